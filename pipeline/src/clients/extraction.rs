use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
};
use async_openai::Client;
use async_trait::async_trait;
use common::storage::types::extraction_schema::{json_schema, StructuredExtraction};
use common::storage::types::task::TaskPayload;
use common::AppError;

use super::retry::{is_retryable_status, sleep_before_retry};

const SYSTEM_PROMPT: &str = "You perform contextual compression over a chunk of a regulatory \
document. Extract the structured fields defined by the provided schema, staying faithful to \
the chunk text and using the supplied context only for disambiguation.";

/// What a successful extraction call returns to the orchestrator.
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub structured_json: serde_json::Value,
    pub structured_text: String,
    pub attempts_used: u32,
}

#[async_trait]
pub trait ExtractionClient: Send + Sync {
    async fn extract(&self, payload: &TaskPayload) -> Result<ExtractionOutcome, AppError>;
}

pub struct OpenAiExtractionClient {
    client: Client<OpenAIConfig>,
    model: String,
    request_retries: u32,
    validation_retries: u32,
}

impl OpenAiExtractionClient {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        request_retries: u32,
        request_timeout_seconds: u64,
        validation_retries: u32,
    ) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_seconds))
            .build()
            .map_err(AppError::Reqwest)?;

        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url);

        let client = Client::with_config(config).with_http_client(http_client);

        Ok(Self {
            client,
            model: model.to_string(),
            request_retries,
            validation_retries,
        })
    }

    fn build_user_prompt(payload: &TaskPayload) -> String {
        format!(
            "source_id: {}\nsource_title: {}\nsource_url: {}\nchunk_index: {}\nchunk_count: {}\n\
             chunk_token_count: {}\ncontext_mode: {:?}\n\n## CONTEXT\n{}\n\n## CHUNK\n{}",
            payload.source_id,
            payload.source_title,
            payload.source_url.as_deref().unwrap_or("(none)"),
            payload.chunk_index,
            payload.chunk_count,
            payload.chunk_token_count,
            payload.context_mode,
            payload.context_text,
            payload.raw_text,
        )
    }

    async fn call_once(&self, payload: &TaskPayload) -> Result<String, OpenAIError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(SYSTEM_PROMPT)
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(Self::build_user_prompt(payload))
                    .build()?
                    .into(),
            ])
            .response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    name: "structured_extraction".to_string(),
                    description: Some("Structured extraction of one regulatory chunk".to_string()),
                    schema: Some(json_schema()),
                    strict: Some(true),
                },
            })
            .build()?;

        let response = self.client.chat().create(request).await?;
        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| OpenAIError::InvalidArgument("empty completion choices".to_string()))?;
        Ok(content)
    }
}

#[async_trait]
impl ExtractionClient for OpenAiExtractionClient {
    async fn extract(&self, payload: &TaskPayload) -> Result<ExtractionOutcome, AppError> {
        let mut attempt: u32 = 0;
        let mut transport_retries_used: u32 = 0;
        let mut validation_retries_used: u32 = 0;
        loop {
            attempt += 1;
            match self.call_once(payload).await {
                Ok(content) => match parse_structured_output(&content) {
                    Ok(mut parsed) => {
                        parsed.source_title = payload.source_title.clone();
                        parsed.source_url = payload.source_url.clone().unwrap_or_default();

                        let structured_json = serde_json::to_value(&parsed)
                            .map_err(|e| AppError::InternalError(e.to_string()))?;
                        let structured_text = serde_json::to_string(&structured_json)
                            .map_err(|e| AppError::InternalError(e.to_string()))?;

                        return Ok(ExtractionOutcome {
                            structured_json,
                            structured_text,
                            attempts_used: attempt,
                        });
                    }
                    Err(ParseFailure::Malformed(e)) => {
                        if validation_retries_used >= self.validation_retries {
                            return Err(AppError::Validation(format!(
                                "schema validation failed: {e}"
                            )));
                        }
                        validation_retries_used += 1;
                        sleep_before_retry(attempt, None).await;
                    }
                    Err(ParseFailure::Invalid(message)) => return Err(AppError::Validation(message)),
                },
                Err(err) => {
                    let (retryable, app_err) = classify(&err);
                    if !retryable || transport_retries_used >= self.request_retries {
                        return Err(app_err);
                    }
                    transport_retries_used += 1;
                    sleep_before_retry(attempt, None).await;
                }
            }
        }
    }
}

/// A response body that isn't valid JSON (or doesn't deserialize into the schema) is
/// `Malformed` and retried up to `llm_validation_retries` times, the same as a transport
/// fault. Valid JSON that fails a semantic constraint is `Invalid` and never retried.
enum ParseFailure {
    Malformed(serde_json::Error),
    Invalid(String),
}

fn parse_structured_output(content: &str) -> Result<StructuredExtraction, ParseFailure> {
    let parsed: StructuredExtraction =
        serde_json::from_str(content).map_err(ParseFailure::Malformed)?;
    if !parsed.is_well_formed() {
        return Err(ParseFailure::Invalid(
            "possible_reasons exceeds 3 entries".to_string(),
        ));
    }
    Ok(parsed)
}

/// HTTP 429/5xx is transient and retried; anything else (including a 4xx that isn't 429)
/// is permanent and fails the stage immediately.
fn classify(err: &OpenAIError) -> (bool, AppError) {
    match err {
        OpenAIError::Reqwest(e) => match e.status().map(|s| s.as_u16()) {
            Some(code) if is_retryable_status(code) => {
                (true, AppError::TransientRemote(err.to_string()))
            }
            Some(_) => (false, AppError::PermanentRemote(err.to_string())),
            None => (true, AppError::TransientRemote(err.to_string())),
        },
        OpenAIError::ApiError(api_err) => {
            match api_err.code.as_deref().and_then(|c| c.parse::<u16>().ok()) {
                Some(code) if is_retryable_status(code) => {
                    (true, AppError::TransientRemote(err.to_string()))
                }
                _ => (false, AppError::PermanentRemote(err.to_string())),
            }
        }
        _ => (false, AppError::PermanentRemote(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::task::ContextMode;

    fn payload() -> TaskPayload {
        TaskPayload {
            task_id: "t1".to_string(),
            run_id: "r1".to_string(),
            source_id: "src-1".to_string(),
            source_title: "Source One".to_string(),
            source_url: Some("https://example.test".to_string()),
            chunk_index: 0,
            chunk_count: 1,
            chunk_token_count: 10,
            context_mode: ContextMode::FullDoc,
            raw_text: "Article 28.".to_string(),
            context_text: "Article 28.".to_string(),
        }
    }

    #[test]
    fn prompt_includes_chunk_and_context() {
        let prompt = OpenAiExtractionClient::build_user_prompt(&payload());
        assert!(prompt.contains("source_id: src-1"));
        assert!(prompt.contains("Article 28."));
    }

    #[test]
    fn unparseable_json_is_malformed_not_invalid() {
        let err = parse_structured_output("{not_json").expect_err("must fail");
        assert!(matches!(err, ParseFailure::Malformed(_)));
    }

    #[test]
    fn valid_json_failing_semantic_check_is_invalid_not_malformed() {
        let content = serde_json::json!({
            "source_title": "t",
            "source_url": "u",
            "article_no": "28",
            "short_description": "d",
            "consequences": null,
            "possible_reasons": ["a", "b", "c", "d"],
            "citation_quote": "q",
            "citation_section": null,
        })
        .to_string();
        let err = parse_structured_output(&content).expect_err("must fail");
        assert!(matches!(err, ParseFailure::Invalid(_)));
    }
}
