use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::CreateEmbeddingRequestArgs;
use async_openai::Client;
use async_trait::async_trait;
use common::AppError;

use super::retry::{is_retryable_status, sleep_before_retry};

const EMBEDDING_DIMENSION: u32 = 1536;

#[derive(Debug, Clone)]
pub struct EmbeddingOutcome {
    pub embedding: Vec<f32>,
    pub attempts_used: u32,
}

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, combined_text: &str) -> Result<EmbeddingOutcome, AppError>;
}

pub struct OpenAiEmbeddingClient {
    client: Client<OpenAIConfig>,
    model: String,
    request_retries: u32,
}

impl OpenAiEmbeddingClient {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        request_retries: u32,
        request_timeout_seconds: u64,
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
        })
    }

    async fn call_once(&self, combined_text: &str) -> Result<Vec<f32>, OpenAIError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .dimensions(EMBEDDING_DIMENSION)
            .input(combined_text)
            .build()?;

        let response = self.client.embeddings().create(request).await?;
        let embedding = response
            .data
            .first()
            .map(|d| d.embedding.clone())
            .unwrap_or_default();
        Ok(embedding)
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbeddingClient {
    async fn embed(&self, combined_text: &str) -> Result<EmbeddingOutcome, AppError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.call_once(combined_text).await {
                Ok(embedding) if embedding.is_empty() => {
                    return Err(AppError::Validation(
                        "embedding response data[0].embedding was empty".to_string(),
                    ));
                }
                Ok(embedding) => {
                    return Ok(EmbeddingOutcome {
                        embedding,
                        attempts_used: attempt,
                    });
                }
                Err(err) => {
                    let (retryable, app_err) = classify(&err);
                    if !retryable || attempt > self.request_retries {
                        return Err(app_err);
                    }
                    sleep_before_retry(attempt, None).await;
                }
            }
        }
    }
}

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

pub use common::storage::types::chunk::combined_text;
