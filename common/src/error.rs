use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

/// Error taxonomy for the ingestion pipeline core (see spec §7).
#[derive(Error, Debug)]
pub enum AppError {
    /// Missing env/DB URL, invalid chunk/overlap, missing manifest. Surfaced before any run exists.
    #[error("Config error: {0}")]
    Config(String),
    /// Persistent tables absent; aborts before workers start.
    #[error("Schema not ready: {0}")]
    SchemaNotReady(String),
    /// HTTP 429/5xx or network fault that exhausted the stage client's retry budget.
    #[error("Transient remote error: {0}")]
    TransientRemote(String),
    /// Extraction response did not conform to the structured schema. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),
    /// HTTP 4xx other than 429. Not retried.
    #[error("Permanent remote error: {0}")]
    PermanentRemote(String),
    /// A save/transition could not be committed.
    #[error("Persistence error: {0}")]
    Persistence(String),
    /// A cooperative cancellation signal was observed.
    #[error("Run cancelled")]
    Cancelled,
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Truncates the error's rendered message to the given length, used before persisting
    /// `llm_error`/`embed_error`/`upsert_error` columns (spec bounds these at 2000 chars).
    pub fn truncated_message(&self, max_len: usize) -> String {
        let rendered = self.to_string();
        if rendered.chars().count() <= max_len {
            return rendered;
        }
        rendered.chars().take(max_len).collect()
    }
}
