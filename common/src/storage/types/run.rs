use serde::{Deserialize, Serialize};

use crate::stored_object;

/// One execution attempt over a planned set of tasks, with frozen configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    PartialFailure,
    Failed,
    Completed,
    Cancelled,
}

/// Configuration frozen onto the run at creation time so that `resume`/`retry-failed`
/// always replay under the exact settings the plan was produced with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub full_doc_threshold_tokens: usize,
    pub tokenizer_scheme: String,
    pub extraction_model: String,
    pub embedding_model: String,
    pub llm_concurrency: usize,
    pub embed_concurrency: usize,
    pub upsert_concurrency: usize,
    pub request_retries: u32,
    pub request_timeout_seconds: u64,
    pub queue_maxsize: usize,
    pub llm_validation_retries: u32,
    pub progress_heartbeat_seconds: u64,
}

stored_object!(Run, "kb_ingest_runs", {
    status: RunStatus,
    config: RunConfig,
    kb_manifest_sha256: String,
    total_chunks: usize,
    completed_chunks: usize,
    failed_chunks: usize,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    error_summary: Option<serde_json::Value>
});
