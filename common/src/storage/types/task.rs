use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stored_object;

/// One of the three dependent phases applied to every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Llm,
    Embed,
    Upsert,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Llm => "llm",
            Stage::Embed => "embed",
            Stage::Upsert => "upsert",
        }
    }
}

/// Per-stage substate. A stage only runs once its predecessor is `Succeeded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Aggregate verdict for a task, derived from its three stage statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalStatus {
    Pending,
    Completed,
    Failed,
}

/// How much surrounding text the extraction service receives with a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextMode {
    FullDoc,
    SurroundingChunks,
}

stored_object!(Task, "kb_ingest_tasks", {
    run_id: String,
    source_id: String,
    chunk_index: usize,
    chunk_count: usize,
    raw_text: String,
    raw_text_sha256: String,
    chunk_token_count: usize,
    doc_token_count: usize,
    context_mode: ContextMode,
    context_window_start: usize,
    context_window_end: usize,
    context_text: String,

    llm_status: StageStatus,
    llm_retry_count: u32,
    llm_started_at: Option<DateTime<Utc>>,
    llm_error: Option<String>,
    structured_json: Option<serde_json::Value>,
    structured_text: Option<String>,

    embed_status: StageStatus,
    embed_retry_count: u32,
    embed_started_at: Option<DateTime<Utc>>,
    embed_error: Option<String>,
    embedding: Option<Vec<f32>>,
    embedding_dim: Option<usize>,

    upsert_status: StageStatus,
    upsert_retry_count: u32,
    upsert_started_at: Option<DateTime<Utc>>,
    upsert_error: Option<String>,

    final_status: FinalStatus
});

impl Task {
    /// Returns the stage `queue_seed` should route this task to, or `None` if it is
    /// already `Completed` (or, under `failed_only`, has nothing currently `Failed`).
    pub fn earliest_pending_stage(&self, failed_only: bool) -> Option<Stage> {
        if self.final_status == FinalStatus::Completed {
            return None;
        }

        let route = |status: StageStatus| -> bool {
            if failed_only {
                status == StageStatus::Failed
            } else {
                status != StageStatus::Succeeded
            }
        };

        if self.llm_status != StageStatus::Succeeded {
            return route(self.llm_status).then_some(Stage::Llm);
        }
        if self.embed_status != StageStatus::Succeeded {
            return route(self.embed_status).then_some(Stage::Embed);
        }
        if self.upsert_status != StageStatus::Succeeded {
            return route(self.upsert_status).then_some(Stage::Upsert);
        }
        None
    }
}

/// Everything a stage client needs to process one chunk; assembled by the repository
/// from a `Task` joined with its owning `Source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: String,
    pub run_id: String,
    pub source_id: String,
    pub source_title: String,
    pub source_url: Option<String>,
    pub chunk_index: usize,
    pub chunk_count: usize,
    pub chunk_token_count: usize,
    pub context_mode: ContextMode,
    pub raw_text: String,
    pub context_text: String,
}
