use serde::{Deserialize, Serialize};

use super::source::SourceKind;
use super::task::ContextMode;

/// One document discovered in the manifest, tokenized and hashed but not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePlan {
    pub source_id: String,
    pub title: String,
    pub authority: String,
    pub kind: SourceKind,
    pub source_url: Option<String>,
    pub txt_path: String,
    pub md_path: Option<String>,
    pub content_sha256: String,
    pub char_count: usize,
    pub token_count: usize,
}

/// One chunk-sized unit of future work, produced purely from tokenization -- no task id yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkTaskPlan {
    pub source_id: String,
    pub chunk_index: usize,
    pub chunk_count: usize,
    pub raw_text: String,
    pub raw_text_sha256: String,
    pub chunk_token_count: usize,
    pub doc_token_count: usize,
    pub context_mode: ContextMode,
    pub context_window_start: usize,
    pub context_window_end: usize,
    pub context_text: String,
}

/// Frozen chunking/context parameters a plan was produced under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub full_doc_threshold_tokens: usize,
    pub max_chunks: Option<usize>,
    pub tokenizer_scheme: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceChunkCount {
    pub source_id: String,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub sources: usize,
    pub chunks: usize,
    pub per_source: Vec<SourceChunkCount>,
}

/// The pure, I/O-local output of planning: printable as-is by the `plan` CLI command,
/// or handed to the repository to seed a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningResult {
    pub manifest_sha256: String,
    pub sources: Vec<SourcePlan>,
    pub tasks: Vec<ChunkTaskPlan>,
    pub config: PlanConfig,
    pub summary: PlanSummary,
}
