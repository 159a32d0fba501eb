use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// kb-pipeline: plan, run, resume, and inspect knowledge-base ingestion runs.
#[derive(Parser, Debug)]
#[command(name = "kb-pipeline")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compute a plan from a manifest and print it as JSON. Never calls a remote service.
    Plan(PlanArgs),
    /// Create a fresh run from a freshly computed plan and execute it.
    Run(RunArgs),
    /// Re-execute an existing run, re-queueing every non-SUCCEEDED stage (including RUNNING).
    Resume(ResumeArgs),
    /// Re-execute an existing run, re-queueing only stages currently FAILED.
    RetryFailed(ResumeArgs),
    /// Print a JSON status document for a run.
    Status(StatusArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct PlanArgs {
    /// Directory containing manifest.json and the source text files it references.
    #[arg(long)]
    pub kb_dir: PathBuf,

    /// Restrict planning to these source ids (repeatable). Defaults to every source.
    #[arg(long = "source-id")]
    pub source_id: Vec<String>,

    /// Caps the number of chunk tasks produced across all sources.
    #[arg(long)]
    pub max_chunks: Option<usize>,

    /// Overrides `KB_CHUNK_SIZE`.
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Overrides `KB_CHUNK_OVERLAP`.
    #[arg(long)]
    pub overlap: Option<usize>,

    /// Overrides `KB_FULL_DOC_THRESHOLD_TOKENS`.
    #[arg(long)]
    pub full_doc_threshold: Option<usize>,
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub plan: PlanArgs,

    #[command(flatten)]
    pub runtime: RuntimeArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct ResumeArgs {
    #[arg(long)]
    pub run_id: String,

    #[command(flatten)]
    pub runtime: RuntimeArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct RuntimeArgs {
    /// Overrides `KB_DATABASE_URL`.
    #[arg(long)]
    pub database_url: Option<String>,

    /// Overrides `KB_EXTRACTION_API_KEY`.
    #[arg(long)]
    pub extraction_api_key: Option<String>,

    /// Overrides `KB_EMBEDDING_API_KEY`.
    #[arg(long)]
    pub embedding_api_key: Option<String>,

    /// Overrides `KB_LLM_CONCURRENCY`.
    #[arg(long)]
    pub llm_concurrency: Option<usize>,

    /// Overrides `KB_EMBED_CONCURRENCY`.
    #[arg(long)]
    pub embed_concurrency: Option<usize>,

    /// Overrides `KB_UPSERT_CONCURRENCY`.
    #[arg(long)]
    pub upsert_concurrency: Option<usize>,
}

#[derive(Parser, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long)]
    pub run_id: String,
}
