use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Environment-driven configuration, read once at process entry (spec §9: no ambient
/// mutable singletons -- this value is constructed once and handed to every component).
#[derive(Clone, Deserialize, Debug, Default)]
pub struct EnvConfig {
    pub database_url: Option<String>,
    #[serde(default = "default_database_namespace")]
    pub database_namespace: String,
    #[serde(default = "default_database_name")]
    pub database_name: String,
    #[serde(default = "default_database_username")]
    pub database_username: String,
    #[serde(default = "default_database_password")]
    pub database_password: String,

    pub extraction_api_key: Option<String>,
    pub embedding_api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub extraction_base_url: String,
    #[serde(default = "default_openai_base_url")]
    pub embedding_base_url: String,
    #[serde(default = "default_extraction_model")]
    pub extraction_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_full_doc_threshold_tokens")]
    pub full_doc_threshold_tokens: usize,

    #[serde(default = "default_llm_concurrency")]
    pub llm_concurrency: usize,
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,
    #[serde(default = "default_upsert_concurrency")]
    pub upsert_concurrency: usize,

    #[serde(default = "default_request_retries")]
    pub request_retries: u32,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_queue_maxsize")]
    pub queue_maxsize: usize,
    #[serde(default = "default_llm_validation_retries")]
    pub llm_validation_retries: u32,
    #[serde(default = "default_progress_heartbeat_seconds")]
    pub progress_heartbeat_seconds: u64,

    #[serde(default = "default_tokenizer_scheme")]
    pub tokenizer_scheme: String,
}

fn default_database_namespace() -> String {
    "kb".to_string()
}
fn default_database_name() -> String {
    "ingestion".to_string()
}
fn default_database_username() -> String {
    "root".to_string()
}
fn default_database_password() -> String {
    "root".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_extraction_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_chunk_size() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    300
}
fn default_full_doc_threshold_tokens() -> usize {
    50_000
}
fn default_llm_concurrency() -> usize {
    4
}
fn default_embed_concurrency() -> usize {
    8
}
fn default_upsert_concurrency() -> usize {
    8
}
fn default_request_retries() -> u32 {
    3
}
fn default_request_timeout_seconds() -> u64 {
    180
}
fn default_queue_maxsize() -> usize {
    64
}
fn default_llm_validation_retries() -> u32 {
    1
}
fn default_progress_heartbeat_seconds() -> u64 {
    10
}
fn default_tokenizer_scheme() -> String {
    "cl100k_base".to_string()
}

/// Reads `config.{toml,json,...}` (optional) overlaid with `KB_*` environment variables.
pub fn get_config() -> Result<EnvConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::with_prefix("KB").separator("_"))
        .build()?;

    config.try_deserialize()
}
