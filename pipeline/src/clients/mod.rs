pub mod embedding;
pub mod extraction;
pub mod retry;

pub use embedding::{combined_text, EmbeddingClient, EmbeddingOutcome, OpenAiEmbeddingClient};
pub use extraction::{ExtractionClient, ExtractionOutcome, OpenAiExtractionClient};
