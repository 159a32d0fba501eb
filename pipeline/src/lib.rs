pub mod clients;
pub mod orchestrator;

pub use clients::{
    combined_text, EmbeddingClient, EmbeddingOutcome, ExtractionClient, ExtractionOutcome,
    OpenAiEmbeddingClient, OpenAiExtractionClient,
};
pub use orchestrator::Orchestrator;
