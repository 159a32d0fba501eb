use serde::{Deserialize, Serialize};

use super::task::ContextMode;
use crate::stored_object;

stored_object!(Chunk, "kb_chunks", {
    source_id: String,
    chunk_index: usize,
    raw_text: String,
    context_mode: ContextMode,
    context_text: String,
    structured_json: serde_json::Value,
    structured_text: String,
    combined_text: String,
    raw_text_sha256: String,
    llm_model: String,
    embedding_model: String,
    embedding: Vec<f32>
});

impl Chunk {
    /// The external-visible identity: reruns of the same plan must upsert onto this key.
    pub fn natural_key(source_id: &str, chunk_index: usize) -> String {
        format!("{source_id}:{chunk_index}")
    }
}

/// The fixed template embedded for a chunk and stored alongside it, so retrieval can
/// match on either the raw text or the structured extraction.
pub fn combined_text(raw_text: &str, structured_json: &serde_json::Value) -> Result<String, crate::AppError> {
    let indented = serde_json::to_string_pretty(structured_json)
        .map_err(|e| crate::AppError::InternalError(e.to_string()))?;
    Ok(format!(
        "## RAW_TEXT_CHUNK\n{}\n\n## STRUCTURED_OUTPUT\n{indented}",
        raw_text.trim()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn combined_text_matches_fixed_template() {
        let text = combined_text("  hello world  ", &json!({"a": 1})).expect("builds");
        assert!(text.starts_with("## RAW_TEXT_CHUNK\nhello world\n\n## STRUCTURED_OUTPUT\n"));
        assert!(text.contains("\"a\": 1"));
    }
}
