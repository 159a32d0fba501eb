use serde::{Deserialize, Serialize};

use crate::stored_object;

/// Document format of a source, as declared in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceKind {
    Html,
    Pdf,
}

stored_object!(Source, "kb_sources", {
    source_id: String,
    title: String,
    authority: String,
    kind: SourceKind,
    source_url: Option<String>,
    txt_path: String,
    md_path: Option<String>,
    content_sha256: String,
    char_count: usize,
    token_count: usize,
    active: bool
});
