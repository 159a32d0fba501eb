use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The structured-extraction service's output contract. Extra keys are forbidden and
/// every field is required by the strict JSON-schema response format, so optionals are
/// modeled as explicitly nullable rather than absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredExtraction {
    pub source_title: String,
    pub source_url: String,
    pub article_no: String,
    pub short_description: String,
    pub consequences: Option<String>,
    pub possible_reasons: Vec<String>,
    pub citation_quote: String,
    pub citation_section: Option<String>,
}

impl StructuredExtraction {
    /// Up to 3 short reasons per the output contract.
    pub fn is_well_formed(&self) -> bool {
        self.possible_reasons.len() <= 3
    }
}

/// JSON schema passed to the extraction service's structured-output mode (strict: every
/// field listed in `required`, nullable fields use a `["type", "null"]` union).
pub fn json_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": [
            "source_title",
            "source_url",
            "article_no",
            "short_description",
            "consequences",
            "possible_reasons",
            "citation_quote",
            "citation_section"
        ],
        "properties": {
            "source_title": { "type": "string" },
            "source_url": { "type": "string" },
            "article_no": { "type": "string" },
            "short_description": { "type": "string" },
            "consequences": { "type": ["string", "null"] },
            "possible_reasons": {
                "type": "array",
                "items": { "type": "string" },
                "maxItems": 3
            },
            "citation_quote": { "type": "string" },
            "citation_section": { "type": ["string", "null"] }
        }
    })
}
