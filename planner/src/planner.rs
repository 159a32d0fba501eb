use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use common::storage::types::plan::{
    ChunkTaskPlan, PlanConfig, PlanSummary, PlanningResult, SourceChunkCount, SourcePlan,
};
use common::storage::types::source::SourceKind;
use common::storage::types::task::ContextMode;
use common::AppError;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::tokenizer::Tokenizer;

/// Neighbor radius for `SURROUNDING_CHUNKS` context (spec §4.2 step 5).
const NEIGHBOR_RADIUS: usize = 3;

#[derive(Debug, Clone, Deserialize)]
struct ManifestSource {
    source_id: String,
    title: String,
    authority: String,
    kind: SourceKind,
    url: Option<String>,
    txt_path: String,
    md_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    sources: Vec<ManifestSource>,
}

/// Inputs to a single planning pass (spec §4.2).
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub manifest_path: PathBuf,
    pub source_id_filters: Vec<String>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub full_doc_threshold_tokens: usize,
    pub max_chunks: Option<usize>,
}

impl PlanRequest {
    fn validate(&self) -> Result<(), AppError> {
        if self.chunk_overlap >= self.chunk_size {
            return Err(AppError::Config(format!(
                "chunk_overlap ({}) must be < chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Reads the manifest, tokenizes each selected document, and emits source/chunk plans.
/// Pure and I/O-local: never calls a remote service, safe to run as a dry-run.
pub fn plan(request: &PlanRequest, tokenizer: &dyn Tokenizer) -> Result<PlanningResult, AppError> {
    request.validate()?;

    let manifest_bytes = fs::read(&request.manifest_path)
        .map_err(|e| AppError::Config(format!("reading manifest {:?}: {e}", request.manifest_path)))?;
    let manifest_sha256 = hex_sha256(&manifest_bytes);

    let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|e| AppError::Config(format!("parsing manifest: {e}")))?;

    let manifest_dir = request
        .manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let filter: Option<HashSet<&str>> = if request.source_id_filters.is_empty() {
        None
    } else {
        Some(request.source_id_filters.iter().map(String::as_str).collect())
    };

    let mut sources = Vec::new();
    let mut tasks = Vec::new();
    let mut per_source_counts = Vec::new();

    'sources: for manifest_source in &manifest.sources {
        if let Some(ref filter) = filter {
            if !filter.contains(manifest_source.source_id.as_str()) {
                continue;
            }
        }

        let txt_path = resolve(&manifest_dir, &manifest_source.txt_path);
        let text = fs::read_to_string(&txt_path)
            .map_err(|e| AppError::Config(format!("reading source text {txt_path:?}: {e}")))?;

        let doc_tokens = tokenizer.encode(&text);
        let doc_token_count = doc_tokens.len();
        let full_doc = doc_token_count <= request.full_doc_threshold_tokens;

        // The full chunk list is always computed for the source; `max_chunks` only caps
        // which chunks are later emitted as tasks, so `chunk_count` always reflects the
        // source's true chunk total, matching an uncapped plan of the same source.
        let mut chunk_texts = Vec::new();
        let mut chunk_token_counts = Vec::new();
        let step = request.chunk_size - request.chunk_overlap;
        let mut start = 0usize;
        while start < doc_token_count {
            let end = (start + request.chunk_size).min(doc_token_count);
            let window = &doc_tokens[start..end];
            let chunk_text = tokenizer.decode(window)?;
            chunk_token_counts.push(window.len());
            chunk_texts.push(chunk_text);
            start += step;
        }

        let chunk_count = chunk_texts.len();

        for (chunk_index, chunk_text) in chunk_texts.iter().enumerate() {
            let (context_mode, window_start, window_end, context_text) = if full_doc {
                (ContextMode::FullDoc, 0, chunk_count.saturating_sub(1), text.clone())
            } else {
                let window_start = chunk_index.saturating_sub(NEIGHBOR_RADIUS);
                let window_end = (chunk_index + NEIGHBOR_RADIUS).min(chunk_count.saturating_sub(1));
                let context_text = (window_start..=window_end)
                    .filter(|&k| k != chunk_index)
                    .map(|k| format!("[Chunk {}/{}]\n{}", k + 1, chunk_count, chunk_texts[k]))
                    .collect::<Vec<_>>()
                    .join("\n\n");
                (ContextMode::SurroundingChunks, window_start, window_end, context_text)
            };

            tasks.push(ChunkTaskPlan {
                source_id: manifest_source.source_id.clone(),
                chunk_index,
                chunk_count,
                raw_text: chunk_text.clone(),
                raw_text_sha256: hex_sha256(chunk_text.as_bytes()),
                chunk_token_count: chunk_token_counts[chunk_index],
                doc_token_count,
                context_mode,
                context_window_start: window_start,
                context_window_end: window_end,
                context_text,
            });

            if let Some(max_chunks) = request.max_chunks {
                if tasks.len() >= max_chunks {
                    per_source_counts.push(SourceChunkCount {
                        source_id: manifest_source.source_id.clone(),
                        chunk_count: chunk_index + 1,
                    });
                    sources.push(source_plan(manifest_source, &text, doc_token_count));
                    break 'sources;
                }
            }
        }

        per_source_counts.push(SourceChunkCount {
            source_id: manifest_source.source_id.clone(),
            chunk_count,
        });
        sources.push(source_plan(manifest_source, &text, doc_token_count));
    }

    let total_chunks = tasks.len();
    Ok(PlanningResult {
        manifest_sha256,
        sources,
        tasks,
        config: PlanConfig {
            chunk_size: request.chunk_size,
            chunk_overlap: request.chunk_overlap,
            full_doc_threshold_tokens: request.full_doc_threshold_tokens,
            max_chunks: request.max_chunks,
            tokenizer_scheme: tokenizer.scheme().to_string(),
        },
        summary: PlanSummary {
            sources: per_source_counts.len(),
            chunks: total_chunks,
            per_source: per_source_counts,
        },
    })
}

fn source_plan(manifest_source: &ManifestSource, text: &str, doc_token_count: usize) -> SourcePlan {
    SourcePlan {
        source_id: manifest_source.source_id.clone(),
        title: manifest_source.title.clone(),
        authority: manifest_source.authority.clone(),
        kind: manifest_source.kind,
        source_url: manifest_source.url.clone(),
        txt_path: manifest_source.txt_path.clone(),
        md_path: manifest_source.md_path.clone(),
        content_sha256: hex_sha256(text.as_bytes()),
        char_count: text.chars().count(),
        token_count: doc_token_count,
    }
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// `⌈max(0, D − overlap) / (chunk_size − overlap)⌉` when `D > 0`, else 0 (spec property 7).
pub fn expected_chunk_count(doc_token_count: usize, chunk_size: usize, chunk_overlap: usize) -> usize {
    if doc_token_count == 0 {
        return 0;
    }
    let step = chunk_size - chunk_overlap;
    let numerator = doc_token_count.saturating_sub(chunk_overlap);
    numerator.div_ceil(step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::Cl100kTokenizer;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_manifest(dir: &Path, sources: &serde_json::Value) -> PathBuf {
        let manifest_path = dir.join("manifest.json");
        let body = serde_json::json!({ "sources": sources });
        let mut f = fs::File::create(&manifest_path).expect("create manifest");
        f.write_all(body.to_string().as_bytes()).expect("write manifest");
        manifest_path
    }

    #[test]
    fn s1_full_doc_small_source() {
        let dir = TempDir::new().expect("create temp dir");
        let text = "Article 28 processor obligations. ".repeat(30);
        fs::write(dir.path().join("src-1.txt"), &text).expect("write source text");
        let manifest_path = write_manifest(
            dir.path(),
            &serde_json::json!([{
                "source_id": "src-1",
                "title": "Source One",
                "authority": "EU",
                "kind": "HTML",
                "url": "https://example.test/src-1",
                "txt_path": "src-1.txt",
                "md_path": null
            }]),
        );

        let tokenizer = Cl100kTokenizer::new().expect("tokenizer");
        let request = PlanRequest {
            manifest_path,
            source_id_filters: vec![],
            chunk_size: 80,
            chunk_overlap: 20,
            full_doc_threshold_tokens: 50_000,
            max_chunks: None,
        };

        let result = plan(&request, &tokenizer).expect("plan succeeds");
        assert!(!result.tasks.is_empty());
        let chunk_count = result.tasks.len();
        for task in &result.tasks {
            assert_eq!(task.context_mode, ContextMode::FullDoc);
            assert_eq!(task.context_text, text);
            assert_eq!(task.context_window_start, 0);
            assert_eq!(task.context_window_end, chunk_count - 1);
        }
    }

    #[test]
    fn s2_above_threshold_uses_surrounding_chunks() {
        let dir = TempDir::new().expect("create temp dir");
        let text = "gdpr ".repeat(3000);
        fs::write(dir.path().join("src-1.txt"), &text).expect("write source text");
        let manifest_path = write_manifest(
            dir.path(),
            &serde_json::json!([{
                "source_id": "src-1",
                "title": "Source One",
                "authority": "EU",
                "kind": "HTML",
                "url": "https://example.test/src-1",
                "txt_path": "src-1.txt",
                "md_path": null
            }]),
        );

        let tokenizer = Cl100kTokenizer::new().expect("tokenizer");
        let request = PlanRequest {
            manifest_path,
            source_id_filters: vec![],
            chunk_size: 50,
            chunk_overlap: 10,
            full_doc_threshold_tokens: 100,
            max_chunks: None,
        };

        let result = plan(&request, &tokenizer).expect("plan succeeds");
        let chunk_count = result.tasks.len();
        for task in &result.tasks {
            assert_eq!(task.context_mode, ContextMode::SurroundingChunks);
            let lower = task.chunk_index.saturating_sub(3);
            let upper = (task.chunk_index + 3).min(chunk_count - 1);
            assert_eq!(task.context_window_start, lower);
            assert_eq!(task.context_window_end, upper);
            assert!(!task.context_text.contains(&format!("[Chunk {}/", task.chunk_index + 1)));
        }
    }

    #[test]
    fn planning_is_deterministic() {
        let dir = TempDir::new().expect("create temp dir");
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(40);
        fs::write(dir.path().join("src-1.txt"), &text).expect("write source text");
        let manifest_path = write_manifest(
            dir.path(),
            &serde_json::json!([{
                "source_id": "src-1",
                "title": "Source One",
                "authority": "EU",
                "kind": "HTML",
                "url": null,
                "txt_path": "src-1.txt",
                "md_path": null
            }]),
        );

        let tokenizer = Cl100kTokenizer::new().expect("tokenizer");
        let request = PlanRequest {
            manifest_path,
            source_id_filters: vec![],
            chunk_size: 100,
            chunk_overlap: 20,
            full_doc_threshold_tokens: 50_000,
            max_chunks: None,
        };

        let first = plan(&request, &tokenizer).expect("first plan");
        let second = plan(&request, &tokenizer).expect("second plan");
        assert_eq!(first, second);
    }

    #[test]
    fn chunk_count_matches_formula() {
        assert_eq!(expected_chunk_count(0, 800, 300), 0);
        assert_eq!(expected_chunk_count(800, 800, 300), 1);
        assert_eq!(expected_chunk_count(1100, 800, 300), 2);
        assert_eq!(expected_chunk_count(1101, 800, 300), 2);
        assert_eq!(expected_chunk_count(1600, 800, 300), 3);
    }

    #[test]
    fn invalid_overlap_is_rejected() {
        let request = PlanRequest {
            manifest_path: PathBuf::from("manifest.json"),
            source_id_filters: vec![],
            chunk_size: 100,
            chunk_overlap: 100,
            full_doc_threshold_tokens: 1000,
            max_chunks: None,
        };
        let tokenizer = Cl100kTokenizer::new().expect("tokenizer");
        let err = plan(&request, &tokenizer).expect_err("overlap == chunk_size must fail");
        assert!(matches!(err, AppError::Config(_)));
    }
}
