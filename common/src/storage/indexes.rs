use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{error::AppError, storage::db::SurrealDbClient};

const INDEX_POLL_INTERVAL: Duration = Duration::from_millis(50);
const HNSW_INDEX_NAME: &str = "idx_chunks_embedding";
const HNSW_TABLE: &str = "kb_chunks";
const HNSW_OPTIONS: &str = "DIST COSINE TYPE F32 EFC 100 M 8 CONCURRENTLY";

fn hnsw_definition(dimension: usize) -> String {
    format!(
        "DEFINE INDEX IF NOT EXISTS {HNSW_INDEX_NAME} ON TABLE {HNSW_TABLE} \
         FIELDS embedding HNSW DIMENSION {dimension} {HNSW_OPTIONS};"
    )
}

fn hnsw_definition_overwrite(dimension: usize) -> String {
    format!(
        "DEFINE INDEX OVERWRITE {HNSW_INDEX_NAME} ON TABLE {HNSW_TABLE} \
         FIELDS embedding HNSW DIMENSION {dimension} {HNSW_OPTIONS};"
    )
}

/// Define (or, on a dimension change, redefine) the HNSW vector index over `kb_chunks`,
/// waiting for the build to finish. Idempotent: safe to call on every process start.
pub async fn ensure_runtime_indexes(
    db: &SurrealDbClient,
    embedding_dimension: usize,
) -> Result<(), AppError> {
    ensure_runtime_indexes_inner(db, embedding_dimension)
        .await
        .map_err(|err| AppError::InternalError(err.to_string()))
}

async fn ensure_runtime_indexes_inner(db: &SurrealDbClient, embedding_dimension: usize) -> Result<()> {
    match existing_dimension(db).await? {
        None => create_with_polling(db, hnsw_definition(embedding_dimension)).await,
        Some(dim) if dim == embedding_dimension => Ok(()),
        Some(dim) => {
            warn!(
                existing_dimension = dim,
                target_dimension = embedding_dimension,
                "overwriting HNSW index to match embedding dimension"
            );
            create_with_polling(db, hnsw_definition_overwrite(embedding_dimension)).await
        }
    }
}

async fn existing_dimension(db: &SurrealDbClient) -> Result<Option<usize>> {
    let info_query = format!("INFO FOR TABLE {HNSW_TABLE};");
    let mut response = db
        .client
        .query(info_query)
        .await
        .context("fetching kb_chunks table info")?;

    let info: surrealdb::Value = response.take(0).context("taking table info response")?;
    let info_json: Value = serde_json::to_value(info).context("serializing table info")?;

    let Some(definition) = info_json
        .get("Object")
        .and_then(|o| o.get("indexes"))
        .and_then(|i| i.get("Object"))
        .and_then(|i| i.as_object())
        .and_then(|indexes| indexes.get(HNSW_INDEX_NAME))
        .and_then(|details| details.get("Strand"))
        .and_then(|v| v.as_str())
    else {
        return Ok(None);
    };

    Ok(extract_dimension(definition))
}

fn extract_dimension(definition: &str) -> Option<usize> {
    definition
        .split("DIMENSION")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|token| token.parse::<usize>().ok())
}

async fn create_with_polling(db: &SurrealDbClient, definition: String) -> Result<()> {
    db.client
        .query(definition)
        .await
        .context("defining kb_chunks HNSW index")?
        .check()
        .context("kb_chunks HNSW index definition failed")?;

    poll_until_ready(db).await
}

async fn poll_until_ready(db: &SurrealDbClient) -> Result<()> {
    let started_at = std::time::Instant::now();

    loop {
        tokio::time::sleep(INDEX_POLL_INTERVAL).await;

        let info_query = format!("INFO FOR INDEX {HNSW_INDEX_NAME} ON TABLE {HNSW_TABLE};");
        let mut info_res = db
            .client
            .query(info_query)
            .await
            .context("checking kb_chunks index build status")?;
        let info: Option<Value> = info_res.take(0).context("taking INFO FOR INDEX result")?;

        let Some(status) = build_status(info) else {
            warn!("INFO FOR INDEX returned no data; assuming index definition is missing");
            return Ok(());
        };

        if status.eq_ignore_ascii_case("ready") {
            debug!(elapsed = ?started_at.elapsed(), "kb_chunks HNSW index is ready");
            return Ok(());
        }
        if status.eq_ignore_ascii_case("error") {
            warn!(status, "kb_chunks HNSW index build reported error status");
            return Ok(());
        }
    }
}

fn build_status(info: Option<Value>) -> Option<String> {
    let info = info?;
    Some(
        info.get("building")
            .and_then(|b| b.get("status"))
            .and_then(|s| s.as_str())
            .unwrap_or("ready")
            .to_string(),
    )
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct CountRow {
    count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn extract_dimension_parses_value() {
        let definition = "DEFINE INDEX idx_chunks_embedding ON TABLE kb_chunks FIELDS embedding HNSW DIMENSION 1536 DIST COSINE TYPE F32 EFC 100 M 8;";
        assert_eq!(extract_dimension(definition), Some(1536));
    }

    #[tokio::test]
    async fn ensure_runtime_indexes_is_idempotent() {
        let namespace = "indexes_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("in-memory db");

        db.apply_migrations().await.expect("migrations should succeed");

        ensure_runtime_indexes(&db, 1536)
            .await
            .expect("initial index creation");
        ensure_runtime_indexes(&db, 1536)
            .await
            .expect("second index creation is a no-op");
    }

    #[tokio::test]
    async fn ensure_hnsw_index_overwrites_dimension() {
        let namespace = "indexes_dim";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("in-memory db");

        db.apply_migrations().await.expect("migrations should succeed");

        ensure_runtime_indexes(&db, 1536)
            .await
            .expect("initial index creation");
        ensure_runtime_indexes(&db, 128)
            .await
            .expect("overwritten index creation");
    }
}
