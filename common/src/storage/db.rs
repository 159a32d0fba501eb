use std::{ops::Deref, sync::Arc};

use futures::Stream;
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Notification, Surreal,
};

use super::types::StoredObject;
use crate::error::AppError;

const EMBEDDING_DIMENSION: usize = 1536;

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

pub trait ProvidesDb {
    fn db(&self) -> &Arc<SurrealDbClient>;
}

impl SurrealDbClient {
    /// Connect, sign in, and select the namespace/database the pipeline runs in.
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        db.signin(Root { username, password }).await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Defines the four ingestion tables and runs `ensure_runtime_indexes`. Safe to call
    /// on every process start; all definitions are idempotent.
    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        self.apply_migrations().await?;
        super::indexes::ensure_runtime_indexes(self, EMBEDDING_DIMENSION).await?;
        Ok(())
    }

    /// `DEFINE TABLE ... SCHEMALESS` for the four ingestion tables plus the task-uniqueness
    /// and lookup indexes named in the persisted-schema contract.
    pub async fn apply_migrations(&self) -> Result<(), Error> {
        self.client
            .query(
                "DEFINE TABLE kb_sources SCHEMALESS;
                 DEFINE INDEX idx_sources_source_id ON TABLE kb_sources FIELDS source_id UNIQUE;

                 DEFINE TABLE kb_ingest_runs SCHEMALESS;
                 DEFINE INDEX idx_runs_status ON TABLE kb_ingest_runs FIELDS status;

                 DEFINE TABLE kb_ingest_tasks SCHEMALESS;
                 DEFINE INDEX idx_tasks_unique ON TABLE kb_ingest_tasks
                     FIELDS run_id, source_id, chunk_index UNIQUE;
                 DEFINE INDEX idx_tasks_run_llm ON TABLE kb_ingest_tasks FIELDS run_id, llm_status;
                 DEFINE INDEX idx_tasks_run_embed ON TABLE kb_ingest_tasks FIELDS run_id, embed_status;
                 DEFINE INDEX idx_tasks_run_upsert ON TABLE kb_ingest_tasks FIELDS run_id, upsert_status;

                 DEFINE TABLE kb_chunks SCHEMALESS;
                 DEFINE INDEX idx_chunks_unique ON TABLE kb_chunks
                     FIELDS source_id, chunk_index UNIQUE;",
            )
            .await?
            .check()?;

        Ok(())
    }

    pub async fn drop_table<T>(&self) -> Result<Vec<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client.delete(T::table_name()).await
    }

    /// Stores a object in SurrealDB, requires the struct to implement `StoredObject`.
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }

    /// Listen for live updates on a table, requires the struct to implement `StoredObject`.
    pub async fn listen<T>(
        &self,
    ) -> Result<impl Stream<Item = Result<Notification<T>, Error>>, Error>
    where
        T: for<'de> StoredObject + std::marker::Unpin,
    {
        self.client.select(T::table_name()).live().await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}

#[cfg(test)]
mod tests {
    use crate::stored_object;

    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    stored_object!(Dummy, "dummy", {
        name: String
    });

    #[tokio::test]
    async fn test_initialization_and_crud() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.ensure_initialized()
            .await
            .expect("Failed to initialize schema");

        let dummy = Dummy {
            id: "abc".to_string(),
            name: "first".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let stored = db
            .store_item(dummy.clone())
            .await
            .expect("Failed to store");
        assert!(stored.is_some());

        let fetched = db
            .get_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to fetch");
        assert_eq!(fetched, Some(dummy.clone()));

        let all = db
            .get_all_stored_items::<Dummy>()
            .await
            .expect("Failed to fetch all");
        assert!(all.contains(&dummy));

        let deleted = db
            .delete_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to delete");
        assert_eq!(deleted, Some(dummy));

        let fetch_post = db
            .get_item::<Dummy>("abc")
            .await
            .expect("Failed fetch post delete");
        assert!(fetch_post.is_none());
    }

    #[tokio::test]
    async fn test_apply_migrations_is_idempotent() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.apply_migrations().await.expect("first migration pass");
        db.apply_migrations()
            .await
            .expect("second migration pass should be a no-op");
    }
}
