use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::db::SurrealDbClient;
use super::types::chunk::Chunk;
use super::types::plan::PlanningResult;
use super::types::run::{Run, RunConfig, RunStatus};
use super::types::source::{Source, SourceKind};
use super::types::task::{FinalStatus, Stage, StageStatus, Task, TaskPayload};
use crate::error::AppError;

const EMBEDDING_DIMENSION: usize = 1536;

/// Per-source seed counters the orchestrator's progress monitor starts from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceProgressSeed {
    pub total_chunks: usize,
    pub llm_succeeded: usize,
    pub embed_succeeded: usize,
    pub upsert_succeeded: usize,
    pub failed: usize,
}

/// The three stage queues' initial contents, in `(source_id, chunk_index)` order.
#[derive(Debug, Clone, Default)]
pub struct QueueSeed {
    pub llm_ids: Vec<String>,
    pub embed_ids: Vec<String>,
    pub upsert_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageCounters {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatusReport {
    pub run: Run,
    pub llm: StageCounters,
    pub embed: StageCounters,
    pub upsert: StageCounters,
    pub failing_samples: Vec<Task>,
}

/// All persistence for the ingestion pipeline: run/source/task rows, atomic per-stage
/// transitions, resume-queue seeding, and the final upsert into the chunk table.
#[derive(Clone)]
pub struct Repository {
    db: Arc<SurrealDbClient>,
}

impl Repository {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    /// Returns quickly if the ingestion tables exist; otherwise fails with `SchemaNotReady`.
    pub async fn assert_schema_ready(&self) -> Result<(), AppError> {
        for table in ["kb_sources", "kb_ingest_runs", "kb_ingest_tasks", "kb_chunks"] {
            let query = format!("INFO FOR TABLE {table};");
            let mut response = self
                .db
                .client
                .query(query)
                .await
                .map_err(|e| AppError::SchemaNotReady(e.to_string()))?;
            response
                .take::<serde_json::Value>(0)
                .map_err(|e| AppError::SchemaNotReady(format!("table {table}: {e}")))?;
        }
        Ok(())
    }

    /// One transaction: insert the run row, upsert every `SourcePlan` by `source_id`,
    /// and insert all tasks PENDING. All-or-nothing.
    pub async fn create_run_from_plan(
        &self,
        plan: &PlanningResult,
        config: RunConfig,
    ) -> Result<String, AppError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let run = Run {
            id: run_id.clone(),
            created_at: now,
            updated_at: now,
            status: RunStatus::Pending,
            config,
            kb_manifest_sha256: plan.manifest_sha256.clone(),
            total_chunks: plan.tasks.len(),
            completed_chunks: 0,
            failed_chunks: 0,
            started_at: None,
            finished_at: None,
            error_summary: None,
        };

        let sources: Vec<Source> = plan
            .sources
            .iter()
            .map(|s| Source {
                id: s.source_id.clone(),
                created_at: now,
                updated_at: now,
                source_id: s.source_id.clone(),
                title: s.title.clone(),
                authority: s.authority.clone(),
                kind: s.kind,
                source_url: s.source_url.clone(),
                txt_path: s.txt_path.clone(),
                md_path: s.md_path.clone(),
                content_sha256: s.content_sha256.clone(),
                char_count: s.char_count,
                token_count: s.token_count,
                active: true,
            })
            .collect();

        let tasks: Vec<Task> = plan
            .tasks
            .iter()
            .map(|t| Task {
                id: uuid::Uuid::new_v4().to_string(),
                created_at: now,
                updated_at: now,
                run_id: run_id.clone(),
                source_id: t.source_id.clone(),
                chunk_index: t.chunk_index,
                chunk_count: t.chunk_count,
                raw_text: t.raw_text.clone(),
                raw_text_sha256: t.raw_text_sha256.clone(),
                chunk_token_count: t.chunk_token_count,
                doc_token_count: t.doc_token_count,
                context_mode: t.context_mode,
                context_window_start: t.context_window_start,
                context_window_end: t.context_window_end,
                context_text: t.context_text.clone(),
                llm_status: StageStatus::Pending,
                llm_retry_count: 0,
                llm_started_at: None,
                llm_error: None,
                structured_json: None,
                structured_text: None,
                embed_status: StageStatus::Pending,
                embed_retry_count: 0,
                embed_started_at: None,
                embed_error: None,
                embedding: None,
                embedding_dim: None,
                upsert_status: StageStatus::Pending,
                upsert_retry_count: 0,
                upsert_started_at: None,
                upsert_error: None,
                final_status: FinalStatus::Pending,
            })
            .collect();

        self.db
            .client
            .query(
                "BEGIN TRANSACTION;
                 CREATE type::thing('kb_ingest_runs', $run.id) CONTENT $run;
                 FOR $s IN $sources {
                     UPDATE type::thing('kb_sources', $s.id) MERGE $s;
                 };
                 FOR $t IN $tasks {
                     CREATE type::thing('kb_ingest_tasks', $t.id) CONTENT $t;
                 };
                 COMMIT TRANSACTION;",
            )
            .bind(("run", run))
            .bind(("sources", sources))
            .bind(("tasks", tasks))
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?
            .check()
            .map_err(|e| AppError::Persistence(e.to_string()))?;

        Ok(run_id)
    }

    pub async fn mark_run_started(&self, run_id: &str) -> Result<(), AppError> {
        self.db
            .client
            .query(
                "UPDATE type::thing('kb_ingest_runs', $id) SET
                    status = 'RUNNING',
                    started_at = started_at ?? time::now(),
                    updated_at = time::now();",
            )
            .bind(("id", run_id.to_string()))
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?
            .check()
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        Ok(())
    }

    pub async fn cancel_run(&self, run_id: &str, reason: &str) -> Result<(), AppError> {
        self.db
            .client
            .query(
                "UPDATE type::thing('kb_ingest_runs', $id) SET
                    status = 'CANCELLED',
                    error_summary = $summary,
                    updated_at = time::now();",
            )
            .bind(("id", run_id.to_string()))
            .bind(("summary", json!({ "reason": reason })))
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?
            .check()
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Loads all tasks of the run ordered by `(source_id, chunk_index)` and partitions
    /// them into the three stage queues (spec §4.3's routing rule).
    pub async fn queue_seed(&self, run_id: &str, failed_only: bool) -> Result<QueueSeed, AppError> {
        let mut response = self
            .db
            .client
            .query(
                "SELECT * FROM kb_ingest_tasks
                 WHERE run_id = $run_id
                 ORDER BY source_id, chunk_index;",
            )
            .bind(("run_id", run_id.to_string()))
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        let tasks: Vec<Task> = response
            .take(0)
            .map_err(|e| AppError::Persistence(e.to_string()))?;

        let mut seed = QueueSeed::default();
        for task in &tasks {
            match task.earliest_pending_stage(failed_only) {
                Some(Stage::Llm) => seed.llm_ids.push(task.id.clone()),
                Some(Stage::Embed) => seed.embed_ids.push(task.id.clone()),
                Some(Stage::Upsert) => seed.upsert_ids.push(task.id.clone()),
                None => {}
            }
        }
        Ok(seed)
    }

    /// Per-source grouped counters, used to seed in-memory progress.
    pub async fn progress_counts_by_source(
        &self,
        run_id: &str,
    ) -> Result<HashMap<String, SourceProgressSeed>, AppError> {
        let mut response = self
            .db
            .client
            .query("SELECT * FROM kb_ingest_tasks WHERE run_id = $run_id;")
            .bind(("run_id", run_id.to_string()))
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        let tasks: Vec<Task> = response
            .take(0)
            .map_err(|e| AppError::Persistence(e.to_string()))?;

        let mut by_source: HashMap<String, SourceProgressSeed> = HashMap::new();
        for task in tasks {
            let entry = by_source.entry(task.source_id.clone()).or_default();
            entry.total_chunks += 1;
            if task.llm_status == StageStatus::Succeeded {
                entry.llm_succeeded += 1;
            }
            if task.embed_status == StageStatus::Succeeded {
                entry.embed_succeeded += 1;
            }
            if task.upsert_status == StageStatus::Succeeded {
                entry.upsert_succeeded += 1;
            }
            if task.final_status == FinalStatus::Failed {
                entry.failed += 1;
            }
        }
        Ok(by_source)
    }

    /// Loads a task and its owning source, assembled into the payload a stage client needs.
    pub async fn load_task_payload(&self, task_id: &str) -> Result<TaskPayload, AppError> {
        let task: Task = self
            .db
            .get_item(task_id)
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;

        let source: Source = self
            .db
            .get_item(&task.source_id)
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?
            .ok_or_else(|| AppError::NotFound(format!("source {}", task.source_id)))?;

        Ok(TaskPayload {
            task_id: task.id,
            run_id: task.run_id,
            source_id: task.source_id,
            source_title: source.title,
            source_url: source.source_url,
            chunk_index: task.chunk_index,
            chunk_count: task.chunk_count,
            chunk_token_count: task.chunk_token_count,
            context_mode: task.context_mode,
            raw_text: task.raw_text,
            context_text: task.context_text,
        })
    }

    pub async fn mark_stage_running(&self, stage: Stage, task_id: &str) -> Result<(), AppError> {
        let field = stage.as_str();
        let query = format!(
            "UPDATE type::thing('kb_ingest_tasks', $id) SET
                {field}_status = 'RUNNING',
                {field}_started_at = time::now(),
                {field}_error = NONE,
                updated_at = time::now();"
        );
        self.db
            .client
            .query(query)
            .bind(("id", task_id.to_string()))
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?
            .check()
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        Ok(())
    }

    pub async fn save_llm_success(
        &self,
        task_id: &str,
        structured_json: serde_json::Value,
        structured_text: String,
        attempts_used: u32,
    ) -> Result<(), AppError> {
        self.db
            .client
            .query(
                "UPDATE type::thing('kb_ingest_tasks', $id) SET
                    llm_status = 'SUCCEEDED',
                    llm_retry_count = $retries,
                    structured_json = $structured_json,
                    structured_text = $structured_text,
                    final_status = IF upsert_status = 'SUCCEEDED' THEN 'COMPLETED' ELSE final_status END,
                    updated_at = time::now();",
            )
            .bind(("id", task_id.to_string()))
            .bind(("retries", attempts_used.saturating_sub(1)))
            .bind(("structured_json", structured_json))
            .bind(("structured_text", structured_text))
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?
            .check()
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// The LLM-stage JSON a pending embed-stage worker needs to build its embedding input.
    pub async fn load_structured_json(
        &self,
        task_id: &str,
    ) -> Result<Option<serde_json::Value>, AppError> {
        let task: Task = self
            .db
            .get_item(task_id)
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
        Ok(task.structured_json)
    }

    pub async fn save_embed_success(
        &self,
        task_id: &str,
        embedding: Vec<f32>,
        attempts_used: u32,
    ) -> Result<(), AppError> {
        let dim = embedding.len();
        self.db
            .client
            .query(
                "UPDATE type::thing('kb_ingest_tasks', $id) SET
                    embed_status = 'SUCCEEDED',
                    embed_retry_count = $retries,
                    embedding = $embedding,
                    embedding_dim = $dim,
                    final_status = IF upsert_status = 'SUCCEEDED' THEN 'COMPLETED' ELSE final_status END,
                    updated_at = time::now();",
            )
            .bind(("id", task_id.to_string()))
            .bind(("retries", attempts_used.saturating_sub(1)))
            .bind(("embedding", embedding))
            .bind(("dim", dim))
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?
            .check()
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Performs the durable upsert into `kb_chunks` keyed by `(source_id, chunk_index)`
    /// and marks the task upsert-succeeded in the same transaction, so a crash never
    /// leaves a visible chunk without a completed task or vice versa.
    pub async fn save_upsert_success(
        &self,
        task_id: &str,
        llm_model: &str,
        embedding_model: &str,
    ) -> Result<(), AppError> {
        let task: Task = self
            .db
            .get_item(task_id)
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;

        let structured_json = task
            .structured_json
            .clone()
            .ok_or_else(|| AppError::InternalError("upsert with no structured_json".into()))?;
        let structured_text = task
            .structured_text
            .clone()
            .ok_or_else(|| AppError::InternalError("upsert with no structured_text".into()))?;
        let embedding = task
            .embedding
            .clone()
            .ok_or_else(|| AppError::InternalError("upsert with no embedding".into()))?;
        if embedding.len() != EMBEDDING_DIMENSION {
            return Err(AppError::Validation(format!(
                "embedding has {} dims, expected {EMBEDDING_DIMENSION}",
                embedding.len()
            )));
        }

        let combined_text = super::types::chunk::combined_text(&task.raw_text, &structured_json)?;

        let now = Utc::now();
        let chunk_key = Chunk::natural_key(&task.source_id, task.chunk_index);
        let chunk = Chunk {
            id: chunk_key,
            created_at: now,
            updated_at: now,
            source_id: task.source_id.clone(),
            chunk_index: task.chunk_index,
            raw_text: task.raw_text.clone(),
            context_mode: task.context_mode,
            context_text: task.context_text.clone(),
            structured_json,
            structured_text,
            combined_text,
            raw_text_sha256: task.raw_text_sha256.clone(),
            llm_model: llm_model.to_string(),
            embedding_model: embedding_model.to_string(),
            embedding,
        };

        self.db
            .client
            .query(
                "BEGIN TRANSACTION;
                 UPDATE type::thing('kb_chunks', $chunk.id) MERGE $chunk;
                 UPDATE type::thing('kb_ingest_tasks', $task_id) SET
                     upsert_status = 'SUCCEEDED',
                     final_status = 'COMPLETED',
                     updated_at = time::now();
                 COMMIT TRANSACTION;",
            )
            .bind(("chunk", chunk))
            .bind(("task_id", task_id.to_string()))
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?
            .check()
            .map_err(|e| AppError::Persistence(e.to_string()))?;

        Ok(())
    }

    /// Records a truncated error (≤2000 chars) and fails the stage. Per the source
    /// behavior this is preserved deliberately: any stage failure makes `final_status`
    /// terminal, so a failed LLM stage blocks embedding even on a later `retry-failed`
    /// unless the resume path re-queues it.
    pub async fn save_stage_failure(
        &self,
        stage: Stage,
        task_id: &str,
        error: &AppError,
        attempts_used: u32,
    ) -> Result<(), AppError> {
        let field = stage.as_str();
        let message = error.truncated_message(2000);
        let query = format!(
            "UPDATE type::thing('kb_ingest_tasks', $id) SET
                {field}_status = 'FAILED',
                {field}_retry_count = $retries,
                {field}_error = $message,
                final_status = 'FAILED',
                updated_at = time::now();"
        );
        self.db
            .client
            .query(query)
            .bind(("id", task_id.to_string()))
            .bind(("retries", attempts_used.saturating_sub(1)))
            .bind(("message", message))
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?
            .check()
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Aggregates per-task outcomes into a run verdict per the §4.3 status rule.
    pub async fn finalize_run(&self, run_id: &str) -> Result<RunStatus, AppError> {
        let mut response = self
            .db
            .client
            .query("SELECT * FROM kb_ingest_tasks WHERE run_id = $run_id;")
            .bind(("run_id", run_id.to_string()))
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        let tasks: Vec<Task> = response
            .take(0)
            .map_err(|e| AppError::Persistence(e.to_string()))?;

        let total = tasks.len();
        let completed = tasks
            .iter()
            .filter(|t| t.final_status == FinalStatus::Completed)
            .count();
        let failed = tasks
            .iter()
            .filter(|t| t.final_status == FinalStatus::Failed)
            .count();
        let pending = total - completed - failed;

        let status = if total > 0 && completed == total {
            RunStatus::Completed
        } else if completed > 0 && failed > 0 {
            RunStatus::PartialFailure
        } else if failed == total && total > 0 {
            RunStatus::Failed
        } else if completed > 0 && pending > 0 {
            RunStatus::PartialFailure
        } else if failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Running
        };

        let error_summary = if failed > 0 {
            Some(json!({ "failed_tasks": failed, "total_tasks": total }))
        } else {
            None
        };

        self.db
            .client
            .query(
                "UPDATE type::thing('kb_ingest_runs', $id) SET
                    status = $status,
                    completed_chunks = $completed,
                    failed_chunks = $failed,
                    finished_at = time::now(),
                    error_summary = $error_summary,
                    updated_at = time::now();",
            )
            .bind(("id", run_id.to_string()))
            .bind(("status", status))
            .bind(("completed", completed))
            .bind(("failed", failed))
            .bind(("error_summary", error_summary))
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?
            .check()
            .map_err(|e| AppError::Persistence(e.to_string()))?;

        Ok(status)
    }

    /// The run row, per-stage counters, and up to 20 failing task samples.
    pub async fn status(&self, run_id: &str) -> Result<RunStatusReport, AppError> {
        let run: Run = self
            .db
            .get_item(run_id)
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?
            .ok_or_else(|| AppError::NotFound(format!("run {run_id}")))?;

        let mut response = self
            .db
            .client
            .query("SELECT * FROM kb_ingest_tasks WHERE run_id = $run_id;")
            .bind(("run_id", run_id.to_string()))
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        let tasks: Vec<Task> = response
            .take(0)
            .map_err(|e| AppError::Persistence(e.to_string()))?;

        let count = |select: fn(&Task) -> StageStatus, want: StageStatus| {
            tasks.iter().filter(|t| select(t) == want).count()
        };
        let counters_for = |select: fn(&Task) -> StageStatus| StageCounters {
            pending: count(select, StageStatus::Pending),
            running: count(select, StageStatus::Running),
            succeeded: count(select, StageStatus::Succeeded),
            failed: count(select, StageStatus::Failed),
        };

        let failing_samples = tasks
            .iter()
            .filter(|t| t.final_status == FinalStatus::Failed)
            .take(20)
            .cloned()
            .collect();

        Ok(RunStatusReport {
            run,
            llm: counters_for(|t| t.llm_status),
            embed: counters_for(|t| t.embed_status),
            upsert: counters_for(|t| t.upsert_status),
            failing_samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::plan::{ChunkTaskPlan, PlanConfig, PlanSummary, SourceChunkCount, SourcePlan};
    use crate::storage::types::task::ContextMode;

    fn sample_config() -> RunConfig {
        RunConfig {
            chunk_size: 800,
            chunk_overlap: 300,
            full_doc_threshold_tokens: 50_000,
            tokenizer_scheme: "cl100k_base".to_string(),
            extraction_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            llm_concurrency: 4,
            embed_concurrency: 8,
            upsert_concurrency: 8,
            request_retries: 3,
            request_timeout_seconds: 180,
            queue_maxsize: 64,
            llm_validation_retries: 1,
            progress_heartbeat_seconds: 10,
        }
    }

    fn sample_plan() -> PlanningResult {
        PlanningResult {
            manifest_sha256: "deadbeef".to_string(),
            sources: vec![SourcePlan {
                source_id: "src-1".to_string(),
                title: "Source One".to_string(),
                authority: "EU".to_string(),
                kind: SourceKind::Html,
                source_url: Some("https://example.test/src-1".to_string()),
                txt_path: "src-1.txt".to_string(),
                md_path: None,
                content_sha256: "abc123".to_string(),
                char_count: 100,
                token_count: 20,
            }],
            tasks: vec![ChunkTaskPlan {
                source_id: "src-1".to_string(),
                chunk_index: 0,
                chunk_count: 1,
                raw_text: "hello world".to_string(),
                raw_text_sha256: "rawsha".to_string(),
                chunk_token_count: 2,
                doc_token_count: 2,
                context_mode: ContextMode::FullDoc,
                context_window_start: 0,
                context_window_end: 0,
                context_text: "hello world".to_string(),
            }],
            config: PlanConfig {
                chunk_size: 800,
                chunk_overlap: 300,
                full_doc_threshold_tokens: 50_000,
                max_chunks: None,
                tokenizer_scheme: "cl100k_base".to_string(),
            },
            summary: PlanSummary {
                sources: 1,
                chunks: 1,
                per_source: vec![SourceChunkCount {
                    source_id: "src-1".to_string(),
                    chunk_count: 1,
                }],
            },
        }
    }

    async fn memory_repo() -> Repository {
        let db = SurrealDbClient::memory("repo_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("in-memory db");
        db.ensure_initialized().await.expect("init schema");
        Repository::new(Arc::new(db))
    }

    #[tokio::test]
    async fn create_run_seeds_pending_llm_queue() {
        let repo = memory_repo().await;
        let run_id = repo
            .create_run_from_plan(&sample_plan(), sample_config())
            .await
            .expect("create run");

        let seed = repo.queue_seed(&run_id, false).await.expect("queue_seed");
        assert_eq!(seed.llm_ids.len(), 1);
        assert!(seed.embed_ids.is_empty());
        assert!(seed.upsert_ids.is_empty());
    }

    #[tokio::test]
    async fn finalize_run_reports_completed_when_all_tasks_succeed() {
        let repo = memory_repo().await;
        let run_id = repo
            .create_run_from_plan(&sample_plan(), sample_config())
            .await
            .expect("create run");
        let seed = repo.queue_seed(&run_id, false).await.expect("queue_seed");
        let task_id = &seed.llm_ids[0];

        repo.save_llm_success(task_id, json!({"a": 1}), "{}".to_string(), 1)
            .await
            .expect("llm success");
        repo.save_embed_success(task_id, vec![0.0_f32; 1536], 1)
            .await
            .expect("embed success");
        repo.save_upsert_success(task_id, "gpt-4o-mini", "text-embedding-3-small")
            .await
            .expect("upsert success");

        let status = repo.finalize_run(&run_id).await.expect("finalize");
        assert_eq!(status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn finalize_run_reports_failed_when_all_tasks_fail() {
        let repo = memory_repo().await;
        let run_id = repo
            .create_run_from_plan(&sample_plan(), sample_config())
            .await
            .expect("create run");
        let seed = repo.queue_seed(&run_id, false).await.expect("queue_seed");
        let task_id = &seed.llm_ids[0];

        repo.save_stage_failure(
            Stage::Llm,
            task_id,
            &AppError::Validation("bad schema".to_string()),
            1,
        )
        .await
        .expect("llm failure");

        let status = repo.finalize_run(&run_id).await.expect("finalize");
        assert_eq!(status, RunStatus::Failed);
    }
}
