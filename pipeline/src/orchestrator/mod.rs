pub mod progress;
pub mod tracker;

use std::sync::Arc;
use std::time::Instant;

use common::storage::repository::{Repository, RunStatusReport};
use common::storage::types::run::RunConfig;
use common::storage::types::task::Stage;
use common::AppError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clients::{combined_text, EmbeddingClient, ExtractionClient};
use progress::ProgressMap;
use tracker::WorkTracker;

const UPSERT_QUEUE_MIN_CAPACITY: usize = 256;
/// Errors are truncated to 500 chars in structured log lines (separate from the 2000-char
/// bound used when persisting `<stage>_error` columns).
const LOG_ERROR_TRUNCATE_LEN: usize = 500;

#[derive(Debug, Clone)]
enum QueueItem {
    Task(String),
    Stop,
}

/// Owns the three bounded queues, the worker pools per stage, progress accounting,
/// cancellation, and run finalization.
pub struct Orchestrator {
    repository: Repository,
    extraction: Arc<dyn ExtractionClient>,
    embedding: Arc<dyn EmbeddingClient>,
    cancellation: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        repository: Repository,
        extraction: Arc<dyn ExtractionClient>,
        embedding: Arc<dyn EmbeddingClient>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            repository,
            extraction,
            embedding,
            cancellation,
        }
    }

    /// `_execute_run(run_id, failed_only)` per spec §4.5: mark started, seed the three
    /// queues from current task state, spawn workers before seeding, drain, finalize.
    pub async fn execute_run(
        &self,
        run_id: &str,
        run_config: &RunConfig,
        failed_only: bool,
    ) -> Result<RunStatusReport, AppError> {
        self.repository.mark_run_started(run_id).await?;

        let seed = self.repository.queue_seed(run_id, failed_only).await?;
        let progress_seed = self.repository.progress_counts_by_source(run_id).await?;
        let progress = Arc::new(ProgressMap::seeded(progress_seed));
        let tracker = Arc::new(WorkTracker::default());

        let llm_cap = run_config.queue_maxsize.max(1);
        let embed_cap = run_config.queue_maxsize.max(1);
        let upsert_cap = run_config.queue_maxsize.max(UPSERT_QUEUE_MIN_CAPACITY);

        let (llm_tx, llm_rx) = mpsc::channel(llm_cap);
        let (embed_tx, embed_rx) = mpsc::channel(embed_cap);
        let (upsert_tx, upsert_rx) = mpsc::channel(upsert_cap);
        let llm_rx = Arc::new(Mutex::new(llm_rx));
        let embed_rx = Arc::new(Mutex::new(embed_rx));
        let upsert_rx = Arc::new(Mutex::new(upsert_rx));

        // Workers must exist before seeding: seeds may exceed queue_maxsize, and
        // producers must not block waiting on consumers that haven't started.
        let mut handles = Vec::new();
        for idx in 0..run_config.llm_concurrency {
            handles.push(tokio::spawn(llm_worker(
                idx,
                self.repository.clone(),
                self.extraction.clone(),
                progress.clone(),
                tracker.clone(),
                llm_rx.clone(),
                embed_tx.clone(),
                run_id.to_string(),
                self.cancellation.clone(),
            )));
        }
        for idx in 0..run_config.embed_concurrency {
            handles.push(tokio::spawn(embed_worker(
                idx,
                self.repository.clone(),
                self.embedding.clone(),
                progress.clone(),
                tracker.clone(),
                embed_rx.clone(),
                upsert_tx.clone(),
                run_id.to_string(),
                self.cancellation.clone(),
            )));
        }
        for idx in 0..run_config.upsert_concurrency {
            handles.push(tokio::spawn(upsert_worker(
                idx,
                self.repository.clone(),
                progress.clone(),
                tracker.clone(),
                upsert_rx.clone(),
                run_id.to_string(),
                self.cancellation.clone(),
                run_config.extraction_model.clone(),
                run_config.embedding_model.clone(),
            )));
        }

        let monitor_cancel = CancellationToken::new();
        let monitor_handle = {
            let progress = progress.clone();
            let run_id = run_id.to_string();
            let heartbeat = run_config.progress_heartbeat_seconds.max(2);
            let stop = monitor_cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(heartbeat)) => {
                            progress.log_heartbeat(&run_id);
                        }
                        () = stop.cancelled() => break,
                    }
                }
            })
        };

        let total_seeded = (seed.llm_ids.len() + seed.embed_ids.len() + seed.upsert_ids.len()) as i64;
        tracker.enqueued(total_seeded);
        for id in seed.llm_ids {
            let _ = llm_tx.send(QueueItem::Task(id)).await;
        }
        for id in seed.embed_ids {
            let _ = embed_tx.send(QueueItem::Task(id)).await;
        }
        for id in seed.upsert_ids {
            let _ = upsert_tx.send(QueueItem::Task(id)).await;
        }

        tokio::select! {
            () = tracker.wait_drained() => {}
            () = self.cancellation.cancelled() => {
                self.repository.cancel_run(run_id, "cooperative cancellation").await?;
            }
        }

        for _ in 0..run_config.llm_concurrency {
            let _ = llm_tx.send(QueueItem::Stop).await;
        }
        for _ in 0..run_config.embed_concurrency {
            let _ = embed_tx.send(QueueItem::Stop).await;
        }
        for _ in 0..run_config.upsert_concurrency {
            let _ = upsert_tx.send(QueueItem::Stop).await;
        }

        for handle in handles {
            let _ = handle.await;
        }
        monitor_cancel.cancel();
        let _ = monitor_handle.await;

        self.repository.finalize_run(run_id).await?;
        self.repository.status(run_id).await
    }
}

async fn next_item(rx: &Mutex<mpsc::Receiver<QueueItem>>) -> Option<QueueItem> {
    rx.lock().await.recv().await
}

#[allow(clippy::too_many_arguments)]
async fn llm_worker(
    worker_idx: usize,
    repository: Repository,
    client: Arc<dyn ExtractionClient>,
    progress: Arc<ProgressMap>,
    tracker: Arc<WorkTracker>,
    rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    next_tx: mpsc::Sender<QueueItem>,
    run_id: String,
    cancellation: CancellationToken,
) {
    loop {
        let Some(item) = next_item(&rx).await else {
            break;
        };
        let task_id = match item {
            QueueItem::Stop => break,
            QueueItem::Task(id) => id,
        };
        if cancellation.is_cancelled() {
            tracker.completed();
            continue;
        }

        let t0 = Instant::now();
        let outcome: Result<(), AppError> = async {
            repository.mark_stage_running(Stage::Llm, &task_id).await?;
            let payload = repository.load_task_payload(&task_id).await?;
            progress.mark_running(&payload.source_id, Stage::Llm);

            let result = client.extract(&payload).await?;
            repository
                .save_llm_success(
                    &task_id,
                    result.structured_json,
                    result.structured_text,
                    result.attempts_used,
                )
                .await?;

            log_stage_event(
                &run_id,
                Stage::Llm,
                "SUCCEEDED",
                t0.elapsed().as_millis() as u64,
                result.attempts_used.saturating_sub(1),
                worker_idx,
                &payload.source_id,
                &task_id,
                payload.chunk_index,
                payload.chunk_count,
                None,
            );
            progress.mark_succeeded(&payload.source_id, Stage::Llm);
            let _ = next_tx.send(QueueItem::Task(task_id.clone())).await;
            tracker.enqueued(1);
            Ok(())
        }
        .await;

        if let Err(err) = outcome {
            handle_stage_failure(&repository, &progress, Stage::Llm, &task_id, &run_id, worker_idx, t0, &err)
                .await;
        }
        tracker.completed();
    }
}

#[allow(clippy::too_many_arguments)]
async fn embed_worker(
    worker_idx: usize,
    repository: Repository,
    client: Arc<dyn EmbeddingClient>,
    progress: Arc<ProgressMap>,
    tracker: Arc<WorkTracker>,
    rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    next_tx: mpsc::Sender<QueueItem>,
    run_id: String,
    cancellation: CancellationToken,
) {
    loop {
        let Some(item) = next_item(&rx).await else {
            break;
        };
        let task_id = match item {
            QueueItem::Stop => break,
            QueueItem::Task(id) => id,
        };
        if cancellation.is_cancelled() {
            tracker.completed();
            continue;
        }

        let t0 = Instant::now();
        let outcome: Result<(), AppError> = async {
            repository.mark_stage_running(Stage::Embed, &task_id).await?;
            let payload = repository.load_task_payload(&task_id).await?;
            progress.mark_running(&payload.source_id, Stage::Embed);

            let structured_json = repository
                .load_structured_json(&task_id)
                .await?
                .ok_or_else(|| AppError::InternalError("embed stage with no structured_json".into()))?;
            let text = combined_text(&payload.raw_text, &structured_json)?;

            let result = client.embed(&text).await?;
            repository
                .save_embed_success(&task_id, result.embedding, result.attempts_used)
                .await?;

            log_stage_event(
                &run_id,
                Stage::Embed,
                "SUCCEEDED",
                t0.elapsed().as_millis() as u64,
                result.attempts_used.saturating_sub(1),
                worker_idx,
                &payload.source_id,
                &task_id,
                payload.chunk_index,
                payload.chunk_count,
                None,
            );
            progress.mark_succeeded(&payload.source_id, Stage::Embed);
            let _ = next_tx.send(QueueItem::Task(task_id.clone())).await;
            tracker.enqueued(1);
            Ok(())
        }
        .await;

        if let Err(err) = outcome {
            handle_stage_failure(&repository, &progress, Stage::Embed, &task_id, &run_id, worker_idx, t0, &err)
                .await;
        }
        tracker.completed();
    }
}

#[allow(clippy::too_many_arguments)]
async fn upsert_worker(
    worker_idx: usize,
    repository: Repository,
    progress: Arc<ProgressMap>,
    tracker: Arc<WorkTracker>,
    rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    run_id: String,
    cancellation: CancellationToken,
    llm_model: String,
    embedding_model: String,
) {
    loop {
        let Some(item) = next_item(&rx).await else {
            break;
        };
        let task_id = match item {
            QueueItem::Stop => break,
            QueueItem::Task(id) => id,
        };
        if cancellation.is_cancelled() {
            tracker.completed();
            continue;
        }

        let t0 = Instant::now();
        let outcome: Result<(), AppError> = async {
            repository.mark_stage_running(Stage::Upsert, &task_id).await?;
            let payload = repository.load_task_payload(&task_id).await?;
            progress.mark_running(&payload.source_id, Stage::Upsert);

            repository
                .save_upsert_success(&task_id, &llm_model, &embedding_model)
                .await?;

            log_stage_event(
                &run_id,
                Stage::Upsert,
                "SUCCEEDED",
                t0.elapsed().as_millis() as u64,
                0,
                worker_idx,
                &payload.source_id,
                &task_id,
                payload.chunk_index,
                payload.chunk_count,
                None,
            );
            progress.mark_succeeded(&payload.source_id, Stage::Upsert);
            Ok(())
        }
        .await;

        if let Err(err) = outcome {
            handle_stage_failure(&repository, &progress, Stage::Upsert, &task_id, &run_id, worker_idx, t0, &err)
                .await;
        }
        tracker.completed();
    }
}

/// A failed chunk never halts the pipeline: record FAILED, don't forward, keep accepting work.
async fn handle_stage_failure(
    repository: &Repository,
    progress: &ProgressMap,
    stage: Stage,
    task_id: &str,
    run_id: &str,
    worker_idx: usize,
    t0: Instant,
    err: &AppError,
) {
    let source_id = repository
        .load_task_payload(task_id)
        .await
        .map(|p| p.source_id)
        .unwrap_or_else(|_| "unknown".to_string());

    if let Err(save_err) = repository.save_stage_failure(stage, task_id, err, 1).await {
        warn!(task_id, stage = stage.as_str(), error = %save_err, "failed to persist stage failure");
    }

    log_stage_event(
        run_id,
        stage,
        "FAILED",
        t0.elapsed().as_millis() as u64,
        0,
        worker_idx,
        &source_id,
        task_id,
        0,
        0,
        Some(err.truncated_message(LOG_ERROR_TRUNCATE_LEN)),
    );
    progress.mark_failed(&source_id, stage);
}

#[allow(clippy::too_many_arguments)]
fn log_stage_event(
    run_id: &str,
    stage: Stage,
    status: &str,
    latency_ms: u64,
    retry_count: u32,
    worker_idx: usize,
    source_id: &str,
    task_id: &str,
    chunk_index: usize,
    chunk_count: usize,
    error: Option<String>,
) {
    let trace_id = format!("{run_id}:{task_id}:{}", stage.as_str());
    match &error {
        Some(error) => warn!(
            event = "stage_event",
            run_id,
            stage = stage.as_str(),
            status,
            latency_ms,
            retry_count,
            worker_idx,
            trace_id,
            source_id,
            chunk_index,
            chunk_count,
            error = %error,
            "stage failed"
        ),
        None => info!(
            event = "stage_event",
            run_id,
            stage = stage.as_str(),
            status,
            latency_ms,
            retry_count,
            worker_idx,
            trace_id,
            source_id,
            chunk_index,
            chunk_count,
            "stage succeeded"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use common::storage::db::SurrealDbClient;
    use common::storage::types::plan::{
        ChunkTaskPlan, PlanConfig, PlanSummary, PlanningResult, SourceChunkCount, SourcePlan,
    };
    use common::storage::types::run::RunStatus;
    use common::storage::types::source::SourceKind;
    use common::storage::types::task::ContextMode;
    use serde_json::json;

    use super::*;
    use crate::clients::{EmbeddingOutcome, ExtractionOutcome};

    fn sample_config() -> RunConfig {
        RunConfig {
            chunk_size: 800,
            chunk_overlap: 300,
            full_doc_threshold_tokens: 50_000,
            tokenizer_scheme: "cl100k_base".to_string(),
            extraction_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            llm_concurrency: 1,
            embed_concurrency: 1,
            upsert_concurrency: 1,
            request_retries: 3,
            request_timeout_seconds: 180,
            queue_maxsize: 8,
            llm_validation_retries: 1,
            progress_heartbeat_seconds: 3600,
        }
    }

    fn plan_with(chunk_count: usize) -> PlanningResult {
        let tasks = (0..chunk_count)
            .map(|i| ChunkTaskPlan {
                source_id: "src-1".to_string(),
                chunk_index: i,
                chunk_count,
                raw_text: format!("chunk {i} text"),
                raw_text_sha256: format!("sha-{i}"),
                chunk_token_count: 4,
                doc_token_count: 4 * chunk_count,
                context_mode: ContextMode::FullDoc,
                context_window_start: 0,
                context_window_end: chunk_count.saturating_sub(1),
                context_text: "full document text".to_string(),
            })
            .collect();

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
                token_count: 4 * chunk_count,
            }],
            tasks,
            config: PlanConfig {
                chunk_size: 800,
                chunk_overlap: 300,
                full_doc_threshold_tokens: 50_000,
                max_chunks: None,
                tokenizer_scheme: "cl100k_base".to_string(),
            },
            summary: PlanSummary {
                sources: 1,
                chunks: chunk_count,
                per_source: vec![SourceChunkCount {
                    source_id: "src-1".to_string(),
                    chunk_count,
                }],
            },
        }
    }

    async fn memory_repo(db_name: &str) -> Repository {
        let db = SurrealDbClient::memory("orchestrator_tests", db_name)
            .await
            .expect("in-memory db");
        db.ensure_initialized().await.expect("init schema");
        Repository::new(Arc::new(db))
    }

    /// Fails the first `fail_times` calls with a transient error, then succeeds.
    struct FlakyExtractionClient {
        fail_times: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl ExtractionClient for FlakyExtractionClient {
        async fn extract(
            &self,
            _payload: &common::storage::types::task::TaskPayload,
        ) -> Result<ExtractionOutcome, AppError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_times {
                return Err(AppError::TransientRemote("simulated 503".to_string()));
            }
            Ok(ExtractionOutcome {
                structured_json: json!({"article_no": "28", "short_description": "ok"}),
                structured_text: "{}".to_string(),
                attempts_used: attempt,
            })
        }
    }

    /// Always returns a validation error; never retried by the stage client itself.
    struct InvalidExtractionClient;

    #[async_trait]
    impl ExtractionClient for InvalidExtractionClient {
        async fn extract(
            &self,
            _payload: &common::storage::types::task::TaskPayload,
        ) -> Result<ExtractionOutcome, AppError> {
            Err(AppError::Validation("missing required field".to_string()))
        }
    }

    struct StubEmbeddingClient;

    #[async_trait]
    impl EmbeddingClient for StubEmbeddingClient {
        async fn embed(&self, _combined_text: &str) -> Result<EmbeddingOutcome, AppError> {
            Ok(EmbeddingOutcome {
                embedding: vec![0.1_f32; 1536],
                attempts_used: 1,
            })
        }
    }

    /// S3: LLM retry then success — stage ends SUCCEEDED with one retry recorded, run COMPLETED.
    #[tokio::test]
    async fn llm_retry_then_success_completes_run() {
        let repo = memory_repo("s3").await;
        let run_id = repo
            .create_run_from_plan(&plan_with(1), sample_config())
            .await
            .expect("create run");

        let extraction = Arc::new(FlakyExtractionClient {
            fail_times: 1,
            attempts: AtomicU32::new(0),
        });
        let embedding = Arc::new(StubEmbeddingClient);
        let orchestrator = Orchestrator::new(
            repo.clone(),
            extraction.clone(),
            embedding,
            CancellationToken::new(),
        );

        let report = orchestrator
            .execute_run(&run_id, &sample_config(), false)
            .await
            .expect("execute_run");

        assert_eq!(report.run.status, RunStatus::Completed);
        assert_eq!(extraction.attempts.load(Ordering::SeqCst), 2);
    }

    /// S4: validation failure is not retried and the run ends FAILED.
    #[tokio::test]
    async fn validation_failure_fails_closed() {
        let repo = memory_repo("s4").await;
        let run_id = repo
            .create_run_from_plan(&plan_with(1), sample_config())
            .await
            .expect("create run");

        let extraction = Arc::new(InvalidExtractionClient);
        let embedding = Arc::new(StubEmbeddingClient);
        let orchestrator =
            Orchestrator::new(repo.clone(), extraction, embedding, CancellationToken::new());

        let report = orchestrator
            .execute_run(&run_id, &sample_config(), false)
            .await
            .expect("execute_run");

        assert_eq!(report.run.status, RunStatus::Failed);
        assert_eq!(report.llm.failed, 1);
        assert_eq!(report.embed.pending, 0);
    }

    /// S5: resuming re-queues only the non-SUCCEEDED stage; already-completed work is untouched.
    #[tokio::test]
    async fn resume_only_advances_pending_stage() {
        let repo = memory_repo("s5").await;
        let run_id = repo
            .create_run_from_plan(&plan_with(2), sample_config())
            .await
            .expect("create run");
        let seed = repo.queue_seed(&run_id, false).await.expect("queue_seed");
        let already_llm_done = &seed.llm_ids[1];
        repo.save_llm_success(
            already_llm_done,
            json!({"article_no": "1"}),
            "{}".to_string(),
            1,
        )
        .await
        .expect("llm success");

        let extraction = Arc::new(FlakyExtractionClient {
            fail_times: 0,
            attempts: AtomicU32::new(0),
        });
        let embedding = Arc::new(StubEmbeddingClient);
        let orchestrator = Orchestrator::new(
            repo.clone(),
            extraction.clone(),
            embedding,
            CancellationToken::new(),
        );

        let report = orchestrator
            .execute_run(&run_id, &sample_config(), false)
            .await
            .expect("execute_run");

        assert_eq!(report.run.status, RunStatus::Completed);
        // Only the one task still pending LLM work should have gone through extraction.
        assert_eq!(extraction.attempts.load(Ordering::SeqCst), 1);
    }

    /// S6: resuming a completed run is a no-op — no further extraction calls are made.
    #[tokio::test]
    async fn resume_on_completed_run_is_noop() {
        let repo = memory_repo("s6").await;
        let run_id = repo
            .create_run_from_plan(&plan_with(1), sample_config())
            .await
            .expect("create run");

        let extraction = Arc::new(FlakyExtractionClient {
            fail_times: 0,
            attempts: AtomicU32::new(0),
        });
        let embedding = Arc::new(StubEmbeddingClient);
        let orchestrator = Orchestrator::new(
            repo.clone(),
            extraction.clone(),
            embedding.clone(),
            CancellationToken::new(),
        );
        let first = orchestrator
            .execute_run(&run_id, &sample_config(), false)
            .await
            .expect("first execute_run");
        assert_eq!(first.run.status, RunStatus::Completed);

        let second = orchestrator
            .execute_run(&run_id, &sample_config(), false)
            .await
            .expect("second execute_run (resume)");

        assert_eq!(second.run.status, RunStatus::Completed);
        assert_eq!(extraction.attempts.load(Ordering::SeqCst), 1);
    }
}
