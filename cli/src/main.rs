mod args;

use std::process::ExitCode;
use std::sync::Arc;

use args::{Cli, Command, PlanArgs, ResumeArgs, RunArgs, RuntimeArgs, StatusArgs};
use clap::Parser;
use common::storage::db::SurrealDbClient;
use common::storage::repository::Repository;
use common::storage::types::run::RunConfig;
use common::{get_config, AppError, EnvConfig};
use pipeline::{OpenAiEmbeddingClient, OpenAiExtractionClient, Orchestrator};
use planner::{Cl100kTokenizer, PlanRequest};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    match run().await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "kb-pipeline exited with an error");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode, AppError> {
    let cli = Cli::parse();
    let env = get_config().map_err(|e| AppError::Config(e.to_string()))?;

    match cli.command {
        Command::Plan(args) => cmd_plan(&env, &args),
        Command::Run(args) => cmd_run(&env, &args).await,
        Command::Resume(args) => cmd_resume(&env, &args, false).await,
        Command::RetryFailed(args) => cmd_resume(&env, &args, true).await,
        Command::Status(args) => cmd_status(&env, &args).await,
    }
}

fn plan_request(env: &EnvConfig, args: &PlanArgs) -> PlanRequest {
    PlanRequest {
        manifest_path: args.kb_dir.join("manifest.json"),
        source_id_filters: args.source_id.clone(),
        chunk_size: args.chunk_size.unwrap_or(env.chunk_size),
        chunk_overlap: args.overlap.unwrap_or(env.chunk_overlap),
        full_doc_threshold_tokens: args
            .full_doc_threshold
            .unwrap_or(env.full_doc_threshold_tokens),
        max_chunks: args.max_chunks,
    }
}

fn cmd_plan(env: &EnvConfig, args: &PlanArgs) -> Result<ExitCode, AppError> {
    let tokenizer = Cl100kTokenizer::new()?;
    let request = plan_request(env, args);
    let result = planner::plan(&request, &tokenizer)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&result)
            .map_err(|e| AppError::InternalError(e.to_string()))?
    );
    Ok(ExitCode::SUCCESS)
}

/// `run|resume|retry-failed` all require a reachable DB URL and both API credentials;
/// `plan` alone is exempt (spec §4.6).
fn require_runtime_secrets(env: &EnvConfig, overrides: &RuntimeArgs) -> Result<(String, String, String), AppError> {
    let database_url = overrides
        .database_url
        .clone()
        .or_else(|| env.database_url.clone())
        .ok_or_else(|| AppError::Config("KB_DATABASE_URL (or --database-url) is required".into()))?;
    let extraction_api_key = overrides
        .extraction_api_key
        .clone()
        .or_else(|| env.extraction_api_key.clone())
        .ok_or_else(|| AppError::Config("KB_EXTRACTION_API_KEY is required".into()))?;
    let embedding_api_key = overrides
        .embedding_api_key
        .clone()
        .or_else(|| env.embedding_api_key.clone())
        .ok_or_else(|| AppError::Config("KB_EMBEDDING_API_KEY is required".into()))?;
    Ok((database_url, extraction_api_key, embedding_api_key))
}

async fn connect_repository(env: &EnvConfig, database_url: &str) -> Result<Repository, AppError> {
    let db = SurrealDbClient::new(
        database_url,
        &env.database_username,
        &env.database_password,
        &env.database_namespace,
        &env.database_name,
    )
    .await
    .map_err(AppError::Database)?;
    db.ensure_initialized().await?;
    Ok(Repository::new(Arc::new(db)))
}

fn build_orchestrator(
    env: &EnvConfig,
    extraction_api_key: &str,
    embedding_api_key: &str,
    repository: Repository,
    cancellation: CancellationToken,
    run_config: &RunConfig,
) -> Result<Orchestrator, AppError> {
    let extraction = Arc::new(OpenAiExtractionClient::new(
        extraction_api_key,
        &env.extraction_base_url,
        &env.extraction_model,
        env.request_retries,
        env.request_timeout_seconds,
        run_config.llm_validation_retries,
    )?);
    let embedding = Arc::new(OpenAiEmbeddingClient::new(
        embedding_api_key,
        &env.embedding_base_url,
        &env.embedding_model,
        env.request_retries,
        env.request_timeout_seconds,
    )?);
    Ok(Orchestrator::new(repository, extraction, embedding, cancellation))
}

fn run_config_from(env: &EnvConfig, overrides: &RuntimeArgs, tokenizer_scheme: &str) -> RunConfig {
    RunConfig {
        chunk_size: env.chunk_size,
        chunk_overlap: env.chunk_overlap,
        full_doc_threshold_tokens: env.full_doc_threshold_tokens,
        tokenizer_scheme: tokenizer_scheme.to_string(),
        extraction_model: env.extraction_model.clone(),
        embedding_model: env.embedding_model.clone(),
        llm_concurrency: overrides.llm_concurrency.unwrap_or(env.llm_concurrency),
        embed_concurrency: overrides.embed_concurrency.unwrap_or(env.embed_concurrency),
        upsert_concurrency: overrides.upsert_concurrency.unwrap_or(env.upsert_concurrency),
        request_retries: env.request_retries,
        request_timeout_seconds: env.request_timeout_seconds,
        queue_maxsize: env.queue_maxsize,
        llm_validation_retries: env.llm_validation_retries,
        progress_heartbeat_seconds: env.progress_heartbeat_seconds,
    }
}

fn spawn_ctrl_c_watcher(cancellation: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, cancelling run");
            cancellation.cancel();
        }
    });
}

async fn cmd_run(env: &EnvConfig, args: &RunArgs) -> Result<ExitCode, AppError> {
    let (database_url, extraction_api_key, embedding_api_key) =
        require_runtime_secrets(env, &args.runtime)?;

    let tokenizer = Cl100kTokenizer::new()?;
    let request = plan_request(env, &args.plan);
    let plan = planner::plan(&request, &tokenizer)?;

    let repository = connect_repository(env, &database_url).await?;
    let run_config = run_config_from(env, &args.runtime, tokenizer.scheme());
    let run_id = repository
        .create_run_from_plan(&plan, run_config.clone())
        .await?;

    let cancellation = CancellationToken::new();
    spawn_ctrl_c_watcher(cancellation.clone());
    let orchestrator = build_orchestrator(
        env,
        &extraction_api_key,
        &embedding_api_key,
        repository,
        cancellation,
        &run_config,
    )?;

    let report = orchestrator.execute_run(&run_id, &run_config, false).await?;
    print_report(&report)
}

async fn cmd_resume(env: &EnvConfig, args: &ResumeArgs, failed_only: bool) -> Result<ExitCode, AppError> {
    let (database_url, extraction_api_key, embedding_api_key) =
        require_runtime_secrets(env, &args.runtime)?;

    let repository = connect_repository(env, &database_url).await?;
    let existing = repository.status(&args.run_id).await?;
    let run_config = existing.run.config.clone();

    let cancellation = CancellationToken::new();
    spawn_ctrl_c_watcher(cancellation.clone());
    let orchestrator = build_orchestrator(
        env,
        &extraction_api_key,
        &embedding_api_key,
        repository,
        cancellation,
        &run_config,
    )?;

    let report = orchestrator
        .execute_run(&args.run_id, &run_config, failed_only)
        .await?;
    print_report(&report)
}

async fn cmd_status(env: &EnvConfig, args: &StatusArgs) -> Result<ExitCode, AppError> {
    let database_url = env
        .database_url
        .clone()
        .ok_or_else(|| AppError::Config("KB_DATABASE_URL is required".into()))?;
    let repository = connect_repository(env, &database_url).await?;
    let report = repository.status(&args.run_id).await?;
    print_report(&report)
}

fn print_report(
    report: &common::storage::repository::RunStatusReport,
) -> Result<ExitCode, AppError> {
    println!(
        "{}",
        serde_json::to_string_pretty(report).map_err(|e| AppError::InternalError(e.to_string()))?
    );
    Ok(ExitCode::SUCCESS)
}
