//! Command-line surface for dagrun: configuration loading, CLI overrides,
//! signal wiring, history queries, and human-readable output. All engine
//! behavior lives in `dagrun-core`.

mod cli;

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use dagrun_core::EngineError;
use dagrun_core::ResumeMode;
use dagrun_core::ResumeRequest;
use dagrun_core::RunOptions;
use dagrun_core::plan_waves;
use dagrun_core::run_workflow;
use dagrun_protocol::AttemptStatus;
use dagrun_protocol::JobStatus;
use dagrun_protocol::WorkflowConfig;
use dagrun_state::HISTORY_DB_FILENAME;
use dagrun_state::HistoryStore;
use dagrun_state::RunSummary;
use dagrun_state::StoreError;
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use cli::Cli;
pub use cli::Command;
use cli::ListRunsArgs;
use cli::MarkSuccessArgs;
use cli::ShowRunArgs;

pub async fn run_main(cli: Cli) -> anyhow::Result<i32> {
    init_tracing();
    if let Some(command) = &cli.command {
        let db_path = history_db_path(&cli);
        return match command {
            Command::ListRuns(args) => list_runs(db_path, args).await,
            Command::ShowRun(args) => show_run(db_path, args).await,
            Command::MarkSuccess(args) => mark_success(db_path, args).await,
        };
    }
    run_configured_workflow(cli).await
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Database path for the read-only history subcommands, which may run
/// without a configuration file.
fn history_db_path(cli: &Cli) -> PathBuf {
    cli.db
        .clone()
        .unwrap_or_else(|| PathBuf::from(HISTORY_DB_FILENAME))
}

async fn run_configured_workflow(cli: Cli) -> anyhow::Result<i32> {
    let Some(config_path) = cli.config.as_deref() else {
        eprintln!("dagrun: --config is required to run a workflow");
        return Ok(2);
    };
    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("dagrun: {err:#}");
            return Ok(2);
        }
    };
    apply_overrides(&mut config, &cli);

    let cli_skips: HashSet<String> = cli.skip.iter().cloned().collect();
    if cli.dry_run {
        return match plan_waves(&config, &cli_skips) {
            Ok(waves) => {
                print_waves(&waves, &cli_skips);
                Ok(0)
            }
            Err(err) => {
                eprintln!("dagrun: {err}");
                Ok(engine_error_code(&err))
            }
        };
    }

    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| config.working_dir.join(HISTORY_DB_FILENAME));
    let cancel = CancellationToken::new();
    install_signal_handlers(&cancel);

    let options = RunOptions {
        db_path,
        resume: cli.resume_from.map(|run_id| ResumeRequest {
            run_id,
            mode: if cli.resume_failed_only {
                ResumeMode::FailedOnly
            } else {
                ResumeMode::Normal
            },
        }),
        cli_env: cli.env.iter().cloned().collect::<HashMap<_, _>>(),
        cli_skips,
        cancel,
    };
    match run_workflow(config, options).await {
        Ok(outcome) => {
            print_outcome(&outcome);
            Ok(outcome.exit_code)
        }
        Err(err) => {
            eprintln!("dagrun: {err}");
            Ok(engine_error_code(&err))
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<WorkflowConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config {}", path.display()))?;
    let config: WorkflowConfig = serde_json::from_str(&raw)
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

fn apply_overrides(config: &mut WorkflowConfig, cli: &Cli) {
    if cli.parallel {
        config.parallel = true;
    }
    if cli.sequential {
        config.parallel = false;
    }
    if let Some(workers) = cli.workers {
        config.max_workers = workers;
    }
    if cli.continue_on_error {
        config.continue_on_error = true;
    }
}

fn engine_error_code(err: &EngineError) -> i32 {
    if err.is_config_error() { 2 } else { 1 }
}

fn install_signal_handlers(cancel: &CancellationToken) {
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("keyboard interrupt");
                cancel.cancel();
            }
        });
    }
    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::SignalKind;
            use tokio::signal::unix::signal;

            let Ok(mut terminate) = signal(SignalKind::terminate()) else {
                return;
            };
            if terminate.recv().await.is_some() {
                debug!("termination signal");
                cancel.cancel();
            }
        });
    }
}

fn print_waves(waves: &[Vec<String>], skips: &HashSet<String>) {
    if !skips.is_empty() {
        let mut skipped: Vec<&String> = skips.iter().collect();
        skipped.sort();
        println!(
            "skipped up front: {}",
            skipped
                .iter()
                .map(|id| id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    for (index, wave) in waves.iter().enumerate() {
        println!("wave {}: {}", index + 1, wave.join(", "));
    }
}

fn print_outcome(outcome: &dagrun_core::WorkflowOutcome) {
    println!(
        "run {} attempt {} finished: {}",
        outcome.run_id,
        outcome.attempt_id,
        paint_attempt(outcome.status)
    );
    let mut job_ids: Vec<&String> = outcome.job_statuses.keys().collect();
    job_ids.sort();
    for job_id in job_ids {
        let Some(status) = outcome.job_statuses.get(job_id) else {
            continue;
        };
        match outcome.reasons.get(job_id) {
            Some(reason) => println!("  {job_id:<24} {} {reason}", paint_job(*status)),
            None => println!("  {job_id:<24} {}", paint_job(*status)),
        }
    }
}

fn paint_attempt(status: AttemptStatus) -> String {
    match status {
        AttemptStatus::Success => status.as_str().green().to_string(),
        AttemptStatus::Running | AttemptStatus::Partial => status.as_str().yellow().to_string(),
        AttemptStatus::Failed | AttemptStatus::Interrupted => status.as_str().red().to_string(),
    }
}

fn paint_job(status: JobStatus) -> String {
    let padded = format!("{:<8}", status.as_str());
    match status {
        JobStatus::Success => padded.green().to_string(),
        JobStatus::Skipped | JobStatus::Pending | JobStatus::Queued | JobStatus::Running => {
            padded.yellow().to_string()
        }
        JobStatus::Failed | JobStatus::Error | JobStatus::Timeout => padded.red().to_string(),
    }
}

async fn open_store(db_path: &Path) -> anyhow::Result<HistoryStore> {
    HistoryStore::open(db_path)
        .await
        .with_context(|| format!("cannot open history database {}", db_path.display()))
}

async fn list_runs(db_path: PathBuf, args: &ListRunsArgs) -> anyhow::Result<i32> {
    let store = open_store(&db_path).await?;
    let runs = store.list_runs(args.application.as_deref()).await?;
    if runs.is_empty() {
        println!("no runs recorded");
        return Ok(0);
    }
    println!(
        "{:>6} {:>8} {:<20} {:<12} {:<20} {:>4} {:>4} {:>4}",
        "RUN", "ATTEMPT", "APPLICATION", "STATUS", "STARTED", "OK", "FAIL", "SKIP"
    );
    for run in &runs {
        print_run_line(run);
    }
    Ok(0)
}

fn print_run_line(run: &RunSummary) {
    println!(
        "{:>6} {:>8} {:<20} {:<21} {:<20} {:>4} {:>4} {:>4}",
        run.run_id,
        run.attempt_id,
        run.application_name,
        paint_attempt(run.status),
        run.start_time.format("%Y-%m-%d %H:%M:%S"),
        run.successful_jobs,
        run.failed_jobs,
        run.skipped_jobs,
    );
}

async fn show_run(db_path: PathBuf, args: &ShowRunArgs) -> anyhow::Result<i32> {
    let store = open_store(&db_path).await?;
    let details = match store.run_details(args.run_id).await {
        Ok(details) => details,
        Err(StoreError::UnknownRun(run_id)) => {
            eprintln!("dagrun: run {run_id} has no recorded history");
            return Ok(1);
        }
        Err(err) => return Err(err.into()),
    };
    for attempt in &details.attempts {
        println!(
            "run {} attempt {} [{}] {} jobs, started {}",
            attempt.run_id,
            attempt.attempt_id,
            paint_attempt(attempt.status),
            attempt.total_jobs,
            attempt.start_time.format("%Y-%m-%d %H:%M:%S"),
        );
        for job in details
            .jobs
            .iter()
            .filter(|job| job.attempt_id == attempt.attempt_id)
        {
            let duration = job
                .duration_seconds
                .map(|seconds| format!("{seconds:.1}s"))
                .unwrap_or_else(|| "-".to_string());
            let exit = job
                .exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<24} {} {:>8} exit={:<4} retries={}",
                job.job_id,
                paint_job(job.status),
                duration,
                exit,
                job.retry_count,
            );
        }
    }
    Ok(0)
}

async fn mark_success(db_path: PathBuf, args: &MarkSuccessArgs) -> anyhow::Result<i32> {
    if args.jobs.is_empty() {
        eprintln!("dagrun: mark-success requires at least one job id");
        return Ok(2);
    }
    let store = open_store(&db_path).await?;
    match store.mark_success(args.run_id, &args.jobs).await {
        Ok(()) => {
            println!(
                "marked {} job(s) successful in run {}",
                args.jobs.len(),
                args.run_id
            );
            Ok(0)
        }
        Err(StoreError::UnknownRun(run_id)) => {
            eprintln!("dagrun: run {run_id} has no recorded history");
            Ok(1)
        }
        Err(err) => Err(err.into()),
    }
}
