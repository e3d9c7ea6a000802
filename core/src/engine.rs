//! Top-level entry points: validate a workflow, execute one attempt
//! against the history store, and plan dry runs.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use dagrun_protocol::AttemptStatus;
use dagrun_protocol::ConfigError;
use dagrun_protocol::JobStatus;
use dagrun_protocol::WorkflowConfig;
use dagrun_state::HistoryStore;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::checks::CheckRegistry;
use crate::error::EngineError;
use crate::logs::LogFiles;
use crate::orchestrator::AttemptExecution;
use crate::orchestrator::execute_attempt;
use crate::plan::execution_waves;
use crate::resume::ResumeRequest;
use crate::run_state::RunLifecycle;
use crate::run_state::process_exit_code;
use crate::security::enforce_security_policy;
use crate::validator::validate_dependencies;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Location of the history database.
    pub db_path: PathBuf,
    pub resume: Option<ResumeRequest>,
    /// `--env KEY=VAL` overrides, the highest-precedence layer.
    pub cli_env: HashMap<String, String>,
    /// `--skip` ids, pre-marked satisfied.
    pub cli_skips: HashSet<String>,
    /// Trips on SIGINT/SIGTERM.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub run_id: i64,
    pub attempt_id: i64,
    pub status: AttemptStatus,
    pub job_statuses: HashMap<String, JobStatus>,
    /// Failure and skip reasons by job id.
    pub reasons: HashMap<String, String>,
    pub exit_code: i32,
}

/// Validate, open an attempt, drain the DAG, and close the attempt.
pub async fn run_workflow(
    config: WorkflowConfig,
    options: RunOptions,
) -> Result<WorkflowOutcome, EngineError> {
    let checks = preflight(&config)?;

    let store = HistoryStore::open(&options.db_path).await?;
    let initialized =
        RunLifecycle::initialize(&store, &config, options.resume, &options.cli_skips).await?;
    let run_id = initialized.lifecycle.run_id;
    let attempt_id = initialized.lifecycle.attempt_id;
    info!(
        run_id,
        attempt_id,
        application = %config.application_name,
        jobs = config.jobs.len(),
        parallel = config.parallel,
        "starting attempt"
    );

    let log_dir = config.log_dir();
    if let Err(err) = tokio::fs::create_dir_all(&log_dir).await {
        warn!(dir = %log_dir.display(), "cannot create log directory: {err}");
    }
    let logs = LogFiles::new(&log_dir, &config.application_name, run_id, attempt_id);

    let all_jobs: HashSet<String> = config.job_ids().into_iter().collect();
    let exec = Arc::new(AttemptExecution {
        store,
        config: Arc::new(config),
        checks: Arc::new(checks),
        logs: Arc::new(logs),
        run_id,
        attempt_id,
        cancel: options.cancel,
        cli_env: options.cli_env,
    });
    let drained = execute_attempt(Arc::clone(&exec), &initialized.skip_set).await?;

    let snapshot = drained.snapshot;
    let status = initialized
        .lifecycle
        .finish(
            &snapshot.executed_successfully(),
            &snapshot.failed,
            &snapshot.all_skipped(),
            &all_jobs,
            drained.interrupted,
        )
        .await?;

    Ok(WorkflowOutcome {
        run_id,
        attempt_id,
        status,
        job_statuses: snapshot.statuses,
        reasons: snapshot.failed_reasons,
        exit_code: process_exit_code(status),
    })
}

/// Validate and compute the dry-run execution waves; nothing executes and
/// no attempt opens.
pub fn plan_waves(
    config: &WorkflowConfig,
    cli_skips: &HashSet<String>,
) -> Result<Vec<Vec<String>>, EngineError> {
    preflight(config)?;
    let skip_set: HashSet<String> = cli_skips
        .iter()
        .filter(|id| config.job(id.as_str()).is_some())
        .cloned()
        .collect();
    execution_waves(&config.jobs, &skip_set)
}

/// The shared pre-attempt validation pass: structural config checks, the
/// dependency graph, the security scan, and check-name resolution.
fn preflight(config: &WorkflowConfig) -> Result<CheckRegistry, EngineError> {
    config.validate()?;
    if !config.working_dir.is_dir() {
        return Err(ConfigError::MissingWorkingDir(config.working_dir.clone()).into());
    }
    validate_dependencies(&config.jobs)?;
    enforce_security_policy(config)?;
    let checks = CheckRegistry::builtin();
    checks.validate(&config.jobs)?;
    Ok(checks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_protocol::JobSpec;
    use pretty_assertions::assert_eq;

    fn base_config(dir: &std::path::Path) -> WorkflowConfig {
        let mut config: WorkflowConfig = serde_json::from_value(serde_json::json!({
            "application_name": "demo",
            "working_dir": dir.to_string_lossy(),
            "jobs": [],
        }))
        .unwrap();
        config.jobs = vec![JobSpec::new("a", "true")];
        config
    }

    #[test]
    fn preflight_rejects_missing_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.working_dir = dir.path().join("not-there");
        let err = preflight(&config).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn preflight_rejects_cycles_with_exit_code_two_family() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.jobs = vec![
            JobSpec::new("a", "true").with_dependencies(&["b"]),
            JobSpec::new("b", "true").with_dependencies(&["a"]),
        ];
        let err = preflight(&config).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn plan_waves_honors_cli_skips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.jobs = vec![
            JobSpec::new("a", "true"),
            JobSpec::new("b", "true").with_dependencies(&["a"]),
        ];
        let skips: HashSet<String> = ["a".to_string()].into();
        let waves = plan_waves(&config, &skips).unwrap();
        assert_eq!(waves, vec![vec!["b".to_string()]]);
    }
}
