//! Executes one job from RUNNING to a terminal status: pre-checks, the
//! retry loop around subprocess supervision, post-checks, and the final
//! history-row write. The runner never propagates errors to the
//! orchestrator; every failure mode collapses into a terminal status plus
//! a reason string.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use dagrun_protocol::JobSpec;
use dagrun_protocol::JobStatus;
use dagrun_protocol::RetryAttempt;
use dagrun_protocol::RetryPolicy;
use dagrun_state::JobRowFinal;
use dagrun_state::JobRowWriter;
use rand::Rng;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::checks::CheckContext;
use crate::checks::CheckOutcome;
use crate::checks::CheckRegistry;
use crate::logs::LogFiles;
use crate::spawn::SpawnJobRequest;
use crate::spawn::spawn_job;
use crate::spawn::terminate_group;

/// How long a process group gets between SIGTERM and SIGKILL.
pub(crate) const KILL_GRACE: Duration = Duration::from_secs(5);

pub(crate) struct JobExecution<'a> {
    pub job: &'a JobSpec,
    pub timeout: Duration,
    pub policy: RetryPolicy,
    pub env: HashMap<String, String>,
    pub working_dir: &'a Path,
    pub writer: &'a JobRowWriter,
    pub logs: &'a LogFiles,
    pub checks: &'a CheckRegistry,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct JobOutcome {
    pub status: JobStatus,
    pub reason: Option<String>,
}

/// How one execution of the command ended.
enum AttemptEnd {
    Exited { code: i32 },
    Signaled { signal: Option<i32> },
    TimedOut,
    Cancelled,
    SpawnFailed(io::Error),
    WaitFailed(io::Error),
}

impl AttemptEnd {
    fn classify(&self, timeout: Duration) -> (JobStatus, Option<i32>, Option<String>) {
        match self {
            AttemptEnd::Exited { code: 0 } => (JobStatus::Success, Some(0), None),
            AttemptEnd::Exited { code } => (
                JobStatus::Failed,
                Some(*code),
                Some(format!("exit code {code}")),
            ),
            AttemptEnd::Signaled { signal } => (
                JobStatus::Error,
                None,
                Some(match signal {
                    Some(signal) => format!("terminated by signal {signal}"),
                    None => "terminated by signal".to_string(),
                }),
            ),
            AttemptEnd::TimedOut => (
                JobStatus::Timeout,
                Some(-1),
                Some(format!("timed out after {}s", timeout.as_secs())),
            ),
            AttemptEnd::Cancelled => (JobStatus::Error, None, Some("cancelled".to_string())),
            AttemptEnd::SpawnFailed(err) => (
                JobStatus::Error,
                None,
                Some(format!("failed to start command: {err}")),
            ),
            AttemptEnd::WaitFailed(err) => (
                JobStatus::Error,
                None,
                Some(format!("failed to wait for command: {err}")),
            ),
        }
    }

    /// Spawn failures, cancellation, and wait errors never retry; the
    /// rest is up to the retry policy.
    fn is_policy_retryable(&self) -> bool {
        matches!(
            self,
            AttemptEnd::Exited { .. } | AttemptEnd::Signaled { .. } | AttemptEnd::TimedOut
        )
    }
}

pub(crate) async fn run_job(exec: JobExecution<'_>) -> JobOutcome {
    let JobExecution {
        job,
        timeout,
        policy,
        env,
        working_dir,
        writer,
        logs,
        checks,
        cancel,
    } = exec;

    let started_at = Utc::now();
    let first_attempt = Instant::now();
    if let Err(err) = writer.mark_running(started_at).await {
        error!(job = %job.id, "cannot record job start: {err}");
        return JobOutcome {
            status: JobStatus::Error,
            reason: Some(format!("history write failed: {err}")),
        };
    }
    debug!(job = %job.id, "job running");

    let ctx = CheckContext {
        job_id: job.id.as_str(),
        working_dir,
        env: &env,
    };

    // Pre-checks gate the command entirely; they are never retried.
    if let Some(reason) = evaluate_checks(&job.pre_checks, checks, &ctx, "pre-check") {
        logs.append_note(&job.id, &reason);
        finalize(writer, &job.id, JobStatus::Failed, started_at, None, 0, Vec::new()).await;
        return JobOutcome {
            status: JobStatus::Failed,
            reason: Some(reason),
        };
    }

    let mut history: Vec<RetryAttempt> = Vec::new();
    let mut status;
    let mut exit_code;
    let mut reason;
    let mut executions: u32 = 0;

    loop {
        let attempt = executions;
        executions += 1;
        let (stdout, stderr) = logs.stdio_for_attempt(&job.id, executions, &job.command);
        let end = match spawn_job(SpawnJobRequest {
            command: &job.command,
            cwd: working_dir,
            env: &env,
            stdout,
            stderr,
        }) {
            Ok(mut child) => supervise(&mut child, timeout, &cancel, logs, &job.id).await,
            Err(err) => AttemptEnd::SpawnFailed(err),
        };
        (status, exit_code, reason) = end.classify(timeout);
        history.push(RetryAttempt {
            ordinal: executions,
            timestamp: Utc::now().timestamp(),
            status,
            exit_code,
            error: reason.clone(),
        });
        if status == JobStatus::Success {
            break;
        }

        let within_count = attempt < policy.max_retries;
        let within_budget =
            policy.max_retry_time.is_zero() || first_attempt.elapsed() < policy.max_retry_time;
        if !(end.is_policy_retryable()
            && within_count
            && policy.admits(status, exit_code)
            && within_budget)
        {
            break;
        }

        let delay = jittered_delay(&policy, attempt);
        info!(
            job = %job.id,
            attempt = executions,
            delay_ms = delay.as_millis() as u64,
            "retrying after {status}"
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // A post-check failure demotes a success but keeps the command's
    // exit code; command retries are spent by this point.
    if status == JobStatus::Success
        && let Some(check_reason) = evaluate_checks(&job.post_checks, checks, &ctx, "post-check")
    {
        logs.append_note(&job.id, &check_reason);
        status = JobStatus::Failed;
        reason = Some(check_reason);
    }

    finalize(
        writer,
        &job.id,
        status,
        started_at,
        exit_code,
        i64::from(executions.saturating_sub(1)),
        history,
    )
    .await;
    JobOutcome { status, reason }
}

fn evaluate_checks(
    specs: &[dagrun_protocol::CheckSpec],
    checks: &CheckRegistry,
    ctx: &CheckContext<'_>,
    kind: &str,
) -> Option<String> {
    for spec in specs {
        if let CheckOutcome::Failed(message) = checks.evaluate(spec, ctx) {
            return Some(format!("{kind} {} failed: {message}", spec.name));
        }
    }
    None
}

async fn supervise(
    child: &mut Child,
    timeout: Duration,
    cancel: &CancellationToken,
    logs: &LogFiles,
    job_id: &str,
) -> AttemptEnd {
    let waited = tokio::select! {
        waited = tokio::time::timeout(timeout, child.wait()) => Some(waited),
        _ = cancel.cancelled() => None,
    };
    match waited {
        Some(Ok(Ok(exit))) => classify_exit(exit),
        Some(Ok(Err(err))) => AttemptEnd::WaitFailed(err),
        Some(Err(_elapsed)) => {
            logs.append_note(job_id, "deadline exceeded, terminating process group");
            terminate_group(child, KILL_GRACE).await;
            AttemptEnd::TimedOut
        }
        None => {
            logs.append_note(job_id, "cancelled, terminating process group");
            terminate_group(child, KILL_GRACE).await;
            AttemptEnd::Cancelled
        }
    }
}

#[cfg(unix)]
fn classify_exit(exit: std::process::ExitStatus) -> AttemptEnd {
    use std::os::unix::process::ExitStatusExt;

    match exit.code() {
        Some(code) => AttemptEnd::Exited { code },
        None => AttemptEnd::Signaled {
            signal: exit.signal(),
        },
    }
}

#[cfg(not(unix))]
fn classify_exit(exit: std::process::ExitStatus) -> AttemptEnd {
    match exit.code() {
        Some(code) => AttemptEnd::Exited { code },
        None => AttemptEnd::Signaled { signal: None },
    }
}

fn jittered_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_delay(attempt);
    if policy.jitter <= 0.0 {
        return base;
    }
    let factor = 1.0 + rand::rng().random_range(-policy.jitter..policy.jitter);
    base.mul_f64(factor.max(0.0))
}

async fn finalize(
    writer: &JobRowWriter,
    job_id: &str,
    status: JobStatus,
    started_at: chrono::DateTime<Utc>,
    exit_code: Option<i32>,
    retry_count: i64,
    retry_history: Vec<RetryAttempt>,
) {
    let row = JobRowFinal {
        status,
        start_time: started_at,
        end_time: Utc::now(),
        exit_code,
        retry_count,
        retry_history,
    };
    if let Err(err) = writer.finalize(&row).await {
        error!(job = job_id, "cannot record job result: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_state::HistoryStore;
    use dagrun_state::OpenAttemptParams;
    use pretty_assertions::assert_eq;

    struct Harness {
        store: HistoryStore,
        dir: tempfile::TempDir,
        checks: CheckRegistry,
    }

    impl Harness {
        async fn new() -> Self {
            let store = HistoryStore::open_in_memory().await.unwrap();
            store
                .open_attempt(&OpenAttemptParams {
                    run_id: 1,
                    attempt_id: 1,
                    application_name: "test".to_string(),
                    working_dir: "/tmp".to_string(),
                    start_time: Utc::now(),
                    total_jobs: 1,
                })
                .await
                .unwrap();
            Self {
                store,
                dir: tempfile::tempdir().unwrap(),
                checks: CheckRegistry::builtin(),
            }
        }

        async fn run(&self, job: &JobSpec, policy: RetryPolicy, timeout: Duration) -> JobOutcome {
            self.run_with_cancel(job, policy, timeout, CancellationToken::new())
                .await
        }

        async fn run_with_cancel(
            &self,
            job: &JobSpec,
            policy: RetryPolicy,
            timeout: Duration,
            cancel: CancellationToken,
        ) -> JobOutcome {
            let writer = self.store.job_row_writer(1, 1, &job.id, &job.command);
            let logs = LogFiles::new(self.dir.path(), "test", 1, 1);
            run_job(JobExecution {
                job,
                timeout,
                policy,
                env: HashMap::new(),
                working_dir: self.dir.path(),
                writer: &writer,
                logs: &logs,
                checks: &self.checks,
                cancel,
            })
            .await
        }

        async fn record(&self, job_id: &str) -> dagrun_state::JobRecord {
            let details = self.store.run_details(1).await.unwrap();
            details
                .jobs
                .into_iter()
                .find(|record| record.job_id == job_id)
                .unwrap_or_else(|| panic!("no row for {job_id}"))
        }
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 0,
            delay: Duration::from_millis(10),
            backoff: 1.0,
            jitter: 0.0,
            max_retry_time: Duration::ZERO,
            retry_on_status: vec![JobStatus::Failed, JobStatus::Timeout],
            retry_on_exit_codes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn successful_command_records_one_history_entry() {
        let harness = Harness::new().await;
        let job = JobSpec::new("ok", "echo hello");
        let outcome = harness.run(&job, no_retry(), Duration::from_secs(10)).await;
        assert_eq!(outcome.status, JobStatus::Success);
        let record = harness.record("ok").await;
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.retry_history.len(), 1);
        assert_eq!(record.retry_history[0].status, JobStatus::Success);
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed_with_the_code_preserved() {
        let harness = Harness::new().await;
        let job = JobSpec::new("bad", "exit 3");
        let outcome = harness.run(&job, no_retry(), Duration::from_secs(10)).await;
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.reason.as_deref(), Some("exit code 3"));
        let record = harness.record("bad").await;
        assert_eq!(record.exit_code, Some(3));
    }

    #[tokio::test]
    async fn retries_until_the_command_succeeds() {
        let harness = Harness::new().await;
        // Fails with exit 1 twice, then succeeds.
        let job = JobSpec::new(
            "flaky",
            "n=$(cat tries 2>/dev/null || echo 0); n=$((n+1)); echo $n > tries; test $n -ge 3",
        );
        let mut policy = no_retry();
        policy.max_retries = 2;
        policy.retry_on_exit_codes = vec![1];
        let outcome = harness.run(&job, policy, Duration::from_secs(10)).await;
        assert_eq!(outcome.status, JobStatus::Success);
        let record = harness.record("flaky").await;
        assert_eq!(record.retry_count, 2);
        assert_eq!(
            record
                .retry_history
                .iter()
                .map(|entry| entry.exit_code)
                .collect::<Vec<_>>(),
            vec![Some(1), Some(1), Some(0)]
        );
    }

    #[tokio::test]
    async fn exhausted_retries_perform_exactly_max_plus_one_executions() {
        let harness = Harness::new().await;
        let job = JobSpec::new(
            "hopeless",
            "n=$(cat count 2>/dev/null || echo 0); echo $((n+1)) > count; exit 1",
        );
        let mut policy = no_retry();
        policy.max_retries = 2;
        let outcome = harness.run(&job, policy, Duration::from_secs(10)).await;
        assert_eq!(outcome.status, JobStatus::Failed);
        let record = harness.record("hopeless").await;
        assert_eq!(record.retry_history.len(), 3);
        let executions = std::fs::read_to_string(harness.dir.path().join("count")).unwrap();
        assert_eq!(executions.trim(), "3");
    }

    #[tokio::test]
    async fn timeout_kills_the_process_group_and_reports_minus_one() {
        let harness = Harness::new().await;
        let job = JobSpec::new("slow", "sleep 30");
        let started = Instant::now();
        let outcome = harness.run(&job, no_retry(), Duration::from_secs(1)).await;
        assert_eq!(outcome.status, JobStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(1) + KILL_GRACE);
        let record = harness.record("slow").await;
        assert_eq!(record.exit_code, Some(-1));
        assert_eq!(record.status, JobStatus::Timeout);
    }

    #[tokio::test]
    async fn cancellation_terminates_with_a_distinguished_reason() {
        let harness = Harness::new().await;
        let job = JobSpec::new("hang", "sleep 30");
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trip.cancel();
        });
        let outcome = harness
            .run_with_cancel(&job, no_retry(), Duration::from_secs(30), cancel)
            .await;
        assert_eq!(outcome.status, JobStatus::Error);
        assert_eq!(outcome.reason.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn pre_check_failure_skips_the_command_entirely() {
        let harness = Harness::new().await;
        let mut job = JobSpec::new("gated", "echo should-not-run > ran.txt");
        job.pre_checks = vec![dagrun_protocol::CheckSpec {
            name: "file_exists".to_string(),
            params: [(
                "path".to_string(),
                serde_json::json!("missing-prerequisite"),
            )]
            .into(),
        }];
        let outcome = harness.run(&job, no_retry(), Duration::from_secs(10)).await;
        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(outcome.reason.unwrap().starts_with("pre-check file_exists failed"));
        assert!(!harness.dir.path().join("ran.txt").exists());
        let record = harness.record("gated").await;
        assert!(record.retry_history.is_empty());
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn post_check_failure_demotes_success_but_keeps_exit_code() {
        let harness = Harness::new().await;
        let mut job = JobSpec::new("produce", "true");
        job.post_checks = vec![dagrun_protocol::CheckSpec {
            name: "file_exists".to_string(),
            params: [("path".to_string(), serde_json::json!("expected-output"))].into(),
        }];
        let outcome = harness.run(&job, no_retry(), Duration::from_secs(10)).await;
        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(outcome.reason.unwrap().starts_with("post-check"));
        let record = harness.record("produce").await;
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn wall_clock_budget_stops_the_retry_loop() {
        let harness = Harness::new().await;
        let job = JobSpec::new("budgeted", "sleep 1; exit 1");
        let mut policy = no_retry();
        policy.max_retries = 50;
        policy.max_retry_time = Duration::from_secs(1);
        let outcome = harness.run(&job, policy, Duration::from_secs(10)).await;
        assert_eq!(outcome.status, JobStatus::Failed);
        let record = harness.record("budgeted").await;
        // The first execution consumes the whole budget.
        assert!(record.retry_history.len() <= 2);
    }
}
