//! Serial and worker-pool execution strategies over the job queue.
//!
//! Both strategies share one contract: pop ready jobs, hand each to the
//! runner, feed terminal statuses back into the queue (which releases or
//! skips dependents), and honor cancellation. The parallel coordinator
//! waits on the queue's completion signal with a short timeout so a
//! wakeup can never be missed for long.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dagrun_protocol::JobSpec;
use dagrun_protocol::WorkflowConfig;
use dagrun_state::HistoryStore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::checks::CheckRegistry;
use crate::env::assemble_env;
use crate::error::EngineError;
use crate::logs::LogFiles;
use crate::queue::JobQueue;
use crate::queue::QueueSnapshot;
use crate::queue::REASON_ABORTED;
use crate::queue::REASON_INTERRUPTED;
use crate::runner::JobExecution;
use crate::runner::run_job;

/// Upper bound on how long the parallel coordinator sleeps between
/// schedule passes when no completion signal arrives.
const COMPLETION_POLL: Duration = Duration::from_millis(100);

pub(crate) struct AttemptExecution {
    pub store: HistoryStore,
    pub config: Arc<WorkflowConfig>,
    pub checks: Arc<CheckRegistry>,
    pub logs: Arc<LogFiles>,
    pub run_id: i64,
    pub attempt_id: i64,
    /// Trips on SIGINT/SIGTERM; workers receive a child of this token.
    pub cancel: CancellationToken,
    pub cli_env: std::collections::HashMap<String, String>,
}

pub(crate) struct DrainOutcome {
    pub snapshot: QueueSnapshot,
    pub interrupted: bool,
}

pub(crate) async fn execute_attempt(
    exec: Arc<AttemptExecution>,
    skip_set: &HashSet<String>,
) -> Result<DrainOutcome, EngineError> {
    let queue = Arc::new(JobQueue::seed(&exec.config.jobs, skip_set).await);

    // Jobs satisfied before the attempt starts still get a history row,
    // so resume sees them and listings stay complete.
    for job_id in skip_set {
        record_skip(&exec, job_id).await;
    }

    // Covers both abort-on-failure and external interrupt: either one
    // stops dispatch and cancels in-flight subprocesses.
    let worker_cancel = exec.cancel.child_token();

    if exec.config.parallel {
        run_parallel(&exec, &queue, &worker_cancel).await;
    } else {
        run_serial(&exec, &queue, &worker_cancel).await;
    }

    let interrupted = exec.cancel.is_cancelled();
    let reason = if interrupted {
        REASON_INTERRUPTED
    } else {
        REASON_ABORTED
    };
    for job_id in queue.drain_pending(reason).await {
        record_skip(&exec, &job_id).await;
    }

    Ok(DrainOutcome {
        snapshot: queue.snapshot().await,
        interrupted,
    })
}

async fn run_serial(exec: &Arc<AttemptExecution>, queue: &Arc<JobQueue>, cancel: &CancellationToken) {
    while !cancel.is_cancelled() {
        let Some(job_id) = queue.pop_ready().await else {
            break;
        };
        let Some(job) = exec.config.job(&job_id).cloned() else {
            warn!(job = %job_id, "job disappeared from configuration");
            continue;
        };
        run_one(exec, queue, cancel, job).await;
    }
}

async fn run_parallel(
    exec: &Arc<AttemptExecution>,
    queue: &Arc<JobQueue>,
    cancel: &CancellationToken,
) {
    let max_workers = exec.config.max_workers.max(1);
    let mut workers: JoinSet<()> = JoinSet::new();
    loop {
        // Reap finished worker tasks without blocking.
        while let Some(result) = workers.try_join_next() {
            if let Err(err) = result {
                error!("worker task failed: {err}");
            }
        }

        if cancel.is_cancelled() {
            if queue.active_count().await == 0 {
                break;
            }
        } else {
            while workers.len() < max_workers {
                let Some(job_id) = queue.pop_ready().await else {
                    break;
                };
                let Some(job) = exec.config.job(&job_id).cloned() else {
                    warn!(job = %job_id, "job disappeared from configuration");
                    continue;
                };
                debug!(job = %job_id, "dispatching to worker");
                let exec = Arc::clone(exec);
                let queue = Arc::clone(queue);
                let cancel = cancel.clone();
                workers.spawn(async move {
                    run_one(&exec, &queue, &cancel, job).await;
                });
            }
            if queue.is_drained().await {
                break;
            }
        }
        queue.wait_for_completion(COMPLETION_POLL).await;
    }
    // Bounded by the runner's own kill grace: every worker terminates its
    // subprocess shortly after cancellation.
    while let Some(result) = workers.join_next().await {
        if let Err(err) = result {
            error!("worker task failed: {err}");
        }
    }
}

/// Run one job to its terminal status and feed the result back into the
/// queue. Used verbatim by both strategies; in parallel mode several of
/// these run concurrently on independent rows.
async fn run_one(
    exec: &Arc<AttemptExecution>,
    queue: &Arc<JobQueue>,
    cancel: &CancellationToken,
    job: JobSpec,
) {
    let env = assemble_env(
        &exec.config.inherit_shell_env,
        &exec.config.env_variables,
        &job.env,
        &exec.cli_env,
    );
    let writer = exec
        .store
        .job_row_writer(exec.run_id, exec.attempt_id, &job.id, &job.command);
    let outcome = run_job(JobExecution {
        job: &job,
        timeout: exec.config.timeout_for(&job),
        policy: exec.config.retry_policy_for(&job),
        env,
        working_dir: &exec.config.working_dir,
        writer: &writer,
        logs: &exec.logs,
        checks: &exec.checks,
        cancel: cancel.clone(),
    })
    .await;

    if let Some(reason) = &outcome.reason {
        queue.record_reason(&job.id, reason).await;
    }
    let newly_skipped = queue.mark_complete(&job.id, outcome.status).await;
    for skipped_id in newly_skipped {
        record_skip(exec, &skipped_id).await;
    }
    if outcome.status.is_terminal_failure() && !exec.config.continue_on_error {
        debug!(job = %job.id, status = %outcome.status, "stopping dispatch after failure");
        cancel.cancel();
    }
}

async fn record_skip(exec: &Arc<AttemptExecution>, job_id: &str) {
    let command = exec
        .config
        .job(job_id)
        .map(|job| job.command.clone())
        .unwrap_or_default();
    let writer = exec
        .store
        .job_row_writer(exec.run_id, exec.attempt_id, job_id, &command);
    if let Err(err) = writer.mark_skipped().await {
        error!(job = job_id, "cannot record skipped job: {err}");
    }
}
