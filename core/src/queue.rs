//! In-memory job-state bookkeeping for one attempt.
//!
//! The queue tracks five disjoint sets of job ids (queued, active,
//! completed, failed, skipped) plus a FIFO ready queue, all behind one
//! lock. It answers "which jobs may start now?" and propagates dependency
//! failures transitively. A notify handle wakes the orchestrator whenever
//! any job reaches a terminal state.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::time::Duration;

use dagrun_protocol::JobSpec;
use dagrun_protocol::JobStatus;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tracing::debug;

pub const REASON_DEPENDENCY_FAILED: &str = "dependency failed";
pub const REASON_ABORTED: &str = "aborted after failure";
pub const REASON_INTERRUPTED: &str = "interrupted";

#[derive(Debug, Default)]
struct QueueState {
    dependencies: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
    queued: HashSet<String>,
    active: HashSet<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    skipped: HashSet<String>,
    failed_reasons: HashMap<String, String>,
    ready: VecDeque<String>,
    ever_ready: HashSet<String>,
    /// Jobs satisfied before the attempt started (resume or --skip).
    preskipped: HashSet<String>,
    /// Exact terminal status per job, for reporting.
    statuses: HashMap<String, JobStatus>,
}

/// Point-in-time copy of the terminal bookkeeping, taken under the lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    pub completed: HashSet<String>,
    pub failed: HashSet<String>,
    pub skipped: HashSet<String>,
    pub preskipped: HashSet<String>,
    pub failed_reasons: HashMap<String, String>,
    pub statuses: HashMap<String, JobStatus>,
}

impl QueueSnapshot {
    /// Jobs that finished successfully in this attempt (pre-skipped jobs
    /// satisfy dependencies but do not count as executed).
    pub fn executed_successfully(&self) -> HashSet<String> {
        self.completed
            .difference(&self.preskipped)
            .cloned()
            .collect()
    }

    /// Every job that ended skipped, whether before the attempt started
    /// or by propagation during it.
    pub fn all_skipped(&self) -> HashSet<String> {
        self.skipped.union(&self.preskipped).cloned().collect()
    }
}

pub struct JobQueue {
    inner: Mutex<QueueState>,
    completion: Notify,
}

impl JobQueue {
    /// Build the queue for one attempt. Every id in `skip_set` is treated
    /// as an already-satisfied dependency; every remaining job whose
    /// dependencies are all satisfied starts in the ready queue.
    pub async fn seed(jobs: &[JobSpec], skip_set: &HashSet<String>) -> Self {
        let mut state = QueueState::default();
        for job in jobs {
            state
                .dependencies
                .insert(job.id.clone(), job.dependencies.clone());
            for dependency in &job.dependencies {
                state
                    .dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(job.id.clone());
            }
        }
        for job in jobs {
            if skip_set.contains(&job.id) {
                state.completed.insert(job.id.clone());
                state.preskipped.insert(job.id.clone());
                state.statuses.insert(job.id.clone(), JobStatus::Skipped);
            }
        }
        for job in jobs {
            if state.completed.contains(&job.id) {
                continue;
            }
            let satisfied = job
                .dependencies
                .iter()
                .all(|dependency| state.completed.contains(dependency));
            if satisfied {
                state.ready.push_back(job.id.clone());
                state.queued.insert(job.id.clone());
                state.ever_ready.insert(job.id.clone());
            }
        }
        Self {
            inner: Mutex::new(state),
            completion: Notify::new(),
        }
    }

    /// Pop one ready job and mark it active.
    pub async fn pop_ready(&self) -> Option<String> {
        let mut state = self.inner.lock().await;
        let job_id = state.ready.pop_front()?;
        state.queued.remove(&job_id);
        state.active.insert(job_id.clone());
        Some(job_id)
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    pub async fn has_ready(&self) -> bool {
        !self.inner.lock().await.ready.is_empty()
    }

    /// Record a terminal status for `job_id` and release or skip its
    /// dependents. Returns the jobs that became SKIPPED as a consequence,
    /// so the caller can record history rows for them.
    pub async fn mark_complete(&self, job_id: &str, status: JobStatus) -> Vec<String> {
        let mut state = self.inner.lock().await;
        state.active.remove(job_id);
        state.queued.remove(job_id);

        let mut newly_skipped = Vec::new();
        match status {
            status if status.is_terminal_failure() => {
                state.failed.insert(job_id.to_string());
                state
                    .failed_reasons
                    .entry(job_id.to_string())
                    .or_insert_with(|| status.to_string());
            }
            JobStatus::Skipped => {
                state.skipped.insert(job_id.to_string());
            }
            JobStatus::Success => {
                state.completed.insert(job_id.to_string());
            }
            other => {
                debug!(job = job_id, status = %other, "ignoring non-terminal completion");
                return newly_skipped;
            }
        }
        state.statuses.insert(job_id.to_string(), status);
        state.resolve_dependents(job_id, &mut newly_skipped);
        state.check_disjoint();
        drop(state);
        self.completion.notify_one();
        newly_skipped
    }

    /// Record a failure reason observed by the runner (kept alongside the
    /// status for reporting).
    pub async fn record_reason(&self, job_id: &str, reason: &str) {
        let mut state = self.inner.lock().await;
        state
            .failed_reasons
            .insert(job_id.to_string(), reason.to_string());
    }

    /// Mark every job that has not reached a terminal state (and is not
    /// currently active) as SKIPPED with `reason`. Returns the drained
    /// ids.
    pub async fn drain_pending(&self, reason: &str) -> Vec<String> {
        let mut state = self.inner.lock().await;
        let mut drained: Vec<String> = Vec::new();
        let ids: Vec<String> = state.dependencies.keys().cloned().collect();
        for job_id in ids {
            let terminal = state.completed.contains(&job_id)
                || state.failed.contains(&job_id)
                || state.skipped.contains(&job_id);
            if terminal || state.active.contains(&job_id) {
                continue;
            }
            state.queued.remove(&job_id);
            state.skipped.insert(job_id.clone());
            state.statuses.insert(job_id.clone(), JobStatus::Skipped);
            state
                .failed_reasons
                .insert(job_id.clone(), reason.to_string());
            drained.push(job_id);
        }
        state.ready.clear();
        state.check_disjoint();
        drained
    }

    /// Wait until some job completes, or until `timeout` elapses. The
    /// timeout bounds scheduling latency; callers re-inspect state on
    /// every wakeup.
    pub async fn wait_for_completion(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.completion.notified()).await;
    }

    /// Whether nothing is in flight and nothing can be dispatched.
    pub async fn is_drained(&self) -> bool {
        let state = self.inner.lock().await;
        state.ready.is_empty() && state.active.is_empty()
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.lock().await;
        QueueSnapshot {
            completed: state.completed.clone(),
            failed: state.failed.clone(),
            skipped: state.skipped.clone(),
            preskipped: state.preskipped.clone(),
            failed_reasons: state.failed_reasons.clone(),
            statuses: state.statuses.clone(),
        }
    }
}

impl QueueState {
    /// After `source` reached a terminal state, re-evaluate its
    /// dependents: a dependent with any failed-or-skipped dependency is
    /// skipped (failure wins and propagates transitively); one whose
    /// dependencies are all satisfied becomes ready.
    fn resolve_dependents(&mut self, source: &str, newly_skipped: &mut Vec<String>) {
        let mut worklist: VecDeque<String> = self
            .dependents
            .get(source)
            .map(|dependents| dependents.iter().cloned().collect())
            .unwrap_or_default();
        while let Some(candidate) = worklist.pop_front() {
            if self.ever_ready.contains(&candidate)
                || self.active.contains(&candidate)
                || self.completed.contains(&candidate)
                || self.failed.contains(&candidate)
                || self.skipped.contains(&candidate)
            {
                continue;
            }
            let dependencies = self
                .dependencies
                .get(&candidate)
                .cloned()
                .unwrap_or_default();
            let failed_path = dependencies
                .iter()
                .any(|dep| self.failed.contains(dep) || self.skipped.contains(dep));
            if failed_path {
                self.skipped.insert(candidate.clone());
                self.statuses.insert(candidate.clone(), JobStatus::Skipped);
                self.failed_reasons
                    .insert(candidate.clone(), REASON_DEPENDENCY_FAILED.to_string());
                newly_skipped.push(candidate.clone());
                if let Some(children) = self.dependents.get(&candidate) {
                    worklist.extend(children.iter().cloned());
                }
                continue;
            }
            let satisfied = dependencies.iter().all(|dep| self.completed.contains(dep));
            if satisfied {
                self.ready.push_back(candidate.clone());
                self.queued.insert(candidate.clone());
                self.ever_ready.insert(candidate);
            }
        }
    }

    fn check_disjoint(&self) {
        debug_assert!(self.active.is_disjoint(&self.completed));
        debug_assert!(self.active.is_disjoint(&self.failed));
        debug_assert!(self.active.is_disjoint(&self.skipped));
        debug_assert!(self.completed.is_disjoint(&self.failed));
        debug_assert!(self.completed.is_disjoint(&self.skipped));
        debug_assert!(self.failed.is_disjoint(&self.skipped));
        debug_assert!(self.queued.is_disjoint(&self.active));
    }
}
