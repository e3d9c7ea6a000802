//! Lifecycle of one logical run: identifier allocation (fresh or
//! resumed), attempt opening with collision retry, and attempt closing
//! with the final status derivation.

use std::collections::HashSet;

use chrono::Utc;
use dagrun_protocol::AttemptStatus;
use dagrun_protocol::WorkflowConfig;
use dagrun_state::AttemptCounters;
use dagrun_state::HistoryStore;
use dagrun_state::OpenAttemptParams;
use dagrun_state::StoreError;
use tracing::info;

use crate::error::EngineError;
use crate::resume::ResumeRequest;
use crate::resume::compute_skip_set;

/// How many times to re-read the next attempt id after losing an
/// open-attempt race before giving up.
const OPEN_ATTEMPT_RETRIES: u32 = 3;

#[derive(Debug)]
pub(crate) struct RunLifecycle {
    store: HistoryStore,
    pub(crate) run_id: i64,
    pub(crate) attempt_id: i64,
}

#[derive(Debug)]
pub(crate) struct InitializedRun {
    pub lifecycle: RunLifecycle,
    /// Jobs pre-marked satisfied for this attempt (resume and `--skip`).
    pub skip_set: HashSet<String>,
}

impl RunLifecycle {
    /// Allocate identifiers, compute the skip-set, and open the attempt
    /// row. A lost open race re-reads identifiers a bounded number of
    /// times before surfacing a collision.
    pub(crate) async fn initialize(
        store: &HistoryStore,
        config: &WorkflowConfig,
        resume: Option<ResumeRequest>,
        cli_skips: &HashSet<String>,
    ) -> Result<InitializedRun, EngineError> {
        let mut skip_set: HashSet<String> = cli_skips
            .iter()
            .filter(|id| config.job(id.as_str()).is_some())
            .cloned()
            .collect();
        if let Some(resume) = resume {
            if store.next_attempt_id(resume.run_id).await? == 1 {
                return Err(EngineError::UnknownResumeRun(resume.run_id));
            }
            let prior = store.latest_status_per_job(resume.run_id).await?;
            skip_set.extend(compute_skip_set(&prior, config, resume.mode));
        }

        let total_jobs = config.jobs.len() as i64;
        let started_at = Utc::now();
        let mut last_conflict = None;
        for _ in 0..OPEN_ATTEMPT_RETRIES {
            let (run_id, attempt_id) = match resume {
                Some(resume) => (
                    resume.run_id,
                    store.next_attempt_id(resume.run_id).await?,
                ),
                None => (store.allocate_run_id().await?, 1),
            };
            let params = OpenAttemptParams {
                run_id,
                attempt_id,
                application_name: config.application_name.clone(),
                working_dir: config.working_dir.display().to_string(),
                start_time: started_at,
                total_jobs,
            };
            match store.open_attempt(&params).await {
                Ok(()) => {
                    info!(run_id, attempt_id, "attempt opened");
                    return Ok(InitializedRun {
                        lifecycle: RunLifecycle {
                            store: store.clone(),
                            run_id,
                            attempt_id,
                        },
                        skip_set,
                    });
                }
                Err(StoreError::Conflict(message)) => {
                    last_conflict = Some((run_id, message));
                }
                Err(err) => return Err(err.into()),
            }
        }
        let run_id = last_conflict
            .map(|(run_id, _)| run_id)
            .unwrap_or_default();
        Err(EngineError::ResumeCollision { run_id })
    }

    /// Derive the attempt status from the drained job sets and close the
    /// attempt row.
    pub(crate) async fn finish(
        &self,
        successful: &HashSet<String>,
        failed: &HashSet<String>,
        skipped: &HashSet<String>,
        all_jobs: &HashSet<String>,
        interrupted: bool,
    ) -> Result<AttemptStatus, EngineError> {
        let status = if interrupted {
            AttemptStatus::Interrupted
        } else if !failed.is_empty() {
            AttemptStatus::Failed
        } else if successful
            .union(skipped)
            .cloned()
            .collect::<HashSet<String>>()
            == *all_jobs
        {
            AttemptStatus::Success
        } else {
            AttemptStatus::Partial
        };
        let counters = AttemptCounters {
            successful: successful.len() as i64,
            failed: failed.len() as i64,
            skipped: skipped.len() as i64,
        };
        self.store
            .close_attempt(self.run_id, self.attempt_id, status, counters, Utc::now())
            .await?;
        info!(
            run_id = self.run_id,
            attempt_id = self.attempt_id,
            status = %status,
            successful = counters.successful,
            failed = counters.failed,
            skipped = counters.skipped,
            "attempt closed"
        );
        Ok(status)
    }
}

/// Process exit code for a finished attempt: 0 when everything succeeded
/// or was skipped, 130 on interrupt, 1 otherwise.
pub fn process_exit_code(status: AttemptStatus) -> i32 {
    match status {
        AttemptStatus::Success => 0,
        AttemptStatus::Interrupted => 130,
        AttemptStatus::Running | AttemptStatus::Partial | AttemptStatus::Failed => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(names: &[&str]) -> HashSet<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn config_with_jobs(names: &[&str]) -> WorkflowConfig {
        let mut config: WorkflowConfig = serde_json::from_value(serde_json::json!({
            "application_name": "demo",
            "working_dir": "/tmp",
            "jobs": [],
        }))
        .unwrap();
        config.jobs = names
            .iter()
            .map(|name| dagrun_protocol::JobSpec::new(*name, "true"))
            .collect();
        config
    }

    #[tokio::test]
    async fn fresh_run_opens_attempt_one() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        let config = config_with_jobs(&["a"]);
        let initialized = RunLifecycle::initialize(&store, &config, None, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(initialized.lifecycle.attempt_id, 1);
        assert!(initialized.skip_set.is_empty());
    }

    #[tokio::test]
    async fn resume_of_unknown_run_is_rejected() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        let config = config_with_jobs(&["a"]);
        let err = RunLifecycle::initialize(
            &store,
            &config,
            Some(ResumeRequest {
                run_id: 99,
                mode: crate::resume::ResumeMode::Normal,
            }),
            &HashSet::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::UnknownResumeRun(99)));
    }

    #[tokio::test]
    async fn resume_increments_the_attempt_id() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        let config = config_with_jobs(&["a"]);
        let first = RunLifecycle::initialize(&store, &config, None, &HashSet::new())
            .await
            .unwrap();
        let run_id = first.lifecycle.run_id;
        let resumed = RunLifecycle::initialize(
            &store,
            &config,
            Some(ResumeRequest {
                run_id,
                mode: crate::resume::ResumeMode::Normal,
            }),
            &HashSet::new(),
        )
        .await
        .unwrap();
        assert_eq!(resumed.lifecycle.run_id, run_id);
        assert_eq!(resumed.lifecycle.attempt_id, 2);
    }

    #[tokio::test]
    async fn cli_skips_ignore_unknown_ids() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        let config = config_with_jobs(&["a", "b"]);
        let initialized = RunLifecycle::initialize(&store, &config, None, &ids(&["b", "ghost"]))
            .await
            .unwrap();
        assert_eq!(initialized.skip_set, ids(&["b"]));
    }

    #[tokio::test]
    async fn finish_derives_the_documented_status_order() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        let config = config_with_jobs(&["a", "b"]);
        let all = ids(&["a", "b"]);

        let initialized = RunLifecycle::initialize(&store, &config, None, &HashSet::new())
            .await
            .unwrap();
        let status = initialized
            .lifecycle
            .finish(&ids(&["a", "b"]), &HashSet::new(), &HashSet::new(), &all, false)
            .await
            .unwrap();
        assert_eq!(status, AttemptStatus::Success);

        let status = initialized
            .lifecycle
            .finish(&ids(&["a"]), &ids(&["b"]), &HashSet::new(), &all, false)
            .await
            .unwrap();
        assert_eq!(status, AttemptStatus::Failed);

        let status = initialized
            .lifecycle
            .finish(&ids(&["a"]), &HashSet::new(), &HashSet::new(), &all, false)
            .await
            .unwrap();
        assert_eq!(status, AttemptStatus::Partial);

        let status = initialized
            .lifecycle
            .finish(&ids(&["a"]), &ids(&["b"]), &HashSet::new(), &all, true)
            .await
            .unwrap();
        assert_eq!(status, AttemptStatus::Interrupted);
    }

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(process_exit_code(AttemptStatus::Success), 0);
        assert_eq!(process_exit_code(AttemptStatus::Failed), 1);
        assert_eq!(process_exit_code(AttemptStatus::Partial), 1);
        assert_eq!(process_exit_code(AttemptStatus::Interrupted), 130);
    }
}
