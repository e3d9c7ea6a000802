//! Skip-set computation for resumed runs.

use std::collections::HashMap;
use std::collections::HashSet;

use dagrun_protocol::JobStatus;
use dagrun_protocol::WorkflowConfig;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeMode {
    /// Re-run everything that did not finish successfully, plus jobs that
    /// never ran.
    #[default]
    Normal,
    /// Re-run only jobs that previously ran and failed.
    FailedOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeRequest {
    pub run_id: i64,
    pub mode: ResumeMode,
}

/// Which jobs the new attempt should pre-mark as satisfied, given the
/// latest per-job statuses of the prior attempts.
///
/// Jobs recorded in history but no longer present in the configuration
/// are ignored; a drifted job count only warns.
pub(crate) fn compute_skip_set(
    prior: &HashMap<String, JobStatus>,
    config: &WorkflowConfig,
    mode: ResumeMode,
) -> HashSet<String> {
    if prior.len() != config.jobs.len() {
        warn!(
            prior = prior.len(),
            current = config.jobs.len(),
            "job count changed since the resumed run"
        );
    }
    config
        .jobs
        .iter()
        .filter(|job| match (mode, prior.get(&job.id)) {
            (_, Some(status)) if status.is_terminal_success() => true,
            (ResumeMode::FailedOnly, None) => true,
            _ => false,
        })
        .map(|job| job.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_protocol::JobSpec;
    use pretty_assertions::assert_eq;

    fn config(ids: &[&str]) -> WorkflowConfig {
        let mut config: WorkflowConfig = serde_json::from_value(serde_json::json!({
            "application_name": "demo",
            "working_dir": "/tmp",
            "jobs": [],
        }))
        .unwrap();
        config.jobs = ids.iter().map(|id| JobSpec::new(*id, "true")).collect();
        config
    }

    fn prior(pairs: &[(&str, JobStatus)]) -> HashMap<String, JobStatus> {
        pairs
            .iter()
            .map(|(id, status)| (id.to_string(), *status))
            .collect()
    }

    #[test]
    fn normal_mode_skips_success_and_skipped() {
        let prior = prior(&[
            ("a", JobStatus::Success),
            ("b", JobStatus::Failed),
            ("c", JobStatus::Skipped),
            ("d", JobStatus::Timeout),
        ]);
        let skips = compute_skip_set(&prior, &config(&["a", "b", "c", "d"]), ResumeMode::Normal);
        assert_eq!(skips, ["a".to_string(), "c".to_string()].into());
    }

    #[test]
    fn normal_mode_runs_jobs_that_never_ran() {
        let prior = prior(&[("a", JobStatus::Success)]);
        let skips = compute_skip_set(&prior, &config(&["a", "new-job"]), ResumeMode::Normal);
        assert_eq!(skips, ["a".to_string()].into());
    }

    #[test]
    fn failed_only_mode_also_skips_never_ran_jobs() {
        let prior = prior(&[("a", JobStatus::Success), ("b", JobStatus::Failed)]);
        let skips = compute_skip_set(&prior, &config(&["a", "b", "new-job"]), ResumeMode::FailedOnly);
        assert_eq!(skips, ["a".to_string(), "new-job".to_string()].into());
    }

    #[test]
    fn jobs_removed_from_config_are_ignored() {
        let prior = prior(&[("gone", JobStatus::Failed), ("a", JobStatus::Success)]);
        let skips = compute_skip_set(&prior, &config(&["a"]), ResumeMode::Normal);
        assert_eq!(skips, ["a".to_string()].into());
    }
}
