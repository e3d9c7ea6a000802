use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::status::JobStatus;

/// One pre- or post-check invocation: a registered check name plus its
/// parameters as they appeared in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckSpec {
    pub name: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

/// Immutable description of one unit of work.
///
/// Retry and timeout fields are optional here; [`JobSpec::retry_policy`]
/// and [`JobSpec::timeout`] merge them with the workflow-level defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_seconds: Option<f64>,
    #[serde(default)]
    pub retry_backoff: Option<f64>,
    #[serde(default)]
    pub retry_jitter: Option<f64>,
    #[serde(default)]
    pub max_retry_time_seconds: Option<u64>,
    #[serde(default)]
    pub retry_on_status: Option<Vec<JobStatus>>,
    #[serde(default)]
    pub retry_on_exit_codes: Option<Vec<i32>>,
    #[serde(default)]
    pub pre_checks: Vec<CheckSpec>,
    #[serde(default)]
    pub post_checks: Vec<CheckSpec>,
}

impl JobSpec {
    /// Minimal spec with just an id and a command, everything else
    /// inherited from workflow defaults.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            dependencies: Vec::new(),
            env: HashMap::new(),
            timeout_seconds: None,
            max_retries: None,
            retry_delay_seconds: None,
            retry_backoff: None,
            retry_jitter: None,
            max_retry_time_seconds: None,
            retry_on_status: None,
            retry_on_exit_codes: None,
            pre_checks: Vec::new(),
            post_checks: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(ToString::to_string).collect();
        self
    }

    pub fn timeout(&self, default_timeout: u64) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(default_timeout))
    }
}

/// Fully-resolved retry policy for one job (job fields merged over the
/// workflow defaults).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
    pub backoff: f64,
    pub jitter: f64,
    /// Zero means no wall-clock bound on the retry loop.
    pub max_retry_time: Duration,
    pub retry_on_status: Vec<JobStatus>,
    pub retry_on_exit_codes: Vec<i32>,
}

impl RetryPolicy {
    /// Whether a finished execution attempt is eligible for another try.
    ///
    /// Status and exit-code gates compose with AND when the exit-code
    /// list is non-empty; an empty list leaves the status gate alone in
    /// charge. Attempts without an exit code (timeouts report -1) only
    /// pass a non-empty code gate if -1 is listed explicitly.
    pub fn admits(&self, status: JobStatus, exit_code: Option<i32>) -> bool {
        if !self.retry_on_status.contains(&status) {
            return false;
        }
        if self.retry_on_exit_codes.is_empty() {
            return true;
        }
        match exit_code {
            Some(code) => self.retry_on_exit_codes.contains(&code),
            None => false,
        }
    }

    /// Delay before retry number `attempt` (0-based ordinal of the attempt
    /// that just failed), before jitter is applied.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff.powi(attempt as i32);
        self.delay.mul_f64(factor)
    }
}

/// One entry of a job's retry history: a single execution of the command,
/// including the final one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based ordinal of this execution.
    pub ordinal: u32,
    /// Unix epoch seconds at which the execution ended.
    pub timestamp: i64,
    pub status: JobStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn policy(statuses: &[JobStatus], codes: &[i32]) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            delay: Duration::from_secs(2),
            backoff: 2.0,
            jitter: 0.0,
            max_retry_time: Duration::ZERO,
            retry_on_status: statuses.to_vec(),
            retry_on_exit_codes: codes.to_vec(),
        }
    }

    #[test]
    fn status_gate_alone_when_code_list_empty() {
        let policy = policy(&[JobStatus::Failed, JobStatus::Timeout], &[]);
        assert!(policy.admits(JobStatus::Failed, Some(7)));
        assert!(policy.admits(JobStatus::Timeout, Some(-1)));
        assert!(!policy.admits(JobStatus::Error, Some(1)));
    }

    #[test]
    fn status_and_code_gates_compose_with_and() {
        let policy = policy(&[JobStatus::Failed], &[1, 75]);
        assert!(policy.admits(JobStatus::Failed, Some(1)));
        assert!(policy.admits(JobStatus::Failed, Some(75)));
        assert!(!policy.admits(JobStatus::Failed, Some(2)));
        assert!(!policy.admits(JobStatus::Failed, None));
        assert!(!policy.admits(JobStatus::Timeout, Some(1)));
    }

    #[test]
    fn base_delay_grows_exponentially() {
        let policy = policy(&[JobStatus::Failed], &[]);
        assert_eq!(policy.base_delay(0), Duration::from_secs(2));
        assert_eq!(policy.base_delay(1), Duration::from_secs(4));
        assert_eq!(policy.base_delay(2), Duration::from_secs(8));
    }

    #[test]
    fn retry_attempt_serializes_status_as_screaming_case() {
        let entry = RetryAttempt {
            ordinal: 1,
            timestamp: 1_700_000_000,
            status: JobStatus::Timeout,
            exit_code: Some(-1),
            error: None,
        };
        let json = serde_json::to_value(&entry).ok();
        assert_eq!(
            json.and_then(|v| v.get("status").cloned()),
            Some(serde_json::json!("TIMEOUT"))
        );
    }
}
