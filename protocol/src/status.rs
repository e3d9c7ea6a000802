use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid status: {0}")]
pub struct ParseStatusError(String);

/// Lifecycle status of one job within one attempt.
///
/// `Success` and `Skipped` are terminal-successful, `Failed`/`Error`/
/// `Timeout` are terminal-failed, and the rest are transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Success,
    Failed,
    Error,
    Timeout,
    Skipped,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Error => "ERROR",
            JobStatus::Timeout => "TIMEOUT",
            JobStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ParseStatusError> {
        match value {
            "PENDING" => Ok(Self::Pending),
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "ERROR" => Ok(Self::Error),
            "TIMEOUT" => Ok(Self::Timeout),
            "SKIPPED" => Ok(Self::Skipped),
            other => Err(ParseStatusError(other.to_string())),
        }
    }

    pub fn is_terminal(self) -> bool {
        self.is_terminal_success() || self.is_terminal_failure()
    }

    pub fn is_terminal_success(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Skipped)
    }

    pub fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Error | JobStatus::Timeout
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one attempt (one full pass over the DAG) of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Running,
    Success,
    Partial,
    Failed,
    Interrupted,
}

impl AttemptStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Running => "RUNNING",
            AttemptStatus::Success => "SUCCESS",
            AttemptStatus::Partial => "PARTIAL",
            AttemptStatus::Failed => "FAILED",
            AttemptStatus::Interrupted => "INTERRUPTED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ParseStatusError> {
        match value {
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "PARTIAL" => Ok(Self::Partial),
            "FAILED" => Ok(Self::Failed),
            "INTERRUPTED" => Ok(Self::Interrupted),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn job_status_round_trips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::Error,
            JobStatus::Timeout,
            JobStatus::Skipped,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).ok(), Some(status));
        }
        assert!(JobStatus::parse("success").is_err());
    }

    #[test]
    fn terminal_partitions_are_disjoint() {
        for status in [JobStatus::Success, JobStatus::Skipped] {
            assert!(status.is_terminal_success());
            assert!(!status.is_terminal_failure());
        }
        for status in [JobStatus::Failed, JobStatus::Error, JobStatus::Timeout] {
            assert!(status.is_terminal_failure());
            assert!(!status.is_terminal_success());
        }
        for status in [JobStatus::Pending, JobStatus::Queued, JobStatus::Running] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn attempt_status_round_trips_through_strings() {
        for status in [
            AttemptStatus::Running,
            AttemptStatus::Success,
            AttemptStatus::Partial,
            AttemptStatus::Failed,
            AttemptStatus::Interrupted,
        ] {
            assert_eq!(AttemptStatus::parse(status.as_str()).ok(), Some(status));
        }
    }
}
