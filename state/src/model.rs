use chrono::DateTime;
use chrono::Utc;
use dagrun_protocol::AttemptStatus;
use dagrun_protocol::JobStatus;
use dagrun_protocol::RetryAttempt;

use crate::error::StoreError;

/// One `(run_id, attempt_id)` row of `run_summary`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: i64,
    pub attempt_id: i64,
    pub application_name: String,
    pub working_dir: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub total_jobs: i64,
    pub successful_jobs: i64,
    pub failed_jobs: i64,
    pub skipped_jobs: i64,
}

/// One `(run_id, attempt_id, job_id)` row of `job_history`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub run_id: i64,
    pub attempt_id: i64,
    pub job_id: String,
    pub command: String,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub exit_code: Option<i32>,
    pub retry_count: i64,
    pub retry_history: Vec<RetryAttempt>,
}

/// Everything recorded for one run: every attempt summary plus every job
/// row, both in attempt order.
#[derive(Debug, Clone, PartialEq)]
pub struct RunDetails {
    pub attempts: Vec<RunSummary>,
    pub jobs: Vec<JobRecord>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RunSummaryRow {
    pub(crate) run_id: i64,
    pub(crate) attempt_id: i64,
    pub(crate) application_name: String,
    pub(crate) working_dir: String,
    pub(crate) start_time: i64,
    pub(crate) end_time: Option<i64>,
    pub(crate) status: String,
    pub(crate) total_jobs: i64,
    pub(crate) successful_jobs: i64,
    pub(crate) failed_jobs: i64,
    pub(crate) skipped_jobs: i64,
}

impl TryFrom<RunSummaryRow> for RunSummary {
    type Error = StoreError;

    fn try_from(row: RunSummaryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            run_id: row.run_id,
            attempt_id: row.attempt_id,
            application_name: row.application_name,
            working_dir: row.working_dir,
            start_time: epoch_seconds_to_datetime(row.start_time)?,
            end_time: row.end_time.map(epoch_seconds_to_datetime).transpose()?,
            status: AttemptStatus::parse(row.status.as_str())
                .map_err(|err| StoreError::Corrupt(err.to_string()))?,
            total_jobs: row.total_jobs,
            successful_jobs: row.successful_jobs,
            failed_jobs: row.failed_jobs,
            skipped_jobs: row.skipped_jobs,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobHistoryRow {
    pub(crate) run_id: i64,
    pub(crate) attempt_id: i64,
    pub(crate) job_id: String,
    pub(crate) command: String,
    pub(crate) status: String,
    pub(crate) start_time: Option<i64>,
    pub(crate) end_time: Option<i64>,
    pub(crate) duration_seconds: Option<f64>,
    pub(crate) exit_code: Option<i64>,
    pub(crate) retry_count: i64,
    pub(crate) retry_history: String,
}

impl TryFrom<JobHistoryRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobHistoryRow) -> Result<Self, Self::Error> {
        let retry_history: Vec<RetryAttempt> = serde_json::from_str(row.retry_history.as_str())
            .map_err(|err| StoreError::Corrupt(format!("retry_history: {err}")))?;
        Ok(Self {
            run_id: row.run_id,
            attempt_id: row.attempt_id,
            job_id: row.job_id,
            command: row.command,
            status: JobStatus::parse(row.status.as_str())
                .map_err(|err| StoreError::Corrupt(err.to_string()))?,
            start_time: row.start_time.map(epoch_seconds_to_datetime).transpose()?,
            end_time: row.end_time.map(epoch_seconds_to_datetime).transpose()?,
            duration_seconds: row.duration_seconds,
            exit_code: row.exit_code.map(exit_code_from_i64).transpose()?,
            retry_count: row.retry_count,
            retry_history,
        })
    }
}

fn exit_code_from_i64(code: i64) -> Result<i32, StoreError> {
    i32::try_from(code).map_err(|_| StoreError::Corrupt(format!("exit code out of range: {code}")))
}

pub(crate) fn epoch_seconds_to_datetime(secs: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid unix timestamp: {secs}")))
}
