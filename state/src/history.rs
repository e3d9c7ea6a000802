use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use dagrun_protocol::AttemptStatus;
use dagrun_protocol::JobStatus;
use dagrun_protocol::RetryAttempt;
use sqlx::Row;
use tracing::debug;

use crate::error::StoreError;
use crate::model::JobHistoryRow;
use crate::model::JobRecord;
use crate::model::RunDetails;
use crate::model::RunSummary;
use crate::model::RunSummaryRow;
use crate::store::HistoryStore;

const RUN_SUMMARY_COLUMNS: &str = r#"
    run_id,
    attempt_id,
    application_name,
    working_dir,
    start_time,
    end_time,
    status,
    total_jobs,
    successful_jobs,
    failed_jobs,
    skipped_jobs
"#;

const JOB_HISTORY_COLUMNS: &str = r#"
    run_id,
    attempt_id,
    job_id,
    command,
    status,
    start_time,
    end_time,
    duration_seconds,
    exit_code,
    retry_count,
    retry_history
"#;

#[derive(Debug, Clone)]
pub struct OpenAttemptParams {
    pub run_id: i64,
    pub attempt_id: i64,
    pub application_name: String,
    pub working_dir: String,
    pub start_time: DateTime<Utc>,
    pub total_jobs: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptCounters {
    pub successful: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl HistoryStore {
    /// Next unused run id: one past the largest id either table has ever
    /// seen, so ids are never reused even after `run_summary` pruning.
    /// Racing allocators may observe the same value; the loser's
    /// `open_attempt` comes back as [`StoreError::Conflict`].
    pub async fn allocate_run_id(&self) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
SELECT COALESCE(MAX(run_id), 0) FROM (
    SELECT run_id FROM run_summary
    UNION ALL
    SELECT run_id FROM job_history
)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>(0) + 1)
    }

    pub async fn next_attempt_id(&self, run_id: i64) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(attempt_id), 0) FROM run_summary WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>(0) + 1)
    }

    /// Insert the attempt row with status RUNNING and zeroed counters.
    pub async fn open_attempt(&self, params: &OpenAttemptParams) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO run_summary (
    run_id,
    attempt_id,
    application_name,
    working_dir,
    start_time,
    end_time,
    status,
    total_jobs,
    successful_jobs,
    failed_jobs,
    skipped_jobs
) VALUES (?, ?, ?, ?, ?, NULL, ?, ?, 0, 0, 0)
            "#,
        )
        .bind(params.run_id)
        .bind(params.attempt_id)
        .bind(params.application_name.as_str())
        .bind(params.working_dir.as_str())
        .bind(params.start_time.timestamp())
        .bind(AttemptStatus::Running.as_str())
        .bind(params.total_jobs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record the attempt outcome. Idempotent: re-running with identical
    /// inputs rewrites the same values.
    pub async fn close_attempt(
        &self,
        run_id: i64,
        attempt_id: i64,
        status: AttemptStatus,
        counters: AttemptCounters,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
UPDATE run_summary
SET status = ?, end_time = ?, successful_jobs = ?, failed_jobs = ?, skipped_jobs = ?
WHERE run_id = ? AND attempt_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(end_time.timestamp())
        .bind(counters.successful)
        .bind(counters.failed)
        .bind(counters.skipped)
        .bind(run_id)
        .bind(attempt_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A writer bound to one `(run_id, attempt_id, job_id)` row. Exactly
    /// one writer exists per dispatched job, which keeps row updates
    /// single-writer without any extra locking.
    pub fn job_row_writer(
        &self,
        run_id: i64,
        attempt_id: i64,
        job_id: &str,
        command: &str,
    ) -> JobRowWriter {
        JobRowWriter {
            store: self.clone(),
            run_id,
            attempt_id,
            job_id: job_id.to_string(),
            command: command.to_string(),
        }
    }

    /// For each job ever observed under `run_id`, the status from the
    /// greatest attempt in which that job has a row.
    pub async fn latest_status_per_job(
        &self,
        run_id: i64,
    ) -> Result<HashMap<String, JobStatus>, StoreError> {
        let rows = sqlx::query(
            r#"
SELECT job_id, status FROM job_history AS outer_rows
WHERE run_id = ?
  AND attempt_id = (
    SELECT MAX(attempt_id) FROM job_history
    WHERE run_id = outer_rows.run_id AND job_id = outer_rows.job_id
  )
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        let mut statuses = HashMap::with_capacity(rows.len());
        for row in rows {
            let job_id: String = row.get(0);
            let status = JobStatus::parse(row.get::<String, _>(1).as_str())
                .map_err(|err| StoreError::Corrupt(err.to_string()))?;
            statuses.insert(job_id, status);
        }
        Ok(statuses)
    }

    /// Exit code from the most recent attempt row of one job, if any.
    pub async fn last_exit_code(
        &self,
        run_id: i64,
        job_id: &str,
    ) -> Result<Option<i32>, StoreError> {
        let row = sqlx::query(
            r#"
SELECT exit_code FROM job_history
WHERE run_id = ? AND job_id = ?
ORDER BY attempt_id DESC
LIMIT 1
            "#,
        )
        .bind(run_id)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let code: Option<i64> = row.get(0);
                Ok(code.map(|code| code as i32))
            }
            None => Ok(None),
        }
    }

    /// Latest attempt of every run, newest run first, optionally filtered
    /// by application name.
    pub async fn list_runs(
        &self,
        application: Option<&str>,
    ) -> Result<Vec<RunSummary>, StoreError> {
        let sql = format!(
            r#"
SELECT {RUN_SUMMARY_COLUMNS} FROM run_summary AS latest
WHERE attempt_id = (
    SELECT MAX(attempt_id) FROM run_summary WHERE run_id = latest.run_id
)
{}
ORDER BY run_id DESC
            "#,
            if application.is_some() {
                "AND application_name = ?"
            } else {
                ""
            }
        );
        let mut query = sqlx::query_as::<_, RunSummaryRow>(sql.as_str());
        if let Some(application) = application {
            query = query.bind(application);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(RunSummary::try_from).collect()
    }

    /// Every attempt summary and job row recorded under `run_id`.
    pub async fn run_details(&self, run_id: i64) -> Result<RunDetails, StoreError> {
        let attempt_sql = format!(
            "SELECT {RUN_SUMMARY_COLUMNS} FROM run_summary WHERE run_id = ? ORDER BY attempt_id"
        );
        let attempts: Vec<RunSummaryRow> = sqlx::query_as(attempt_sql.as_str())
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        if attempts.is_empty() {
            return Err(StoreError::UnknownRun(run_id));
        }
        let job_sql = format!(
            "SELECT {JOB_HISTORY_COLUMNS} FROM job_history WHERE run_id = ? ORDER BY attempt_id, job_id"
        );
        let jobs: Vec<JobHistoryRow> = sqlx::query_as(job_sql.as_str())
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(RunDetails {
            attempts: attempts
                .into_iter()
                .map(RunSummary::try_from)
                .collect::<Result<_, _>>()?,
            jobs: jobs
                .into_iter()
                .map(JobRecord::try_from)
                .collect::<Result<_, _>>()?,
        })
    }

    /// Force the latest-attempt row of each named job to SUCCESS, creating
    /// a synthetic row in the run's latest attempt for jobs that never
    /// ran. All updates land in one transaction.
    pub async fn mark_success(&self, run_id: i64, job_ids: &[String]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let latest_attempt: Option<i64> =
            sqlx::query("SELECT MAX(attempt_id) FROM run_summary WHERE run_id = ?")
                .bind(run_id)
                .fetch_one(&mut *tx)
                .await?
                .get(0);
        let Some(latest_attempt) = latest_attempt else {
            return Err(StoreError::UnknownRun(run_id));
        };
        let now = Utc::now().timestamp();
        for job_id in job_ids {
            let updated = sqlx::query(
                r#"
UPDATE job_history SET status = ?, end_time = ?
WHERE run_id = ? AND job_id = ?
  AND attempt_id = (
    SELECT MAX(attempt_id) FROM job_history WHERE run_id = ? AND job_id = ?
  )
                "#,
            )
            .bind(JobStatus::Success.as_str())
            .bind(now)
            .bind(run_id)
            .bind(job_id.as_str())
            .bind(run_id)
            .bind(job_id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated == 0 {
                sqlx::query(
                    r#"
INSERT INTO job_history (
    run_id, attempt_id, job_id, command, status,
    start_time, end_time, duration_seconds, exit_code, retry_count, retry_history
) VALUES (?, ?, ?, '', ?, NULL, ?, NULL, NULL, 0, '[]')
                    "#,
                )
                .bind(run_id)
                .bind(latest_attempt)
                .bind(job_id.as_str())
                .bind(JobStatus::Success.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        debug!(run_id, jobs = job_ids.len(), "marked jobs successful");
        Ok(())
    }
}

/// Write handle for a single job's history row.
#[derive(Clone)]
pub struct JobRowWriter {
    store: HistoryStore,
    run_id: i64,
    attempt_id: i64,
    job_id: String,
    command: String,
}

/// Terminal snapshot of a job row.
#[derive(Debug, Clone)]
pub struct JobRowFinal {
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub retry_count: i64,
    pub retry_history: Vec<RetryAttempt>,
}

impl JobRowWriter {
    pub fn job_id(&self) -> &str {
        self.job_id.as_str()
    }

    /// Upsert the row as RUNNING at `start_time`.
    pub async fn mark_running(&self, start_time: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO job_history (
    run_id, attempt_id, job_id, command, status,
    start_time, end_time, duration_seconds, exit_code, retry_count, retry_history
) VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, NULL, 0, '[]')
ON CONFLICT (run_id, attempt_id, job_id) DO UPDATE SET
    status = excluded.status,
    start_time = excluded.start_time
            "#,
        )
        .bind(self.run_id)
        .bind(self.attempt_id)
        .bind(self.job_id.as_str())
        .bind(self.command.as_str())
        .bind(JobStatus::Running.as_str())
        .bind(start_time.timestamp())
        .execute(&self.store.pool)
        .await?;
        Ok(())
    }

    /// Upsert a SKIPPED row (dependency failure, resume, or abort drain).
    pub async fn mark_skipped(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO job_history (
    run_id, attempt_id, job_id, command, status,
    start_time, end_time, duration_seconds, exit_code, retry_count, retry_history
) VALUES (?, ?, ?, ?, ?, NULL, NULL, NULL, NULL, 0, '[]')
ON CONFLICT (run_id, attempt_id, job_id) DO UPDATE SET
    status = excluded.status
            "#,
        )
        .bind(self.run_id)
        .bind(self.attempt_id)
        .bind(self.job_id.as_str())
        .bind(self.command.as_str())
        .bind(JobStatus::Skipped.as_str())
        .execute(&self.store.pool)
        .await?;
        Ok(())
    }

    /// Upsert the terminal snapshot of the row.
    pub async fn finalize(&self, row: &JobRowFinal) -> Result<(), StoreError> {
        let retry_history = serde_json::to_string(&row.retry_history)
            .map_err(|err| StoreError::Corrupt(format!("retry_history: {err}")))?;
        let duration = (row.end_time - row.start_time)
            .to_std()
            .map(|delta| delta.as_secs_f64())
            .unwrap_or(0.0);
        sqlx::query(
            r#"
INSERT INTO job_history (
    run_id, attempt_id, job_id, command, status,
    start_time, end_time, duration_seconds, exit_code, retry_count, retry_history
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (run_id, attempt_id, job_id) DO UPDATE SET
    status = excluded.status,
    start_time = excluded.start_time,
    end_time = excluded.end_time,
    duration_seconds = excluded.duration_seconds,
    exit_code = excluded.exit_code,
    retry_count = excluded.retry_count,
    retry_history = excluded.retry_history
            "#,
        )
        .bind(self.run_id)
        .bind(self.attempt_id)
        .bind(self.job_id.as_str())
        .bind(self.command.as_str())
        .bind(row.status.as_str())
        .bind(row.start_time.timestamp())
        .bind(row.end_time.timestamp())
        .bind(duration)
        .bind(row.exit_code)
        .bind(row.retry_count)
        .bind(retry_history)
        .execute(&self.store.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn open_store() -> HistoryStore {
        HistoryStore::open_in_memory().await.unwrap()
    }

    fn attempt_params(run_id: i64, attempt_id: i64) -> OpenAttemptParams {
        OpenAttemptParams {
            run_id,
            attempt_id,
            application_name: "demo".to_string(),
            working_dir: "/tmp".to_string(),
            start_time: Utc::now(),
            total_jobs: 2,
        }
    }

    #[tokio::test]
    async fn run_ids_allocate_monotonically() {
        let store = open_store().await;
        let first = store.allocate_run_id().await.unwrap();
        store.open_attempt(&attempt_params(first, 1)).await.unwrap();
        let second = store.allocate_run_id().await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn duplicate_attempt_is_a_conflict() {
        let store = open_store().await;
        store.open_attempt(&attempt_params(1, 1)).await.unwrap();
        let err = store.open_attempt(&attempt_params(1, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn next_attempt_id_counts_from_existing_rows() {
        let store = open_store().await;
        assert_eq!(store.next_attempt_id(9).await.unwrap(), 1);
        store.open_attempt(&attempt_params(9, 1)).await.unwrap();
        store.open_attempt(&attempt_params(9, 2)).await.unwrap();
        assert_eq!(store.next_attempt_id(9).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn latest_status_prefers_greatest_attempt() {
        let store = open_store().await;
        store.open_attempt(&attempt_params(5, 1)).await.unwrap();
        store.open_attempt(&attempt_params(5, 2)).await.unwrap();
        let now = Utc::now();

        let writer = store.job_row_writer(5, 1, "build", "make");
        writer
            .finalize(&JobRowFinal {
                status: JobStatus::Failed,
                start_time: now,
                end_time: now,
                exit_code: Some(2),
                retry_count: 0,
                retry_history: Vec::new(),
            })
            .await
            .unwrap();
        let writer = store.job_row_writer(5, 2, "build", "make");
        writer
            .finalize(&JobRowFinal {
                status: JobStatus::Success,
                start_time: now,
                end_time: now,
                exit_code: Some(0),
                retry_count: 1,
                retry_history: Vec::new(),
            })
            .await
            .unwrap();
        // Only ran in attempt 1.
        let writer = store.job_row_writer(5, 1, "deploy", "./deploy.sh");
        writer.mark_skipped().await.unwrap();

        let statuses = store.latest_status_per_job(5).await.unwrap();
        assert_eq!(statuses.get("build"), Some(&JobStatus::Success));
        assert_eq!(statuses.get("deploy"), Some(&JobStatus::Skipped));
        assert_eq!(store.last_exit_code(5, "build").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn close_attempt_is_idempotent() {
        let store = open_store().await;
        store.open_attempt(&attempt_params(2, 1)).await.unwrap();
        let counters = AttemptCounters {
            successful: 2,
            failed: 0,
            skipped: 0,
        };
        let end = Utc::now();
        for _ in 0..2 {
            store
                .close_attempt(2, 1, AttemptStatus::Success, counters, end)
                .await
                .unwrap();
        }
        let details = store.run_details(2).await.unwrap();
        assert_eq!(details.attempts.len(), 1);
        assert_eq!(details.attempts[0].status, AttemptStatus::Success);
        assert_eq!(details.attempts[0].successful_jobs, 2);
    }

    #[tokio::test]
    async fn mark_success_updates_latest_row_and_backfills_missing() {
        let store = open_store().await;
        store.open_attempt(&attempt_params(3, 1)).await.unwrap();
        let now = Utc::now();
        let writer = store.job_row_writer(3, 1, "flaky", "./flaky.sh");
        writer
            .finalize(&JobRowFinal {
                status: JobStatus::Failed,
                start_time: now,
                end_time: now,
                exit_code: Some(1),
                retry_count: 0,
                retry_history: Vec::new(),
            })
            .await
            .unwrap();

        store
            .mark_success(3, &["flaky".to_string(), "never-ran".to_string()])
            .await
            .unwrap();
        let statuses = store.latest_status_per_job(3).await.unwrap();
        assert_eq!(statuses.get("flaky"), Some(&JobStatus::Success));
        assert_eq!(statuses.get("never-ran"), Some(&JobStatus::Success));
    }

    #[tokio::test]
    async fn mark_success_rejects_unknown_run() {
        let store = open_store().await;
        let err = store
            .mark_success(42, &["a".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownRun(42)));
    }

    #[tokio::test]
    async fn list_runs_returns_latest_attempt_per_run() {
        let store = open_store().await;
        store.open_attempt(&attempt_params(1, 1)).await.unwrap();
        store.open_attempt(&attempt_params(1, 2)).await.unwrap();
        store.open_attempt(&attempt_params(2, 1)).await.unwrap();

        let runs = store.list_runs(None).await.unwrap();
        assert_eq!(
            runs.iter()
                .map(|run| (run.run_id, run.attempt_id))
                .collect::<Vec<_>>(),
            vec![(2, 1), (1, 2)]
        );
        let filtered = store.list_runs(Some("other-app")).await.unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn retry_history_round_trips_through_the_row() {
        let store = open_store().await;
        store.open_attempt(&attempt_params(7, 1)).await.unwrap();
        let now = Utc::now();
        let history = vec![
            RetryAttempt {
                ordinal: 1,
                timestamp: now.timestamp(),
                status: JobStatus::Failed,
                exit_code: Some(1),
                error: Some("exit code 1".to_string()),
            },
            RetryAttempt {
                ordinal: 2,
                timestamp: now.timestamp() + 2,
                status: JobStatus::Success,
                exit_code: Some(0),
                error: None,
            },
        ];
        let writer = store.job_row_writer(7, 1, "load", "./load.sh");
        writer
            .finalize(&JobRowFinal {
                status: JobStatus::Success,
                start_time: now,
                end_time: now,
                exit_code: Some(0),
                retry_count: 1,
                retry_history: history.clone(),
            })
            .await
            .unwrap();
        let details = store.run_details(7).await.unwrap();
        assert_eq!(details.jobs.len(), 1);
        assert_eq!(details.jobs[0].retry_history, history);
    }
}
