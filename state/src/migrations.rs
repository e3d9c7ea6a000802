//! Linear, forward-only schema migrations.
//!
//! Each migration runs in its own immediate transaction and is recorded in
//! `schema_version` together with a SHA-256 digest of its SQL body. A
//! digest mismatch for an already-applied version is fatal: it means the
//! binary's embedded schema history no longer matches what produced the
//! database on disk.

use sha2::Digest;
use sha2::Sha256;
use sqlx::Row;
use sqlx::SqliteConnection;
use sqlx::SqlitePool;
use tracing::info;

use crate::error::StoreError;

struct Migration {
    version: i64,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "run summaries and per-job history",
        sql: r#"
CREATE TABLE run_summary (
    run_id INTEGER NOT NULL,
    attempt_id INTEGER NOT NULL,
    application_name TEXT NOT NULL,
    working_dir TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    status TEXT NOT NULL,
    total_jobs INTEGER NOT NULL,
    successful_jobs INTEGER NOT NULL DEFAULT 0,
    failed_jobs INTEGER NOT NULL DEFAULT 0,
    skipped_jobs INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (run_id, attempt_id)
);

CREATE TABLE job_history (
    run_id INTEGER NOT NULL,
    attempt_id INTEGER NOT NULL,
    job_id TEXT NOT NULL,
    command TEXT NOT NULL,
    status TEXT NOT NULL,
    start_time INTEGER,
    end_time INTEGER,
    duration_seconds REAL,
    exit_code INTEGER,
    retry_count INTEGER NOT NULL DEFAULT 0,
    retry_history TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (run_id, attempt_id, job_id)
);
"#,
    },
    Migration {
        version: 2,
        description: "lookup indexes for resume and listing queries",
        sql: r#"
CREATE INDEX idx_job_history_run_job ON job_history (run_id, job_id, attempt_id);
CREATE INDEX idx_run_summary_application ON run_summary (application_name, run_id);
"#,
    },
];

fn digest(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    let mut conn = pool.acquire().await?;
    sqlx::raw_sql(
        r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL,
    description TEXT NOT NULL,
    hash TEXT NOT NULL
);
"#,
    )
    .execute(&mut *conn)
    .await?;

    let applied: Vec<(i64, String)> =
        sqlx::query("SELECT version, hash FROM schema_version ORDER BY version")
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(|row| (row.get::<i64, _>(0), row.get::<String, _>(1)))
            .collect();

    let max_applied = applied.last().map(|(version, _)| *version).unwrap_or(0);

    for migration in MIGRATIONS {
        let expected = digest(migration.sql);
        if let Some((_, recorded)) = applied
            .iter()
            .find(|(version, _)| *version == migration.version)
        {
            if recorded != &expected {
                return Err(StoreError::MigrationHashMismatch {
                    version: migration.version,
                });
            }
            continue;
        }
        if migration.version <= max_applied {
            return Err(StoreError::MigrationFailed {
                version: migration.version,
                message: "migration is older than the applied schema".to_string(),
            });
        }
        apply(&mut conn, migration, &expected).await?;
        info!(
            version = migration.version,
            description = migration.description,
            "applied schema migration"
        );
    }
    Ok(())
}

/// One migration inside one immediate transaction, so a concurrent opener
/// blocks on the write lock instead of interleaving DDL.
async fn apply(
    conn: &mut SqliteConnection,
    migration: &Migration,
    hash: &str,
) -> Result<(), StoreError> {
    let failed = |message: String| StoreError::MigrationFailed {
        version: migration.version,
        message,
    };

    sqlx::raw_sql("BEGIN IMMEDIATE")
        .execute(&mut *conn)
        .await
        .map_err(|err| failed(err.to_string()))?;

    let body = async {
        sqlx::raw_sql(migration.sql).execute(&mut *conn).await?;
        sqlx::query(
            "INSERT INTO schema_version (version, applied_at, description, hash) VALUES (?, ?, ?, ?)",
        )
        .bind(migration.version)
        .bind(chrono::Utc::now().timestamp())
        .bind(migration.description)
        .bind(hash)
        .execute(&mut *conn)
        .await?;
        Ok::<(), sqlx::Error>(())
    }
    .await;

    match body {
        Ok(()) => {
            sqlx::raw_sql("COMMIT")
                .execute(&mut *conn)
                .await
                .map_err(|err| failed(err.to_string()))?;
            Ok(())
        }
        Err(err) => {
            let _ = sqlx::raw_sql("ROLLBACK").execute(&mut *conn).await;
            Err(failed(err.to_string()))
        }
    }
}
