use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique-constraint violation, e.g. two processes opening the same
    /// `(run_id, attempt_id)`. Usually recoverable by re-reading and
    /// retrying; all other variants are fatal.
    #[error("history database conflict: {0}")]
    Conflict(String),

    #[error("schema migration {version} was modified after being applied (hash mismatch)")]
    MigrationHashMismatch { version: i64 },

    #[error("schema migration {version} failed: {message}")]
    MigrationFailed { version: i64, message: String },

    #[error("run {0} has no recorded history")]
    UnknownRun(i64),

    #[error("corrupt history row: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err
            && db_err.is_unique_violation()
        {
            return Self::Conflict(db_err.message().to_string());
        }
        Self::Database(err)
    }
}
