use std::path::Path;
use std::time::Duration;

use sqlx::ConnectOptions;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;

use crate::error::StoreError;
use crate::migrations::run_migrations;

pub const HISTORY_DB_FILENAME: &str = "dagrun-history.sqlite";

/// Handle to the history database. Cheap to clone; all clones share one
/// connection pool.
#[derive(Clone, Debug)]
pub struct HistoryStore {
    pub(crate) pool: SqlitePool,
}

impl HistoryStore {
    /// Open (creating if missing) the database at `path` and bring its
    /// schema up to date. Opening is the only moment migrations run.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .log_statements(log::LevelFilter::Off);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .log_statements(log::LevelFilter::Off);
        let pool = SqlitePoolOptions::new()
            // A single connection: every :memory: connection is its own db.
            .max_connections(1)
            .connect_with(options)
            .await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }
}
