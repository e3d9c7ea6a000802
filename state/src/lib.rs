//! SQLite-backed run and job history for dagrun.
//!
//! This crate is intentionally small and focused: it owns the durable
//! state (run summaries, per-job history rows, schema versioning) and the
//! typed operations over it. Scheduling, execution, and resume decisions
//! live in `dagrun-core`.

mod error;
mod history;
mod migrations;
mod model;
mod store;

pub use error::StoreError;
pub use history::AttemptCounters;
pub use history::JobRowFinal;
pub use history::JobRowWriter;
pub use history::OpenAttemptParams;
pub use model::JobRecord;
pub use model::RunDetails;
pub use model::RunSummary;
pub use store::HISTORY_DB_FILENAME;
pub use store::HistoryStore;
