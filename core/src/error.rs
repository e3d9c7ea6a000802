use dagrun_protocol::ConfigError;
use dagrun_state::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("job `{job}` depends on `{dependency}`, which is not defined")]
    MissingDependency { job: String, dependency: String },

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Another process created the attempt we were about to open, and the
    /// retry budget ran out.
    #[error("another process is writing attempts for run {run_id}")]
    ResumeCollision { run_id: i64 },

    #[error("cannot resume run {0}: no recorded history")]
    UnknownResumeRun(i64),
}

impl EngineError {
    /// Whether this error belongs to the configuration/graph family,
    /// which maps to process exit code 2.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            EngineError::Config(_) | EngineError::MissingDependency { .. } | EngineError::Cycle { .. }
        )
    }
}
