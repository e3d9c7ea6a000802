//! Per-job log files.
//!
//! One append-only file per `(app, run, attempt, job)` receives the job's
//! merged stdout/stderr plus one header line per execution attempt. Log
//! files are convenience output: the history rows are the source of
//! truth, so any failure here degrades to discarding output with a
//! warning instead of failing the job.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;

use chrono::Utc;
use tracing::warn;

pub(crate) struct LogFiles {
    dir: PathBuf,
    application: String,
    run_id: i64,
    attempt_id: i64,
}

impl LogFiles {
    pub(crate) fn new(dir: &Path, application: &str, run_id: i64, attempt_id: i64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            application: application.to_string(),
            run_id,
            attempt_id,
        }
    }

    pub(crate) fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!(
            "{}.{}.{}.{job_id}.log",
            self.application, self.run_id, self.attempt_id
        ))
    }

    fn open_file(&self, job_id: &str) -> Option<File> {
        let path = self.path_for(job_id);
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(job = job_id, path = %path.display(), "cannot open job log: {err}");
                None
            }
        }
    }

    /// Append the per-execution header and hand back stdout/stderr for
    /// the subprocess, both pointing at the same file. Falls back to
    /// discarding output if the file cannot be opened or cloned.
    pub(crate) fn stdio_for_attempt(
        &self,
        job_id: &str,
        ordinal: u32,
        command: &str,
    ) -> (Stdio, Stdio) {
        let Some(mut file) = self.open_file(job_id) else {
            return (Stdio::null(), Stdio::null());
        };
        let header = format!(
            "--- execution {ordinal} at {} :: {command}\n",
            Utc::now().to_rfc3339()
        );
        if let Err(err) = file.write_all(header.as_bytes()) {
            warn!(job = job_id, "cannot write job log header: {err}");
        }
        match file.try_clone() {
            Ok(clone) => (Stdio::from(file), Stdio::from(clone)),
            Err(err) => {
                warn!(job = job_id, "cannot clone job log handle: {err}");
                (Stdio::from(file), Stdio::null())
            }
        }
    }

    /// Append a free-form note (check failures, kill notices).
    pub(crate) fn append_note(&self, job_id: &str, note: &str) {
        if let Some(mut file) = self.open_file(job_id)
            && let Err(err) = writeln!(file, "--- {note}")
        {
            warn!(job = job_id, "cannot write job log note: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn paths_are_deterministic() {
        let logs = LogFiles::new(Path::new("/var/log/dagrun"), "etl", 12, 3);
        assert_eq!(
            logs.path_for("extract"),
            PathBuf::from("/var/log/dagrun/etl.12.3.extract.log")
        );
    }

    #[test]
    fn headers_and_notes_append() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogFiles::new(dir.path(), "etl", 1, 1);
        let _ = logs.stdio_for_attempt("load", 1, "echo hi");
        logs.append_note("load", "timed out after 1s");
        let contents = std::fs::read_to_string(logs.path_for("load")).unwrap();
        assert!(contents.contains("execution 1"));
        assert!(contents.contains("timed out after 1s"));
    }

    #[test]
    fn unopenable_log_degrades_to_null() {
        let logs = LogFiles::new(Path::new("/nonexistent-dir/nope"), "etl", 1, 1);
        // Must not panic or fail the job.
        let _ = logs.stdio_for_attempt("job", 1, "true");
    }
}
