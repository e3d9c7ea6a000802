//! Pre- and post-check evaluation.
//!
//! Checks are a narrow capability interface: each registered check is
//! addressed by name from the configuration and evaluated with the job's
//! context. The registry is populated at configuration-load time, so an
//! unknown check name is a configuration error long before anything runs.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use dagrun_protocol::CheckSpec;
use dagrun_protocol::ConfigError;
use dagrun_protocol::JobSpec;

/// What a check may look at while evaluating.
pub struct CheckContext<'a> {
    pub job_id: &'a str,
    pub working_dir: &'a Path,
    /// The job's effective (merged, interpolated) environment.
    pub env: &'a HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Passed,
    Failed(String),
}

impl CheckOutcome {
    fn fail(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

pub trait JobCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, spec: &CheckSpec, ctx: &CheckContext<'_>) -> CheckOutcome;
}

pub struct CheckRegistry {
    checks: HashMap<&'static str, Box<dyn JobCheck>>,
}

impl std::fmt::Debug for CheckRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckRegistry")
            .field("checks", &self.checks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CheckRegistry {
    /// Registry with the built-in checks.
    pub fn builtin() -> Self {
        let mut registry = Self {
            checks: HashMap::new(),
        };
        registry.register(Box::new(FileExists));
        registry.register(Box::new(FileAbsent));
        registry.register(Box::new(EnvSet));
        registry.register(Box::new(MinDiskMb));
        registry
    }

    pub fn register(&mut self, check: Box<dyn JobCheck>) {
        self.checks.insert(check.name(), check);
    }

    /// Reject configurations referencing unregistered check names.
    pub fn validate(&self, jobs: &[JobSpec]) -> Result<(), ConfigError> {
        for job in jobs {
            for spec in job.pre_checks.iter().chain(job.post_checks.iter()) {
                if !self.checks.contains_key(spec.name.as_str()) {
                    return Err(ConfigError::invalid_job(
                        &job.id,
                        format!("unknown check `{}`", spec.name),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn evaluate(&self, spec: &CheckSpec, ctx: &CheckContext<'_>) -> CheckOutcome {
        match self.checks.get(spec.name.as_str()) {
            Some(check) => check.evaluate(spec, ctx),
            None => CheckOutcome::fail(format!("unknown check `{}`", spec.name)),
        }
    }
}

fn str_param<'a>(spec: &'a CheckSpec, key: &str) -> Result<&'a str, CheckOutcome> {
    spec.params
        .get(key)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| CheckOutcome::fail(format!("missing `{key}` parameter")))
}

fn path_param(spec: &CheckSpec, ctx: &CheckContext<'_>) -> Result<PathBuf, CheckOutcome> {
    let raw = str_param(spec, "path")?;
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(ctx.working_dir.join(path))
    }
}

struct FileExists;

impl JobCheck for FileExists {
    fn name(&self) -> &'static str {
        "file_exists"
    }

    fn evaluate(&self, spec: &CheckSpec, ctx: &CheckContext<'_>) -> CheckOutcome {
        let path = match path_param(spec, ctx) {
            Ok(path) => path,
            Err(outcome) => return outcome,
        };
        if path.exists() {
            CheckOutcome::Passed
        } else {
            CheckOutcome::fail(format!("{} does not exist", path.display()))
        }
    }
}

struct FileAbsent;

impl JobCheck for FileAbsent {
    fn name(&self) -> &'static str {
        "file_absent"
    }

    fn evaluate(&self, spec: &CheckSpec, ctx: &CheckContext<'_>) -> CheckOutcome {
        let path = match path_param(spec, ctx) {
            Ok(path) => path,
            Err(outcome) => return outcome,
        };
        if path.exists() {
            CheckOutcome::fail(format!("{} already exists", path.display()))
        } else {
            CheckOutcome::Passed
        }
    }
}

struct EnvSet;

impl JobCheck for EnvSet {
    fn name(&self) -> &'static str {
        "env_set"
    }

    fn evaluate(&self, spec: &CheckSpec, ctx: &CheckContext<'_>) -> CheckOutcome {
        let name = match str_param(spec, "name") {
            Ok(name) => name,
            Err(outcome) => return outcome,
        };
        match ctx.env.get(name) {
            Some(value) if !value.trim().is_empty() => CheckOutcome::Passed,
            Some(_) => CheckOutcome::fail(format!("environment variable {name} is empty")),
            None => CheckOutcome::fail(format!("environment variable {name} is not set")),
        }
    }
}

/// Free-space floor for the filesystem holding `path` (defaults to the
/// working directory). Best-effort: on platforms without statvfs the
/// check always passes.
struct MinDiskMb;

impl JobCheck for MinDiskMb {
    fn name(&self) -> &'static str {
        "min_disk_mb"
    }

    fn evaluate(&self, spec: &CheckSpec, ctx: &CheckContext<'_>) -> CheckOutcome {
        let required_mb = match spec.params.get("mb").and_then(serde_json::Value::as_u64) {
            Some(mb) => mb,
            None => return CheckOutcome::fail("missing `mb` parameter"),
        };
        let path = match spec.params.get("path").and_then(serde_json::Value::as_str) {
            Some(raw) => {
                let path = PathBuf::from(raw);
                if path.is_absolute() {
                    path
                } else {
                    ctx.working_dir.join(path)
                }
            }
            None => ctx.working_dir.to_path_buf(),
        };
        match free_mebibytes(&path) {
            Some(free) if free >= required_mb => CheckOutcome::Passed,
            Some(free) => CheckOutcome::fail(format!(
                "only {free} MiB free at {}, need {required_mb}",
                path.display()
            )),
            None => CheckOutcome::Passed,
        }
    }
}

#[cfg(unix)]
fn free_mebibytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let raw = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::statvfs(raw.as_ptr(), &mut stats) };
    if result != 0 {
        return None;
    }
    let fragment = stats.f_frsize as u64;
    Some(stats.f_bavail as u64 * fragment / (1024 * 1024))
}

#[cfg(not(unix))]
fn free_mebibytes(_path: &Path) -> Option<u64> {
    None
}
