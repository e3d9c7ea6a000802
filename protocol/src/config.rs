use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::job::JobSpec;
use crate::job::RetryPolicy;
use crate::status::JobStatus;

/// Environment variables granted to jobs when `inherit_shell_env` is
/// `"default"`.
pub const DEFAULT_ENV_WHITELIST: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "SHELL", "LANG", "LC_ALL", "TZ", "TMPDIR",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("application_name must not be empty")]
    MissingApplicationName,
    #[error("working_dir must be an absolute path, got `{}`", .0.display())]
    RelativeWorkingDir(PathBuf),
    #[error("working_dir `{}` does not exist", .0.display())]
    MissingWorkingDir(PathBuf),
    #[error("at least one job must be defined")]
    NoJobs,
    #[error("duplicate job id `{0}`")]
    DuplicateJobId(String),
    #[error("job `{job}`: {message}")]
    InvalidJob { job: String, message: String },
    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid_job(job: &str, message: impl Into<String>) -> Self {
        Self::InvalidJob {
            job: job.to_string(),
            message: message.into(),
        }
    }
}

/// Base-environment policy for spawned jobs: inherit everything, start
/// empty, use the built-in whitelist, or use an explicit whitelist.
///
/// In configuration this is written as `true`, `false`, `"default"`, or a
/// list of variable names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvInheritance {
    Full,
    None,
    DefaultWhitelist,
    Whitelist(Vec<String>),
}

impl Default for EnvInheritance {
    fn default() -> Self {
        Self::Full
    }
}

// The config shapes (bool | string | list) do not map onto one enum
// representation serde can derive, so deserialize through a raw form.
#[derive(Deserialize)]
#[serde(untagged)]
enum EnvInheritanceRaw {
    Flag(bool),
    Preset(String),
    List(Vec<String>),
}

impl TryFrom<EnvInheritanceRaw> for EnvInheritance {
    type Error = String;

    fn try_from(raw: EnvInheritanceRaw) -> Result<Self, Self::Error> {
        match raw {
            EnvInheritanceRaw::Flag(true) => Ok(Self::Full),
            EnvInheritanceRaw::Flag(false) => Ok(Self::None),
            EnvInheritanceRaw::Preset(preset) if preset == "default" => Ok(Self::DefaultWhitelist),
            EnvInheritanceRaw::Preset(preset) => {
                Err(format!("unknown inherit_shell_env preset `{preset}`"))
            }
            EnvInheritanceRaw::List(names) => Ok(Self::Whitelist(names)),
        }
    }
}

impl<'de> Deserialize<'de> for EnvInheritance {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = EnvInheritanceRaw::deserialize(deserializer)?;
        Self::try_from(raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityPolicy {
    #[default]
    Warn,
    Strict,
}

fn default_max_workers() -> usize {
    1
}

fn default_timeout() -> u64 {
    10_800
}

fn default_retry_delay() -> f64 {
    1.0
}

fn default_retry_backoff() -> f64 {
    1.0
}

fn default_retry_on_status() -> Vec<JobStatus> {
    vec![JobStatus::Failed, JobStatus::Timeout]
}

/// The full user-declared workflow: global settings plus job specs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    pub application_name: String,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_timeout")]
    pub default_timeout: u64,
    #[serde(default)]
    pub default_max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub default_retry_delay: f64,
    #[serde(default = "default_retry_backoff")]
    pub default_retry_backoff: f64,
    #[serde(default)]
    pub default_retry_jitter: f64,
    #[serde(default)]
    pub default_max_retry_time: u64,
    #[serde(default)]
    pub default_retry_on_exit_codes: Vec<i32>,
    #[serde(default = "default_retry_on_status")]
    pub default_retry_on_status: Vec<JobStatus>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub inherit_shell_env: EnvInheritance,
    #[serde(default)]
    pub env_variables: HashMap<String, String>,
    #[serde(default)]
    pub security_policy: SecurityPolicy,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    pub jobs: Vec<JobSpec>,
}

impl WorkflowConfig {
    /// Structural validation of fields and per-job constraints. Graph
    /// checks (missing dependencies, cycles) are a separate pre-flight
    /// pass; filesystem checks live with the loader.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.trim().is_empty() {
            return Err(ConfigError::MissingApplicationName);
        }
        if !self.working_dir.is_absolute() {
            return Err(ConfigError::RelativeWorkingDir(self.working_dir.clone()));
        }
        if self.jobs.is_empty() {
            return Err(ConfigError::NoJobs);
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be >= 1".to_string()));
        }
        if self.default_timeout == 0 {
            return Err(ConfigError::Invalid(
                "default_timeout must be positive".to_string(),
            ));
        }
        validate_retry_numbers(None, self.default_retry_backoff, self.default_retry_jitter)?;
        validate_retry_statuses(None, &self.default_retry_on_status)?;

        let mut seen: HashSet<&str> = HashSet::new();
        for job in &self.jobs {
            if job.id.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "job ids must not be empty".to_string(),
                ));
            }
            if !seen.insert(job.id.as_str()) {
                return Err(ConfigError::DuplicateJobId(job.id.clone()));
            }
            if job.command.trim().is_empty() {
                return Err(ConfigError::invalid_job(&job.id, "command must not be empty"));
            }
            if job.dependencies.iter().any(|dep| dep == &job.id) {
                return Err(ConfigError::invalid_job(
                    &job.id,
                    "a job cannot depend on itself",
                ));
            }
            if job.timeout_seconds == Some(0) {
                return Err(ConfigError::invalid_job(
                    &job.id,
                    "timeout_seconds must be positive",
                ));
            }
            validate_retry_numbers(
                Some(&job.id),
                job.retry_backoff.unwrap_or(self.default_retry_backoff),
                job.retry_jitter.unwrap_or(self.default_retry_jitter),
            )?;
            if let Some(statuses) = &job.retry_on_status {
                validate_retry_statuses(Some(&job.id), statuses)?;
            }
        }
        Ok(())
    }

    pub fn job(&self, id: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.iter().map(|job| job.id.clone()).collect()
    }

    pub fn timeout_for(&self, job: &JobSpec) -> Duration {
        job.timeout(self.default_timeout)
    }

    /// Job-level retry fields merged over the workflow defaults.
    pub fn retry_policy_for(&self, job: &JobSpec) -> RetryPolicy {
        RetryPolicy {
            max_retries: job.max_retries.unwrap_or(self.default_max_retries),
            delay: Duration::from_secs_f64(
                job.retry_delay_seconds
                    .unwrap_or(self.default_retry_delay)
                    .max(0.0),
            ),
            backoff: job.retry_backoff.unwrap_or(self.default_retry_backoff),
            jitter: job.retry_jitter.unwrap_or(self.default_retry_jitter),
            max_retry_time: Duration::from_secs(
                job.max_retry_time_seconds
                    .unwrap_or(self.default_max_retry_time),
            ),
            retry_on_status: job
                .retry_on_status
                .clone()
                .unwrap_or_else(|| self.default_retry_on_status.clone()),
            retry_on_exit_codes: job
                .retry_on_exit_codes
                .clone()
                .unwrap_or_else(|| self.default_retry_on_exit_codes.clone()),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.working_dir.join("logs"))
    }
}

fn validate_retry_numbers(job: Option<&str>, backoff: f64, jitter: f64) -> Result<(), ConfigError> {
    if backoff < 1.0 {
        return Err(retry_error(job, "retry_backoff must be >= 1.0"));
    }
    if !(0.0..=1.0).contains(&jitter) {
        return Err(retry_error(job, "retry_jitter must be within [0, 1]"));
    }
    Ok(())
}

fn validate_retry_statuses(job: Option<&str>, statuses: &[JobStatus]) -> Result<(), ConfigError> {
    match statuses.iter().find(|status| !status.is_terminal_failure()) {
        Some(status) => Err(retry_error(
            job,
            format!("retry_on_status may only contain FAILED, ERROR, or TIMEOUT, got {status}"),
        )),
        None => Ok(()),
    }
}

fn retry_error(job: Option<&str>, message: impl Into<String>) -> ConfigError {
    match job {
        Some(job) => ConfigError::invalid_job(job, message),
        None => ConfigError::Invalid(message.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn minimal_config(jobs: Vec<JobSpec>) -> WorkflowConfig {
        let json = serde_json::json!({
            "application_name": "demo",
            "working_dir": "/tmp",
            "jobs": [],
        });
        let mut config: WorkflowConfig =
            serde_json::from_value(json).unwrap_or_else(|err| panic!("config: {err}"));
        config.jobs = jobs;
        config
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = minimal_config(vec![JobSpec::new("a", "true")]);
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.default_timeout, 10_800);
        assert!(!config.parallel);
        assert!(!config.continue_on_error);
        assert_eq!(config.inherit_shell_env, EnvInheritance::Full);
        assert_eq!(config.security_policy, SecurityPolicy::Warn);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_inheritance_accepts_all_config_shapes() {
        let cases = [
            (serde_json::json!(true), EnvInheritance::Full),
            (serde_json::json!(false), EnvInheritance::None),
            (serde_json::json!("default"), EnvInheritance::DefaultWhitelist),
            (
                serde_json::json!(["PATH", "HOME"]),
                EnvInheritance::Whitelist(vec!["PATH".to_string(), "HOME".to_string()]),
            ),
        ];
        for (raw, expected) in cases {
            let parsed: EnvInheritance =
                serde_json::from_value(raw).unwrap_or_else(|err| panic!("parse: {err}"));
            assert_eq!(parsed, expected);
        }
        assert!(serde_json::from_value::<EnvInheritance>(serde_json::json!("everything")).is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let config = minimal_config(vec![JobSpec::new("a", "true"), JobSpec::new("a", "false")]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateJobId(id)) if id == "a"
        ));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut job = JobSpec::new("a", "true");
        job.dependencies = vec!["a".to_string()];
        let config = minimal_config(vec![job]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_on_status_rejects_non_failure_statuses() {
        let mut job = JobSpec::new("a", "true");
        job.retry_on_status = Some(vec![JobStatus::Success]);
        let config = minimal_config(vec![job]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_policy_merges_job_fields_over_defaults() {
        let mut job = JobSpec::new("a", "true");
        job.max_retries = Some(4);
        job.retry_jitter = Some(0.25);
        let mut config = minimal_config(vec![job]);
        config.default_retry_delay = 3.0;
        config.default_max_retries = 1;
        let job = config.jobs[0].clone();
        let policy = config.retry_policy_for(&job);
        assert_eq!(policy.max_retries, 4);
        assert_eq!(policy.delay, Duration::from_secs(3));
        assert_eq!(policy.jitter, 0.25);
        assert_eq!(
            policy.retry_on_status,
            vec![JobStatus::Failed, JobStatus::Timeout]
        );
    }
}
