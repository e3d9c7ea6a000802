//! Pre-flight scan of raw command strings for obviously destructive
//! patterns. Under the `warn` policy a hit only logs; under `strict` it
//! rejects the configuration before any attempt opens. This is a guard
//! rail, not a sandbox: it never inspects a running process.

use dagrun_protocol::ConfigError;
use dagrun_protocol::SecurityPolicy;
use dagrun_protocol::WorkflowConfig;
use tracing::warn;

const DENY_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "rm -rf ~",
    "mkfs",
    "dd if=/dev/zero of=/dev/",
    "> /dev/sd",
    ":(){ :|:& };:",
    "chmod -R 777 /",
];

/// The first deny-list pattern the command contains, if any.
pub(crate) fn scan_command(command: &str) -> Option<&'static str> {
    DENY_PATTERNS
        .iter()
        .find(|pattern| command.contains(*pattern))
        .copied()
}

pub(crate) fn enforce_security_policy(config: &WorkflowConfig) -> Result<(), ConfigError> {
    for job in &config.jobs {
        let Some(pattern) = scan_command(&job.command) else {
            continue;
        };
        match config.security_policy {
            SecurityPolicy::Warn => {
                warn!(job = %job.id, pattern, "command matches a destructive pattern");
            }
            SecurityPolicy::Strict => {
                return Err(ConfigError::invalid_job(
                    &job.id,
                    format!("command matches destructive pattern `{pattern}`"),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_protocol::JobSpec;
    use pretty_assertions::assert_eq;

    fn config(policy: SecurityPolicy, command: &str) -> WorkflowConfig {
        let mut config: WorkflowConfig = serde_json::from_value(serde_json::json!({
            "application_name": "demo",
            "working_dir": "/tmp",
            "jobs": [],
        }))
        .unwrap();
        config.security_policy = policy;
        config.jobs = vec![JobSpec::new("risky", command)];
        config
    }

    #[test]
    fn benign_commands_pass_both_policies() {
        assert_eq!(scan_command("echo hello && ls -la"), None);
        assert!(enforce_security_policy(&config(SecurityPolicy::Strict, "echo ok")).is_ok());
    }

    #[test]
    fn warn_policy_does_not_reject() {
        let config = config(SecurityPolicy::Warn, "rm -rf / --no-preserve-root");
        assert!(enforce_security_policy(&config).is_ok());
    }

    #[test]
    fn strict_policy_rejects_destructive_commands() {
        let config = config(SecurityPolicy::Strict, "rm -rf / --no-preserve-root");
        assert!(enforce_security_policy(&config).is_err());
    }
}
