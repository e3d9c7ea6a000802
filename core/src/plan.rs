//! Dry-run planning: group jobs into execution "waves" where every job in
//! a wave has all of its dependencies satisfied by earlier waves (or by
//! the skip-set). Nothing is executed and no attempt is opened.

use std::collections::HashSet;

use dagrun_protocol::JobSpec;

use crate::error::EngineError;
use crate::validator::validate_dependencies;

pub(crate) fn execution_waves(
    jobs: &[JobSpec],
    skip_set: &HashSet<String>,
) -> Result<Vec<Vec<String>>, EngineError> {
    validate_dependencies(jobs)?;

    let mut satisfied: HashSet<&str> = jobs
        .iter()
        .filter(|job| skip_set.contains(&job.id))
        .map(|job| job.id.as_str())
        .collect();
    let mut remaining: Vec<&JobSpec> = jobs
        .iter()
        .filter(|job| !skip_set.contains(&job.id))
        .collect();
    let mut waves = Vec::new();
    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&JobSpec>, Vec<&JobSpec>) =
            remaining.into_iter().partition(|job| {
                job.dependencies
                    .iter()
                    .all(|dependency| satisfied.contains(dependency.as_str()))
            });
        // An acyclic graph always frees at least one job per pass.
        debug_assert!(!ready.is_empty());
        for job in &ready {
            satisfied.insert(job.id.as_str());
        }
        waves.push(ready.iter().map(|job| job.id.clone()).collect());
        remaining = blocked;
    }
    Ok(waves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn job(id: &str, deps: &[&str]) -> JobSpec {
        JobSpec::new(id, "true").with_dependencies(deps)
    }

    #[test]
    fn waves_respect_dependency_depth() {
        let jobs = vec![
            job("a", &[]),
            job("b", &["a"]),
            job("c", &["a"]),
            job("d", &["b", "c"]),
        ];
        let waves = execution_waves(&jobs, &HashSet::new()).unwrap();
        assert_eq!(
            waves,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
    }

    #[test]
    fn skipped_jobs_satisfy_dependents_without_appearing() {
        let jobs = vec![job("a", &[]), job("b", &["a"])];
        let skips: HashSet<String> = ["a".to_string()].into();
        let waves = execution_waves(&jobs, &skips).unwrap();
        assert_eq!(waves, vec![vec!["b".to_string()]]);
    }

    #[test]
    fn cycles_are_surfaced_as_errors() {
        let jobs = vec![job("a", &["b"]), job("b", &["a"])];
        assert!(execution_waves(&jobs, &HashSet::new()).is_err());
    }
}
