//! Pre-flight graph checks, run once per attempt before the queue is
//! seeded: every declared dependency must exist, and the dependency graph
//! must be acyclic.

use std::collections::HashMap;
use std::collections::HashSet;

use dagrun_protocol::JobSpec;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

pub fn validate_dependencies(jobs: &[JobSpec]) -> Result<(), EngineError> {
    let known: HashSet<&str> = jobs.iter().map(|job| job.id.as_str()).collect();
    for job in jobs {
        for dependency in &job.dependencies {
            if !known.contains(dependency.as_str()) {
                return Err(EngineError::MissingDependency {
                    job: job.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    let dependencies: HashMap<&str, &[String]> = jobs
        .iter()
        .map(|job| (job.id.as_str(), job.dependencies.as_slice()))
        .collect();

    // Iterative DFS so deep chains cannot overflow the stack; an edge back
    // into the in-progress path is a cycle.
    let mut visited: HashMap<&str, Visit> = HashMap::new();
    for root in jobs {
        if visited.contains_key(root.id.as_str()) {
            continue;
        }
        let mut path: Vec<&str> = Vec::new();
        let mut stack: Vec<(&str, usize)> = vec![(root.id.as_str(), 0)];
        while let Some((node, next_child)) = stack.pop() {
            if next_child == 0 {
                visited.insert(node, Visit::InProgress);
                path.push(node);
            }
            let children = dependencies.get(node).copied().unwrap_or(&[]);
            if next_child < children.len() {
                stack.push((node, next_child + 1));
                let child = children[next_child].as_str();
                match visited.get(child) {
                    Some(Visit::InProgress) => {
                        return Err(EngineError::Cycle {
                            cycle: extract_cycle(&path, child),
                        });
                    }
                    Some(Visit::Done) => {}
                    None => stack.push((child, 0)),
                }
            } else {
                visited.insert(node, Visit::Done);
                path.pop();
            }
        }
    }
    Ok(())
}

/// The portion of the DFS path from the first occurrence of `back_edge`
/// to the top, closed with `back_edge` again.
fn extract_cycle(path: &[&str], back_edge: &str) -> Vec<String> {
    let start = path
        .iter()
        .position(|node| *node == back_edge)
        .unwrap_or(0);
    let mut cycle: Vec<String> = path[start..].iter().map(ToString::to_string).collect();
    cycle.push(back_edge.to_string());
    cycle
}
