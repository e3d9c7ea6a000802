//! Effective-environment assembly for jobs: base policy, layered merge,
//! and `${NAME}` interpolation.

use std::collections::HashMap;
use std::collections::HashSet;

use dagrun_protocol::DEFAULT_ENV_WHITELIST;
use dagrun_protocol::EnvInheritance;
use tracing::warn;

/// Left-to-right merge with later layers overriding earlier: base policy,
/// application env, job env, CLI overrides. The merged map is then
/// interpolated to a fixed point.
pub(crate) fn assemble_env(
    inheritance: &EnvInheritance,
    app_env: &HashMap<String, String>,
    job_env: &HashMap<String, String>,
    cli_env: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = base_env(inheritance);
    for layer in [app_env, job_env, cli_env] {
        for (key, value) in layer {
            merged.insert(key.clone(), value.clone());
        }
    }
    interpolate(&merged)
}

fn base_env(inheritance: &EnvInheritance) -> HashMap<String, String> {
    match inheritance {
        EnvInheritance::Full => std::env::vars().collect(),
        EnvInheritance::None => HashMap::new(),
        EnvInheritance::DefaultWhitelist => whitelist_env(DEFAULT_ENV_WHITELIST.iter().copied()),
        EnvInheritance::Whitelist(names) => whitelist_env(names.iter().map(String::as_str)),
    }
}

fn whitelist_env<'a>(names: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    names
        .filter_map(|name| std::env::var(name).ok().map(|value| (name.to_string(), value)))
        .collect()
}

/// Expand `${NAME}` references against the map itself until a fixed point.
/// A reference that participates in a cycle stays in its literal form;
/// references to undefined names are also left untouched.
pub(crate) fn interpolate(merged: &HashMap<String, String>) -> HashMap<String, String> {
    let mut resolved: HashMap<String, String> = HashMap::new();
    let mut visiting: Vec<String> = Vec::new();
    let mut keys: Vec<&String> = merged.keys().collect();
    keys.sort();
    for key in keys {
        resolve(key, merged, &mut resolved, &mut visiting);
    }
    resolved
}

fn resolve(
    name: &str,
    merged: &HashMap<String, String>,
    resolved: &mut HashMap<String, String>,
    visiting: &mut Vec<String>,
) -> String {
    if let Some(value) = resolved.get(name) {
        return value.clone();
    }
    let Some(raw) = merged.get(name) else {
        return format!("${{{name}}}");
    };
    visiting.push(name.to_string());
    let value = expand(raw, merged, resolved, visiting);
    visiting.pop();
    resolved.insert(name.to_string(), value.clone());
    value
}

fn expand(
    raw: &str,
    merged: &HashMap<String, String>,
    resolved: &mut HashMap<String, String>,
    visiting: &mut Vec<String>,
) -> String {
    let mut output = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference: keep the remainder verbatim.
            output.push_str(&rest[start..]);
            return output;
        };
        let name = &after[..end];
        if visiting.iter().any(|seen| seen == name) {
            warn!(variable = name, "environment variable references itself; leaving literal");
            output.push_str(&format!("${{{name}}}"));
        } else {
            output.push_str(&resolve(name, merged, resolved, visiting));
        }
        rest = &after[end + 1..];
    }
    output.push_str(rest);
    output
}

/// Names referenced by `${...}` anywhere in the map that the map itself
/// does not define. Useful for warning at validation time.
#[allow(dead_code)]
pub(crate) fn undefined_references(merged: &HashMap<String, String>) -> HashSet<String> {
    let mut missing = HashSet::new();
    for raw in merged.values() {
        let mut rest = raw.as_str();
        while let Some(start) = rest.find("${") {
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else { break };
            let name = &after[..end];
            if !merged.contains_key(name) {
                missing.insert(name.to_string());
            }
            rest = &after[end + 1..];
        }
    }
    missing
}
