use std::path::PathBuf;

use clap::Parser;

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VAL, got `{raw}`")),
    }
}

#[derive(Parser, Debug)]
#[command(name = "dagrun", version, about = "Run a DAG of shell jobs with history and resume")]
pub struct Cli {
    /// Action to perform. If omitted, runs the configured workflow.
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Workflow configuration file (JSON).
    #[arg(long = "config", short = 'c', value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// History database path. Defaults to dagrun-history.sqlite in the
    /// workflow's working directory (or the current directory for
    /// history subcommands).
    #[arg(long = "db", value_name = "PATH", global = true)]
    pub db: Option<PathBuf>,

    /// Validate and print the execution plan without running anything.
    #[arg(long = "dry-run", default_value_t = false)]
    pub dry_run: bool,

    /// Comma-separated job ids to pre-mark as skipped.
    #[arg(long = "skip", value_name = "IDS", value_delimiter = ',')]
    pub skip: Vec<String>,

    /// Environment overrides applied on top of every other layer.
    #[arg(
        long = "env",
        short = 'e',
        value_name = "KEY=VAL",
        value_parser = parse_env_pair
    )]
    pub env: Vec<(String, String)>,

    /// Force the worker-pool strategy.
    #[arg(long = "parallel", default_value_t = false, conflicts_with = "sequential")]
    pub parallel: bool,

    /// Force the serial strategy.
    #[arg(long = "sequential", default_value_t = false)]
    pub sequential: bool,

    /// Worker-pool size (implies nothing about strategy selection).
    #[arg(long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Keep dispatching jobs after a failure instead of aborting.
    #[arg(long = "continue-on-error", default_value_t = false)]
    pub continue_on_error: bool,

    /// Open a new attempt under an existing run id, skipping jobs that
    /// already succeeded.
    #[arg(long = "resume-from", value_name = "RUN_ID")]
    pub resume_from: Option<i64>,

    /// With --resume-from: only re-run jobs that previously failed.
    #[arg(
        long = "resume-failed-only",
        default_value_t = false,
        requires = "resume_from"
    )]
    pub resume_failed_only: bool,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// List recorded runs, newest first.
    ListRuns(ListRunsArgs),

    /// Show every attempt and job row of one run.
    ShowRun(ShowRunArgs),

    /// Force the latest-attempt rows of the named jobs to SUCCESS.
    MarkSuccess(MarkSuccessArgs),
}

#[derive(Debug, clap::Args)]
pub struct ListRunsArgs {
    /// Only list runs of this application.
    #[arg(value_name = "APPLICATION")]
    pub application: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct ShowRunArgs {
    #[arg(value_name = "RUN_ID")]
    pub run_id: i64,
}

#[derive(Debug, clap::Args)]
pub struct MarkSuccessArgs {
    #[arg(long = "run-id", short = 'r', value_name = "RUN_ID")]
    pub run_id: i64,

    /// Comma-separated job ids.
    #[arg(long = "jobs", short = 'j', value_name = "IDS", value_delimiter = ',')]
    pub jobs: Vec<String>,
}
