//! Subprocess plumbing shared by the job runner.
//!
//! Every job command is spawned through `sh -c` in its own process group
//! so that timeout and cancellation kills reach the whole tree the
//! command may have forked, not just the shell.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Child;
use tokio::process::Command;
use tracing::trace;
use tracing::warn;

pub(crate) struct SpawnJobRequest<'a> {
    pub command: &'a str,
    pub cwd: &'a Path,
    pub env: &'a HashMap<String, String>,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

pub(crate) fn spawn_job(request: SpawnJobRequest<'_>) -> io::Result<Child> {
    let SpawnJobRequest {
        command,
        cwd,
        env,
        stdout,
        stderr,
    } = request;

    trace!("spawn_job: {command:?} cwd={cwd:?}");

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.current_dir(cwd);
    cmd.env_clear();
    cmd.envs(env);

    // No stdin: a job that waits for input should time out, not hang the
    // attempt on a tty.
    cmd.stdin(Stdio::null());
    cmd.stdout(stdout);
    cmd.stderr(stderr);

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(set_process_group);
    }

    // If this process dies (including SIGKILL), any still-running job
    // subprocess is reaped with it.
    cmd.kill_on_drop(true).spawn()
}

#[cfg(unix)]
/// Put the calling process into its own process group.
///
/// Intended for use in `pre_exec` so the child becomes the group leader.
fn set_process_group() -> io::Result<()> {
    let result = unsafe { libc::setpgid(0, 0) };
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(unix)]
/// Send `signal` to the process group of `child` (best-effort).
fn signal_process_group(child: &Child, signal: i32) -> io::Result<()> {
    use std::io::ErrorKind;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    if pgid == -1 {
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::NotFound {
            return Err(err);
        }
        return Ok(());
    }
    let result = unsafe { libc::killpg(pgid, signal) };
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::NotFound {
            return Err(err);
        }
    }
    Ok(())
}

/// Terminate the child's process group: SIGTERM, a grace window, then
/// SIGKILL. Waits for the child to be reaped before returning.
pub(crate) async fn terminate_group(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Err(err) = signal_process_group(child, libc::SIGTERM) {
            warn!("failed to SIGTERM process group: {err}");
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        if let Err(err) = signal_process_group(child, libc::SIGKILL) {
            warn!("failed to SIGKILL process group: {err}");
        }
        if let Err(err) = child.wait().await {
            warn!("failed to reap killed job process: {err}");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
        if let Err(err) = child.start_kill() {
            warn!("failed to kill job process: {err}");
        }
        if let Err(err) = child.wait().await {
            warn!("failed to reap killed job process: {err}");
        }
    }
}
