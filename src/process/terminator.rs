//! Graceful-then-forceful termination of a child and its descendant process tree.
//!
//! Walks the descendant tree with `sysinfo` before signalling, since a supervised backend may
//! fork helpers that would otherwise survive its own exit.

use std::time::Duration;
use sysinfo::{Pid, System};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, warn};

/// How long to wait for a graceful exit before escalating to SIGKILL.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::Error,
    },
}

/// Returns `root` and every process transitively parented by it, root first.
fn descendant_tree(root: u32) -> Vec<u32> {
    let mut system = System::new_all();
    system.refresh_all();

    let root_pid = Pid::from_u32(root);
    let mut tree = vec![root];
    let mut frontier = vec![root_pid];

    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) {
                tree.push(pid.as_u32());
                frontier.push(*pid);
            }
        }
    }
    tree
}

fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), TerminateError> {
    use nix::sys::signal;
    use nix::unistd::Pid as NixPid;
    match signal::kill(NixPid::from_raw(pid as i32), signal) {
        // ESRCH: the process is already gone, which is exactly what we wanted.
        Err(nix::Error::ESRCH) => Ok(()),
        Err(source) => Err(TerminateError::Signal { pid, source }),
        Ok(()) => Ok(()),
    }
}

/// Sends SIGTERM to `root_pid` and its whole descendant tree, then awaits `wait_exit` up to
/// [`GRACE_PERIOD`]. If it does not resolve in time, escalates to SIGKILL across the same tree.
///
/// `wait_exit` should resolve once the root process has actually been reaped.
pub async fn terminate_tree<F>(root_pid: u32, wait_exit: F) -> Result<(), TerminateError>
where
    F: std::future::Future<Output = ()>,
{
    let tree = descendant_tree(root_pid);
    for pid in &tree {
        send_signal(*pid, nix::sys::signal::Signal::SIGTERM)?;
    }

    if timeout(GRACE_PERIOD, wait_exit).await.is_err() {
        warn!(pid = root_pid, "grace period elapsed, escalating to SIGKILL");
        // Re-enumerate: some descendants may have exited on their own during the grace period.
        for pid in descendant_tree(root_pid) {
            if let Err(err) = send_signal(pid, nix::sys::signal::Signal::SIGKILL) {
                error!(pid, %err, "failed to force-kill process");
                return Err(err);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[tokio::test]
    async fn terminate_tree_on_already_exited_process_does_not_hang() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        terminate_tree(pid, async {}).await.unwrap();
    }

    #[tokio::test]
    async fn terminate_tree_escalates_to_sigkill_on_timeout() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        let pid = child.id();

        // `wait_exit` never resolves on its own; the timeout must force escalation.
        let never = std::future::pending::<()>();
        terminate_tree(pid, never).await.unwrap();

        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
