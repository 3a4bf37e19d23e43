//! The common subprocess supervisor (spec component C1): spawn, stream, and
//! gracefully-then-forcefully terminate a single child process.
//!
//! `ProcessCore` is deliberately capability-sized rather than a base class to be subclassed:
//! [`crate::supervisor::pausable::PausableSupervisor`] and
//! [`crate::supervisor::ondemand::OnDemandSupervisor`] each *own* one and layer their own gate
//! (deferred start) or reaper (idle lease) around it, instead of overriding its behavior.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

use super::stream::{relay_lines, Stream};
use super::terminator::terminate_tree;

struct State {
    running: bool,
    terminated_by_manager: bool,
    current_pid: Option<u32>,
}

/// Spawns `cmdline` in `workdir`, relays its output, and tears it down on request.
///
/// Invariant: `current_pid.is_some()` iff a child has been spawned and not yet reaped;
/// `running` holds for exactly the same interval.
pub struct ProcessCore {
    pub name: String,
    cmdline: Vec<String>,
    workdir: PathBuf,
    state: Mutex<State>,
    reaped: Notify,
}

impl ProcessCore {
    pub fn new(name: impl Into<String>, cmdline: Vec<String>, workdir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            cmdline,
            workdir,
            state: Mutex::new(State {
                running: false,
                terminated_by_manager: false,
                current_pid: None,
            }),
            reaped: Notify::new(),
        })
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Idempotent: if a child is already running, does nothing. Otherwise spawns one and
    /// drives it to completion in the background, invoking `on_exit(terminated_by_manager)`
    /// once it has been reaped. Returns immediately; it never awaits the child's exit.
    pub fn start<F, Fut>(self: &Arc<Self>, on_exit: F)
    where
        F: FnOnce(bool) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            {
                let mut state = this.state.lock().await;
                if state.running {
                    return;
                }
                state.running = true;
                state.terminated_by_manager = false;
            }
            this.run_process(on_exit).await;
        });
    }

    async fn run_process<F, Fut>(self: Arc<Self>, on_exit: F)
    where
        F: FnOnce(bool) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        info!(supervisor = self.name, cmdline = ?self.cmdline, "starting supervisor process");

        let mut command = Command::new(&self.cmdline[0]);
        command
            .args(&self.cmdline[1..])
            .current_dir(&self.workdir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(supervisor = self.name, %err, "failed to spawn supervisor process");
                let mut state = self.state.lock().await;
                state.running = false;
                drop(state);
                on_exit(false).await;
                return;
            }
        };

        let pid = child.id().expect("just-spawned child always has a pid");
        {
            let mut state = self.state.lock().await;
            state.current_pid = Some(pid);
        }

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let name = self.name.clone();
        let name2 = self.name.clone();
        let stdout_task = tokio::spawn(async move { relay_lines(&name, Stream::Stdout, stdout).await });
        let stderr_task = tokio::spawn(async move { relay_lines(&name2, Stream::Stderr, stderr).await });

        let exit_status = child.wait().await;
        let _ = tokio::join!(stdout_task, stderr_task);

        match &exit_status {
            Ok(status) if !status.success() => {
                warn!(supervisor = self.name, code = ?status.code(), "supervisor process exited unsuccessfully");
            }
            Err(err) => {
                error!(supervisor = self.name, %err, "error while waiting for supervisor process");
            }
            Ok(_) => {}
        }

        let terminated_by_manager = {
            let mut state = self.state.lock().await;
            state.running = false;
            state.current_pid = None;
            state.terminated_by_manager
        };
        self.reaped.notify_waiters();

        on_exit(terminated_by_manager).await;
    }

    /// Marks this process as deliberately stopped, then signals the child's process tree
    /// (SIGTERM, then SIGKILL after [`super::terminator::GRACE_PERIOD`]). A no-op if no child
    /// is currently running.
    pub async fn terminate(&self) {
        let pid = {
            let mut state = self.state.lock().await;
            state.terminated_by_manager = true;
            match state.current_pid {
                Some(pid) => pid,
                None => return,
            }
        };

        let wait_for_reap = async {
            loop {
                if !self.is_running().await {
                    return;
                }
                self.reaped.notified().await;
            }
        };

        if let Err(err) = terminate_tree(pid, wait_for_reap).await {
            error!(supervisor = self.name, %err, "failed to terminate supervisor process tree");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let core = ProcessCore::new("sleeper", vec!["sh".into(), "-c".into(), "sleep 2".into()], ".".into());
        let exits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for _ in 0..3 {
            let exits = exits.clone();
            core.start(move |_| async move {
                exits.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(core.is_running().await);
        core.terminate().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminate_before_start_is_a_no_op() {
        let core = ProcessCore::new("idle", vec!["sh".into(), "-c".into(), "sleep 2".into()], ".".into());
        core.terminate().await;
        assert!(!core.is_running().await);
    }

    #[tokio::test]
    async fn process_terminated_hook_reports_manager_intent() {
        let core = ProcessCore::new("sleeper", vec!["sh".into(), "-c".into(), "sleep 5".into()], ".".into());
        let manager_terminated = Arc::new(AtomicBool::new(false));
        let flag = manager_terminated.clone();
        core.start(move |terminated_by_manager| async move {
            flag.store(terminated_by_manager, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        core.terminate().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager_terminated.load(Ordering::SeqCst));
    }
}
