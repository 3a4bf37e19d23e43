//! The pausable supervisor (spec component C2): a [`ProcessCore`] wrapped in a deferred-start
//! gate. `start()` returns immediately and the child is spawned only once `scheduled_start`
//! has elapsed; a child that exits on its own (not via `terminate()`) is restarted immediately.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tracing::info;

use crate::process::ProcessCore;

/// `start` and `start_immediately` call each other across the exit-hook boundary; boxing their
/// futures gives rustc a concrete type to close the cycle with instead of an opaque one.
type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

struct State {
    scheduled_start: Instant,
    gate_pending: bool,
}

pub struct PausableSupervisor {
    core: Arc<ProcessCore>,
    state: Mutex<State>,
    wake: Notify,
}

/// The fallback cadence at which the deferred-start gate re-checks `scheduled_start`, used only
/// as a safety net between `reschedule`/`start_immediately` wake-ups.
const POLL_FALLBACK: Duration = Duration::from_secs(1);

impl PausableSupervisor {
    pub fn new(name: impl Into<String>, cmdline: Vec<String>, workdir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            core: ProcessCore::new(name, cmdline, workdir),
            state: Mutex::new(State {
                scheduled_start: Instant::now(),
                gate_pending: false,
            }),
            wake: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Idempotent request to have a running child, honoring `scheduled_start`. Does not spawn
    /// a second deferred-start task if one is already waiting, nor if the child already runs.
    pub fn start(self: &Arc<Self>) -> BoxFuture<'static> {
        let this = self.clone();
        Box::pin(async move {
            {
                let mut state = this.state.lock().await;
                if state.gate_pending || this.core.is_running().await {
                    return;
                }
                state.gate_pending = true;
            }
            let gate = this.clone();
            tokio::spawn(async move { gate.run_gate().await });
        })
    }

    async fn run_gate(self: Arc<Self>) {
        loop {
            let target = self.state.lock().await.scheduled_start;
            let now = Instant::now();
            if now >= target {
                break;
            }
            let wait = (target - now).min(POLL_FALLBACK);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => {}
            }
        }
        self.state.lock().await.gate_pending = false;

        let this = self.clone();
        self.core.start(move |terminated_by_manager| {
            let this = this.clone();
            async move {
                if !terminated_by_manager {
                    info!(supervisor = this.name(), "process exited on its own, auto-restarting");
                    this.start_immediately().await;
                }
            }
        });
    }

    /// Sets `scheduled_start` to now and starts immediately.
    pub fn start_immediately(self: &Arc<Self>) -> BoxFuture<'static> {
        let this = self.clone();
        Box::pin(async move {
            {
                this.state.lock().await.scheduled_start = Instant::now();
            }
            this.wake.notify_waiters();
            this.start().await;
        })
    }

    /// Reschedules the next start; takes effect on the gate's next wake-up.
    pub async fn reschedule(&self, at: Instant) {
        {
            self.state.lock().await.scheduled_start = at;
        }
        self.wake.notify_waiters();
    }

    pub async fn terminate(&self) {
        self.core.terminate().await;
    }

    pub async fn is_running(&self) -> bool {
        self.core.is_running().await
    }
}
