//! The on-demand supervisor (spec component C3): a [`ProcessCore`] wrapped in an idle-lease
//! reaper. Every `start()` extends the lease to `now + timeout`; a single watcher task tears
//! the process down once the lease elapses.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::{Mutex, Notify};
use tracing::info;

use crate::process::ProcessCore;

struct State {
    schedule_end: Instant,
    watched: bool,
}

pub struct OnDemandSupervisor {
    core: Arc<ProcessCore>,
    pub endpoint: String,
    pub conflicts_with: Vec<String>,
    pub body_regex: Option<Regex>,
    timeout: Duration,
    state: Mutex<State>,
    wake: Notify,
}

const POLL_FALLBACK: Duration = Duration::from_secs(1);

impl OnDemandSupervisor {
    pub fn new(
        name: impl Into<String>,
        cmdline: Vec<String>,
        workdir: PathBuf,
        endpoint: String,
        timeout: Duration,
        conflicts_with: Vec<String>,
        body_regex: Option<Regex>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: ProcessCore::new(name, cmdline, workdir),
            endpoint,
            conflicts_with,
            body_regex,
            timeout,
            state: Mutex::new(State {
                schedule_end: Instant::now(),
                watched: false,
            }),
            wake: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `true` for the unique pool member with no `body_regex` ("main").
    pub fn is_main(&self) -> bool {
        self.body_regex.is_none()
    }

    /// Returns `true` if `body` anchored-matches this supervisor's regex. `false` for main
    /// (main is selected only as the fallback, never by matching).
    pub fn matches(&self, body: &str) -> bool {
        match &self.body_regex {
            Some(re) => re
                .find(body)
                .map(|m| m.start() == 0)
                .unwrap_or(false),
            None => false,
        }
    }

    /// Extends the lease to at least `now + timeout` and ensures the child is (still) running,
    /// starting a watcher for it if one isn't already active.
    pub async fn start(self: &Arc<Self>) {
        let now = Instant::now();
        {
            let mut state = self.state.lock().await;
            state.schedule_end = state.schedule_end.max(now + self.timeout);
        }
        self.wake.notify_waiters();

        let this = self.clone();
        self.core.start(move |_terminated_by_manager| {
            let this = this.clone();
            async move {
                this.state.lock().await.schedule_end = Instant::now();
                this.wake.notify_waiters();
            }
        });

        self.ensure_watcher().await;
    }

    async fn ensure_watcher(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.watched {
                return;
            }
            state.watched = true;
        }
        let this = self.clone();
        tokio::spawn(async move { this.watch_loop().await });
    }

    async fn watch_loop(self: Arc<Self>) {
        loop {
            let end = self.state.lock().await.schedule_end;
            let now = Instant::now();
            if now >= end {
                break;
            }
            let wait = (end - now).min(POLL_FALLBACK);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => {}
            }
        }
        info!(supervisor = self.name(), "idle lease expired, terminating");
        self.core.terminate().await;
        self.state.lock().await.watched = false;
    }

    pub async fn terminate(&self) {
        self.core.terminate().await;
    }

    pub async fn is_running(&self) -> bool {
        self.core.is_running().await
    }
}
