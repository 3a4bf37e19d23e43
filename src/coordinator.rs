//! The coordinator (spec component C4): a registry of every supervisor that arbitrates mutual
//! exclusion between an on-demand process and its declared conflicts, and pauses/resumes the
//! pausable set around an on-demand lease.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::supervisor::{OnDemandSupervisor, PausableSupervisor};

#[derive(Default)]
pub struct Coordinator {
    pausable: Mutex<Vec<Arc<PausableSupervisor>>>,
    ondemand: Mutex<Vec<Arc<OnDemandSupervisor>>>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_pausable(&self, supervisor: Arc<PausableSupervisor>) {
        self.pausable.lock().await.push(supervisor);
    }

    pub async fn add_ondemand(&self, supervisor: Arc<OnDemandSupervisor>) {
        self.ondemand.lock().await.push(supervisor);
    }

    /// Removes the first registered pausable supervisor identical to `supervisor`. No-op if not
    /// registered.
    pub async fn remove_pausable(&self, supervisor: &Arc<PausableSupervisor>) {
        let mut guard = self.pausable.lock().await;
        if let Some(i) = guard.iter().position(|p| Arc::ptr_eq(p, supervisor)) {
            guard.remove(i);
        }
    }

    /// Removes the first registered on-demand supervisor identical to `supervisor`. No-op if not
    /// registered.
    pub async fn remove_ondemand(&self, supervisor: &Arc<OnDemandSupervisor>) {
        let mut guard = self.ondemand.lock().await;
        if let Some(i) = guard.iter().position(|p| Arc::ptr_eq(p, supervisor)) {
            guard.remove(i);
        }
    }

    pub async fn ondemand_by_name(&self, name: &str) -> Option<Arc<OnDemandSupervisor>> {
        self.ondemand
            .lock()
            .await
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    /// Terminates every pausable supervisor, in registration order. If `requester` is given,
    /// reschedules each one to resume only after the requester's idle lease could expire, so
    /// pausables stay quiescent for the whole time the on-demand process may be serving.
    pub async fn stop_all_pausable(&self, requester: Option<&OnDemandSupervisor>) {
        // Snapshot under the lock, then release it: termination is not instantaneous and must
        // tolerate concurrent registration.
        let snapshot = self.pausable.lock().await.clone();
        for p in &snapshot {
            p.terminate().await;
        }
        if let Some(requester) = requester {
            let resume_at = Instant::now() + requester.timeout();
            for p in &snapshot {
                p.reschedule(resume_at).await;
            }
        }
    }

    /// Terminates every on-demand supervisor named in `requester.conflicts_with`.
    pub async fn stop_all_ondemand(&self, requester: &OnDemandSupervisor) {
        let snapshot = self.ondemand.lock().await.clone();
        for peer in snapshot
            .iter()
            .filter(|peer| requester.conflicts_with.iter().any(|c| c == peer.name()))
        {
            peer.terminate().await;
        }
    }

    /// Stops pausables unconditionally; additionally stops `requester`'s conflicts if given.
    pub async fn stop_all(&self, requester: Option<&OnDemandSupervisor>) {
        self.stop_all_pausable(requester).await;
        if let Some(requester) = requester {
            self.stop_all_ondemand(requester).await;
        }
    }

    /// Starts every pausable supervisor, honoring each one's current `scheduled_start`.
    pub async fn resume_all(&self) {
        let snapshot = self.pausable.lock().await.clone();
        for p in &snapshot {
            p.start().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pausable(name: &str) -> Arc<PausableSupervisor> {
        PausableSupervisor::new(name, vec!["sh".into(), "-c".into(), "sleep 5".into()], ".".into())
    }

    fn ondemand(name: &str, conflicts_with: Vec<String>) -> Arc<OnDemandSupervisor> {
        OnDemandSupervisor::new(
            name,
            vec!["sh".into(), "-c".into(), "sleep 5".into()],
            ".".into(),
            "http://127.0.0.1:9/".into(),
            Duration::from_secs(60),
            conflicts_with,
            None,
        )
    }

    #[tokio::test]
    async fn stop_all_ondemand_terminates_only_declared_conflicts() {
        let coordinator = Coordinator::new();
        let a = ondemand("a", vec!["b".into()]);
        let b = ondemand("b", vec![]);
        let c = ondemand("c", vec![]);
        coordinator.add_ondemand(a.clone()).await;
        coordinator.add_ondemand(b.clone()).await;
        coordinator.add_ondemand(c.clone()).await;

        b.start().await;
        c.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b.is_running().await);
        assert!(c.is_running().await);

        coordinator.stop_all_ondemand(&a).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!b.is_running().await, "declared conflict must be terminated");
        assert!(c.is_running().await, "non-conflicting peer must be left alone");
    }

    #[tokio::test]
    async fn remove_pausable_drops_only_the_matching_entry() {
        let coordinator = Coordinator::new();
        let a = pausable("a");
        let b = pausable("b");
        coordinator.add_pausable(a.clone()).await;
        coordinator.add_pausable(b.clone()).await;

        coordinator.remove_pausable(&a).await;
        assert_eq!(coordinator.pausable.lock().await.len(), 1);
        assert!(Arc::ptr_eq(&coordinator.pausable.lock().await[0], &b));

        // Removing an already-removed supervisor is a no-op.
        coordinator.remove_pausable(&a).await;
        assert_eq!(coordinator.pausable.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_ondemand_drops_only_the_matching_entry() {
        let coordinator = Coordinator::new();
        let a = ondemand("a", vec![]);
        let b = ondemand("b", vec![]);
        coordinator.add_ondemand(a.clone()).await;
        coordinator.add_ondemand(b.clone()).await;

        coordinator.remove_ondemand(&a).await;
        assert_eq!(coordinator.ondemand.lock().await.len(), 1);
        assert!(Arc::ptr_eq(&coordinator.ondemand.lock().await[0], &b));
    }

    #[tokio::test]
    async fn stop_all_pausable_reschedules_around_requesters_timeout() {
        let coordinator = Coordinator::new();
        let p = pausable("p");
        coordinator.add_pausable(p.clone()).await;
        p.start_immediately().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(p.is_running().await);

        let requester = ondemand("a", vec![]);
        let before = Instant::now();
        coordinator.stop_all_pausable(Some(&requester)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!p.is_running().await);

        // resume_all before the requester's timeout elapses must not restart it yet.
        coordinator.resume_all().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!p.is_running().await, "must stay paused until requester.timeout elapses");
        assert!(before.elapsed() < requester.timeout());
    }
}
