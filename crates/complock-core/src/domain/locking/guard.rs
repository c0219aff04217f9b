//! Lock guards for RAII-style manifestation locks
//!
//! Dropping a guard queues a release request for the lock manager, so a
//! view that goes away abnormally still gives up its hold. The manager
//! applies queued releases in [`LockManager::process_releases`].
//!
//! [`LockManager::process_releases`]: super::manager::LockManager::process_releases

use std::collections::BTreeSet;
use std::fmt;
use tokio::sync::mpsc;

use super::types::Holder;

/// Request to release holders, sent when a guard is dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub component_id: String,
    pub holders: BTreeSet<Holder>,
}

/// Channel for notifying the lock manager when a guard is dropped
pub type ReleaseNotifier = mpsc::UnboundedSender<ReleaseRequest>;

/// Holds a component lock on behalf of a set of manifestations
///
/// The hold is released when the guard is dropped.
#[derive(Debug)]
pub struct ManifestationLockGuard {
    component_id: String,
    holders: BTreeSet<Holder>,
    release_tx: Option<ReleaseNotifier>,
    released: bool,
}

impl ManifestationLockGuard {
    pub(crate) fn new(
        component_id: &str,
        holders: BTreeSet<Holder>,
        release_tx: ReleaseNotifier,
    ) -> Self {
        Self {
            component_id: component_id.to_string(),
            holders,
            release_tx: Some(release_tx),
            released: false,
        }
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    pub fn holders(&self) -> &BTreeSet<Holder> {
        &self.holders
    }

    /// Whether the guard still owns its hold
    pub fn is_active(&self) -> bool {
        !self.released
    }

    /// Explicitly release the hold (normally done on drop)
    pub fn release(mut self) {
        self.do_release();
    }

    /// Keep the hold but stop tracking it; the caller must unlock explicitly
    pub fn disarm(mut self) {
        self.released = true;
        self.release_tx = None;
    }

    fn do_release(&mut self) {
        if !self.released {
            self.released = true;
            if let Some(tx) = self.release_tx.take() {
                // Receiver gone means the manager is gone too
                let _ = tx.send(ReleaseRequest {
                    component_id: self.component_id.clone(),
                    holders: std::mem::take(&mut self.holders),
                });
            }
        }
    }
}

impl Drop for ManifestationLockGuard {
    fn drop(&mut self) {
        self.do_release();
    }
}

impl fmt::Display for ManifestationLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lock[{}; {} holder(s)]", self.component_id, self.holders.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::locking::types::ViewerId;

    fn guard(tx: ReleaseNotifier) -> ManifestationLockGuard {
        let holders = [Holder::Viewer(ViewerId::new())].into_iter().collect();
        ManifestationLockGuard::new("c1", holders, tx)
    }

    #[test]
    fn test_drop_sends_release() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let g = guard(tx);
        assert!(g.is_active());
        assert_eq!(g.to_string(), "Lock[c1; 1 holder(s)]");
        drop(g);

        let request = rx.try_recv().expect("release request");
        assert_eq!(request.component_id, "c1");
        assert_eq!(request.holders.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_explicit_release_sends_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        guard(tx).release();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_queued_releases_are_never_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..500 {
            drop(guard(tx.clone()));
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 500);
    }

    #[test]
    fn test_disarm_sends_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        guard(tx).disarm();
        assert!(rx.try_recv().is_err());
    }
}
