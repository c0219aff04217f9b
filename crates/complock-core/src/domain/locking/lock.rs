//! Per-component lock
//!
//! A `ComponentLock` records which holders currently have a component in
//! edit mode. Locks for shared components carry a distributed strategy and
//! may only gain holders while the strategy holds the lease.
//!
//! Every locked/unlocked transition is published on the event bus: entering
//! holders get `EnteredLocked`, and when the last holder leaves every holder
//! that took part in the episode gets one `ExitedLocked`.

use std::collections::BTreeSet;
use tracing::{debug, warn};

use super::event::{LockEvent, LockEventBus};
use super::strategy::DistributedLockStrategy;
use super::transaction::PendingTransaction;
use super::types::{Holder, LockError, LockInfo, LockResult};

/// Result of releasing holders from a lock
#[derive(Debug)]
pub enum Release {
    /// None of the holders held the lock
    NotHeld,
    /// Holders were removed; others still hold the lock
    Partial,
    /// The release empties the lock. Teardown has begun and must be
    /// completed with [`ComponentLock::finish_release`].
    Final(Option<PendingTransaction>),
}

/// Mutual-exclusion state for one component
#[derive(Debug)]
pub struct ComponentLock {
    component_id: String,
    holders: BTreeSet<Holder>,
    /// Every holder that entered during the current locked episode
    participants: BTreeSet<Holder>,
    locked_for_all_sessions: bool,
    unlocking: bool,
    distributed: Option<Box<dyn DistributedLockStrategy>>,
    transaction: Option<PendingTransaction>,
}

impl ComponentLock {
    /// Lock for a private component
    pub fn local(component_id: &str) -> Self {
        Self {
            component_id: component_id.to_string(),
            holders: BTreeSet::new(),
            participants: BTreeSet::new(),
            locked_for_all_sessions: false,
            unlocking: false,
            distributed: None,
            transaction: None,
        }
    }

    /// Lock for a shared component
    pub fn distributed(component_id: &str, strategy: Box<dyn DistributedLockStrategy>) -> Self {
        Self {
            distributed: Some(strategy),
            ..Self::local(component_id)
        }
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    pub fn is_shared(&self) -> bool {
        self.distributed.is_some()
    }

    pub fn is_locked(&self) -> bool {
        !self.holders.is_empty()
    }

    pub fn is_locked_for_all_sessions(&self) -> bool {
        self.locked_for_all_sessions
    }

    pub fn is_unlocking(&self) -> bool {
        self.unlocking
    }

    /// Whether `holder` holds the lock, directly or through the wildcard
    pub fn is_held_by(&self, holder: &Holder) -> bool {
        self.holders.contains(holder) || self.holders.contains(&Holder::AllViewers)
    }

    pub fn held_handles(&self) -> &BTreeSet<Holder> {
        &self.holders
    }

    /// Held by named manifestations in edit mode
    pub fn is_extended(&self) -> bool {
        self.is_locked()
            && !self.locked_for_all_sessions
            && self.holders.iter().all(|h| !h.is_wildcard())
    }

    pub fn transaction(&self) -> Option<&PendingTransaction> {
        self.transaction.as_ref()
    }

    pub fn has_pending_changes(&self) -> bool {
        self.transaction.as_ref().is_some_and(|t| !t.is_empty())
    }

    pub fn info(&self) -> LockInfo {
        LockInfo {
            component_id: self.component_id.clone(),
            shared: self.is_shared(),
            holders: self.holders.clone(),
            locked_for_all_sessions: self.locked_for_all_sessions,
            unlocking: self.unlocking,
            pending_changes: self.transaction.as_ref().map_or(0, |t| t.len()),
        }
    }

    /// Add holders to the lock
    ///
    /// Fails without changing state when the lock is held for all sessions,
    /// is being torn down, or the lease cannot be obtained.
    pub async fn acquire(&mut self, holders: &BTreeSet<Holder>, bus: &LockEventBus) -> bool {
        if holders.is_empty() {
            return false;
        }
        if self.locked_for_all_sessions || self.unlocking {
            debug!(
                component_id = %self.component_id,
                for_all_sessions = self.locked_for_all_sessions,
                unlocking = self.unlocking,
                "Lock unavailable"
            );
            bus.publish(LockEvent::lock_contention(&self.component_id, holders.iter().copied()));
            return false;
        }
        if !self.take_lease().await {
            bus.publish(LockEvent::lock_contention(&self.component_id, holders.iter().copied()));
            return false;
        }

        self.enter(holders.iter().copied(), bus);
        true
    }

    /// Acquire the lock exclusively for every session
    pub async fn acquire_for_all_sessions(&mut self, bus: &LockEventBus) -> bool {
        if self.locked_for_all_sessions {
            return true;
        }
        if self.unlocking || !self.take_lease().await {
            bus.publish(LockEvent::lock_contention(&self.component_id, [Holder::AllViewers]));
            return false;
        }

        self.locked_for_all_sessions = true;
        self.enter([Holder::AllViewers], bus);
        true
    }

    /// Remove holders from the lock
    ///
    /// When the release would leave no holders, the lock is marked as
    /// unlocking and its transaction is handed back; holders stay in place
    /// until [`finish_release`](Self::finish_release).
    pub fn release(&mut self, holders: &BTreeSet<Holder>) -> Release {
        if self.unlocking {
            return Release::NotHeld;
        }

        let leaving: BTreeSet<Holder> = self.holders.intersection(holders).copied().collect();
        if leaving.is_empty() {
            return Release::NotHeld;
        }

        if leaving.len() < self.holders.len() {
            self.holders.retain(|h| !leaving.contains(h));
            debug!(
                component_id = %self.component_id,
                released = leaving.len(),
                remaining = self.holders.len(),
                "Holders released"
            );
            return Release::Partial;
        }

        self.unlocking = true;
        Release::Final(self.transaction.take())
    }

    /// Release every holder
    pub fn release_all(&mut self) -> Release {
        let holders = self.holders.clone();
        self.release(&holders)
    }

    /// Complete a final release started by [`release`](Self::release)
    ///
    /// Returns `false` when a forced release already tore the lock down.
    pub async fn finish_release(&mut self, bus: &LockEventBus) -> bool {
        if !self.unlocking {
            return false;
        }

        if let Some(strategy) = self.distributed.as_mut() {
            strategy.unlock(&self.component_id).await;
        }
        self.exit(bus);
        true
    }

    /// Unconditionally clear the lock, releasing any lease on the component
    ///
    /// For shared locks this also removes leases held by other sessions.
    /// Returns whether the lock was held here.
    pub async fn force_release(&mut self, bus: &LockEventBus) -> bool {
        let was_locked = self.is_locked();

        if let Some(strategy) = self.distributed.as_mut() {
            strategy.force_unlock(&self.component_id).await;
        }
        if let Some(txn) = self.transaction.take().filter(|t| !t.is_empty()) {
            warn!(
                component_id = %self.component_id,
                dropped = txn.len(),
                "Discarding unsaved changes on forced release"
            );
        }

        if was_locked {
            self.exit(bus);
        } else {
            self.unlocking = false;
            self.locked_for_all_sessions = false;
        }
        was_locked
    }

    /// Append a change to the attached transaction
    ///
    /// `Ok(false)` means the change arrived during teardown and was dropped.
    pub fn push_change(&mut self, change: serde_json::Value, bus: &LockEventBus) -> LockResult<bool> {
        if self.unlocking {
            debug!(component_id = %self.component_id, "Dropping change pushed during unlock");
            return Ok(false);
        }

        let txn = self
            .transaction
            .as_mut()
            .ok_or_else(|| LockError::NoTransaction(self.component_id.clone()))?;
        txn.push(change);

        bus.publish(LockEvent::dirty(&self.component_id, self.holders.iter().copied()));
        Ok(true)
    }

    /// Rebuild this lock as a shared lock backed by `strategy`
    ///
    /// Held state moves to the new lock only if the lease can be taken; if
    /// not, the local holders are dropped and notified. The boolean reports
    /// whether held state survived. Callers must not promote a lock that is
    /// unlocking.
    pub async fn promote(
        mut self,
        strategy: Box<dyn DistributedLockStrategy>,
        bus: &LockEventBus,
    ) -> (ComponentLock, bool) {
        if self.is_shared() {
            return (self, true);
        }

        let mut shared = ComponentLock::distributed(&self.component_id, strategy);
        if !self.is_locked() {
            return (shared, true);
        }

        if !shared.take_lease().await {
            warn!(
                component_id = %self.component_id,
                "Lease unavailable during promotion, dropping local holders"
            );
            self.transaction = None;
            self.exit(bus);
            return (shared, false);
        }

        shared.holders = std::mem::take(&mut self.holders);
        shared.participants = std::mem::take(&mut self.participants);
        shared.locked_for_all_sessions = self.locked_for_all_sessions;
        shared.transaction = self.transaction.take();
        (shared, true)
    }

    async fn take_lease(&mut self) -> bool {
        if self.is_locked() {
            return true;
        }
        match self.distributed.as_mut() {
            Some(strategy) => strategy.lock(&self.component_id).await,
            None => true,
        }
    }

    fn enter(&mut self, holders: impl IntoIterator<Item = Holder>, bus: &LockEventBus) {
        if !self.is_locked() {
            self.transaction = Some(PendingTransaction::open(&self.component_id));
        }

        let entering: Vec<Holder> = holders
            .into_iter()
            .filter(|h| self.holders.insert(*h))
            .collect();
        if entering.is_empty() {
            return;
        }

        self.participants.extend(entering.iter().copied());
        bus.publish(LockEvent::entered_locked(&self.component_id, entering));
    }

    fn exit(&mut self, bus: &LockEventBus) {
        let participants = std::mem::take(&mut self.participants);
        self.holders.clear();
        self.transaction = None;
        self.locked_for_all_sessions = false;
        self.unlocking = false;

        if !participants.is_empty() {
            bus.publish(LockEvent::exited_locked(&self.component_id, participants));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::locking::event::LockEventType;
    use crate::domain::locking::types::ViewerId;
    use async_trait::async_trait;
    use tokio::sync::broadcast::Receiver;

    /// In-process stand-in for a lease table with a single slot
    #[derive(Debug)]
    struct SlotStrategy {
        available: bool,
        held: bool,
    }

    #[async_trait]
    impl DistributedLockStrategy for SlotStrategy {
        async fn lock(&mut self, _component_id: &str) -> bool {
            if self.available {
                self.held = true;
            }
            self.available
        }
        async fn unlock(&mut self, _component_id: &str) {
            self.held = false;
        }
        async fn force_unlock(&mut self, _component_id: &str) {
            self.held = false;
        }
        fn holds_lease(&self) -> bool {
            self.held
        }
    }

    fn holders(ids: &[ViewerId]) -> BTreeSet<Holder> {
        ids.iter().map(|id| Holder::Viewer(*id)).collect()
    }

    fn drain(rx: &mut Receiver<LockEvent>) -> Vec<LockEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_local_acquire_and_release() {
        let bus = LockEventBus::new(16);
        let mut rx = bus.subscribe();
        let a = ViewerId::new();
        let mut lock = ComponentLock::local("c1");

        assert!(!lock.is_locked());
        assert!(lock.acquire(&holders(&[a]), &bus).await);
        assert!(lock.is_locked());
        assert!(lock.is_held_by(&Holder::Viewer(a)));
        assert!(lock.transaction().is_some());

        let Release::Final(txn) = lock.release(&holders(&[a])) else {
            panic!("expected final release");
        };
        assert!(txn.is_some());
        assert!(lock.is_unlocking());
        assert!(lock.finish_release(&bus).await);
        assert!(!lock.is_locked());
        assert!(lock.transaction().is_none());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, LockEventType::EnteredLocked);
        assert_eq!(events[1].event_type, LockEventType::ExitedLocked);
        assert!(events[1].concerns(a));
    }

    #[tokio::test]
    async fn test_partial_release_keeps_lock() {
        let bus = LockEventBus::new(16);
        let mut rx = bus.subscribe();
        let (a, b) = (ViewerId::new(), ViewerId::new());
        let mut lock = ComponentLock::local("c1");

        assert!(lock.acquire(&holders(&[a]), &bus).await);
        assert!(lock.acquire(&holders(&[b]), &bus).await);

        assert!(matches!(lock.release(&holders(&[a])), Release::Partial));
        assert!(lock.is_locked());
        assert!(!lock.is_held_by(&Holder::Viewer(a)));

        assert!(matches!(lock.release(&holders(&[b])), Release::Final(_)));
        lock.finish_release(&bus).await;

        let exits: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.event_type == LockEventType::ExitedLocked)
            .collect();
        assert_eq!(exits.len(), 1);
        assert!(exits[0].concerns(a));
        assert!(exits[0].concerns(b));
    }

    #[tokio::test]
    async fn test_release_of_non_holder() {
        let bus = LockEventBus::default();
        let mut lock = ComponentLock::local("c1");
        assert!(matches!(lock.release(&holders(&[ViewerId::new()])), Release::NotHeld));

        lock.acquire(&holders(&[ViewerId::new()]), &bus).await;
        assert!(matches!(lock.release(&holders(&[ViewerId::new()])), Release::NotHeld));
        assert!(lock.is_locked());
    }

    #[tokio::test]
    async fn test_all_sessions_lock_blocks_viewers() {
        let bus = LockEventBus::default();
        let mut lock = ComponentLock::local("c1");

        assert!(lock.acquire_for_all_sessions(&bus).await);
        assert!(lock.is_locked_for_all_sessions());
        assert!(!lock.is_extended());
        assert!(!lock.acquire(&holders(&[ViewerId::new()]), &bus).await);

        assert!(matches!(lock.release_all(), Release::Final(_)));
        lock.finish_release(&bus).await;
        assert!(!lock.is_locked_for_all_sessions());
        assert!(lock.acquire(&holders(&[ViewerId::new()]), &bus).await);
    }

    #[tokio::test]
    async fn test_distributed_acquire_respects_strategy() {
        let bus = LockEventBus::default();
        let strategy = SlotStrategy { available: false, held: false };
        let mut lock = ComponentLock::distributed("c2", Box::new(strategy));

        assert!(lock.is_shared());
        assert!(!lock.acquire(&holders(&[ViewerId::new()]), &bus).await);
        assert!(!lock.is_locked());
        assert!(lock.transaction().is_none());
    }

    #[tokio::test]
    async fn test_push_change_states() {
        let bus = LockEventBus::default();
        let mut rx = bus.subscribe();
        let a = ViewerId::new();
        let mut lock = ComponentLock::local("c1");

        assert_eq!(
            lock.push_change(serde_json::json!({"x": 1}), &bus),
            Err(LockError::NoTransaction("c1".to_string()))
        );

        lock.acquire(&holders(&[a]), &bus).await;
        assert_eq!(lock.push_change(serde_json::json!({"x": 1}), &bus), Ok(true));
        assert!(lock.has_pending_changes());

        let Release::Final(Some(txn)) = lock.release_all() else {
            panic!("expected transaction");
        };
        assert_eq!(txn.len(), 1);
        assert_eq!(lock.push_change(serde_json::json!({"x": 2}), &bus), Ok(false));
        lock.finish_release(&bus).await;

        let dirty = drain(&mut rx)
            .into_iter()
            .filter(|e| e.event_type == LockEventType::Dirty)
            .count();
        assert_eq!(dirty, 1);
    }

    #[tokio::test]
    async fn test_force_release_during_unlock() {
        let bus = LockEventBus::new(16);
        let mut rx = bus.subscribe();
        let mut lock = ComponentLock::local("c1");
        lock.acquire(&holders(&[ViewerId::new()]), &bus).await;

        assert!(matches!(lock.release_all(), Release::Final(_)));
        assert!(lock.force_release(&bus).await);
        assert!(!lock.finish_release(&bus).await);

        let exits = drain(&mut rx)
            .into_iter()
            .filter(|e| e.event_type == LockEventType::ExitedLocked)
            .count();
        assert_eq!(exits, 1);
    }

    #[tokio::test]
    async fn test_promote_carries_held_state() {
        let bus = LockEventBus::default();
        let a = ViewerId::new();
        let mut lock = ComponentLock::local("c1");
        lock.acquire(&holders(&[a]), &bus).await;
        lock.acquire_for_all_sessions(&bus).await;
        lock.push_change(serde_json::json!({"x": 1}), &bus).unwrap();

        let strategy = Box::new(SlotStrategy { available: true, held: false });
        let (shared, kept) = lock.promote(strategy, &bus).await;

        assert!(kept);
        assert!(shared.is_shared());
        assert!(shared.is_held_by(&Holder::Viewer(a)));
        assert!(shared.is_locked_for_all_sessions());
        assert!(shared.has_pending_changes());
    }

    #[tokio::test]
    async fn test_promote_without_lease_drops_holders() {
        let bus = LockEventBus::new(16);
        let mut rx = bus.subscribe();
        let a = ViewerId::new();
        let mut lock = ComponentLock::local("c1");
        lock.acquire(&holders(&[a]), &bus).await;
        drain(&mut rx);

        let strategy = Box::new(SlotStrategy { available: false, held: false });
        let (shared, kept) = lock.promote(strategy, &bus).await;

        assert!(!kept);
        assert!(shared.is_shared());
        assert!(!shared.is_locked());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, LockEventType::ExitedLocked);
    }
}
