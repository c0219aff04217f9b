//! Lock manager for coordinating component locks
//!
//! The lock manager is the per-process registry of component locks and the
//! only entry point for changing them. It handles:
//! - Lazy creation of locks, local or lease-backed
//! - One-way promotion of local locks to shared locks
//! - Serialization of every lock operation behind one registry mutex
//! - Publishing lock-state transitions on the event bus
//! - Handing pending transactions to the persistence sink on final release

use super::event::{LockEvent, LockEventBus};
use super::guard::{ManifestationLockGuard, ReleaseRequest};
use super::lease::{LeaseStore, SqliteLeaseStore};
use super::lock::{ComponentLock, Release};
use super::strategy::{LeaseStrategyFactory, StrategyFactory};
use super::transaction::TransactionSink;
use super::types::{Holder, LockConfig, LockError, LockInfo, LockResult, ViewerId};
use crate::domain::component::ComponentRegistry;
use crate::domain::session::SessionContext;
use crate::storage::{ConnectionBudget, Database};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

/// The two disjoint lock maps
#[derive(Debug, Default)]
struct LockRegistry {
    local_locks: HashMap<String, ComponentLock>,
    shared_locks: HashMap<String, ComponentLock>,
}

impl LockRegistry {
    fn get(&self, component_id: &str) -> Option<&ComponentLock> {
        self.shared_locks
            .get(component_id)
            .or_else(|| self.local_locks.get(component_id))
    }

    fn get_mut(&mut self, component_id: &str) -> Option<&mut ComponentLock> {
        if self.shared_locks.contains_key(component_id) {
            return self.shared_locks.get_mut(component_id);
        }
        self.local_locks.get_mut(component_id)
    }

    fn remove(&mut self, component_id: &str) -> Option<ComponentLock> {
        self.shared_locks
            .remove(component_id)
            .or_else(|| self.local_locks.remove(component_id))
    }

    fn iter(&self) -> impl Iterator<Item = &ComponentLock> {
        self.local_locks.values().chain(self.shared_locks.values())
    }
}

/// Lock manager for coordinating component locks
pub struct LockManager {
    /// Configuration
    config: LockConfig,

    /// Session this manager acts for
    session: SessionContext,

    /// Component lookup (shared or private)
    components: Arc<dyn ComponentRegistry>,

    /// Builds the distributed strategy for each shared lock
    strategies: Arc<dyn StrategyFactory>,

    /// Registry of locks; one mutex serializes every operation
    locks: Mutex<LockRegistry>,

    /// Lock-state notifications
    events: LockEventBus,

    /// Receives pending transactions on final release
    sink: Option<Arc<dyn TransactionSink>>,

    /// Channel receiver for guard release requests
    release_rx: Mutex<mpsc::UnboundedReceiver<ReleaseRequest>>,

    /// Channel sender for guard release requests
    release_tx: mpsc::UnboundedSender<ReleaseRequest>,
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("has_sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl LockManager {
    /// Create a new lock manager
    pub fn new(
        config: LockConfig,
        session: SessionContext,
        components: Arc<dyn ComponentRegistry>,
        strategies: Arc<dyn StrategyFactory>,
    ) -> Self {
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let events = LockEventBus::new(config.event_capacity);

        Self {
            config,
            session,
            components,
            strategies,
            locks: Mutex::new(LockRegistry::default()),
            events,
            sink: None,
            release_rx: Mutex::new(release_rx),
            release_tx,
        }
    }

    /// Create a lock manager whose shared locks use `store` for leases
    ///
    /// Managers on the same store should share `budget`.
    pub fn with_lease_store(
        config: LockConfig,
        session: SessionContext,
        components: Arc<dyn ComponentRegistry>,
        store: Arc<dyn LeaseStore>,
        budget: ConnectionBudget,
    ) -> Self {
        let strategies = Arc::new(LeaseStrategyFactory::new(
            store,
            budget,
            session.clone(),
            config.lease_timeout,
        ));
        Self::new(config, session, components, strategies)
    }

    /// Create a lock manager backed by the `edit_locks` table of `db`
    pub fn for_database(
        config: LockConfig,
        session: SessionContext,
        components: Arc<dyn ComponentRegistry>,
        db: &Database,
    ) -> Self {
        let store = Arc::new(SqliteLeaseStore::new(db.pool().clone()));
        Self::with_lease_store(config, session, components, store, db.lease_budget().clone())
    }

    /// Hand pending transactions to `sink` when a lock is finally released
    pub fn with_transaction_sink(mut self, sink: Arc<dyn TransactionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Get the session this manager acts for
    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Subscribe to lock-state events
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    // ========== Acquisition ==========

    /// Create an unshared lock for a component if none exists
    ///
    /// Creating a lock does not acquire it.
    pub async fn new_lock(&self, component_id: &str) {
        let mut locks = self.locks.lock().await;
        if locks.get(component_id).is_none() {
            debug!(component_id = %component_id, "Creating lock");
            locks
                .local_locks
                .insert(component_id.to_string(), ComponentLock::local(component_id));
        }
    }

    /// Lock a component on behalf of all of its manifestations
    pub async fn lock(&self, component_id: &str) -> bool {
        self.acquire(component_id, BTreeSet::from([Holder::AllViewers]))
            .await
    }

    /// Lock a component on behalf of one manifestation
    pub async fn lock_manifestation(&self, component_id: &str, viewer: ViewerId) -> bool {
        self.acquire(component_id, BTreeSet::from([Holder::Viewer(viewer)]))
            .await
    }

    /// Lock a component on behalf of a set of manifestations
    pub async fn lock_manifestations(
        &self,
        component_id: &str,
        viewers: impl IntoIterator<Item = ViewerId>,
    ) -> bool {
        self.acquire(component_id, viewer_holders(viewers)).await
    }

    /// Lock a component for a set of manifestations, releasing on guard drop
    ///
    /// Releases queued by dropped guards are applied by
    /// [`process_releases`](Self::process_releases).
    pub async fn lock_guarded(
        &self,
        component_id: &str,
        viewers: impl IntoIterator<Item = ViewerId>,
    ) -> Option<ManifestationLockGuard> {
        let holders = viewer_holders(viewers);
        if !self.acquire(component_id, holders.clone()).await {
            return None;
        }
        Some(ManifestationLockGuard::new(
            component_id,
            holders,
            self.release_tx.clone(),
        ))
    }

    /// Lock a component exclusively for every user and session
    ///
    /// Used to take a component offline from all editors, e.g. before
    /// deleting it.
    pub async fn lock_for_all_users(&self, component_id: &str) -> bool {
        let mut locks = self.locks.lock().await;
        let lock = match self.route(&mut locks, component_id).await {
            Ok(lock) => lock,
            Err(e) => {
                warn!(component_id = %component_id, error = %e, "Cannot route lock");
                return false;
            }
        };

        let acquired = lock.acquire_for_all_sessions(&self.events).await;
        if acquired {
            info!(
                component_id = %component_id,
                session = %self.session.session_id,
                user_id = %self.session.user_id,
                host = %self.session.host,
                "Locked for all users"
            );
        }
        acquired
    }

    async fn acquire(&self, component_id: &str, holders: BTreeSet<Holder>) -> bool {
        if holders.is_empty() {
            debug!(component_id = %component_id, "No manifestations to lock for");
            return false;
        }

        let mut locks = self.locks.lock().await;
        let lock = match self.route(&mut locks, component_id).await {
            Ok(lock) => lock,
            Err(e) => {
                warn!(component_id = %component_id, error = %e, "Cannot route lock");
                return false;
            }
        };

        let acquired = lock.acquire(&holders, &self.events).await;
        if acquired {
            info!(
                component_id = %component_id,
                holders = lock.held_handles().len(),
                shared = lock.is_shared(),
                "Lock acquired"
            );
        } else {
            debug!(component_id = %component_id, "Lock acquisition refused");
        }
        acquired
    }

    /// Find the lock for a component, creating it and promoting it to a
    /// shared lock when the component registry reports it shared
    async fn route<'a>(
        &self,
        locks: &'a mut LockRegistry,
        component_id: &str,
    ) -> LockResult<&'a mut ComponentLock> {
        if !locks.shared_locks.contains_key(component_id) && self.components.is_shared(component_id) {
            self.promote(locks, component_id).await?;
        }

        if locks.shared_locks.contains_key(component_id) {
            return locks
                .shared_locks
                .get_mut(component_id)
                .ok_or_else(|| LockError::NoSuchLock(component_id.to_string()));
        }

        Ok(locks
            .local_locks
            .entry(component_id.to_string())
            .or_insert_with(|| ComponentLock::local(component_id)))
    }

    // ========== Promotion ==========

    /// Promote a component's lock from local to shared
    ///
    /// Promotion cannot be undone. If the component is held locally, the
    /// holders move to the shared lock when the lease can be taken; the
    /// result is `false` when the lease was unavailable and the local holders
    /// were released instead.
    pub async fn share_lock(&self, component_id: &str) -> LockResult<bool> {
        let mut locks = self.locks.lock().await;
        self.promote(&mut locks, component_id).await
    }

    async fn promote(&self, locks: &mut LockRegistry, component_id: &str) -> LockResult<bool> {
        if locks.shared_locks.contains_key(component_id) {
            return Ok(true);
        }
        if locks
            .local_locks
            .get(component_id)
            .is_some_and(|lock| lock.is_unlocking())
        {
            return Err(LockError::InvalidState(format!(
                "cannot share '{}' while it is being unlocked",
                component_id
            )));
        }

        let local = locks
            .local_locks
            .remove(component_id)
            .unwrap_or_else(|| ComponentLock::local(component_id));
        let strategy = self.strategies.create(component_id);
        let (shared, kept) = local.promote(strategy, &self.events).await;

        info!(component_id = %component_id, kept_holders = kept, "Lock promoted to shared");
        locks.shared_locks.insert(component_id.to_string(), shared);
        self.events.publish(LockEvent::promoted(component_id));
        Ok(kept)
    }

    // ========== Release ==========

    /// Release every holder of a component's lock
    pub async fn unlock(&self, component_id: &str) -> LockResult<()> {
        self.release(component_id, None).await
    }

    /// Release one manifestation's hold
    pub async fn unlock_manifestation(&self, component_id: &str, viewer: ViewerId) -> LockResult<()> {
        self.release(component_id, Some(BTreeSet::from([Holder::Viewer(viewer)])))
            .await
    }

    /// Release a set of manifestations' holds
    pub async fn unlock_manifestations(
        &self,
        component_id: &str,
        viewers: impl IntoIterator<Item = ViewerId>,
    ) -> LockResult<()> {
        self.release(component_id, Some(viewer_holders(viewers)))
            .await
    }

    /// Unconditionally clear a component's lock
    ///
    /// Administrative override for stuck locks: holders are dropped without
    /// flushing their transaction, and for shared components every lease on
    /// the component is deleted.
    pub async fn force_unlock(&self, component_id: &str) -> LockResult<()> {
        let mut locks = self.locks.lock().await;
        let lock = locks
            .get_mut(component_id)
            .ok_or_else(|| LockError::NoSuchLock(component_id.to_string()))?;

        let was_locked = lock.force_release(&self.events).await;
        info!(component_id = %component_id, was_locked, "Lock force-released");
        Ok(())
    }

    /// Drop the lock of a deleted component, force-releasing it if held
    pub async fn remove_lock(&self, component_id: &str) -> bool {
        let mut locks = self.locks.lock().await;
        let Some(mut lock) = locks.remove(component_id) else {
            return false;
        };

        if lock.is_locked() {
            lock.force_release(&self.events).await;
        }
        debug!(component_id = %component_id, "Lock removed");
        true
    }

    async fn release(&self, component_id: &str, holders: Option<BTreeSet<Holder>>) -> LockResult<()> {
        let mut locks = self.locks.lock().await;
        let lock = locks
            .get_mut(component_id)
            .ok_or_else(|| LockError::NoSuchLock(component_id.to_string()))?;

        let release = match &holders {
            Some(holders) => lock.release(holders),
            None => lock.release_all(),
        };
        let transaction = match release {
            Release::NotHeld | Release::Partial => return Ok(()),
            Release::Final(transaction) => transaction.filter(|t| !t.is_empty()),
        };

        let flush = match (transaction, &self.sink) {
            (Some(transaction), Some(sink)) => Some((transaction, sink.clone())),
            (Some(transaction), None) => {
                warn!(
                    component_id = %component_id,
                    dropped = transaction.len(),
                    "No transaction sink, discarding unsaved changes"
                );
                None
            }
            (None, _) => None,
        };
        let Some((transaction, sink)) = flush else {
            lock.finish_release(&self.events).await;
            info!(component_id = %component_id, "Lock released");
            return Ok(());
        };

        // Flush without holding the registry; pushes meanwhile are dropped
        drop(locks);
        let changes = transaction.len();
        match sink.flush(transaction).await {
            Ok(()) => debug!(component_id = %component_id, changes, "Transaction flushed"),
            Err(e) => warn!(component_id = %component_id, changes, error = %e, "Transaction flush failed"),
        }

        let mut locks = self.locks.lock().await;
        if let Some(lock) = locks.get_mut(component_id) {
            if lock.finish_release(&self.events).await {
                info!(component_id = %component_id, "Lock released");
            }
        }
        Ok(())
    }

    /// Apply releases queued by dropped guards
    ///
    /// Returns the number of requests processed.
    pub async fn process_releases(&self) -> usize {
        let requests: Vec<ReleaseRequest> = {
            let mut rx = self.release_rx.lock().await;
            let mut requests = Vec::new();
            while let Ok(request) = rx.try_recv() {
                requests.push(request);
            }
            requests
        };

        let processed = requests.len();
        for request in requests {
            if let Err(e) = self
                .release(&request.component_id, Some(request.holders))
                .await
            {
                warn!(component_id = %request.component_id, error = %e, "Queued release failed");
            }
        }
        processed
    }

    // ========== Changes ==========

    /// Record an unsaved change against a held lock
    ///
    /// Returns `Ok(false)` if the lock is being released; the change is
    /// dropped, not queued.
    pub async fn push_changes(&self, component_id: &str, change: serde_json::Value) -> LockResult<bool> {
        let mut locks = self.locks.lock().await;
        let lock = locks
            .get_mut(component_id)
            .ok_or_else(|| LockError::NoSuchLock(component_id.to_string()))?;

        lock.push_change(change, &self.events)
    }

    /// Whether the component's lock carries unsaved changes
    pub async fn has_pending_transaction(&self, component_id: &str) -> bool {
        let locks = self.locks.lock().await;
        locks
            .get(component_id)
            .is_some_and(|lock| lock.has_pending_changes())
    }

    // ========== Queries ==========

    pub async fn is_locked(&self, component_id: &str) -> bool {
        self.query(component_id, |lock| lock.is_locked()).await
    }

    pub async fn is_manifestation_locked(&self, component_id: &str, viewer: ViewerId) -> bool {
        self.query(component_id, |lock| lock.is_held_by(&Holder::Viewer(viewer)))
            .await
    }

    /// Whether every manifestation in a non-empty set holds the lock
    pub async fn is_manifestation_set_locked(
        &self,
        component_id: &str,
        viewers: impl IntoIterator<Item = ViewerId>,
    ) -> bool {
        let holders = viewer_holders(viewers);
        if holders.is_empty() {
            return false;
        }
        self.query(component_id, |lock| holders.iter().all(|h| lock.is_held_by(h)))
            .await
    }

    pub async fn is_locked_for_all_users(&self, component_id: &str) -> bool {
        self.query(component_id, |lock| lock.is_locked_for_all_sessions())
            .await
    }

    /// Whether the lock is held by named manifestations in edit mode
    pub async fn is_extended_locking(&self, component_id: &str) -> bool {
        self.query(component_id, |lock| lock.is_extended()).await
    }

    pub async fn is_unlocking_in_progress(&self, component_id: &str) -> bool {
        self.query(component_id, |lock| lock.is_unlocking()).await
    }

    /// Whether the component's lock has been promoted to a shared lock
    pub async fn is_shared(&self, component_id: &str) -> bool {
        self.locks.lock().await.shared_locks.contains_key(component_id)
    }

    /// Snapshot of manifestations holding locks, by component
    ///
    /// Locks held through the all-manifestations wildcard are left out.
    pub async fn get_all_locked_manifestations(&self) -> HashMap<String, BTreeSet<ViewerId>> {
        let locks = self.locks.lock().await;
        locks
            .iter()
            .filter(|lock| lock.is_locked() && !lock.held_handles().contains(&Holder::AllViewers))
            .map(|lock| {
                let viewers = lock.held_handles().iter().filter_map(Holder::viewer).collect();
                (lock.component_id().to_string(), viewers)
            })
            .collect()
    }

    /// Get a snapshot of one lock
    pub async fn lock_info(&self, component_id: &str) -> Option<LockInfo> {
        self.locks.lock().await.get(component_id).map(ComponentLock::info)
    }

    /// List snapshots of every lock, ordered by component id
    pub async fn list_locks(&self) -> Vec<LockInfo> {
        let locks = self.locks.lock().await;
        let mut infos: Vec<LockInfo> = locks.iter().map(ComponentLock::info).collect();
        infos.sort_by(|a, b| a.component_id.cmp(&b.component_id));
        infos
    }

    async fn query(&self, component_id: &str, f: impl FnOnce(&ComponentLock) -> bool) -> bool {
        let locks = self.locks.lock().await;
        locks.get(component_id).is_some_and(f)
    }
}

fn viewer_holders(viewers: impl IntoIterator<Item = ViewerId>) -> BTreeSet<Holder> {
    viewers.into_iter().map(Holder::Viewer).collect()
}
