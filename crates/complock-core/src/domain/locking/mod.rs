//! Component locking for concurrent editing
//!
//! This module keeps two sessions from editing the same component at once,
//! and lets several views of one component in a session cooperate on a
//! single hold.
//!
//! # Architecture
//!
//! - **Lock**: `ComponentLock` tracks holders, the pending transaction and
//!   the teardown state of one component
//! - **Strategy**: `DistributedLockStrategy` adds cross-process exclusivity
//!   for shared components, implemented by `LeaseLockStrategy`
//! - **Lease Store**: `LeaseStore` over the `edit_locks` table
//! - **Lock Manager**: `LockManager`, the registry all callers go through
//! - **Guards**: RAII-style guards that release a view's hold on drop
//!
//! # Features
//!
//! - Private components lock in-process only
//! - Shared components lock through an exclusive lease row, reclaimed lazily
//!   once older than the lease timeout
//! - One-way promotion from local to shared locking
//! - Lock-state events on a broadcast channel
//!
//! # Example
//!
//! ```ignore
//! use complock_core::domain::locking::{LockConfig, LockManager, ViewerId};
//!
//! let manager = LockManager::for_database(LockConfig::default(), session, registry, &db);
//! let mut events = manager.subscribe();
//!
//! let view = ViewerId::new();
//! if manager.lock_manifestation("sensor-grid", view).await {
//!     manager.push_changes("sensor-grid", serde_json::json!({"rate": 10})).await?;
//!     manager.unlock_manifestation("sensor-grid", view).await?;
//! }
//! ```

pub mod event;
pub mod guard;
pub mod lease;
pub mod lock;
pub mod manager;
pub mod strategy;
pub mod transaction;
pub mod types;

// Re-export main types
pub use event::{LockEvent, LockEventBus, LockEventType};
pub use guard::{ManifestationLockGuard, ReleaseRequest};
pub use lease::{Lease, LeaseReservation, LeaseStore, SqliteLeaseStore};
pub use lock::{ComponentLock, Release};
pub use manager::LockManager;
pub use strategy::{DistributedLockStrategy, LeaseLockStrategy, LeaseStrategyFactory, StrategyFactory};
pub use transaction::{PendingChange, PendingTransaction, TransactionSink};
pub use types::{DEFAULT_LEASE_TIMEOUT, Holder, LockConfig, LockError, LockInfo, LockResult, ViewerId};
