//! Complock Core Integration Tests
//!
//! Two lock managers over separate connection pools to one on-disk lease
//! database stand in for two editing sessions.

use async_trait::async_trait;
use chrono::Utc;
use complock_core::domain::component::{ComponentInfo, InMemoryComponentRegistry};
use complock_core::domain::locking::{
    Lease, LeaseStore, LockConfig, LockEventType, LockManager, PendingTransaction, SqliteLeaseStore,
    TransactionSink, ViewerId,
};
use complock_core::domain::session::SessionContext;
use complock_core::storage::{Database, DatabaseConfig};
use complock_core::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

struct Site {
    dir: TempDir,
    components: Arc<InMemoryComponentRegistry>,
}

impl Site {
    fn new() -> Self {
        let components = Arc::new(InMemoryComponentRegistry::new());
        components.insert(ComponentInfo::private("C1", "alice"));
        components.insert(ComponentInfo::shared("C2", "alice"));
        Self {
            dir: TempDir::new().unwrap(),
            components,
        }
    }

    fn db_path(&self) -> std::path::PathBuf {
        self.dir.path().join("locks.db")
    }

    async fn database(&self) -> Database {
        Database::new(DatabaseConfig::with_path(self.db_path()))
            .await
            .expect("Failed to open lease database")
    }

    async fn session(&self, user: &str, config: LockConfig) -> (LockManager, Database) {
        let db = self.database().await;
        let session = SessionContext::new(user).unwrap();
        let manager = LockManager::for_database(config, session, self.components.clone(), &db);
        (manager, db)
    }
}

#[tokio::test]
async fn test_private_component_never_touches_lease_table() {
    let site = Site::new();
    let (alice, db) = site.session("alice", LockConfig::default()).await;
    let (bob, _) = site.session("bob", LockConfig::default()).await;

    assert!(alice.lock("C1").await);
    // Private locks are per-process
    assert!(bob.lock("C1").await);

    let store = SqliteLeaseStore::new(db.pool().clone());
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_shared_component_across_sessions() {
    let site = Site::new();
    let (alice, db) = site.session("alice", LockConfig::default()).await;
    let (bob, _) = site.session("bob", LockConfig::default()).await;
    let store = SqliteLeaseStore::new(db.pool().clone());

    let view = ViewerId::new();
    assert!(alice.lock_manifestation("C2", view).await);
    assert!(!bob.lock("C2").await);
    assert!(!bob.is_locked("C2").await);

    let lease = store.get("C2").await.unwrap().expect("lease row");
    assert_eq!(lease.user_id, "alice");
    assert_eq!(lease.session.len(), 32);

    alice.unlock_manifestation("C2", view).await.unwrap();
    assert!(store.get("C2").await.unwrap().is_none());

    assert!(bob.lock("C2").await);
    assert_eq!(store.get("C2").await.unwrap().unwrap().user_id, "bob");
}

#[tokio::test]
async fn test_concurrent_acquisition_has_single_winner() {
    let site = Site::new();
    let (alice, _) = site.session("alice", LockConfig::default()).await;
    let (bob, _) = site.session("bob", LockConfig::default()).await;

    for round in 0..5 {
        let (a, b) = tokio::join!(alice.lock("C2"), bob.lock("C2"));
        assert!(a ^ b, "round {}: exactly one session must win", round);

        if a {
            alice.unlock("C2").await.unwrap();
        } else {
            bob.unlock("C2").await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_abandoned_lease_is_reclaimed_after_timeout() {
    let site = Site::new();
    let db = site.database().await;
    let store = SqliteLeaseStore::new(db.pool().clone());

    let crashed = Lease::exclusive("C2", "crashed", "carol").started_at(Utc::now() - chrono::Duration::minutes(10));
    store.try_insert(&crashed).await.unwrap();

    let (patient, _) = site.session("alice", LockConfig::default()).await;
    assert!(!patient.lock("C2").await, "a live lease must not be reclaimed");

    let short = LockConfig::default().with_lease_timeout(Duration::from_secs(5 * 60));
    let (bob, _) = site.session("bob", short).await;
    assert!(bob.lock("C2").await);
    assert_eq!(store.get("C2").await.unwrap().unwrap().user_id, "bob");
}

#[tokio::test]
async fn test_publish_promotes_held_lock() {
    let site = Site::new();
    site.components.insert(ComponentInfo::private("C3", "alice"));
    let (alice, db) = site.session("alice", LockConfig::default()).await;
    let (bob, _) = site.session("bob", LockConfig::default()).await;
    let mut events = alice.subscribe();

    let view = ViewerId::new();
    assert!(alice.lock_manifestation("C3", view).await);

    site.components.publish("C3");
    assert!(alice.share_lock("C3").await.unwrap());
    assert!(alice.is_manifestation_locked("C3", view).await);
    assert!(!bob.lock("C3").await);

    let store = SqliteLeaseStore::new(db.pool().clone());
    assert_eq!(store.get("C3").await.unwrap().unwrap().user_id, "alice");

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.event_type);
    }
    assert_eq!(kinds, vec![LockEventType::EnteredLocked, LockEventType::Promoted]);
}

#[tokio::test]
async fn test_promotion_drops_holders_when_lease_is_taken() {
    let site = Site::new();
    site.components.insert(ComponentInfo::private("C4", "alice"));
    let (alice, _) = site.session("alice", LockConfig::default()).await;
    let (bob, _) = site.session("bob", LockConfig::default()).await;

    let view = ViewerId::new();
    assert!(alice.lock_manifestation("C4", view).await);

    site.components.publish("C4");
    assert!(bob.lock("C4").await);

    let mut events = alice.subscribe();
    assert!(!alice.share_lock("C4").await.unwrap());
    assert!(!alice.is_locked("C4").await);
    assert!(alice.is_shared("C4").await);

    let exited = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| e.event_type == LockEventType::ExitedLocked && e.concerns(view))
        .count();
    assert_eq!(exited, 1);
}

#[tokio::test]
async fn test_guard_drop_releases_lease() {
    let site = Site::new();
    let (alice, db) = site.session("alice", LockConfig::default()).await;
    let store = SqliteLeaseStore::new(db.pool().clone());

    {
        let _guard = alice
            .lock_guarded("C2", [ViewerId::new(), ViewerId::new()])
            .await
            .expect("free component");
        assert!(store.get("C2").await.unwrap().is_some());
    }

    assert_eq!(alice.process_releases().await, 1);
    assert!(!alice.is_locked("C2").await);
    assert!(store.get("C2").await.unwrap().is_none());
}

#[derive(Default)]
struct RecordingSink {
    flushed: Mutex<Vec<PendingTransaction>>,
}

#[async_trait]
impl TransactionSink for RecordingSink {
    async fn flush(&self, transaction: PendingTransaction) -> Result<()> {
        self.flushed.lock().unwrap().push(transaction);
        Ok(())
    }
}

#[tokio::test]
async fn test_final_release_flushes_transaction() {
    let site = Site::new();
    let sink = Arc::new(RecordingSink::default());
    let (alice, _) = site.session("alice", LockConfig::default()).await;
    let alice = alice.with_transaction_sink(sink.clone());

    let (a, b) = (ViewerId::new(), ViewerId::new());
    assert!(alice.lock_manifestations("C2", [a, b]).await);
    assert!(alice.push_changes("C2", serde_json::json!({"rate": 10})).await.unwrap());
    assert!(alice.push_changes("C2", serde_json::json!({"title": "Bus voltage"})).await.unwrap());

    alice.unlock_manifestation("C2", a).await.unwrap();
    assert!(sink.flushed.lock().unwrap().is_empty());
    assert!(alice.has_pending_transaction("C2").await);

    alice.unlock_manifestation("C2", b).await.unwrap();
    let flushed = sink.flushed.lock().unwrap();
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].component_id, "C2");
    assert_eq!(flushed[0].changes()[1].payload["title"], "Bus voltage");
}

#[tokio::test]
async fn test_lock_for_all_users_then_remove() {
    let site = Site::new();
    let (alice, db) = site.session("alice", LockConfig::default()).await;
    let (bob, _) = site.session("bob", LockConfig::default()).await;

    assert!(alice.lock_for_all_users("C2").await);
    assert!(alice.is_locked_for_all_users("C2").await);
    assert!(!alice.lock_manifestation("C2", ViewerId::new()).await);
    assert!(!bob.lock("C2").await);

    // Component deleted
    assert!(alice.remove_lock("C2").await);
    let store = SqliteLeaseStore::new(db.pool().clone());
    assert!(store.list().await.unwrap().is_empty());
}
