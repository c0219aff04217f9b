//! Pending-change accumulator attached to a held lock

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// A single unsaved change pushed while the lock is held
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: Uuid,
    pub payload: serde_json::Value,
    pub pushed_at: DateTime<Utc>,
}

impl PendingChange {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            pushed_at: Utc::now(),
        }
    }
}

/// Changes accumulated between acquisition and final release of a lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub id: Uuid,
    pub component_id: String,
    pub opened_at: DateTime<Utc>,
    changes: Vec<PendingChange>,
}

impl PendingTransaction {
    pub fn open(component_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            component_id: component_id.to_string(),
            opened_at: Utc::now(),
            changes: Vec::new(),
        }
    }

    pub fn push(&mut self, payload: serde_json::Value) {
        self.changes.push(PendingChange::new(payload));
    }

    pub fn changes(&self) -> &[PendingChange] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Persistence collaborator that receives a lock's transaction on final release
///
/// While `flush` runs the lock reports unlocking in progress and further
/// pushes for the component are dropped.
#[async_trait]
pub trait TransactionSink: Send + Sync {
    async fn flush(&self, transaction: PendingTransaction) -> Result<()>;
}
