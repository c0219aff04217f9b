//! Locking domain events
//!
//! Lock-state transitions are published on a broadcast channel. Viewers
//! subscribe and update their own visual state, filtering on the component
//! id and on the holders named in each event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::types::{Holder, ViewerId};

/// Type of lock event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventType {
    /// Holders entered the locked (editing) state
    EnteredLocked,
    /// Holders left the locked state
    ExitedLocked,
    /// The component has unsaved changes
    Dirty,
    /// An acquisition attempt lost to another session
    LockContention,
    /// The lock was promoted from local to shared
    Promoted,
}

impl LockEventType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnteredLocked => "entered_locked",
            Self::ExitedLocked => "exited_locked",
            Self::Dirty => "dirty",
            Self::LockContention => "lock_contention",
            Self::Promoted => "promoted",
        }
    }
}

impl std::fmt::Display for LockEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A locking domain event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockEvent {
    /// Unique event identifier
    pub id: Uuid,
    /// Component the event concerns
    pub component_id: String,
    /// Type of event
    pub event_type: LockEventType,
    /// Holders the event is addressed to
    pub holders: BTreeSet<Holder>,
    /// When the event occurred
    pub created_at: DateTime<Utc>,
}

impl LockEvent {
    /// Create a new lock event
    pub fn new(
        component_id: &str,
        event_type: LockEventType,
        holders: impl IntoIterator<Item = Holder>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            component_id: component_id.to_string(),
            event_type,
            holders: holders.into_iter().collect(),
            created_at: Utc::now(),
        }
    }

    pub fn entered_locked(component_id: &str, holders: impl IntoIterator<Item = Holder>) -> Self {
        Self::new(component_id, LockEventType::EnteredLocked, holders)
    }

    pub fn exited_locked(component_id: &str, holders: impl IntoIterator<Item = Holder>) -> Self {
        Self::new(component_id, LockEventType::ExitedLocked, holders)
    }

    pub fn dirty(component_id: &str, holders: impl IntoIterator<Item = Holder>) -> Self {
        Self::new(component_id, LockEventType::Dirty, holders)
    }

    pub fn lock_contention(component_id: &str, holders: impl IntoIterator<Item = Holder>) -> Self {
        Self::new(component_id, LockEventType::LockContention, holders)
    }

    pub fn promoted(component_id: &str) -> Self {
        Self::new(component_id, LockEventType::Promoted, [])
    }

    /// Whether a viewer of this component should react to the event
    ///
    /// Wildcard holders address every viewer of the component.
    pub fn concerns(&self, viewer: ViewerId) -> bool {
        self.holders.contains(&Holder::AllViewers) || self.holders.contains(&Holder::Viewer(viewer))
    }
}

/// Broadcast bus for lock events
#[derive(Debug, Clone)]
pub struct LockEventBus {
    sender: broadcast::Sender<LockEvent>,
}

impl LockEventBus {
    /// Create a new bus with the given per-subscriber buffer
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Get a receiver for lock events
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: LockEvent) {
        debug!(
            component_id = %event.component_id,
            event_type = %event.event_type,
            holders = event.holders.len(),
            "Lock event"
        );
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LockEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
