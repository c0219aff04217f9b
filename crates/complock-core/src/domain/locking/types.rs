//! Lock types and error definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Default lease timeout: 480 minutes
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(480 * 60);

/// Lock errors
///
/// Contention is not an error: acquisition reports it as `false`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// An operation addressed a component with no registered lock
    #[error("No lock registered for component '{0}'")]
    NoSuchLock(String),

    /// Changes were pushed for a component whose lock is not held
    #[error("Component '{0}' has no pending transaction (lock is not held)")]
    NoTransaction(String),

    /// Invalid lock state
    #[error("Invalid lock state: {0}")]
    InvalidState(String),
}

impl LockError {
    /// Get error code for this lock error
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSuchLock(_) => "E302",
            Self::NoTransaction(_) => "E303",
            Self::InvalidState(_) => "E305",
        }
    }
}

/// Identity of a manifestation (an on-screen view of a component)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewerId(Uuid);

impl ViewerId {
    /// Allocate a fresh viewer identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ViewerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something that can hold a component lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Holder {
    /// Every manifestation of the component in this session
    AllViewers,
    /// A single manifestation
    Viewer(ViewerId),
}

impl Holder {
    pub fn viewer(&self) -> Option<ViewerId> {
        match self {
            Self::AllViewers => None,
            Self::Viewer(id) => Some(*id),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::AllViewers)
    }
}

impl From<ViewerId> for Holder {
    fn from(id: ViewerId) -> Self {
        Self::Viewer(id)
    }
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllViewers => write!(f, "*"),
            Self::Viewer(id) => write!(f, "{}", id),
        }
    }
}

/// Snapshot of a single lock's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Component the lock guards
    pub component_id: String,

    /// Whether the lock is backed by a distributed lease
    pub shared: bool,

    /// Current holders (empty when unlocked)
    pub holders: BTreeSet<Holder>,

    /// Whether the lock is held exclusively for all sessions
    pub locked_for_all_sessions: bool,

    /// Whether a final release is handing off the transaction
    pub unlocking: bool,

    /// Number of changes waiting in the attached transaction
    pub pending_changes: usize,
}

impl LockInfo {
    pub fn is_locked(&self) -> bool {
        !self.holders.is_empty()
    }
}

/// Configuration for the lock manager
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How old a lease row must be before a contending session may reclaim it
    pub lease_timeout: Duration,

    /// Capacity of the lock event broadcast channel
    pub event_capacity: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            event_capacity: 256,
        }
    }
}

impl LockConfig {
    /// Set the lease timeout
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    /// Set the event channel capacity
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
