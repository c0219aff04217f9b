//! Complock Core Library
//!
//! This crate provides component locking for a multi-user editor:
//! - Per-component locks shared by several views of the component
//! - Lease-backed exclusivity for shared components across processes
//! - A lock manager that routes every lock operation
//! - Storage (SQLite lease table with migrations)
//! - Configuration (TOML)

pub mod config;
pub mod domain;
pub mod error;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::component::{ComponentInfo, ComponentRegistry, InMemoryComponentRegistry};
    pub use crate::domain::locking::{
        Holder, LockConfig, LockError, LockEvent, LockEventType, LockManager, LockResult, ViewerId,
    };
    pub use crate::domain::session::SessionContext;
    pub use crate::error::{Error, Result};
    pub use crate::storage::Database;
}
