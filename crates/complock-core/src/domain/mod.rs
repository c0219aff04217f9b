//! Domain layer
//!
//! Contains the locking model and the collaborators it depends on.

pub mod component;
pub mod locking;
pub mod session;
