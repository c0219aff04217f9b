//! Current session and user
//!
//! Each process runs one editing session on behalf of one user. The user id
//! is recorded in every lease the session takes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Longest user id the lease table accepts
pub const MAX_USER_ID_LEN: usize = 20;

/// Identity of the running editing session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Session identifier (32 hex characters)
    pub session_id: String,

    /// User on whose behalf leases are taken
    pub user_id: String,

    /// Host the session runs on
    pub host: String,
}

impl SessionContext {
    /// Start a new session for `user_id`
    pub fn new(user_id: impl Into<String>) -> Result<Self> {
        let user_id = user_id.into();
        validate_user_id(&user_id)?;

        Ok(Self {
            session_id: new_session_id(),
            user_id,
            host: gethostname::gethostname().to_string_lossy().into_owned(),
        })
    }

    /// Session for the user named by `USER`/`USERNAME`, falling back to "operator"
    pub fn from_env() -> Result<Self> {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .ok()
            .filter(|user| !user.trim().is_empty())
            .unwrap_or_else(|| "operator".to_string());
        let user: String = user.chars().take(MAX_USER_ID_LEN).collect();
        Self::new(user)
    }
}

/// Generate a session id that fits the lease table's 32-character column
pub fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() {
        return Err(Error::InvalidInput("user id must not be empty".to_string()));
    }
    if user_id.chars().count() > MAX_USER_ID_LEN {
        return Err(Error::InvalidInput(format!(
            "user id '{}' is longer than {} characters",
            user_id, MAX_USER_ID_LEN
        )));
    }
    Ok(())
}
