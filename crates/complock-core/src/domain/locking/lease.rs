//! Lease store for cross-process edit locks
//!
//! A lease is a row in `edit_locks`. The unique index on
//! `(component_id, exclusive)` admits at most one exclusive row per
//! component, so a successful insert is the only proof of ownership.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::pool::PoolConnection;
use sqlx::{Executor, Sqlite, SqlitePool};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Marker stored in the `exclusive` column of exclusive leases
pub const EXCLUSIVE_MARKER: &str = "true";

/// A persisted edit lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub component_id: String,
    pub session: String,
    pub user_id: String,
    pub version: i64,
    pub lease_start: DateTime<Utc>,
    pub exclusive: bool,
}

impl Lease {
    /// Create an exclusive lease starting now
    pub fn exclusive(component_id: &str, session: &str, user_id: &str) -> Self {
        Self {
            component_id: component_id.to_string(),
            session: session.to_string(),
            user_id: user_id.to_string(),
            version: 0,
            lease_start: Utc::now(),
            exclusive: true,
        }
    }

    /// Override the lease start time
    pub fn started_at(mut self, lease_start: DateTime<Utc>) -> Self {
        self.lease_start = lease_start;
        self
    }

    /// Age of the lease relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.lease_start).to_std().unwrap_or_default()
    }

    /// Whether the lease is older than `timeout`
    pub fn is_expired(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > timeout
    }
}

/// Cutoff instant for a lease timeout: rows started before it are expired
pub fn expiry_cutoff(timeout: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_sub_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Storage operations for edit leases
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Insert a lease; `Ok(false)` when the uniqueness constraint rejects it
    async fn try_insert(&self, lease: &Lease) -> Result<bool>;

    /// Delete the lease owned by `session`
    async fn delete(&self, component_id: &str, session: &str) -> Result<u64>;

    /// Delete leases for a component that started before `cutoff`
    async fn delete_expired(&self, component_id: &str, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Delete every lease for a component (administrative)
    async fn delete_all(&self, component_id: &str) -> Result<u64>;

    /// Get the exclusive lease for a component, if any
    async fn get(&self, component_id: &str) -> Result<Option<Lease>>;

    /// List all leases, oldest first
    async fn list(&self) -> Result<Vec<Lease>>;

    /// Delete every lease that started before `cutoff` (administrative)
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Take a connection for one acquisition without queueing behind busy ones
    ///
    /// `None` when every connection the store may open is in use.
    async fn try_reserve(&self) -> Option<Box<dyn LeaseReservation>>;
}

/// A store connection held for one acquisition round trip
#[async_trait]
pub trait LeaseReservation: Send {
    async fn try_insert(&mut self, lease: &Lease) -> Result<bool>;

    async fn delete_expired(&mut self, component_id: &str, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// How long a reservation waits on a full pool for a connection being returned
///
/// Dropped pool connections go back to the pool on a spawned task, so one
/// released by the previous round trip may not be idle yet.
pub const RETURN_GRACE: Duration = Duration::from_millis(100);

/// SQLite-backed lease store
#[derive(Debug, Clone)]
pub struct SqliteLeaseStore {
    pool: SqlitePool,
}

impl SqliteLeaseStore {
    /// Create a new store with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn try_insert(&self, lease: &Lease) -> Result<bool> {
        insert_lease(&self.pool, lease).await
    }

    async fn delete(&self, component_id: &str, session: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM edit_locks WHERE component_id = ? AND session = ?")
            .bind(component_id)
            .bind(session)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        Ok(result.rows_affected())
    }

    async fn delete_expired(&self, component_id: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        delete_expired_lease(&self.pool, component_id, cutoff).await
    }

    async fn delete_all(&self, component_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM edit_locks WHERE component_id = ?")
            .bind(component_id)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        Ok(result.rows_affected())
    }

    async fn get(&self, component_id: &str) -> Result<Option<Lease>> {
        let row: Option<LeaseRow> = sqlx::query_as(
            r#"
            SELECT component_id, session, user_id, version, lease_start, exclusive
            FROM edit_locks
            WHERE component_id = ? AND exclusive = ?
            "#,
        )
        .bind(component_id)
        .bind(EXCLUSIVE_MARKER)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(row.map(LeaseRow::into_lease))
    }

    async fn list(&self) -> Result<Vec<Lease>> {
        let rows: Vec<LeaseRow> = sqlx::query_as(
            r#"
            SELECT component_id, session, user_id, version, lease_start, exclusive
            FROM edit_locks
            ORDER BY julianday(lease_start) ASC, component_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(rows.into_iter().map(LeaseRow::into_lease).collect())
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM edit_locks WHERE julianday(lease_start) < julianday(?)")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        Ok(result.rows_affected())
    }

    async fn try_reserve(&self) -> Option<Box<dyn LeaseReservation>> {
        if let Some(conn) = self.pool.try_acquire() {
            return Some(Box::new(SqliteReservation { conn }));
        }

        let options = self.pool.options();
        let wait = if self.pool.size() >= options.get_max_connections() {
            RETURN_GRACE
        } else {
            // Room to open a fresh connection
            options.get_acquire_timeout()
        };

        match tokio::time::timeout(wait, self.pool.acquire()).await {
            Ok(Ok(conn)) => Some(Box::new(SqliteReservation { conn })),
            Ok(Err(e)) => {
                warn!(error = %e, "Could not open lease connection");
                None
            }
            Err(_) => {
                debug!(size = self.pool.size(), idle = self.pool.num_idle(), "Lease pool exhausted");
                None
            }
        }
    }
}

/// Pooled connection pinned for one acquisition
struct SqliteReservation {
    conn: PoolConnection<Sqlite>,
}

#[async_trait]
impl LeaseReservation for SqliteReservation {
    async fn try_insert(&mut self, lease: &Lease) -> Result<bool> {
        insert_lease(&mut *self.conn, lease).await
    }

    async fn delete_expired(&mut self, component_id: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        delete_expired_lease(&mut *self.conn, component_id, cutoff).await
    }
}

async fn insert_lease<'e, E>(executor: E, lease: &Lease) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let exclusive = lease.exclusive.then_some(EXCLUSIVE_MARKER);

    let result = sqlx::query(
        r#"
        INSERT INTO edit_locks (component_id, session, user_id, version, lease_start, exclusive)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&lease.component_id)
    .bind(&lease.session)
    .bind(&lease.user_id)
    .bind(lease.version)
    .bind(lease.lease_start)
    .bind(exclusive)
    .execute(executor)
    .await;

    match result {
        Ok(_) => Ok(true),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            debug!(component_id = %lease.component_id, "Lease insert rejected by unique index");
            Ok(false)
        }
        Err(e) => Err(Error::DatabaseError(e)),
    }
}

async fn delete_expired_lease<'e, E>(executor: E, component_id: &str, cutoff: DateTime<Utc>) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        DELETE FROM edit_locks
        WHERE component_id = ?
        AND julianday(lease_start) < julianday(?)
        "#,
    )
    .bind(component_id)
    .bind(cutoff)
    .execute(executor)
    .await
    .map_err(Error::DatabaseError)?;

    Ok(result.rows_affected())
}

/// Database row for a lease
#[derive(sqlx::FromRow)]
struct LeaseRow {
    component_id: String,
    session: String,
    user_id: String,
    version: i64,
    lease_start: DateTime<Utc>,
    exclusive: Option<String>,
}

impl LeaseRow {
    fn into_lease(self) -> Lease {
        Lease {
            component_id: self.component_id,
            session: self.session,
            user_id: self.user_id,
            version: self.version,
            lease_start: self.lease_start,
            exclusive: self.exclusive.as_deref() == Some(EXCLUSIVE_MARKER),
        }
    }
}
