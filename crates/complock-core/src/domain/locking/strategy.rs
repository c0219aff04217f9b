//! Distributed lock strategy
//!
//! Shared components are locked across processes by holding an exclusive
//! lease row. The store's unique index is the only source of cross-process
//! truth; this module never checks before inserting.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::lease::{Lease, LeaseReservation, LeaseStore, expiry_cutoff};
use crate::domain::session::{SessionContext, new_session_id};
use crate::storage::ConnectionBudget;

/// Cross-process exclusivity for a shared component's lock
#[async_trait]
pub trait DistributedLockStrategy: Send + Sync + std::fmt::Debug {
    /// Take the lease; `false` on contention or any failure
    async fn lock(&mut self, component_id: &str) -> bool;

    /// Release the lease held by this strategy, if any
    async fn unlock(&mut self, component_id: &str);

    /// Administrative release of every lease on the component
    async fn force_unlock(&mut self, component_id: &str);

    /// Whether this strategy currently believes it holds the lease
    fn holds_lease(&self) -> bool;
}

/// Creates one strategy per shared lock
pub trait StrategyFactory: Send + Sync {
    fn create(&self, component_id: &str) -> Box<dyn DistributedLockStrategy>;
}

/// Lease-table strategy with lazy reclamation of expired leases
pub struct LeaseLockStrategy {
    store: Arc<dyn LeaseStore>,
    budget: ConnectionBudget,
    user_id: String,
    lease_timeout: Duration,
    /// Session id of the lease this strategy holds
    lease_session: Option<String>,
}

impl std::fmt::Debug for LeaseLockStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLockStrategy")
            .field("user_id", &self.user_id)
            .field("lease_timeout", &self.lease_timeout)
            .field("lease_session", &self.lease_session)
            .finish()
    }
}

impl LeaseLockStrategy {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        budget: ConnectionBudget,
        user_id: impl Into<String>,
        lease_timeout: Duration,
    ) -> Self {
        Self {
            store,
            budget,
            user_id: user_id.into(),
            lease_timeout,
            lease_session: None,
        }
    }

    /// Session id of the held lease
    pub fn lease_session(&self) -> Option<&str> {
        self.lease_session.as_deref()
    }

    async fn insert(reservation: &mut dyn LeaseReservation, lease: &Lease) -> bool {
        match reservation.try_insert(lease).await {
            Ok(inserted) => inserted,
            Err(e) => {
                // Fail closed
                warn!(component_id = %lease.component_id, error = %e, "Lease insert failed");
                false
            }
        }
    }

    async fn reclaim_expired(&self, reservation: &mut dyn LeaseReservation, component_id: &str) {
        let cutoff = expiry_cutoff(self.lease_timeout, Utc::now());
        match reservation.delete_expired(component_id, cutoff).await {
            Ok(0) => {}
            Ok(reclaimed) => {
                info!(component_id = %component_id, reclaimed, "Reclaimed expired lease");
            }
            Err(e) => {
                warn!(component_id = %component_id, error = %e, "Expired lease cleanup failed");
            }
        }
    }
}

#[async_trait]
impl DistributedLockStrategy for LeaseLockStrategy {
    async fn lock(&mut self, component_id: &str) -> bool {
        if self.lease_session.is_some() {
            return true;
        }

        let Some(_permit) = self.budget.try_acquire() else {
            warn!(
                component_id = %component_id,
                max = self.budget.max(),
                "Lease connection budget exhausted"
            );
            return false;
        };

        let Some(mut reservation) = self.store.try_reserve().await else {
            warn!(component_id = %component_id, "No free lease store connection");
            return false;
        };

        let session = new_session_id();
        let lease = Lease::exclusive(component_id, &session, &self.user_id);

        let acquired = if Self::insert(reservation.as_mut(), &lease).await {
            true
        } else {
            debug!(component_id = %component_id, "Lease held elsewhere, checking for expiry");
            self.reclaim_expired(reservation.as_mut(), component_id).await;
            Self::insert(reservation.as_mut(), &lease.started_at(Utc::now())).await
        };

        if acquired {
            debug!(component_id = %component_id, session = %session, "Lease acquired");
            self.lease_session = Some(session);
        }
        acquired
    }

    async fn unlock(&mut self, component_id: &str) {
        let Some(session) = self.lease_session.take() else {
            return;
        };

        match self.store.delete(component_id, &session).await {
            Ok(0) => {
                debug!(component_id = %component_id, session = %session, "Lease already gone");
            }
            Ok(_) => {
                debug!(component_id = %component_id, session = %session, "Lease released");
            }
            Err(e) => {
                // The row expires on its own
                warn!(component_id = %component_id, session = %session, error = %e, "Lease release failed");
            }
        }
    }

    async fn force_unlock(&mut self, component_id: &str) {
        self.lease_session = None;

        match self.store.delete_all(component_id).await {
            Ok(removed) => {
                info!(component_id = %component_id, removed, "Lease force-released");
            }
            Err(e) => {
                warn!(component_id = %component_id, error = %e, "Lease force release failed");
            }
        }
    }

    fn holds_lease(&self) -> bool {
        self.lease_session.is_some()
    }
}

/// Builds lease strategies that share one store, budget and session
pub struct LeaseStrategyFactory {
    store: Arc<dyn LeaseStore>,
    budget: ConnectionBudget,
    session: SessionContext,
    lease_timeout: Duration,
}

impl LeaseStrategyFactory {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        budget: ConnectionBudget,
        session: SessionContext,
        lease_timeout: Duration,
    ) -> Self {
        Self {
            store,
            budget,
            session,
            lease_timeout,
        }
    }

    pub fn budget(&self) -> &ConnectionBudget {
        &self.budget
    }
}

impl StrategyFactory for LeaseStrategyFactory {
    fn create(&self, _component_id: &str) -> Box<dyn DistributedLockStrategy> {
        Box::new(LeaseLockStrategy::new(
            self.store.clone(),
            self.budget.clone(),
            self.session.user_id.clone(),
            self.lease_timeout,
        ))
    }
}
