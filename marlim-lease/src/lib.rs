//! Single-writer leases per (account, symbol).
//!
//! At most one engine process may act on a given (account, symbol) pair at
//! any instant (invariant: no intent is processed without the lease). The
//! lease carries a **fencing token**, a monotonically increasing integer
//! per key, that downstream writes can check to reject stale holders
//! after a partition.
//!
//! The primitive behind the port only needs three properties:
//! - mutual exclusion,
//! - bounded unavailability on holder crash (≤ TTL),
//! - fencing tokens.
//!
//! `MemoryLeaseManager` covers single-process deployments and tests (with
//! an injectable clock, so expiry is deterministic); `PgLeaseManager`
//! (feature `postgres`) backs the lease with a heartbeat row.

#![warn(clippy::all)]

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marlim_domain::{AccountId, Symbol};
use tracing::{debug, warn};

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "postgres")]
pub use postgres::PgLeaseManager;

// =============================================================================
// Types
// =============================================================================

/// Lease key: one writer per (account, symbol).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseKey {
    pub account_id: AccountId,
    pub symbol: Symbol,
}

impl LeaseKey {
    pub fn new(account_id: AccountId, symbol: Symbol) -> Self {
        Self { account_id, symbol }
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account_id, self.symbol.as_pair())
    }
}

/// A granted lease. The token fences writes: storage rejects any write
/// carrying a token lower than the highest it has seen for the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: LeaseKey,
    /// Monotonically increasing per key
    pub token: u64,
    pub expires_at: DateTime<Utc>,
}

/// Lease errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseError {
    /// Another holder owns the key
    #[error("Lease conflict on {0}: held by another process")]
    Conflict(String),

    /// The lease expired or was stolen; stop issuing intents and reacquire
    #[error("Lease lost on {0}")]
    Lost(String),

    /// Backend failure
    #[error("Lease backend error: {0}")]
    Backend(String),
}

// =============================================================================
// Port
// =============================================================================

/// Leader election with fencing tokens and TTLs.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Acquire the lease for a key.
    ///
    /// Fails with `Conflict` while another unexpired holder exists.
    async fn acquire(&self, key: &LeaseKey, ttl: Duration) -> Result<Lease, LeaseError>;

    /// Extend a held lease.
    ///
    /// Fails with `Lost` if it expired or was stolen; the caller must stop
    /// issuing intents immediately, reacquire, and reconcile.
    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, LeaseError>;

    /// Best-effort release.
    async fn release(&self, lease: &Lease);
}

/// Scoped acquisition: the lease is released on every exit path, including
/// errors and cancellation of the future.
pub async fn with_lease<M, F, Fut, T, E>(
    manager: &M,
    key: &LeaseKey,
    ttl: Duration,
    f: F,
) -> Result<Result<T, E>, LeaseError>
where
    M: LeaseManager + ?Sized,
    F: FnOnce(Lease) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let lease = manager.acquire(key, ttl).await?;
    let guard = ReleaseGuard {
        manager,
        lease: Some(lease.clone()),
    };

    let result = f(lease).await;

    guard.disarm_and_release().await;
    Ok(result)
}

struct ReleaseGuard<'a, M: LeaseManager + ?Sized> {
    manager: &'a M,
    lease: Option<Lease>,
}

impl<'a, M: LeaseManager + ?Sized> ReleaseGuard<'a, M> {
    async fn disarm_and_release(mut self) {
        if let Some(lease) = self.lease.take() {
            self.manager.release(&lease).await;
        }
    }
}

impl<'a, M: LeaseManager + ?Sized> Drop for ReleaseGuard<'a, M> {
    fn drop(&mut self) {
        // Cancelled before the explicit release: the TTL bounds the orphan
        // window; log so operators can correlate.
        if let Some(lease) = self.lease.take() {
            warn!(key = %lease.key, token = lease.token, "Lease guard dropped without release; expires by TTL");
        }
    }
}

// =============================================================================
// Memory implementation
// =============================================================================

/// Clock abstraction so lease expiry is testable deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

struct Slot {
    token: u64,
    expires_at: DateTime<Utc>,
    held: bool,
}

/// In-memory lease manager.
///
/// Correct for a single process (tests, paper mode, single-node deploys);
/// multi-node deployments use the Postgres manager.
pub struct MemoryLeaseManager<C: Clock = SystemClock> {
    slots: Mutex<HashMap<LeaseKey, Slot>>,
    clock: C,
}

impl MemoryLeaseManager<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryLeaseManager<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryLeaseManager<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl<C: Clock> LeaseManager for MemoryLeaseManager<C> {
    async fn acquire(&self, key: &LeaseKey, ttl: Duration) -> Result<Lease, LeaseError> {
        let now = self.clock.now();
        let mut slots = self.slots.lock().map_err(|e| LeaseError::Backend(e.to_string()))?;

        let slot = slots.entry(key.clone()).or_insert(Slot {
            token: 0,
            expires_at: now,
            held: false,
        });

        if slot.held && slot.expires_at > now {
            return Err(LeaseError::Conflict(key.to_string()));
        }

        // New holder, next fencing token
        slot.token += 1;
        slot.held = true;
        slot.expires_at = now
            + chrono::Duration::from_std(ttl).map_err(|e| LeaseError::Backend(e.to_string()))?;

        debug!(%key, token = slot.token, "Lease acquired");

        Ok(Lease {
            key: key.clone(),
            token: slot.token,
            expires_at: slot.expires_at,
        })
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, LeaseError> {
        let now = self.clock.now();
        let mut slots = self.slots.lock().map_err(|e| LeaseError::Backend(e.to_string()))?;

        let slot = slots
            .get_mut(&lease.key)
            .ok_or_else(|| LeaseError::Lost(lease.key.to_string()))?;

        // Lost if a newer holder took over, or the lease lapsed
        if slot.token != lease.token || !slot.held || slot.expires_at <= now {
            return Err(LeaseError::Lost(lease.key.to_string()));
        }

        slot.expires_at = now
            + chrono::Duration::from_std(ttl).map_err(|e| LeaseError::Backend(e.to_string()))?;

        Ok(Lease {
            key: lease.key.clone(),
            token: lease.token,
            expires_at: slot.expires_at,
        })
    }

    async fn release(&self, lease: &Lease) {
        if let Ok(mut slots) = self.slots.lock() {
            if let Some(slot) = slots.get_mut(&lease.key) {
                if slot.token == lease.token {
                    slot.held = false;
                    debug!(key = %lease.key, token = lease.token, "Lease released");
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
