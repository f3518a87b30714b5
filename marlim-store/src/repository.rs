//! Repository trait definitions (ports).
//!
//! The event stream is the source of truth; the position snapshot is a
//! cache maintained atomically with every append. Callers never write a
//! snapshot directly; they append events (the snapshot argument to
//! `append` is the fold result the caller already computed via
//! `Position::apply`).

use crate::error::StoreError;
use async_trait::async_trait;
use marlim_domain::{
    Event, Intent, IntentId, IntentStatus, Order, OrderId, Position, PositionId, Side, Symbol,
};

/// Append-only event log plus the snapshot cache.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Append an event and commit the caller's new snapshot atomically.
    ///
    /// Returns the global sequence number of the appended event. Appends
    /// for one position are serialized by the holder's lease; the store
    /// additionally serializes on the snapshot row.
    async fn append(&self, event: &Event, snapshot: &Position) -> Result<i64, StoreError>;

    /// All events for a position, in sequence order.
    async fn events_for(&self, position_id: PositionId) -> Result<Vec<Event>, StoreError>;

    /// Events for a position after a given sequence number.
    async fn events_after(
        &self,
        position_id: PositionId,
        after_seq: i64,
    ) -> Result<Vec<Event>, StoreError>;

    /// Latest sequence number for a position, if any events exist.
    async fn latest_seq(&self, position_id: PositionId) -> Result<Option<i64>, StoreError>;
}

/// Read access to position snapshots.
#[async_trait]
pub trait PositionRepository: Send + Sync {
    /// Load the cached snapshot.
    async fn load_snapshot(&self, id: PositionId) -> Result<Option<Position>, StoreError>;

    /// Positions whose state is Armed, Entering, Active or Exiting.
    async fn list_active(&self) -> Result<Vec<Position>, StoreError>;

    /// Snapshots filtered by state name.
    async fn list_by_state(&self, state: &str) -> Result<Vec<Position>, StoreError>;

    /// Live engine position for a (symbol, side), if one exists.
    ///
    /// The safety net uses this as its second exclusion layer.
    async fn find_live_by_symbol_side(
        &self,
        symbol: &Symbol,
        side: Side,
    ) -> Result<Option<Position>, StoreError>;

    /// Overwrite a snapshot with the authoritative event-fold result.
    ///
    /// Only the reconciler calls this, after `rebuild_snapshot` detected a
    /// divergence.
    async fn heal_snapshot(&self, position: &Position) -> Result<(), StoreError>;
}

/// Order rows, keyed by id with client/exchange id lookups.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn save(&self, order: &Order) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError>;

    async fn find_by_position(&self, position_id: PositionId) -> Result<Vec<Order>, StoreError>;

    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Order>, StoreError>;
}

/// Intent journal rows. Unique on `(id, position_id)`.
#[async_trait]
pub trait IntentRepository: Send + Sync {
    /// Persist a pending intent. Duplicate `(id, position_id)` is an error.
    async fn record(&self, intent: &Intent) -> Result<(), StoreError>;

    async fn find(&self, id: IntentId, position_id: PositionId)
        -> Result<Option<Intent>, StoreError>;

    /// Move an intent through its status machine, storing result or error.
    async fn mark(
        &self,
        id: IntentId,
        position_id: PositionId,
        status: IntentStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Pending and Processing intents, for startup replay.
    async fn unresolved(&self) -> Result<Vec<Intent>, StoreError>;

    async fn by_position(&self, position_id: PositionId) -> Result<Vec<Intent>, StoreError>;
}

/// Combined store interface.
#[async_trait]
pub trait Store: Send + Sync {
    fn events(&self) -> &dyn EventRepository;
    fn positions(&self) -> &dyn PositionRepository;
    fn orders(&self) -> &dyn OrderRepository;
    fn intents(&self) -> &dyn IntentRepository;

    /// Fold the full event stream of a position through `Position::apply`.
    ///
    /// Must produce the same snapshot as the stored one (modulo
    /// `updated_at`); divergence is a bug surfaced as `SnapshotMismatch`
    /// by `verify_snapshot`.
    async fn rebuild_snapshot(&self, position_id: PositionId) -> Result<Position, StoreError> {
        let events = self.events().events_for(position_id).await?;
        if events.is_empty() {
            return Err(StoreError::not_found("events", position_id.to_string()));
        }
        Ok(Position::from_event_stream(&events)?)
    }

    /// Compare the stored snapshot with the event fold.
    async fn verify_snapshot(&self, position_id: PositionId) -> Result<Position, StoreError> {
        let rebuilt = self.rebuild_snapshot(position_id).await?;
        let stored = self
            .positions()
            .load_snapshot(position_id)
            .await?
            .ok_or_else(|| StoreError::not_found("position", position_id.to_string()))?;

        if !snapshots_equal(&stored, &rebuilt) {
            return Err(StoreError::SnapshotMismatch {
                position_id: position_id.to_string(),
                detail: format!(
                    "stored state {} != rebuilt state {}",
                    stored.state.name(),
                    rebuilt.state.name()
                ),
            });
        }

        Ok(rebuilt)
    }
}

/// Snapshot equality modulo `updated_at` (the only field the fold cannot
/// reproduce byte-for-byte).
pub fn snapshots_equal(a: &Position, b: &Position) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.updated_at = b.updated_at;
    a == b
}
