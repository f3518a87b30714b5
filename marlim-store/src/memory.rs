//! In-memory store implementation.
//!
//! Used for tests, paper trading and single-node deployments without a
//! database. Thread-safe via RwLock; the event append and snapshot update
//! happen inside one write-lock critical section, which is the in-memory
//! equivalent of the Postgres transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use marlim_domain::{
    Event, Intent, IntentId, IntentStatus, Order, OrderId, Position, PositionId, Side, Symbol,
};

use crate::error::StoreError;
use crate::repository::{
    EventRepository, IntentRepository, OrderRepository, PositionRepository, Store,
};

struct StoredEvent {
    seq: i64,
    event: Event,
}

/// In-memory store.
pub struct MemoryStore {
    positions: RwLock<HashMap<PositionId, Position>>,
    orders: RwLock<HashMap<OrderId, Order>>,
    events: RwLock<Vec<StoredEvent>>,
    intents: RwLock<HashMap<(IntentId, PositionId), Intent>>,
    event_seq: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
            intents: RwLock::new(HashMap::new()),
            event_seq: AtomicI64::new(0),
        }
    }

    pub fn position_count(&self) -> usize {
        self.positions.read().unwrap().len()
    }

    pub fn event_count(&self) -> usize {
        self.events.read().unwrap().len()
    }

    /// Clear all data (test setup helper)
    pub fn clear(&self) {
        self.positions.write().unwrap().clear();
        self.orders.write().unwrap().clear();
        self.events.write().unwrap().clear();
        self.intents.write().unwrap().clear();
        self.event_seq.store(0, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Event repository
// =============================================================================

#[async_trait]
impl EventRepository for MemoryStore {
    async fn append(&self, event: &Event, snapshot: &Position) -> Result<i64, StoreError> {
        if event.position_id() != snapshot.id {
            return Err(StoreError::Serialization(format!(
                "event position {} != snapshot position {}",
                event.position_id(),
                snapshot.id
            )));
        }

        // Event first, snapshot second, one critical section: readers never
        // observe a snapshot ahead of its log.
        let mut events = self.events.write().unwrap();
        let seq = self.event_seq.fetch_add(1, Ordering::SeqCst) + 1;
        events.push(StoredEvent { seq, event: event.clone() });

        let mut positions = self.positions.write().unwrap();
        positions.insert(snapshot.id, snapshot.clone());

        Ok(seq)
    }

    async fn events_for(&self, position_id: PositionId) -> Result<Vec<Event>, StoreError> {
        let events = self.events.read().unwrap();
        Ok(events
            .iter()
            .filter(|e| e.event.position_id() == position_id)
            .map(|e| e.event.clone())
            .collect())
    }

    async fn events_after(
        &self,
        position_id: PositionId,
        after_seq: i64,
    ) -> Result<Vec<Event>, StoreError> {
        let events = self.events.read().unwrap();
        Ok(events
            .iter()
            .filter(|e| e.event.position_id() == position_id && e.seq > after_seq)
            .map(|e| e.event.clone())
            .collect())
    }

    async fn latest_seq(&self, position_id: PositionId) -> Result<Option<i64>, StoreError> {
        let events = self.events.read().unwrap();
        Ok(events
            .iter()
            .filter(|e| e.event.position_id() == position_id)
            .map(|e| e.seq)
            .max())
    }
}

// =============================================================================
// Position repository
// =============================================================================

#[async_trait]
impl PositionRepository for MemoryStore {
    async fn load_snapshot(&self, id: PositionId) -> Result<Option<Position>, StoreError> {
        let positions = self.positions.read().unwrap();
        Ok(positions.get(&id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<Position>, StoreError> {
        let positions = self.positions.read().unwrap();
        Ok(positions.values().filter(|p| p.is_live()).cloned().collect())
    }

    async fn list_by_state(&self, state: &str) -> Result<Vec<Position>, StoreError> {
        let positions = self.positions.read().unwrap();
        Ok(positions
            .values()
            .filter(|p| p.state.name() == state)
            .cloned()
            .collect())
    }

    async fn find_live_by_symbol_side(
        &self,
        symbol: &Symbol,
        side: Side,
    ) -> Result<Option<Position>, StoreError> {
        let positions = self.positions.read().unwrap();
        Ok(positions
            .values()
            .find(|p| p.is_live() && &p.symbol == symbol && p.side == side)
            .cloned())
    }

    async fn heal_snapshot(&self, position: &Position) -> Result<(), StoreError> {
        let mut positions = self.positions.write().unwrap();
        let mut healed = position.clone();
        healed.updated_at = Utc::now();
        positions.insert(position.id, healed);
        Ok(())
    }
}

// =============================================================================
// Order repository
// =============================================================================

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn save(&self, order: &Order) -> Result<(), StoreError> {
        let mut orders = self.orders.write().unwrap();
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let orders = self.orders.read().unwrap();
        Ok(orders.get(&id).cloned())
    }

    async fn find_by_position(&self, position_id: PositionId) -> Result<Vec<Order>, StoreError> {
        let orders = self.orders.read().unwrap();
        Ok(orders
            .values()
            .filter(|o| o.position_id == position_id)
            .cloned()
            .collect())
    }

    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Order>, StoreError> {
        let orders = self.orders.read().unwrap();
        Ok(orders
            .values()
            .find(|o| o.client_order_id.as_str() == client_id)
            .cloned())
    }
}

// =============================================================================
// Intent repository
// =============================================================================

#[async_trait]
impl IntentRepository for MemoryStore {
    async fn record(&self, intent: &Intent) -> Result<(), StoreError> {
        let mut intents = self.intents.write().unwrap();
        let key = (intent.id, intent.position_id);

        if intents.contains_key(&key) {
            return Err(StoreError::duplicate("intent", intent.id.to_string()));
        }

        intents.insert(key, intent.clone());
        Ok(())
    }

    async fn find(
        &self,
        id: IntentId,
        position_id: PositionId,
    ) -> Result<Option<Intent>, StoreError> {
        let intents = self.intents.read().unwrap();
        Ok(intents.get(&(id, position_id)).cloned())
    }

    async fn mark(
        &self,
        id: IntentId,
        position_id: PositionId,
        status: IntentStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut intents = self.intents.write().unwrap();
        let intent = intents
            .get_mut(&(id, position_id))
            .ok_or_else(|| StoreError::not_found("intent", id.to_string()))?;

        intent.status = status;
        if result.is_some() {
            intent.result = result;
        }
        if error.is_some() {
            intent.error = error;
        }
        if matches!(status, IntentStatus::Completed | IntentStatus::Failed) {
            intent.completed_at = Some(Utc::now());
        }

        Ok(())
    }

    async fn unresolved(&self) -> Result<Vec<Intent>, StoreError> {
        let intents = self.intents.read().unwrap();
        let mut pending: Vec<Intent> =
            intents.values().filter(|i| i.is_unresolved()).cloned().collect();
        // Time-ordered ids make chronological sort equal insertion order
        pending.sort_by_key(|i| i.id);
        Ok(pending)
    }

    async fn by_position(&self, position_id: PositionId) -> Result<Vec<Intent>, StoreError> {
        let intents = self.intents.read().unwrap();
        let mut found: Vec<Intent> = intents
            .values()
            .filter(|i| i.position_id == position_id)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.id);
        Ok(found)
    }
}

impl Store for MemoryStore {
    fn events(&self) -> &dyn EventRepository {
        self
    }

    fn positions(&self) -> &dyn PositionRepository {
        self
    }

    fn orders(&self) -> &dyn OrderRepository {
        self
    }

    fn intents(&self) -> &dyn IntentRepository {
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
