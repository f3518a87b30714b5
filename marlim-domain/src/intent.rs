//! Intents: the idempotency record for every externally visible action.
//!
//! An intent is a purely internal journal entry, not a user-facing trading
//! decision. Each intent that produces an order carries a deterministic
//! `client_order_id` derived from its id plus a namespace, and retries
//! always reuse the same id; the exchange deduplicates on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{IntentId, PositionId};
use crate::value_objects::{ClientOrderId, OrderNamespace};

/// The action an intent performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    /// Market order opening a core position
    EnterMarket,
    /// Market order closing a core position
    ExitMarket,
    /// Rest a stop-limit insurance order on the exchange
    PlaceInsuranceStop,
    /// Remove a resting insurance order
    CancelInsuranceStop,
    /// Safety-net market close of a detected position
    SafetyExit,
}

impl IntentKind {
    /// Namespace of the client_order_id this kind produces.
    pub fn namespace(&self) -> OrderNamespace {
        match self {
            IntentKind::SafetyExit => OrderNamespace::Safety,
            _ => OrderNamespace::Core,
        }
    }
}

/// Execution status of an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// Recorded, not yet executed
    Pending,
    /// Execution started; on crash this is resolved by replay, never rerun
    Processing,
    /// Finished successfully (see `result`)
    Completed,
    /// Finished unsuccessfully (see `error`)
    Failed,
}

/// A journaled intent. Primary key is `(id, position_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: IntentId,
    pub position_id: PositionId,
    pub kind: IntentKind,
    /// Kind-specific parameters (symbol, side, qty, prices)
    pub payload: serde_json::Value,
    pub status: IntentStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Intent {
    /// Create a pending intent with a fresh time-ordered id.
    pub fn new(position_id: PositionId, kind: IntentKind, payload: serde_json::Value) -> Self {
        Self::with_id(Uuid::now_v7(), position_id, kind, payload)
    }

    /// Create a pending intent with a caller-allocated id.
    ///
    /// Used when the id was already committed elsewhere (e.g. recorded in
    /// an `EntryRequested` event) so the client_order_id stays stable.
    pub fn with_id(
        id: IntentId,
        position_id: PositionId,
        kind: IntentKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id,
            position_id,
            kind,
            payload,
            status: IntentStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Deterministic exchange-side idempotency key for this intent.
    pub fn client_order_id(&self) -> ClientOrderId {
        match self.kind.namespace() {
            OrderNamespace::Core => ClientOrderId::core(self.id),
            OrderNamespace::Safety => ClientOrderId::safety(self.id),
        }
    }

    /// Pending or Processing: needs resolution on startup.
    pub fn is_unresolved(&self) -> bool {
        matches!(self.status, IntentStatus::Pending | IntentStatus::Processing)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, IntentStatus::Completed)
    }
}
