//! Intent journal: idempotent, crash-recoverable execution of side effects.
//!
//! # Flow
//!
//! 1. `record` the intent (before touching the exchange)
//! 2. mark Processing, execute, mark Completed/Failed
//! 3. on restart, `replay_pending` resolves anything left Pending or
//!    Processing via `lookup_order`, never by resubmitting
//!
//! A crash between the exchange acknowledgement and the local persistence
//! leaves the intent in Processing; the lookup on the same
//! client_order_id discovers the truth.

use std::sync::Arc;

use tracing::{info, warn};

use marlim_domain::{Intent, IntentId, IntentStatus, PositionId, Symbol};
use marlim_store::Store;

use crate::error::{ExecError, ExecResult, ExchangeError};
use crate::ports::{ExchangePort, OrderStatusView};

/// Journal over the store's intent rows.
pub struct IntentJournal<S: Store> {
    store: Arc<S>,
}

/// What `record` found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Fresh intent persisted; proceed to execute
    Recorded,
    /// Intent exists but is unresolved (crashed mid-flight); the caller
    /// must resolve via lookup before anything else
    Unresolved,
    /// Intent already completed; do not execute again
    AlreadyProcessed,
}

/// Resolution of an unresolved intent during replay.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub intent: Intent,
    pub outcome: ReplayOutcome,
}

#[derive(Debug, Clone)]
pub enum ReplayOutcome {
    /// The order reached the exchange and filled
    Filled(OrderStatusView),
    /// The order reached the exchange and is still open
    Open(OrderStatusView),
    /// The exchange never saw this client_order_id
    NeverReached,
}

impl<S: Store> IntentJournal<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Persist a pending intent, tolerating re-recording after a crash.
    pub async fn record(&self, intent: &Intent) -> ExecResult<RecordOutcome> {
        match self.store.intents().record(intent).await {
            Ok(()) => Ok(RecordOutcome::Recorded),
            Err(marlim_store::StoreError::Duplicate { .. }) => {
                let existing = self
                    .store
                    .intents()
                    .find(intent.id, intent.position_id)
                    .await?
                    .ok_or_else(|| ExecError::InvalidState("duplicate without row".to_string()))?;

                if existing.is_unresolved() {
                    Ok(RecordOutcome::Unresolved)
                } else {
                    Ok(RecordOutcome::AlreadyProcessed)
                }
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Mark an intent Processing before the exchange call.
    pub async fn begin(&self, id: IntentId, position_id: PositionId) -> ExecResult<()> {
        self.store
            .intents()
            .mark(id, position_id, IntentStatus::Processing, None, None)
            .await?;
        Ok(())
    }

    /// Record a successful execution.
    pub async fn complete(
        &self,
        id: IntentId,
        position_id: PositionId,
        result: serde_json::Value,
    ) -> ExecResult<()> {
        self.store
            .intents()
            .mark(id, position_id, IntentStatus::Completed, Some(result), None)
            .await?;
        Ok(())
    }

    /// Record a permanent failure.
    pub async fn fail(
        &self,
        id: IntentId,
        position_id: PositionId,
        error: String,
    ) -> ExecResult<()> {
        self.store
            .intents()
            .mark(id, position_id, IntentStatus::Failed, None, Some(error))
            .await?;
        Ok(())
    }

    pub async fn find(&self, id: IntentId, position_id: PositionId) -> ExecResult<Option<Intent>> {
        Ok(self.store.intents().find(id, position_id).await?)
    }

    /// Resolve all Pending/Processing intents against the exchange.
    ///
    /// Runs on startup before any position task starts; each unresolved
    /// intent is looked up by its deterministic client_order_id and marked
    /// accordingly. Returns what was found so the reconciler can replay
    /// missing fill events.
    pub async fn replay_pending<E: ExchangePort>(
        &self,
        exchange: &E,
        symbol_of: impl Fn(&Intent) -> Option<Symbol>,
    ) -> ExecResult<Vec<Resolution>> {
        let unresolved = self.store.intents().unresolved().await?;
        let mut resolutions = Vec::with_capacity(unresolved.len());

        for intent in unresolved {
            let Some(symbol) = symbol_of(&intent) else {
                warn!(intent_id = %intent.id, "Cannot determine symbol for replay, skipping");
                continue;
            };

            let client_order_id = intent.client_order_id();
            let looked_up = match exchange.lookup_order(&symbol, &client_order_id).await {
                Ok(view) => view,
                Err(ExchangeError::Transient(e)) | Err(ExchangeError::RateLimited(e)) => {
                    warn!(intent_id = %intent.id, error = %e, "Lookup failed transiently, leaving unresolved");
                    continue;
                },
                Err(e) => return Err(e.into()),
            };

            let outcome = match looked_up {
                Some(view) if view.is_filled() => {
                    info!(
                        intent_id = %intent.id,
                        exchange_order_id = %view.exchange_order_id,
                        "Replay: intent order filled while we were away"
                    );
                    self.complete(
                        intent.id,
                        intent.position_id,
                        serde_json::to_value(&view)
                            .map_err(|e| ExecError::InvalidState(e.to_string()))?,
                    )
                    .await?;
                    ReplayOutcome::Filled(view)
                },
                Some(view) => {
                    info!(
                        intent_id = %intent.id,
                        status = ?view.status,
                        "Replay: intent order still open on exchange"
                    );
                    ReplayOutcome::Open(view)
                },
                None => {
                    info!(intent_id = %intent.id, "Replay: order never reached the exchange");
                    self.fail(
                        intent.id,
                        intent.position_id,
                        "order never reached the exchange".to_string(),
                    )
                    .await?;
                    ReplayOutcome::NeverReached
                },
            };

            resolutions.push(Resolution { intent, outcome });
        }

        Ok(resolutions)
    }
}

// =============================================================================
// Tests
// =============================================================================
