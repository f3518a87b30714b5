//! Executor: turns engine decisions into journaled exchange actions.
//!
//! The executor is the bridge between the pure engine and the impure
//! exchange. Every externally visible action goes through the intent
//! journal first, so a crash at any point is recoverable by
//! `replay_pending`, and a retry reuses the same client_order_id, never
//! minting a new order.
//!
//! ```text
//! EngineDecision → Executor → IntentJournal → ExchangePort → ActionResult
//!                     └─ events appended atomically with the snapshot fold
//! ```

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use marlim_domain::{
    ClientOrderId, Event, Intent, IntentId, IntentKind, Order, OrderSide, Position, PositionId,
    Price, Quantity, Symbol,
};
use marlim_engine::EngineAction;
use marlim_store::Store;

use crate::error::{ExecError, ExecResult, ExchangeError};
use crate::intent::{IntentJournal, RecordOutcome};
use crate::ports::{ExchangePort, FillEvent, OrderAck};

// =============================================================================
// Results
// =============================================================================

/// Result of executing one engine action.
#[derive(Debug, Clone)]
pub enum ActionResult {
    /// Event appended at this sequence number
    EventPersisted { seq: i64 },
    /// Order accepted by the exchange
    OrderAccepted(OrderAck),
    /// Intent already completed earlier (idempotent skip)
    AlreadyProcessed(IntentId),
    /// Submit outcome unknown or retriable; the caller must drive
    /// resolution via `lookup_order` (same client_order_id), never resubmit
    /// blindly
    OrderUnresolved { intent_id: IntentId },
    /// Permanent rejection; the caller decides the failure transition
    OrderRejected { intent_id: IntentId, reason: String },
    /// Insurance stop rested on the exchange
    InsurancePlaced(OrderAck),
    /// Insurance stop cancelled
    InsuranceCancelled,
    /// Insurance layer degraded (never blocks the main path)
    InsuranceDegraded(String),
}

/// Payload recorded with order-producing intents, self-contained enough to
/// re-place the order after a restart.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OrderIntentPayload {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Quantity,
}

// =============================================================================
// Executor
// =============================================================================

/// Executes engine actions with idempotency guarantees.
pub struct Executor<E: ExchangePort, S: Store> {
    exchange: Arc<E>,
    journal: IntentJournal<S>,
    store: Arc<S>,
}

impl<E: ExchangePort, S: Store> Executor<E, S> {
    pub fn new(exchange: Arc<E>, store: Arc<S>) -> Self {
        Self {
            exchange,
            journal: IntentJournal::new(store.clone()),
            store,
        }
    }

    pub fn journal(&self) -> &IntentJournal<S> {
        &self.journal
    }

    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    /// Execute a decision's actions in order.
    ///
    /// Returns the position snapshot after all appended events (which is
    /// the engine's `updated_position` plus any insurance events the
    /// executor appended itself) and the per-action results.
    ///
    /// A storage error aborts immediately: the engine must never advance
    /// state it could not persist.
    pub async fn execute(
        &self,
        position: &Position,
        actions: Vec<EngineAction>,
    ) -> ExecResult<(Position, Vec<ActionResult>)> {
        let mut current = position.clone();
        let mut results = Vec::with_capacity(actions.len());

        for action in actions {
            let result = match action {
                EngineAction::EmitEvent(event) => {
                    current = current.apply(&event)?;
                    let seq = self.store.events().append(&event, &current).await?;
                    debug!(
                        position_id = %event.position_id(),
                        event_type = event.event_type(),
                        seq,
                        "Event persisted"
                    );
                    ActionResult::EventPersisted { seq }
                },

                EngineAction::PlaceEntryOrder {
                    position_id,
                    intent_id,
                    symbol,
                    side,
                    quantity,
                    ..
                } => {
                    self.place_order(
                        position_id,
                        intent_id,
                        IntentKind::EnterMarket,
                        symbol,
                        side,
                        quantity,
                    )
                    .await?
                },

                EngineAction::PlaceExitOrder {
                    position_id,
                    intent_id,
                    symbol,
                    side,
                    quantity,
                    ..
                } => {
                    self.place_order(
                        position_id,
                        intent_id,
                        IntentKind::ExitMarket,
                        symbol,
                        side,
                        quantity,
                    )
                    .await?
                },

                EngineAction::PlaceInsuranceStop {
                    position_id,
                    symbol,
                    side,
                    quantity,
                    stop_price,
                    limit_price,
                } => {
                    match self
                        .place_insurance(position_id, &symbol, side, quantity, stop_price, limit_price)
                        .await
                    {
                        Ok(ack) => {
                            // Record the resting stop as an order row, so
                            // the reconciler's open-order sweep knows it is
                            // ours.
                            if let Some((_, intent_id)) =
                                ClientOrderId::parse(&ack.client_order_id)
                            {
                                let mut row = Order::new_stop_loss_limit(
                                    position_id,
                                    symbol.clone(),
                                    side,
                                    quantity,
                                    stop_price,
                                    limit_price,
                                    ClientOrderId::core(intent_id),
                                );
                                row.mark_submitted(ack.exchange_order_id.clone());
                                self.store.orders().save(&row).await?;
                            }

                            // The engine cannot emit this event (it needs the
                            // exchange id), so the executor appends it here.
                            let event = Event::InsuranceStopPlaced {
                                position_id,
                                exchange_order_id: ack.exchange_order_id.clone(),
                                stop_price,
                                limit_price,
                                timestamp: ack.timestamp,
                            };
                            current = current.apply(&event)?;
                            self.store.events().append(&event, &current).await?;
                            ActionResult::InsurancePlaced(ack)
                        },
                        Err(e) => {
                            warn!(%position_id, error = %e, "Insurance stop placement degraded");
                            ActionResult::InsuranceDegraded(e.to_string())
                        },
                    }
                },

                EngineAction::CancelInsuranceStop {
                    position_id,
                    exchange_order_id,
                } => {
                    match self
                        .exchange
                        .cancel_order(&current.symbol, &exchange_order_id)
                        .await
                    {
                        Ok(()) | Err(ExchangeError::Rejected(_)) => {
                            // Not-found counts as cancelled
                            let event = Event::InsuranceStopCancelled {
                                position_id,
                                exchange_order_id,
                                reason: "superseded".to_string(),
                                timestamp: chrono::Utc::now(),
                            };
                            current = current.apply(&event)?;
                            self.store.events().append(&event, &current).await?;
                            ActionResult::InsuranceCancelled
                        },
                        Err(e) => {
                            warn!(%position_id, error = %e, "Insurance stop cancel degraded");
                            ActionResult::InsuranceDegraded(e.to_string())
                        },
                    }
                },
            };

            results.push(result);
        }

        Ok((current, results))
    }

    /// Journaled market-order placement.
    async fn place_order(
        &self,
        position_id: PositionId,
        intent_id: IntentId,
        kind: IntentKind,
        symbol: Symbol,
        side: OrderSide,
        quantity: Quantity,
    ) -> ExecResult<ActionResult> {
        let payload = OrderIntentPayload {
            symbol: symbol.as_pair(),
            side,
            quantity,
        };
        let intent = Intent::with_id(
            intent_id,
            position_id,
            kind,
            serde_json::to_value(&payload).map_err(|e| ExecError::InvalidState(e.to_string()))?,
        );

        match self.journal.record(&intent).await? {
            RecordOutcome::Recorded => {},
            RecordOutcome::Unresolved => {
                info!(%intent_id, %position_id, "Intent unresolved from a prior run, deferring to lookup");
                return Ok(ActionResult::OrderUnresolved { intent_id });
            },
            RecordOutcome::AlreadyProcessed => {
                info!(%intent_id, %position_id, "Intent already processed, skipping");
                return Ok(ActionResult::AlreadyProcessed(intent_id));
            },
        }

        self.journal.begin(intent_id, position_id).await?;
        self.submit_intent(&intent).await
    }

    /// Submit (or re-submit, same client id) a journaled order intent.
    ///
    /// The intent must already be Processing. Used both for first
    /// submission and for the bounded retry ladder driven by the position
    /// task after an unresolved outcome.
    pub async fn submit_intent(&self, intent: &Intent) -> ExecResult<ActionResult> {
        let payload: OrderIntentPayload = serde_json::from_value(intent.payload.clone())
            .map_err(|e| ExecError::InvalidState(e.to_string()))?;
        let symbol = Symbol::from_pair(&payload.symbol)?;
        let client_order_id = intent.client_order_id();

        info!(
            intent_id = %intent.id,
            position_id = %intent.position_id,
            symbol = %symbol.as_pair(),
            side = %payload.side,
            quantity = %payload.quantity,
            client_order_id = %client_order_id,
            "Placing market order"
        );

        match self
            .exchange
            .place_market_order(&symbol, payload.side, payload.quantity, &client_order_id)
            .await
        {
            Ok(ack) => {
                let mut order = Order::new_market(
                    intent.position_id,
                    symbol,
                    payload.side,
                    payload.quantity,
                    client_order_id,
                );
                order.mark_submitted(ack.exchange_order_id.clone());
                self.store.orders().save(&order).await?;

                self.journal
                    .complete(
                        intent.id,
                        intent.position_id,
                        serde_json::to_value(&ack)
                            .map_err(|e| ExecError::InvalidState(e.to_string()))?,
                    )
                    .await?;

                info!(
                    intent_id = %intent.id,
                    exchange_order_id = %ack.exchange_order_id,
                    "Order accepted"
                );
                Ok(ActionResult::OrderAccepted(ack))
            },
            Err(ExchangeError::Rejected(reason)) => {
                error!(intent_id = %intent.id, %reason, "Order rejected");
                self.journal
                    .fail(intent.id, intent.position_id, reason.clone())
                    .await?;
                Ok(ActionResult::OrderRejected {
                    intent_id: intent.id,
                    reason,
                })
            },
            Err(e) => {
                // Transient, rate-limited or unknown: the intent stays
                // Processing and resolution happens via lookup with the
                // SAME client_order_id. Never resubmit from here.
                warn!(intent_id = %intent.id, error = %e, "Order outcome unresolved");
                Ok(ActionResult::OrderUnresolved { intent_id: intent.id })
            },
        }
    }

    /// Insurance placement: fire-and-forget with one retry.
    async fn place_insurance(
        &self,
        position_id: PositionId,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Quantity,
        stop_price: Price,
        limit_price: Price,
    ) -> Result<OrderAck, ExchangeError> {
        let intent_id = uuid::Uuid::now_v7();
        let client_order_id = ClientOrderId::core(intent_id);

        let mut attempt = 0;
        loop {
            match self
                .exchange
                .place_stop_limit(symbol, side, quantity, stop_price, limit_price, &client_order_id)
                .await
            {
                Ok(ack) => {
                    debug!(
                        %position_id,
                        exchange_order_id = %ack.exchange_order_id,
                        stop = %stop_price,
                        "Insurance stop rested"
                    );
                    return Ok(ack);
                },
                Err(e) if e.is_retriable() && attempt == 0 => {
                    attempt += 1;
                    warn!(%position_id, error = %e, "Insurance stop retry");
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Update the order row when its fill notification arrives.
    pub async fn record_fill(&self, fill: &FillEvent) -> ExecResult<Option<Order>> {
        let Some(mut order) = self
            .store
            .orders()
            .find_by_client_id(&fill.client_order_id)
            .await?
        else {
            return Ok(None);
        };

        if order.is_filled() {
            return Ok(Some(order));
        }

        order.mark_filled(fill.avg_fill_price, fill.filled_qty, fill.fee)?;
        self.store.orders().save(&order).await?;
        Ok(Some(order))
    }
}

// =============================================================================
// Tests
// =============================================================================
