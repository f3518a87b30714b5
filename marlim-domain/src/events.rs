//! Domain events for the position lifecycle.
//!
//! Events are immutable records of state changes. The event stream of a
//! position is append-only and authoritative: the Position snapshot is a
//! cache reconstructible by folding the stream through `Position::apply`.

use crate::entities::{
    AccountId, ExitReason, IntentId, Position, PositionId, PositionState, SignalId,
};
use crate::value_objects::{
    ClientOrderId, DomainError, Price, Quantity, RiskConfig, Side, Symbol, SymbolFilters,
    TechStopDistance,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Domain events for the position lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Position created and armed, waiting for an entry signal
    PositionArmed {
        position_id: PositionId,
        account_id: AccountId,
        symbol: Symbol,
        side: Side,
        risk_config: RiskConfig,
        tech_stop_distance: TechStopDistance,
        filters: SymbolFilters,
        timestamp: DateTime<Utc>,
    },

    /// Armed position cancelled by the operator before entering
    PositionDisarmed {
        position_id: PositionId,
        timestamp: DateTime<Utc>,
    },

    /// Entry intent created for a matching signal
    EntryRequested {
        position_id: PositionId,
        /// Intent that owns the entry order; its client_order_id derives from it
        intent_id: IntentId,
        /// Correlation id of the triggering signal
        signal_id: SignalId,
        quantity: Quantity,
        expected_price: Price,
        timestamp: DateTime<Utc>,
    },

    /// Entry order filled, position is now active
    EntryFilled {
        position_id: PositionId,
        intent_id: IntentId,
        fill_price: Price,
        filled_quantity: Quantity,
        /// Fee in the quote asset
        fee: Decimal,
        /// Initial trailing stop (fill ∓ tech stop distance)
        initial_stop: Price,
        timestamp: DateTime<Utc>,
    },

    /// Entry abandoned (rejected, or unresolved past the retry budget)
    EntryFailed {
        position_id: PositionId,
        intent_id: IntentId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Trailing stop moved on favorable price movement
    TrailingStopUpdated {
        position_id: PositionId,
        previous_stop: Price,
        new_stop: Price,
        /// The new favorable extreme that produced the move
        trigger_price: Price,
        timestamp: DateTime<Utc>,
    },

    /// Insurance stop resting on the exchange (backstop while the engine is away)
    InsuranceStopPlaced {
        position_id: PositionId,
        exchange_order_id: String,
        stop_price: Price,
        limit_price: Price,
        timestamp: DateTime<Utc>,
    },

    /// Insurance stop removed (replaced, or position exiting)
    InsuranceStopCancelled {
        position_id: PositionId,
        exchange_order_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Exit intent created (stop breached or operator panic)
    ExitRequested {
        position_id: PositionId,
        intent_id: IntentId,
        reason: ExitReason,
        trigger_price: Price,
        stop_price: Price,
        timestamp: DateTime<Utc>,
    },

    /// Exit order filled
    ExitFilled {
        position_id: PositionId,
        intent_id: IntentId,
        fill_price: Price,
        filled_quantity: Quantity,
        fee: Decimal,
        timestamp: DateTime<Utc>,
    },

    /// Exit could not complete within the retry budget
    ExitFailed {
        position_id: PositionId,
        intent_id: IntentId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Position closed with final P&L
    PositionClosed {
        position_id: PositionId,
        exit_reason: ExitReason,
        entry_price: Price,
        exit_price: Price,
        realized_pnl: Decimal,
        total_fees: Decimal,
        timestamp: DateTime<Utc>,
    },

    /// Position entered the error state
    PositionError {
        position_id: PositionId,
        error: String,
        recoverable: bool,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Get the position id from any event
    pub fn position_id(&self) -> PositionId {
        match self {
            Event::PositionArmed { position_id, .. }
            | Event::PositionDisarmed { position_id, .. }
            | Event::EntryRequested { position_id, .. }
            | Event::EntryFilled { position_id, .. }
            | Event::EntryFailed { position_id, .. }
            | Event::TrailingStopUpdated { position_id, .. }
            | Event::InsuranceStopPlaced { position_id, .. }
            | Event::InsuranceStopCancelled { position_id, .. }
            | Event::ExitRequested { position_id, .. }
            | Event::ExitFilled { position_id, .. }
            | Event::ExitFailed { position_id, .. }
            | Event::PositionClosed { position_id, .. }
            | Event::PositionError { position_id, .. } => *position_id,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::PositionArmed { timestamp, .. }
            | Event::PositionDisarmed { timestamp, .. }
            | Event::EntryRequested { timestamp, .. }
            | Event::EntryFilled { timestamp, .. }
            | Event::EntryFailed { timestamp, .. }
            | Event::TrailingStopUpdated { timestamp, .. }
            | Event::InsuranceStopPlaced { timestamp, .. }
            | Event::InsuranceStopCancelled { timestamp, .. }
            | Event::ExitRequested { timestamp, .. }
            | Event::ExitFilled { timestamp, .. }
            | Event::ExitFailed { timestamp, .. }
            | Event::PositionClosed { timestamp, .. }
            | Event::PositionError { timestamp, .. } => *timestamp,
        }
    }

    /// Snake-case event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::PositionArmed { .. } => "position_armed",
            Event::PositionDisarmed { .. } => "position_disarmed",
            Event::EntryRequested { .. } => "entry_requested",
            Event::EntryFilled { .. } => "entry_filled",
            Event::EntryFailed { .. } => "entry_failed",
            Event::TrailingStopUpdated { .. } => "trailing_stop_updated",
            Event::InsuranceStopPlaced { .. } => "insurance_stop_placed",
            Event::InsuranceStopCancelled { .. } => "insurance_stop_cancelled",
            Event::ExitRequested { .. } => "exit_requested",
            Event::ExitFilled { .. } => "exit_filled",
            Event::ExitFailed { .. } => "exit_failed",
            Event::PositionClosed { .. } => "position_closed",
            Event::PositionError { .. } => "position_error",
        }
    }
}

// =============================================================================
// Event application (the pure transition function)
// =============================================================================

impl Position {
    /// Seed a position from its creation event.
    pub fn from_armed(event: &Event) -> Result<Position, DomainError> {
        match event {
            Event::PositionArmed {
                position_id,
                account_id,
                symbol,
                side,
                risk_config,
                tech_stop_distance,
                filters,
                timestamp,
            } => {
                let mut position = Position::arm(
                    *account_id,
                    symbol.clone(),
                    *side,
                    *risk_config,
                    *tech_stop_distance,
                    *filters,
                )?;
                position.id = *position_id;
                position.created_at = *timestamp;
                position.updated_at = *timestamp;
                Ok(position)
            },
            other => Err(DomainError::InvalidTransition {
                state: "(new)".to_string(),
                event: other.event_type().to_string(),
            }),
        }
    }

    /// Apply one event to this position, producing the next snapshot.
    ///
    /// This is the ONLY way a Position mutates in memory. It is total over
    /// events valid for the current state and rejects everything else with
    /// `InvalidTransition`, which is always a bug in the producer, never
    /// in the log.
    pub fn apply(&self, event: &Event) -> Result<Position, DomainError> {
        let invalid = || DomainError::InvalidTransition {
            state: self.state.name().to_string(),
            event: event.event_type().to_string(),
        };

        if event.position_id() != self.id {
            return Err(DomainError::InvalidSignal(format!(
                "event for {} applied to {}",
                event.position_id(),
                self.id
            )));
        }

        let mut next = self.clone();
        next.updated_at = event.timestamp();

        match (&self.state, event) {
            (
                PositionState::Armed,
                Event::EntryRequested {
                    intent_id,
                    signal_id,
                    quantity,
                    expected_price,
                    ..
                },
            ) => {
                next.state = PositionState::Entering {
                    intent_id: *intent_id,
                    signal_id: *signal_id,
                    requested_qty: *quantity,
                    expected_entry: *expected_price,
                };
                next.entry_order_id =
                    Some(ClientOrderId::core(*intent_id).as_str().to_string());
            },

            (PositionState::Armed, Event::PositionDisarmed { timestamp, .. }) => {
                next.state = PositionState::Closed {
                    exit_price: None,
                    realized_pnl: Decimal::ZERO,
                    exit_reason: ExitReason::Disarmed,
                };
                next.closed_at = Some(*timestamp);
            },

            (
                PositionState::Entering { .. },
                Event::EntryFilled {
                    fill_price,
                    filled_quantity,
                    fee,
                    initial_stop,
                    timestamp,
                    ..
                },
            ) => {
                next.entry_price = Some(*fill_price);
                next.entry_filled_at = Some(*timestamp);
                next.quantity = Some(*filled_quantity);
                next.fees_paid += *fee;
                next.tech_stop_distance_pct =
                    Some(self.tech_stop_distance.pct_of(*fill_price));
                next.state = PositionState::Active {
                    current_price: *fill_price,
                    trailing_stop: *initial_stop,
                    favorable_extreme: *fill_price,
                    extreme_at: *timestamp,
                    insurance_stop_id: None,
                };
            },

            (PositionState::Entering { .. }, Event::EntryFailed { reason, .. }) => {
                next.state = PositionState::Error {
                    error: format!("entry failed: {}", reason),
                    recoverable: true,
                };
            },

            (
                PositionState::Active { insurance_stop_id, .. },
                Event::TrailingStopUpdated {
                    new_stop,
                    trigger_price,
                    timestamp,
                    ..
                },
            ) => {
                next.state = PositionState::Active {
                    current_price: *trigger_price,
                    trailing_stop: *new_stop,
                    favorable_extreme: *trigger_price,
                    extreme_at: *timestamp,
                    insurance_stop_id: insurance_stop_id.clone(),
                };
            },

            (
                PositionState::Active {
                    current_price,
                    trailing_stop,
                    favorable_extreme,
                    extreme_at,
                    ..
                },
                Event::InsuranceStopPlaced { exchange_order_id, .. },
            ) => {
                next.insurance_stop_id = Some(exchange_order_id.clone());
                next.state = PositionState::Active {
                    current_price: *current_price,
                    trailing_stop: *trailing_stop,
                    favorable_extreme: *favorable_extreme,
                    extreme_at: *extreme_at,
                    insurance_stop_id: Some(exchange_order_id.clone()),
                };
            },

            (
                PositionState::Active {
                    current_price,
                    trailing_stop,
                    favorable_extreme,
                    extreme_at,
                    ..
                },
                Event::InsuranceStopCancelled { .. },
            ) => {
                next.insurance_stop_id = None;
                next.state = PositionState::Active {
                    current_price: *current_price,
                    trailing_stop: *trailing_stop,
                    favorable_extreme: *favorable_extreme,
                    extreme_at: *extreme_at,
                    insurance_stop_id: None,
                };
            },

            (
                PositionState::Active { .. },
                Event::ExitRequested {
                    intent_id,
                    reason,
                    trigger_price,
                    ..
                },
            ) => {
                next.state = PositionState::Exiting {
                    intent_id: *intent_id,
                    exit_reason: *reason,
                    trigger_price: *trigger_price,
                };
                next.exit_order_id =
                    Some(ClientOrderId::core(*intent_id).as_str().to_string());
                next.insurance_stop_id = None;
            },

            (PositionState::Exiting { .. }, Event::ExitFilled { fee, .. }) => {
                // Fees accumulate here; the terminal summary arrives with
                // PositionClosed.
                next.fees_paid += *fee;
            },

            (PositionState::Exiting { .. }, Event::ExitFailed { reason, .. }) => {
                next.state = PositionState::Error {
                    error: format!("exit failed: {}", reason),
                    recoverable: true,
                };
            },

            (
                PositionState::Exiting { .. },
                Event::PositionClosed {
                    exit_reason,
                    exit_price,
                    realized_pnl,
                    total_fees,
                    timestamp,
                    ..
                },
            ) => {
                next.state = PositionState::Closed {
                    exit_price: Some(*exit_price),
                    realized_pnl: *realized_pnl,
                    exit_reason: *exit_reason,
                };
                next.realized_pnl = *realized_pnl;
                next.fees_paid = *total_fees;
                next.closed_at = Some(*timestamp);
            },

            (
                PositionState::Armed
                | PositionState::Entering { .. }
                | PositionState::Active { .. }
                | PositionState::Exiting { .. },
                Event::PositionError { error, recoverable, .. },
            ) => {
                next.state = PositionState::Error {
                    error: error.clone(),
                    recoverable: *recoverable,
                };
            },

            _ => return Err(invalid()),
        }

        Ok(next)
    }

    /// Fold a full event stream into a snapshot.
    ///
    /// The first event must be `PositionArmed`. The result must equal the
    /// stored snapshot (modulo `updated_at`); divergence is a bug detected
    /// by the reconciler.
    pub fn from_event_stream(events: &[Event]) -> Result<Position, DomainError> {
        let (first, rest) = events.split_first().ok_or_else(|| {
            DomainError::InvalidTransition {
                state: "(new)".to_string(),
                event: "(empty stream)".to_string(),
            }
        })?;

        let mut position = Position::from_armed(first)?;
        for event in rest {
            position = position.apply(event)?;
        }
        Ok(position)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn armed_event(position_id: PositionId) -> Event {
        Event::PositionArmed {
            position_id,
            account_id: Uuid::now_v7(),
            symbol: Symbol::from_pair("BTCUSDT").unwrap(),
            side: Side::Long,
            risk_config: RiskConfig::new(dec!(10000), dec!(1)).unwrap(),
            tech_stop_distance: TechStopDistance::new(dec!(500)).unwrap(),
            filters: SymbolFilters::new(dec!(0.01), dec!(0.001)).unwrap(),
            timestamp: Utc::now(),
        }
    }

    fn full_lifecycle_events(position_id: PositionId) -> Vec<Event> {
        let entry_intent = Uuid::now_v7();
        let exit_intent = Uuid::now_v7();

        vec![
            armed_event(position_id),
            Event::EntryRequested {
                position_id,
                intent_id: entry_intent,
                signal_id: Uuid::now_v7(),
                quantity: Quantity::new(dec!(0.2)).unwrap(),
                expected_price: Price::new(dec!(100000)).unwrap(),
                timestamp: Utc::now(),
            },
            Event::EntryFilled {
                position_id,
                intent_id: entry_intent,
                fill_price: Price::new(dec!(100000)).unwrap(),
                filled_quantity: Quantity::new(dec!(0.2)).unwrap(),
                fee: dec!(10),
                initial_stop: Price::new(dec!(99500)).unwrap(),
                timestamp: Utc::now(),
            },
            Event::TrailingStopUpdated {
                position_id,
                previous_stop: Price::new(dec!(99500)).unwrap(),
                new_stop: Price::new(dec!(100500)).unwrap(),
                trigger_price: Price::new(dec!(101000)).unwrap(),
                timestamp: Utc::now(),
            },
            Event::ExitRequested {
                position_id,
                intent_id: exit_intent,
                reason: ExitReason::TrailingStop,
                trigger_price: Price::new(dec!(100400)).unwrap(),
                stop_price: Price::new(dec!(100500)).unwrap(),
                timestamp: Utc::now(),
            },
            Event::ExitFilled {
                position_id,
                intent_id: exit_intent,
                fill_price: Price::new(dec!(100400)).unwrap(),
                filled_quantity: Quantity::new(dec!(0.2)).unwrap(),
                fee: dec!(10),
                timestamp: Utc::now(),
            },
            Event::PositionClosed {
                position_id,
                exit_reason: ExitReason::TrailingStop,
                entry_price: Price::new(dec!(100000)).unwrap(),
                exit_price: Price::new(dec!(100400)).unwrap(),
                realized_pnl: dec!(60),
                total_fees: dec!(20),
                timestamp: Utc::now(),
            },
        ]
    }

    #[test]
    fn test_fold_full_lifecycle() {
        let position_id = Uuid::now_v7();
        let events = full_lifecycle_events(position_id);

        let position = Position::from_event_stream(&events).unwrap();

        assert_eq!(position.id, position_id);
        assert_eq!(position.state.name(), "closed");
        assert_eq!(position.realized_pnl, dec!(60));
        assert_eq!(position.fees_paid, dec!(20));
        assert!(position.closed_at.is_some());
        assert_eq!(position.entry_price.unwrap().as_decimal(), dec!(100000));
    }

    #[test]
    fn test_fold_intermediate_states() {
        let position_id = Uuid::now_v7();
        let events = full_lifecycle_events(position_id);

        // Armed after the first event
        let armed = Position::from_event_stream(&events[..1]).unwrap();
        assert_eq!(armed.state.name(), "armed");

        // Entering after the request
        let entering = Position::from_event_stream(&events[..2]).unwrap();
        assert_eq!(entering.state.name(), "entering");

        // Active after the fill with the initial stop
        let active = Position::from_event_stream(&events[..3]).unwrap();
        assert_eq!(active.trailing_stop().unwrap().as_decimal(), dec!(99500));
        assert_eq!(active.tech_stop_distance_pct.unwrap(), dec!(0.5));

        // Stop trailed after the update
        let trailed = Position::from_event_stream(&events[..4]).unwrap();
        assert_eq!(trailed.trailing_stop().unwrap().as_decimal(), dec!(100500));

        // Exiting after the request
        let exiting = Position::from_event_stream(&events[..5]).unwrap();
        assert_eq!(exiting.state.name(), "exiting");
        assert!(exiting.exit_order_id.is_some());
    }

    #[test]
    fn test_apply_rejects_invalid_transition() {
        let position_id = Uuid::now_v7();
        let armed = Position::from_armed(&armed_event(position_id)).unwrap();

        // A fill without a preceding request is a producer bug
        let fill = Event::EntryFilled {
            position_id,
            intent_id: Uuid::now_v7(),
            fill_price: Price::new(dec!(100000)).unwrap(),
            filled_quantity: Quantity::new(dec!(0.2)).unwrap(),
            fee: dec!(0),
            initial_stop: Price::new(dec!(99500)).unwrap(),
            timestamp: Utc::now(),
        };

        let result = armed.apply(&fill);
        assert!(matches!(result, Err(DomainError::InvalidTransition { .. })));
    }

    #[test]
    fn test_apply_rejects_foreign_position_event() {
        let armed = Position::from_armed(&armed_event(Uuid::now_v7())).unwrap();
        let foreign = Event::PositionDisarmed {
            position_id: Uuid::now_v7(),
            timestamp: Utc::now(),
        };

        assert!(armed.apply(&foreign).is_err());
    }

    #[test]
    fn test_disarm_closes_without_entry() {
        let position_id = Uuid::now_v7();
        let events = vec![
            armed_event(position_id),
            Event::PositionDisarmed {
                position_id,
                timestamp: Utc::now(),
            },
        ];

        let position = Position::from_event_stream(&events).unwrap();

        match position.state {
            PositionState::Closed {
                exit_price,
                realized_pnl,
                exit_reason,
            } => {
                assert!(exit_price.is_none());
                assert_eq!(realized_pnl, Decimal::ZERO);
                assert_eq!(exit_reason, ExitReason::Disarmed);
            },
            other => panic!("expected Closed, got {:?}", other.name()),
        }
        assert!(position.closed_at.is_some());
    }

    #[test]
    fn test_insurance_stop_events() {
        let position_id = Uuid::now_v7();
        let mut events = full_lifecycle_events(position_id)[..3].to_vec();

        events.push(Event::InsuranceStopPlaced {
            position_id,
            exchange_order_id: "EX-1".to_string(),
            stop_price: Price::new(dec!(99400)).unwrap(),
            limit_price: Price::new(dec!(99350)).unwrap(),
            timestamp: Utc::now(),
        });

        let with_insurance = Position::from_event_stream(&events).unwrap();
        assert_eq!(with_insurance.insurance_stop_id.as_deref(), Some("EX-1"));

        events.push(Event::InsuranceStopCancelled {
            position_id,
            exchange_order_id: "EX-1".to_string(),
            reason: "replaced".to_string(),
            timestamp: Utc::now(),
        });

        let without = Position::from_event_stream(&events).unwrap();
        assert!(without.insurance_stop_id.is_none());
    }

    #[test]
    fn test_error_event_from_any_live_state() {
        let position_id = Uuid::now_v7();
        let error = Event::PositionError {
            position_id,
            error: "rebuild mismatch".to_string(),
            recoverable: false,
            timestamp: Utc::now(),
        };

        let armed = Position::from_armed(&armed_event(position_id)).unwrap();
        let errored = armed.apply(&error).unwrap();
        assert_eq!(errored.state.name(), "error");

        // But not from a terminal state
        assert!(errored.apply(&error).is_err());
    }

    #[test]
    fn test_event_serialization_roundtrip() {
        let event = armed_event(Uuid::now_v7());
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(event.position_id(), back.position_id());
        assert!(json.contains("\"type\":\"position_armed\""));
    }

    #[test]
    fn test_event_type_names() {
        let position_id = Uuid::now_v7();
        for event in full_lifecycle_events(position_id) {
            assert_eq!(event.position_id(), position_id);
            assert!(!event.event_type().is_empty());
        }
    }
}
