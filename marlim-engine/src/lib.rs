//! Marlim engine layer.
//!
//! Pure decision logic for the position lifecycle. The engine never touches
//! network, database or filesystem: it consumes a position snapshot plus one
//! input (signal, tick, fill) and returns the actions the execution layer
//! should perform, along with the next snapshot.
//!
//! State transitions go through `Position::apply` on the same events the
//! engine emits, so decisions and event-stream folds can never diverge.
//!
//! # Dual-stop policy
//!
//! While a position is Active the local monitor trails a stop at exactly
//! 1x the technical stop distance below the peak (Long) or above the trough
//! (Short). Optionally an insurance stop rests on the exchange strictly
//! wider than the local stop, as a backstop for when the engine is down;
//! it is cancelled and replaced on every trail advance and cancelled before
//! any exit order.

#![warn(clippy::all)]

use chrono::{DateTime, Utc};
use marlim_domain::{
    calculate_position_size, ClientOrderId, EntrySignal, Event, ExitReason, IntentId, OrderSide,
    Position, PositionId, PositionState, Price, Quantity, Side, Symbol,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

// =============================================================================
// Engine errors
// =============================================================================

/// Errors surfaced by engine processing
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Position is not in the expected state for this operation
    #[error("Invalid position state: expected {expected}, got {actual}")]
    InvalidPositionState {
        expected: String,
        actual: String,
    },

    /// Tick/fill for the wrong symbol
    #[error("Invalid market data: {0}")]
    InvalidMarketData(String),

    /// Domain error passthrough
    #[error("Domain error: {0}")]
    Domain(#[from] marlim_domain::DomainError),
}

// =============================================================================
// Inputs
// =============================================================================

/// A trade tick for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: Symbol,
    pub last_price: Price,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn new(symbol: Symbol, last_price: Price) -> Self {
        Self { symbol, last_price, timestamp: Utc::now() }
    }
}

// =============================================================================
// Actions
// =============================================================================

/// Actions the engine decides should be executed.
///
/// These are pure data; the execution layer performs the I/O through the
/// intent journal so each is applied exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineAction {
    /// Place the entry market order
    PlaceEntryOrder {
        position_id: PositionId,
        /// Intent id; `client_order_id` below derives from it
        intent_id: IntentId,
        symbol: Symbol,
        side: OrderSide,
        quantity: Quantity,
        client_order_id: ClientOrderId,
    },

    /// Place the exit market order
    PlaceExitOrder {
        position_id: PositionId,
        intent_id: IntentId,
        symbol: Symbol,
        side: OrderSide,
        quantity: Quantity,
        client_order_id: ClientOrderId,
        reason: ExitReason,
    },

    /// Rest (or re-rest) the insurance stop on the exchange
    PlaceInsuranceStop {
        position_id: PositionId,
        symbol: Symbol,
        side: OrderSide,
        quantity: Quantity,
        stop_price: Price,
        limit_price: Price,
    },

    /// Remove the resting insurance stop (best effort, ignore not-found)
    CancelInsuranceStop {
        position_id: PositionId,
        exchange_order_id: String,
    },

    /// Persist a domain event
    EmitEvent(Event),
}

/// Result of engine processing: ordered actions plus the next snapshot.
#[derive(Debug, Clone)]
pub struct EngineDecision {
    pub actions: Vec<EngineAction>,
    pub updated_position: Option<Position>,
}

impl EngineDecision {
    pub fn no_action() -> Self {
        Self { actions: vec![], updated_position: None }
    }

    pub fn with_position(actions: Vec<EngineAction>, position: Position) -> Self {
        Self { actions, updated_position: Some(position) }
    }

    pub fn has_actions(&self) -> bool {
        !self.actions.is_empty()
    }
}

/// Outcome of a tick on an Active position.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Nothing to do
    NoAction,
    /// Favorable move: stop advanced (and insurance replaced if enabled)
    StopAdvanced(EngineDecision),
    /// Stop breached: the caller must follow up with `decide_exit`
    StopBreached {
        trigger_price: Price,
        stop_price: Price,
    },
}

// =============================================================================
// Insurance policy
// =============================================================================

/// Insurance-stop configuration.
///
/// The insurance price must always be strictly wider than the local
/// trailing stop so the local monitor fires first in normal operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InsurancePolicy {
    pub enabled: bool,
    /// Gap between the local stop and the insurance trigger, as % of the stop
    pub buffer_pct: Decimal,
    /// Gap between the insurance trigger and its limit price, as % of the stop
    pub limit_offset_pct: Decimal,
}

impl InsurancePolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            buffer_pct: Decimal::new(2, 1),       // 0.2%
            limit_offset_pct: Decimal::new(1, 1), // 0.1%
        }
    }

    pub fn enabled(buffer_pct: Decimal) -> Self {
        Self {
            enabled: true,
            buffer_pct,
            limit_offset_pct: Decimal::new(1, 1),
        }
    }

    /// Insurance trigger and limit prices for a given local stop.
    fn prices_for(&self, side: Side, local_stop: Price) -> (Price, Price) {
        let stop = local_stop.as_decimal();
        let buffer = stop * self.buffer_pct / Decimal::from(100);
        let offset = stop * self.limit_offset_pct / Decimal::from(100);

        match side {
            // Long exits sell: trigger below the local stop, limit below trigger
            Side::Long => (Price::from(stop - buffer), Price::from(stop - buffer - offset)),
            // Short exits buy: trigger above the local stop, limit above trigger
            Side::Short => (Price::from(stop + buffer), Price::from(stop + buffer + offset)),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Pure decision engine for the position lifecycle.
///
/// # Responsibilities
///
/// 1. Entry: validate signal, size the position, request the entry order
/// 2. Trailing: advance the stop on favorable ticks, fixed 1x distance
/// 3. Exit: detect breaches, request the exit order, settle PnL
/// 4. Events: every state change goes through an emitted domain event
#[derive(Debug, Clone)]
pub struct Engine {
    insurance: InsurancePolicy,
    /// Accepted shortfall between requested and filled entry qty, in %
    fill_tolerance_pct: Decimal,
}

impl Engine {
    pub fn new(insurance: InsurancePolicy, fill_tolerance_pct: Decimal) -> Self {
        Self { insurance, fill_tolerance_pct }
    }

    /// Engine with insurance off and the default 0.5% fill tolerance.
    pub fn default_paper() -> Self {
        Self::new(InsurancePolicy::disabled(), Decimal::new(5, 1))
    }

    pub fn insurance(&self) -> &InsurancePolicy {
        &self.insurance
    }

    // =========================================================================
    // Entry
    // =========================================================================

    /// Process an entry signal against an armed position.
    ///
    /// Sizing follows the golden rule: quantity = floor_to_step(risk budget
    /// / stop distance). The intent id is allocated by the caller so crash
    /// recovery replays the same `client_order_id`.
    ///
    /// Duplicate delivery is a no-op: if the position is already Entering
    /// (or beyond) for this `signal_id`, the decision is empty.
    pub fn decide_entry(
        &self,
        position: &Position,
        signal: &EntrySignal,
        intent_id: IntentId,
    ) -> Result<EngineDecision, EngineError> {
        // Idempotent re-delivery: the signal already moved this position.
        match &position.state {
            PositionState::Entering { signal_id, .. } if *signal_id == signal.signal_id => {
                debug!(
                    position_id = %position.id,
                    signal_id = %signal.signal_id,
                    "Duplicate signal delivery ignored"
                );
                return Ok(EngineDecision::no_action());
            },
            PositionState::Armed => {},
            other => {
                return Err(EngineError::InvalidPositionState {
                    expected: "armed".to_string(),
                    actual: other.name().to_string(),
                });
            },
        }

        signal.validate_for_position(position)?;

        // Policy bounds on the stop distance, relative to the signal price
        position.tech_stop_distance.validate_against(signal.entry_price)?;

        let quantity = calculate_position_size(
            &position.risk_config,
            &position.tech_stop_distance,
            &position.filters,
        )?;

        debug!(
            position_id = %position.id,
            signal_id = %signal.signal_id,
            entry_price = %signal.entry_price,
            quantity = %quantity,
            "Entry signal accepted, requesting order"
        );

        let event = Event::EntryRequested {
            position_id: position.id,
            intent_id,
            signal_id: signal.signal_id,
            quantity,
            expected_price: signal.entry_price,
            timestamp: Utc::now(),
        };
        let updated = position.apply(&event)?;

        let actions = vec![
            EngineAction::EmitEvent(event),
            EngineAction::PlaceEntryOrder {
                position_id: position.id,
                intent_id,
                symbol: position.symbol.clone(),
                side: position.side.entry_action(),
                quantity,
                client_order_id: ClientOrderId::core(intent_id),
            },
        ];

        Ok(EngineDecision::with_position(actions, updated))
    }

    /// Process the entry fill: Entering → Active with the initial stop.
    ///
    /// Replaying the fill on an already-Active position is a no-op.
    pub fn process_entry_fill(
        &self,
        position: &Position,
        fill_price: Price,
        filled_quantity: Quantity,
        fee: Decimal,
    ) -> Result<EngineDecision, EngineError> {
        let (intent_id, requested_qty) = match &position.state {
            PositionState::Entering { intent_id, requested_qty, .. } => {
                (*intent_id, *requested_qty)
            },
            // Idempotent replay after the transition already happened
            PositionState::Active { .. } => {
                debug!(position_id = %position.id, "Entry fill replayed on active position");
                return Ok(EngineDecision::no_action());
            },
            other => {
                return Err(EngineError::InvalidPositionState {
                    expected: "entering".to_string(),
                    actual: other.name().to_string(),
                });
            },
        };

        // Entry is complete when cumulative fill is within tolerance of the
        // request, or the exchange reported order-level Filled (the caller
        // only invokes this on that condition).
        let tolerance =
            requested_qty.as_decimal() * self.fill_tolerance_pct / Decimal::from(100);
        if filled_quantity.as_decimal() < requested_qty.as_decimal() - tolerance {
            debug!(
                position_id = %position.id,
                requested = %requested_qty,
                filled = %filled_quantity,
                "Entry fill below tolerance, accepting exchange-reported fill"
            );
        }

        // Initial stop: fill ∓ distance, rounded toward entry on the tick grid
        let raw_stop = position
            .tech_stop_distance
            .trailing_stop_for(position.side, fill_price);
        let initial_stop = Price::from(
            position
                .filters
                .round_stop_to_tick(raw_stop.as_decimal(), position.side),
        );

        debug!(
            position_id = %position.id,
            fill_price = %fill_price,
            filled_quantity = %filled_quantity,
            initial_stop = %initial_stop,
            "Entry filled, position now active"
        );

        let event = Event::EntryFilled {
            position_id: position.id,
            intent_id,
            fill_price,
            filled_quantity,
            fee,
            initial_stop,
            timestamp: Utc::now(),
        };
        let updated = position.apply(&event)?;

        let mut actions = vec![EngineAction::EmitEvent(event)];

        if self.insurance.enabled {
            let (stop_price, limit_price) =
                self.insurance.prices_for(position.side, initial_stop);
            actions.push(EngineAction::PlaceInsuranceStop {
                position_id: position.id,
                symbol: position.symbol.clone(),
                side: position.side.exit_action(),
                quantity: filled_quantity,
                stop_price,
                limit_price,
            });
        }

        Ok(EngineDecision::with_position(actions, updated))
    }

    // =========================================================================
    // Active: trailing stop
    // =========================================================================

    /// Process a tick for an Active position.
    ///
    /// Exit beats update: a price that gaps through both the stop and a new
    /// extreme triggers the exit, never a trail.
    pub fn process_tick(
        &self,
        position: &Position,
        tick: &Tick,
    ) -> Result<TickOutcome, EngineError> {
        let (trailing_stop, favorable_extreme, insurance_stop_id) = match &position.state {
            PositionState::Active {
                trailing_stop,
                favorable_extreme,
                insurance_stop_id,
                ..
            } => (*trailing_stop, *favorable_extreme, insurance_stop_id.clone()),
            other => {
                return Err(EngineError::InvalidPositionState {
                    expected: "active".to_string(),
                    actual: other.name().to_string(),
                });
            },
        };

        if position.symbol != tick.symbol {
            return Err(EngineError::InvalidMarketData(format!(
                "symbol mismatch: position={}, tick={}",
                position.symbol, tick.symbol
            )));
        }

        let price = tick.last_price;
        let distance = &position.tech_stop_distance;

        // 1. Exit check first
        if distance.is_stop_breached(position.side, price, trailing_stop) {
            debug!(
                position_id = %position.id,
                last_price = %price,
                trailing_stop = %trailing_stop,
                "Trailing stop breached"
            );
            return Ok(TickOutcome::StopBreached {
                trigger_price: price,
                stop_price: trailing_stop,
            });
        }

        // 2. Trail check: a new favorable extreme moves the stop
        let is_new_extreme = match position.side {
            Side::Long => price.as_decimal() > favorable_extreme.as_decimal(),
            Side::Short => price.as_decimal() < favorable_extreme.as_decimal(),
        };

        if !is_new_extreme {
            return Ok(TickOutcome::NoAction);
        }

        let raw = distance.trailing_stop_for(position.side, price);
        let new_stop = Price::from(
            position.filters.round_stop_to_tick(raw.as_decimal(), position.side),
        );

        // Monotone: never loosen (tick rounding can produce an equal stop)
        let more_favorable = match position.side {
            Side::Long => new_stop.as_decimal() > trailing_stop.as_decimal(),
            Side::Short => new_stop.as_decimal() < trailing_stop.as_decimal(),
        };
        if !more_favorable {
            return Ok(TickOutcome::NoAction);
        }

        debug!(
            position_id = %position.id,
            last_price = %price,
            old_stop = %trailing_stop,
            new_stop = %new_stop,
            "Trailing stop advanced"
        );

        let event = Event::TrailingStopUpdated {
            position_id: position.id,
            previous_stop: trailing_stop,
            new_stop,
            trigger_price: price,
            timestamp: tick.timestamp,
        };
        let updated = position.apply(&event)?;

        let mut actions = vec![EngineAction::EmitEvent(event)];

        // Insurance follows the trail: cancel-then-replace strictly wider
        // than the new local stop. Degraded insurance never blocks the trail.
        if self.insurance.enabled {
            if let Some(exchange_order_id) = insurance_stop_id {
                actions.push(EngineAction::CancelInsuranceStop {
                    position_id: position.id,
                    exchange_order_id,
                });
            }
            if let Some(quantity) = position.quantity {
                let (stop_price, limit_price) =
                    self.insurance.prices_for(position.side, new_stop);
                actions.push(EngineAction::PlaceInsuranceStop {
                    position_id: position.id,
                    symbol: position.symbol.clone(),
                    side: position.side.exit_action(),
                    quantity,
                    stop_price,
                    limit_price,
                });
            }
        }

        Ok(TickOutcome::StopAdvanced(EngineDecision::with_position(actions, updated)))
    }

    // =========================================================================
    // Exit
    // =========================================================================

    /// Request the exit of an Active position (stop breach or panic).
    pub fn decide_exit(
        &self,
        position: &Position,
        reason: ExitReason,
        trigger_price: Price,
        intent_id: IntentId,
    ) -> Result<EngineDecision, EngineError> {
        let (trailing_stop, insurance_stop_id) = match &position.state {
            PositionState::Active {
                trailing_stop,
                insurance_stop_id,
                ..
            } => (*trailing_stop, insurance_stop_id.clone()),
            // Already on its way out; don't double-request
            PositionState::Exiting { .. } => {
                debug!(position_id = %position.id, "Exit already requested, ignoring");
                return Ok(EngineDecision::no_action());
            },
            other => {
                return Err(EngineError::InvalidPositionState {
                    expected: "active".to_string(),
                    actual: other.name().to_string(),
                });
            },
        };

        let quantity = position.quantity.ok_or_else(|| {
            EngineError::InvalidPositionState {
                expected: "active with quantity".to_string(),
                actual: "active without quantity".to_string(),
            }
        })?;

        let event = Event::ExitRequested {
            position_id: position.id,
            intent_id,
            reason,
            trigger_price,
            stop_price: trailing_stop,
            timestamp: Utc::now(),
        };
        let updated = position.apply(&event)?;

        let mut actions = Vec::with_capacity(3);

        if let Some(exchange_order_id) = insurance_stop_id {
            actions.push(EngineAction::CancelInsuranceStop {
                position_id: position.id,
                exchange_order_id,
            });
        }

        actions.push(EngineAction::EmitEvent(event));
        actions.push(EngineAction::PlaceExitOrder {
            position_id: position.id,
            intent_id,
            symbol: position.symbol.clone(),
            side: position.side.exit_action(),
            quantity,
            client_order_id: ClientOrderId::core(intent_id),
            reason,
        });

        Ok(EngineDecision::with_position(actions, updated))
    }

    /// Process the exit fill: Exiting → Closed with realized PnL.
    ///
    /// ```text
    /// realized_pnl = (exit − entry) × quantity × side_sign − Σ fees
    /// ```
    pub fn process_exit_fill(
        &self,
        position: &Position,
        fill_price: Price,
        filled_quantity: Quantity,
        fee: Decimal,
    ) -> Result<EngineDecision, EngineError> {
        let (intent_id, exit_reason) = match &position.state {
            PositionState::Exiting { intent_id, exit_reason, .. } => (*intent_id, *exit_reason),
            PositionState::Closed { .. } => {
                debug!(position_id = %position.id, "Exit fill replayed on closed position");
                return Ok(EngineDecision::no_action());
            },
            other => {
                return Err(EngineError::InvalidPositionState {
                    expected: "exiting".to_string(),
                    actual: other.name().to_string(),
                });
            },
        };

        let entry_price = position.entry_price.ok_or_else(|| {
            EngineError::InvalidPositionState {
                expected: "exiting with entry price".to_string(),
                actual: "exiting without entry price".to_string(),
            }
        })?;

        let total_fees = position.fees_paid + fee;
        let gross = (fill_price.as_decimal() - entry_price.as_decimal())
            * filled_quantity.as_decimal()
            * position.side.sign();
        let realized_pnl = gross - total_fees;

        let fill_event = Event::ExitFilled {
            position_id: position.id,
            intent_id,
            fill_price,
            filled_quantity,
            fee,
            timestamp: Utc::now(),
        };
        let closed_event = Event::PositionClosed {
            position_id: position.id,
            exit_reason,
            entry_price,
            exit_price: fill_price,
            realized_pnl,
            total_fees,
            timestamp: Utc::now(),
        };

        let updated = position.apply(&fill_event)?.apply(&closed_event)?;

        debug!(
            position_id = %position.id,
            exit_price = %fill_price,
            realized_pnl = %realized_pnl,
            "Position closed"
        );

        let actions = vec![
            EngineAction::EmitEvent(fill_event),
            EngineAction::EmitEvent(closed_event),
        ];

        Ok(EngineDecision::with_position(actions, updated))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use marlim_domain::{RiskConfig, SymbolFilters, TechStopDistance};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn engine() -> Engine {
        Engine::default_paper()
    }

    fn engine_with_insurance() -> Engine {
        Engine::new(InsurancePolicy::enabled(dec!(0.2)), dec!(0.5))
    }

    fn armed_position(side: Side, distance: Decimal) -> Position {
        Position::arm(
            Uuid::now_v7(),
            Symbol::from_pair("BTCUSDT").unwrap(),
            side,
            RiskConfig::new(dec!(10000), dec!(1)).unwrap(),
            TechStopDistance::new(distance).unwrap(),
            SymbolFilters::new(dec!(0.01), dec!(0.001)).unwrap(),
        )
        .unwrap()
    }

    fn signal_for(position: &Position, price: Decimal) -> EntrySignal {
        EntrySignal::new(
            position.id,
            position.symbol.clone(),
            position.side,
            Price::new(price).unwrap(),
        )
    }

    /// Armed → Entering → Active helper
    fn active_position(side: Side, distance: Decimal, entry: Decimal) -> Position {
        let e = engine();
        let armed = armed_position(side, distance);
        let signal = signal_for(&armed, entry);
        let entering = e
            .decide_entry(&armed, &signal, Uuid::now_v7())
            .unwrap()
            .updated_position
            .unwrap();
        let qty = match &entering.state {
            PositionState::Entering { requested_qty, .. } => *requested_qty,
            _ => unreachable!(),
        };
        e.process_entry_fill(&entering, Price::new(entry).unwrap(), qty, dec!(0))
            .unwrap()
            .updated_position
            .unwrap()
    }

    fn tick(price: Decimal) -> Tick {
        Tick::new(Symbol::from_pair("BTCUSDT").unwrap(), Price::new(price).unwrap())
    }

    // =========================================================================
    // Entry
    // =========================================================================

    #[test]
    fn test_decide_entry_long() {
        let e = engine();
        let position = armed_position(Side::Long, dec!(500));
        let signal = signal_for(&position, dec!(100000));

        let decision = e.decide_entry(&position, &signal, Uuid::now_v7()).unwrap();

        assert_eq!(decision.actions.len(), 2);
        match &decision.actions[1] {
            EngineAction::PlaceEntryOrder { side, quantity, client_order_id, .. } => {
                assert_eq!(*side, OrderSide::Buy);
                // $100 risk / $500 distance = 0.2
                assert_eq!(quantity.as_decimal(), dec!(0.200));
                assert!(client_order_id.as_str().starts_with("core_"));
            },
            other => panic!("expected PlaceEntryOrder, got {:?}", other),
        }

        let updated = decision.updated_position.unwrap();
        assert_eq!(updated.state.name(), "entering");
    }

    #[test]
    fn test_decide_entry_short_sells() {
        let e = engine();
        let position = armed_position(Side::Short, dec!(500));
        let signal = signal_for(&position, dec!(100000));

        let decision = e.decide_entry(&position, &signal, Uuid::now_v7()).unwrap();

        let has_sell = decision.actions.iter().any(|a| {
            matches!(a, EngineAction::PlaceEntryOrder { side: OrderSide::Sell, .. })
        });
        assert!(has_sell);
    }

    #[test]
    fn test_decide_entry_duplicate_signal_is_noop() {
        let e = engine();
        let position = armed_position(Side::Long, dec!(500));
        let signal = signal_for(&position, dec!(100000));

        let first = e.decide_entry(&position, &signal, Uuid::now_v7()).unwrap();
        let entering = first.updated_position.unwrap();

        // Same correlation id again: no second intent
        let second = e.decide_entry(&entering, &signal, Uuid::now_v7()).unwrap();
        assert!(!second.has_actions());
        assert!(second.updated_position.is_none());
    }

    #[test]
    fn test_decide_entry_rejects_active() {
        let e = engine();
        let position = active_position(Side::Long, dec!(500), dec!(100000));
        let signal = signal_for(&position, dec!(100000));

        let result = e.decide_entry(&position, &signal, Uuid::now_v7());
        assert!(matches!(
            result,
            Err(EngineError::InvalidPositionState { .. })
        ));
    }

    #[test]
    fn test_decide_entry_rejects_out_of_bounds_distance() {
        let e = engine();
        // Distance $500 on a $1,000 price is 50%, way past the 10% bound
        let position = armed_position(Side::Long, dec!(500));
        let signal = signal_for(&position, dec!(1000));

        assert!(e.decide_entry(&position, &signal, Uuid::now_v7()).is_err());
    }

    #[test]
    fn test_entry_fill_initializes_stop() {
        let position = active_position(Side::Long, dec!(500), dec!(100000));

        match &position.state {
            PositionState::Active {
                trailing_stop,
                favorable_extreme,
                ..
            } => {
                assert_eq!(trailing_stop.as_decimal(), dec!(99500.00));
                assert_eq!(favorable_extreme.as_decimal(), dec!(100000));
            },
            other => panic!("expected Active, got {:?}", other.name()),
        }
        assert_eq!(position.entry_price.unwrap().as_decimal(), dec!(100000));
    }

    #[test]
    fn test_entry_fill_short_stop_above() {
        let position = active_position(Side::Short, dec!(500), dec!(100000));
        assert_eq!(position.trailing_stop().unwrap().as_decimal(), dec!(100500.00));
    }

    #[test]
    fn test_entry_fill_replay_is_noop() {
        let e = engine();
        let position = active_position(Side::Long, dec!(500), dec!(100000));

        let replay = e
            .process_entry_fill(
                &position,
                Price::new(dec!(100000)).unwrap(),
                Quantity::new(dec!(0.2)).unwrap(),
                dec!(0),
            )
            .unwrap();
        assert!(!replay.has_actions());
    }

    #[test]
    fn test_entry_fill_places_insurance_when_enabled() {
        let e = engine_with_insurance();
        let armed = armed_position(Side::Long, dec!(500));
        let signal = signal_for(&armed, dec!(100000));
        let entering = e
            .decide_entry(&armed, &signal, Uuid::now_v7())
            .unwrap()
            .updated_position
            .unwrap();

        let decision = e
            .process_entry_fill(
                &entering,
                Price::new(dec!(100000)).unwrap(),
                Quantity::new(dec!(0.2)).unwrap(),
                dec!(0),
            )
            .unwrap();

        let insurance = decision.actions.iter().find_map(|a| match a {
            EngineAction::PlaceInsuranceStop { stop_price, .. } => Some(*stop_price),
            _ => None,
        });

        // Strictly wider than the local stop of 99,500
        let stop = insurance.expect("insurance stop expected");
        assert!(stop.as_decimal() < dec!(99500));
    }

    // =========================================================================
    // Trailing
    // =========================================================================

    #[test]
    fn test_tick_no_action_when_stable() {
        let e = engine();
        let position = active_position(Side::Long, dec!(500), dec!(100000));

        let outcome = e.process_tick(&position, &tick(dec!(100000))).unwrap();
        assert!(matches!(outcome, TickOutcome::NoAction));
    }

    #[test]
    fn test_tick_advances_stop_on_new_high() {
        let e = engine();
        let position = active_position(Side::Long, dec!(500), dec!(100000));

        let outcome = e.process_tick(&position, &tick(dec!(101000))).unwrap();

        match outcome {
            TickOutcome::StopAdvanced(decision) => {
                let updated = decision.updated_position.unwrap();
                assert_eq!(updated.trailing_stop().unwrap().as_decimal(), dec!(100500.00));
            },
            other => panic!("expected StopAdvanced, got {:?}", other),
        }
    }

    #[test]
    fn test_tick_pullback_does_not_move_stop() {
        let e = engine();
        let position = active_position(Side::Long, dec!(500), dec!(100000));

        // Up to 101k, then back to 100.8k: stop stays at 100.5k
        let advanced = match e.process_tick(&position, &tick(dec!(101000))).unwrap() {
            TickOutcome::StopAdvanced(d) => d.updated_position.unwrap(),
            other => panic!("expected StopAdvanced, got {:?}", other),
        };

        let outcome = e.process_tick(&advanced, &tick(dec!(100800))).unwrap();
        assert!(matches!(outcome, TickOutcome::NoAction));
        assert_eq!(advanced.trailing_stop().unwrap().as_decimal(), dec!(100500.00));
    }

    #[test]
    fn test_tick_breach_triggers_exit() {
        let e = engine();
        let position = active_position(Side::Long, dec!(500), dec!(100000));

        let advanced = match e.process_tick(&position, &tick(dec!(101000))).unwrap() {
            TickOutcome::StopAdvanced(d) => d.updated_position.unwrap(),
            other => panic!("expected StopAdvanced, got {:?}", other),
        };

        let outcome = e.process_tick(&advanced, &tick(dec!(100400))).unwrap();
        match outcome {
            TickOutcome::StopBreached { trigger_price, stop_price } => {
                assert_eq!(trigger_price.as_decimal(), dec!(100400));
                assert_eq!(stop_price.as_decimal(), dec!(100500.00));
            },
            other => panic!("expected StopBreached, got {:?}", other),
        }
    }

    #[test]
    fn test_exit_beats_update_on_gap() {
        let e = engine();
        let position = active_position(Side::Long, dec!(500), dec!(100000));

        // A crash below the stop is a breach even though it is also "new data"
        let outcome = e.process_tick(&position, &tick(dec!(99000))).unwrap();
        assert!(matches!(outcome, TickOutcome::StopBreached { .. }));
    }

    #[test]
    fn test_short_trailing_mirror() {
        let e = engine();
        let position = active_position(Side::Short, dec!(500), dec!(100000));

        // New low advances the stop down
        let advanced = match e.process_tick(&position, &tick(dec!(99000))).unwrap() {
            TickOutcome::StopAdvanced(d) => d.updated_position.unwrap(),
            other => panic!("expected StopAdvanced, got {:?}", other),
        };
        assert_eq!(advanced.trailing_stop().unwrap().as_decimal(), dec!(99500.00));

        // Price rising to the stop breaches
        let outcome = e.process_tick(&advanced, &tick(dec!(99500))).unwrap();
        assert!(matches!(outcome, TickOutcome::StopBreached { .. }));
    }

    #[test]
    fn test_trailing_distance_is_constant() {
        // The gap between extreme and stop is exactly the distance
        let e = engine();
        let mut position = active_position(Side::Long, dec!(500), dec!(100000));

        for price in [dec!(100500), dec!(101000), dec!(102000), dec!(105000)] {
            if let TickOutcome::StopAdvanced(d) = e.process_tick(&position, &tick(price)).unwrap()
            {
                position = d.updated_position.unwrap();
            }
            if let PositionState::Active {
                trailing_stop,
                favorable_extreme,
                ..
            } = &position.state
            {
                assert_eq!(
                    favorable_extreme.as_decimal() - trailing_stop.as_decimal(),
                    dec!(500.00)
                );
            }
        }
    }

    #[test]
    fn test_trail_replaces_insurance() {
        let e = engine_with_insurance();
        let armed = armed_position(Side::Long, dec!(500));
        let signal = signal_for(&armed, dec!(100000));
        let entering = e
            .decide_entry(&armed, &signal, Uuid::now_v7())
            .unwrap()
            .updated_position
            .unwrap();
        let fill = e
            .process_entry_fill(
                &entering,
                Price::new(dec!(100000)).unwrap(),
                Quantity::new(dec!(0.2)).unwrap(),
                dec!(0),
            )
            .unwrap();

        // Simulate the executor having rested the insurance stop
        let mut active = fill.updated_position.unwrap();
        active = active
            .apply(&Event::InsuranceStopPlaced {
                position_id: active.id,
                exchange_order_id: "EX-9".to_string(),
                stop_price: Price::new(dec!(99301)).unwrap(),
                limit_price: Price::new(dec!(99201)).unwrap(),
                timestamp: Utc::now(),
            })
            .unwrap();

        let outcome = e.process_tick(&active, &tick(dec!(101000))).unwrap();
        let decision = match outcome {
            TickOutcome::StopAdvanced(d) => d,
            other => panic!("expected StopAdvanced, got {:?}", other),
        };

        let has_cancel = decision.actions.iter().any(|a| {
            matches!(a, EngineAction::CancelInsuranceStop { exchange_order_id, .. } if exchange_order_id == "EX-9")
        });
        let has_replace = decision
            .actions
            .iter()
            .any(|a| matches!(a, EngineAction::PlaceInsuranceStop { .. }));
        assert!(has_cancel && has_replace);
    }

    // =========================================================================
    // Exit
    // =========================================================================

    #[test]
    fn test_decide_exit_and_fill() {
        let e = engine();
        let position = active_position(Side::Long, dec!(500), dec!(100000));

        let intent_id = Uuid::now_v7();
        let decision = e
            .decide_exit(
                &position,
                ExitReason::TrailingStop,
                Price::new(dec!(99500)).unwrap(),
                intent_id,
            )
            .unwrap();

        let exiting = decision.updated_position.unwrap();
        assert_eq!(exiting.state.name(), "exiting");

        let has_order = decision.actions.iter().any(|a| {
            matches!(a, EngineAction::PlaceExitOrder { side: OrderSide::Sell, .. })
        });
        assert!(has_order);

        // Fill at the trigger: PnL = (99500 − 100000) × 0.2 − 0 = −100
        let closed = e
            .process_exit_fill(
                &exiting,
                Price::new(dec!(99500)).unwrap(),
                Quantity::new(dec!(0.200)).unwrap(),
                dec!(0),
            )
            .unwrap()
            .updated_position
            .unwrap();

        assert_eq!(closed.state.name(), "closed");
        assert_eq!(closed.realized_pnl, dec!(-100.0000));
    }

    #[test]
    fn test_exit_pnl_with_fees() {
        // realized = (exit − entry) × qty × sign − total fees
        let e = engine();
        let armed = armed_position(Side::Long, dec!(500));
        let signal = signal_for(&armed, dec!(100000));
        let entering = e
            .decide_entry(&armed, &signal, Uuid::now_v7())
            .unwrap()
            .updated_position
            .unwrap();
        let active = e
            .process_entry_fill(
                &entering,
                Price::new(dec!(100000)).unwrap(),
                Quantity::new(dec!(0.200)).unwrap(),
                dec!(10),
            )
            .unwrap()
            .updated_position
            .unwrap();

        let exiting = e
            .decide_exit(
                &active,
                ExitReason::TrailingStop,
                Price::new(dec!(100400)).unwrap(),
                Uuid::now_v7(),
            )
            .unwrap()
            .updated_position
            .unwrap();

        let closed = e
            .process_exit_fill(
                &exiting,
                Price::new(dec!(100400)).unwrap(),
                Quantity::new(dec!(0.200)).unwrap(),
                dec!(10),
            )
            .unwrap()
            .updated_position
            .unwrap();

        // gross 400 × 0.2 = 80, fees 20 → 60
        assert_eq!(closed.realized_pnl, dec!(60.0000));
        assert_eq!(closed.fees_paid, dec!(20));
    }

    #[test]
    fn test_exit_short_pnl_sign() {
        let e = engine();
        let position = active_position(Side::Short, dec!(500), dec!(2000));

        let exiting = e
            .decide_exit(
                &position,
                ExitReason::OperatorPanic,
                Price::new(dec!(1900)).unwrap(),
                Uuid::now_v7(),
            )
            .unwrap()
            .updated_position
            .unwrap();

        let qty = position.quantity.unwrap();
        let closed = e
            .process_exit_fill(&exiting, Price::new(dec!(1900)).unwrap(), qty, dec!(0))
            .unwrap()
            .updated_position
            .unwrap();

        // Short profits when price falls: (1900 − 2000) × qty × (−1) > 0
        assert!(closed.realized_pnl > Decimal::ZERO);
    }

    #[test]
    fn test_decide_exit_twice_is_noop() {
        let e = engine();
        let position = active_position(Side::Long, dec!(500), dec!(100000));

        let exiting = e
            .decide_exit(
                &position,
                ExitReason::TrailingStop,
                Price::new(dec!(99500)).unwrap(),
                Uuid::now_v7(),
            )
            .unwrap()
            .updated_position
            .unwrap();

        let again = e
            .decide_exit(
                &exiting,
                ExitReason::OperatorPanic,
                Price::new(dec!(99400)).unwrap(),
                Uuid::now_v7(),
            )
            .unwrap();
        assert!(!again.has_actions());
    }

    #[test]
    fn test_exit_cancels_insurance_first() {
        let e = engine_with_insurance();
        let mut position = active_position(Side::Long, dec!(500), dec!(100000));
        position = position
            .apply(&Event::InsuranceStopPlaced {
                position_id: position.id,
                exchange_order_id: "EX-7".to_string(),
                stop_price: Price::new(dec!(99301)).unwrap(),
                limit_price: Price::new(dec!(99201)).unwrap(),
                timestamp: Utc::now(),
            })
            .unwrap();

        let decision = e
            .decide_exit(
                &position,
                ExitReason::TrailingStop,
                Price::new(dec!(99500)).unwrap(),
                Uuid::now_v7(),
            )
            .unwrap();

        // Cancel comes before the exit order
        assert!(matches!(
            decision.actions[0],
            EngineAction::CancelInsuranceStop { .. }
        ));
    }

    // =========================================================================
    // Full happy-path numbers driven through the pure engine
    // =========================================================================

    #[test]
    fn test_happy_path_long_spec_numbers() {
        let e = engine();
        let armed = armed_position(Side::Long, dec!(500));
        let signal = signal_for(&armed, dec!(100000));

        let entering = e
            .decide_entry(&armed, &signal, Uuid::now_v7())
            .unwrap()
            .updated_position
            .unwrap();

        let mut position = e
            .process_entry_fill(
                &entering,
                Price::new(dec!(100000)).unwrap(),
                Quantity::new(dec!(0.200)).unwrap(),
                dec!(0),
            )
            .unwrap()
            .updated_position
            .unwrap();

        assert_eq!(position.trailing_stop().unwrap().as_decimal(), dec!(99500.00));

        // Ticks: 100500, 101000, 100800, 100600; stop peaks at 100500
        let mut breach = None;
        for price in [dec!(100500), dec!(101000), dec!(100800), dec!(100600), dec!(100400)] {
            match e.process_tick(&position, &tick(price)).unwrap() {
                TickOutcome::StopAdvanced(d) => position = d.updated_position.unwrap(),
                TickOutcome::StopBreached { trigger_price, .. } => {
                    breach = Some(trigger_price);
                    break;
                },
                TickOutcome::NoAction => {},
            }
        }

        // First tick at or below 100,500 triggers
        assert_eq!(breach.unwrap().as_decimal(), dec!(100400));
        assert_eq!(position.trailing_stop().unwrap().as_decimal(), dec!(100500.00));

        let exiting = e
            .decide_exit(
                &position,
                ExitReason::TrailingStop,
                Price::new(dec!(100400)).unwrap(),
                Uuid::now_v7(),
            )
            .unwrap()
            .updated_position
            .unwrap();

        let closed = e
            .process_exit_fill(
                &exiting,
                Price::new(dec!(100400)).unwrap(),
                Quantity::new(dec!(0.200)).unwrap(),
                dec!(0),
            )
            .unwrap()
            .updated_position
            .unwrap();

        // (100400 − 100000) × 0.2 = +80
        assert_eq!(closed.realized_pnl, dec!(80.0000));
    }
}
