//! Domain entities for Marlim.
//!
//! Core business entities with identity and lifecycle.

use crate::value_objects::{
    ClientOrderId, DomainError, OrderSide, Price, Quantity, RiskConfig, Side, Symbol,
    SymbolFilters, TechStopDistance,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a Position
pub type PositionId = Uuid;

/// Unique identifier for an Order
pub type OrderId = Uuid;

/// Unique identifier for an Intent
pub type IntentId = Uuid;

/// Unique identifier for an Account
pub type AccountId = Uuid;

/// Correlation identifier of an entry signal
pub type SignalId = Uuid;

// =============================================================================
// Position
// =============================================================================

/// Position is the unit of ownership for one directional exposure in one
/// symbol on one account.
///
/// Key concepts:
/// - No stop-gain: exit happens when the trailing stop is hit
/// - The trailing distance is fixed at 1x the technical stop distance
/// - Isolated margin, **fixed 10x leverage** (implicit in sizing)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub account_id: AccountId,
    pub symbol: Symbol,
    pub side: Side,
    pub state: PositionState,

    // Sizing inputs, fixed at arm time
    pub risk_config: RiskConfig,
    pub tech_stop_distance: TechStopDistance,
    /// Distance as % of entry; set when the entry fills
    pub tech_stop_distance_pct: Option<Decimal>,
    pub filters: SymbolFilters,

    // Entry
    pub entry_price: Option<Price>,
    pub entry_filled_at: Option<DateTime<Utc>>,
    pub quantity: Option<Quantity>,

    // P&L tracking
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,

    // Associated orders
    pub entry_order_id: Option<String>,
    pub exit_order_id: Option<String>,
    /// Exchange-assigned id of the resting insurance stop, if any
    pub insurance_stop_id: Option<String>,
    /// Exchange position handle, once known
    pub exchange_position_id: Option<String>,

    // Audit
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Create a new armed position.
    ///
    /// Validates the arm-time invariants: positive stop distance and a
    /// risk budget able to buy at least one quantity step at that distance.
    pub fn arm(
        account_id: AccountId,
        symbol: Symbol,
        side: Side,
        risk_config: RiskConfig,
        tech_stop_distance: TechStopDistance,
        filters: SymbolFilters,
    ) -> Result<Self, DomainError> {
        // A budget that floors to zero steps can never enter.
        let raw = risk_config.max_risk_amount() / tech_stop_distance.distance();
        if filters.floor_to_step(raw) <= Decimal::ZERO {
            return Err(DomainError::InsufficientCapital(format!(
                "risk budget {} cannot cover one step of {} at distance {}",
                risk_config.max_risk_amount(),
                filters.step_size,
                tech_stop_distance.distance(),
            )));
        }

        let now = Utc::now();
        Ok(Self {
            id: Uuid::now_v7(),
            account_id,
            symbol,
            side,
            state: PositionState::Armed,
            risk_config,
            tech_stop_distance,
            tech_stop_distance_pct: None,
            filters,
            entry_price: None,
            entry_filled_at: None,
            quantity: None,
            realized_pnl: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            entry_order_id: None,
            exit_order_id: None,
            insurance_stop_id: None,
            exchange_position_id: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        })
    }

    /// Check if position can enter (is Armed)
    pub fn can_enter(&self) -> bool {
        matches!(self.state, PositionState::Armed)
    }

    /// Check if position can exit (is Active)
    pub fn can_exit(&self) -> bool {
        matches!(self.state, PositionState::Active { .. })
    }

    /// Check if position reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, PositionState::Closed { .. } | PositionState::Error { .. })
    }

    /// States that still need an engine task: Armed, Entering, Active, Exiting
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Current trailing stop (only meaningful while Active)
    pub fn trailing_stop(&self) -> Option<Price> {
        match &self.state {
            PositionState::Active { trailing_stop, .. } => Some(*trailing_stop),
            _ => None,
        }
    }

    /// Unrealized PnL while Active, realized PnL once Closed.
    pub fn pnl(&self) -> Decimal {
        let entry = match self.entry_price {
            Some(p) => p.as_decimal(),
            None => return Decimal::ZERO,
        };

        match &self.state {
            PositionState::Active { current_price, .. } => {
                let qty = self.quantity.map(|q| q.as_decimal()).unwrap_or(Decimal::ZERO);
                (current_price.as_decimal() - entry) * qty * self.side.sign()
            },
            PositionState::Closed { realized_pnl, .. } => *realized_pnl,
            _ => Decimal::ZERO,
        }
    }
}

// =============================================================================
// Position sizing (the golden rule)
// =============================================================================

/// Calculate position size from the risk budget and stop distance.
///
/// **THE GOLDEN RULE**: size is DERIVED from the technical stop distance.
///
/// ```text
/// Position Size = floor_to_step( (Capital × Risk%) / Stop Distance )
/// ```
///
/// Wide stop → smaller size. Tight stop → larger size. The amount at risk
/// stays constant at the configured fraction of capital; flooring to the
/// exchange step only ever shrinks it.
///
/// # Example
///
/// ```
/// # use marlim_domain::value_objects::{RiskConfig, SymbolFilters, TechStopDistance};
/// # use marlim_domain::entities::calculate_position_size;
/// # use rust_decimal_macros::dec;
/// let risk = RiskConfig::new(dec!(10000), dec!(1)).unwrap();
/// let distance = TechStopDistance::new(dec!(500)).unwrap();
/// let filters = SymbolFilters::new(dec!(0.01), dec!(0.001)).unwrap();
///
/// let qty = calculate_position_size(&risk, &distance, &filters).unwrap();
/// // $100 risk / $500 distance = 0.2
/// assert_eq!(qty.as_decimal(), dec!(0.200));
/// ```
pub fn calculate_position_size(
    risk_config: &RiskConfig,
    distance: &TechStopDistance,
    filters: &SymbolFilters,
) -> Result<Quantity, DomainError> {
    let raw = risk_config.max_risk_amount() / distance.distance();
    let floored = filters.floor_to_step(raw);

    if floored <= Decimal::ZERO {
        return Err(DomainError::InsufficientCapital(format!(
            "risk budget {} yields zero steps at distance {}",
            risk_config.max_risk_amount(),
            distance.distance(),
        )));
    }

    Quantity::new(floored).map_err(|e| DomainError::SizingError(e.to_string()))
}

/// Notional value of a position: quantity × entry price
pub fn notional_value(quantity: Quantity, entry_price: Price) -> Decimal {
    quantity.as_decimal() * entry_price.as_decimal()
}

/// Margin required at fixed leverage: notional / 10
pub fn margin_required(quantity: Quantity, entry_price: Price) -> Decimal {
    notional_value(quantity, entry_price) / Decimal::from(RiskConfig::LEVERAGE)
}

// =============================================================================
// Position state machine
// =============================================================================

/// Position state machine with trailing-stop tracking.
///
/// ```text
/// Armed ── signal ──▶ Entering ── fill ──▶ Active ── stop hit ──▶ Exiting ── fill ──▶ Closed
///   │                    │                   │ tick                  │
///   └─ disarm ─▶ Closed  └─▶ Error           └─▶ Active (trail)      └─▶ Error
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PositionState {
    /// Armed and sized, waiting for an entry signal
    Armed,

    /// Entry intent issued, waiting for the fill
    Entering {
        /// Intent that owns the entry order (also its client_order_id)
        intent_id: IntentId,
        /// Signal that triggered the entry, for idempotency
        signal_id: SignalId,
        /// Requested quantity
        requested_qty: Quantity,
        /// Price observed when the signal fired
        expected_entry: Price,
    },

    /// Position open, the local monitor trails the stop
    Active {
        /// Last trade price seen
        current_price: Price,
        /// Current trailing stop
        trailing_stop: Price,
        /// Peak (Long) or trough (Short) observed since entry
        favorable_extreme: Price,
        /// When the extreme was reached
        extreme_at: DateTime<Utc>,
        /// Exchange id of the resting insurance stop, if enabled
        insurance_stop_id: Option<String>,
    },

    /// Exit intent issued, waiting for the fill
    Exiting {
        /// Intent that owns the exit order
        intent_id: IntentId,
        /// Why the exit was requested
        exit_reason: ExitReason,
        /// Price that breached the stop (or panic price)
        trigger_price: Price,
    },

    /// Terminal: position closed, PnL realized
    Closed {
        /// Fill price of the exit order; None when disarmed before entry
        exit_price: Option<Price>,
        realized_pnl: Decimal,
        exit_reason: ExitReason,
    },

    /// Terminal: requires operator review; the reconciler may recover it
    Error { error: String, recoverable: bool },
}

impl PositionState {
    /// Lowercase state name for display and persistence
    pub fn name(&self) -> &'static str {
        match self {
            PositionState::Armed => "armed",
            PositionState::Entering { .. } => "entering",
            PositionState::Active { .. } => "active",
            PositionState::Exiting { .. } => "exiting",
            PositionState::Closed { .. } => "closed",
            PositionState::Error { .. } => "error",
        }
    }
}

/// Why a position was closed (or is closing)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Trailing stop breached (the normal exit)
    TrailingStop,
    /// Insurance stop on the exchange fired while the engine was away
    InsuranceStop,
    /// Operator panic command
    OperatorPanic,
    /// Disarmed before entering
    Disarmed,
    /// Closed during reconciliation
    Reconciled,
}

// =============================================================================
// Order
// =============================================================================

/// Order is an instruction sent to the exchange on behalf of a position.
///
/// Fill info is consolidated here; isolated-margin market orders usually
/// execute in a single fill, partial fills accumulate into filled_quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub position_id: PositionId,
    pub exchange_order_id: Option<String>,
    pub client_order_id: ClientOrderId,

    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Quantity,
    /// Limit price; None for market orders
    pub price: Option<Price>,
    /// Stop trigger price for stop-limit orders
    pub stop_price: Option<Price>,

    pub status: OrderStatus,

    pub filled_quantity: Option<Quantity>,
    pub fill_price: Option<Price>,
    pub filled_at: Option<DateTime<Utc>>,
    /// Fee normalized to the quote asset
    pub fee_paid: Option<Decimal>,

    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Create a new market order
    pub fn new_market(
        position_id: PositionId,
        symbol: Symbol,
        side: OrderSide,
        quantity: Quantity,
        client_order_id: ClientOrderId,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            position_id,
            exchange_order_id: None,
            client_order_id,
            symbol,
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            status: OrderStatus::Pending,
            filled_quantity: None,
            fill_price: None,
            filled_at: None,
            fee_paid: None,
            created_at: Utc::now(),
        }
    }

    /// Create a new stop-loss limit order (the insurance stop)
    pub fn new_stop_loss_limit(
        position_id: PositionId,
        symbol: Symbol,
        side: OrderSide,
        quantity: Quantity,
        stop_price: Price,
        limit_price: Price,
        client_order_id: ClientOrderId,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            position_id,
            exchange_order_id: None,
            client_order_id,
            symbol,
            side,
            order_type: OrderType::StopLossLimit,
            quantity,
            price: Some(limit_price),
            stop_price: Some(stop_price),
            status: OrderStatus::Pending,
            filled_quantity: None,
            fill_price: None,
            filled_at: None,
            fee_paid: None,
            created_at: Utc::now(),
        }
    }

    /// Mark as accepted by the exchange
    pub fn mark_submitted(&mut self, exchange_order_id: String) {
        self.exchange_order_id = Some(exchange_order_id);
        self.status = OrderStatus::Submitted;
    }

    /// Record a fill (full or the final partial).
    pub fn mark_filled(
        &mut self,
        fill_price: Price,
        filled_quantity: Quantity,
        fee: Decimal,
    ) -> Result<(), DomainError> {
        match self.status {
            OrderStatus::Pending | OrderStatus::Submitted | OrderStatus::Partial => {},
            _ => {
                return Err(DomainError::InvalidTransition {
                    state: format!("order:{:?}", self.status),
                    event: "fill".to_string(),
                });
            },
        }

        self.fill_price = Some(fill_price);
        self.filled_quantity = Some(filled_quantity);
        self.fee_paid = Some(fee);
        self.status = OrderStatus::Filled;
        self.filled_at = Some(Utc::now());

        Ok(())
    }

    pub fn is_filled(&self) -> bool {
        matches!(self.status, OrderStatus::Filled)
    }
}

/// Order types supported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Market order (immediate execution)
    Market,
    /// Limit order
    Limit,
    /// Stop-loss limit (insurance stop resting on the exchange)
    StopLossLimit,
}

/// Order status lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created locally, not sent yet
    Pending,
    /// Accepted by the exchange
    Submitted,
    /// Partially filled
    Partial,
    /// Completely filled
    Filled,
    /// Cancelled
    Cancelled,
    /// Rejected by the exchange
    Rejected,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_filters() -> SymbolFilters {
        SymbolFilters::new(dec!(0.01), dec!(0.001)).unwrap()
    }

    fn armed_position() -> Position {
        Position::arm(
            Uuid::now_v7(),
            Symbol::from_pair("BTCUSDT").unwrap(),
            Side::Long,
            RiskConfig::new(dec!(10000), dec!(1)).unwrap(),
            TechStopDistance::new(dec!(500)).unwrap(),
            test_filters(),
        )
        .unwrap()
    }

    #[test]
    fn test_position_arm() {
        let position = armed_position();

        assert_eq!(position.state.name(), "armed");
        assert!(position.can_enter());
        assert!(!position.can_exit());
        assert!(position.is_live());
    }

    #[test]
    fn test_position_arm_insufficient_capital() {
        // $1 budget at 1% is $0.01 risk; at distance $500 that floors to
        // zero steps.
        let result = Position::arm(
            Uuid::now_v7(),
            Symbol::from_pair("BTCUSDT").unwrap(),
            Side::Long,
            RiskConfig::new(dec!(1), dec!(1)).unwrap(),
            TechStopDistance::new(dec!(500)).unwrap(),
            test_filters(),
        );

        assert!(matches!(result, Err(DomainError::InsufficientCapital(_))));
    }

    #[test]
    fn test_calculate_position_size_spec_example() {
        // capital 10_000, risk 1%, distance 500 → 0.2
        let risk = RiskConfig::new(dec!(10000), dec!(1)).unwrap();
        let distance = TechStopDistance::new(dec!(500)).unwrap();

        let qty = calculate_position_size(&risk, &distance, &test_filters()).unwrap();
        assert_eq!(qty.as_decimal(), dec!(0.200));
    }

    #[test]
    fn test_calculate_position_size_floors_to_step() {
        // $100 / $1500 = 0.0666... floors to 0.066
        let risk = RiskConfig::new(dec!(10000), dec!(1)).unwrap();
        let distance = TechStopDistance::new(dec!(1500)).unwrap();

        let qty = calculate_position_size(&risk, &distance, &test_filters()).unwrap();
        assert_eq!(qty.as_decimal(), dec!(0.066));
    }

    #[test]
    fn test_position_sizing_risk_never_exceeds_budget() {
        // Flooring means the realized loss at the stop is at most the
        // configured risk amount, regardless of distance.
        let risk = RiskConfig::new(dec!(10000), dec!(1)).unwrap();

        for distance in [dec!(500), dec!(1000), dec!(1500), dec!(3000)] {
            let d = TechStopDistance::new(distance).unwrap();
            let qty = calculate_position_size(&risk, &d, &test_filters()).unwrap();
            let loss_at_stop = qty.as_decimal() * distance;
            assert!(loss_at_stop <= risk.max_risk_amount());
        }
    }

    #[test]
    fn test_margin_required() {
        let qty = Quantity::new(dec!(0.1)).unwrap();
        let price = Price::new(dec!(95000)).unwrap();

        // Notional $9,500 at 10x → $950
        assert_eq!(margin_required(qty, price), dec!(950));
    }

    #[test]
    fn test_order_market_creation() {
        let id = Uuid::now_v7();
        let order = Order::new_market(
            Uuid::now_v7(),
            Symbol::from_pair("BTCUSDT").unwrap(),
            OrderSide::Buy,
            Quantity::new(dec!(0.1)).unwrap(),
            ClientOrderId::core(id),
        );

        assert_eq!(order.order_type, OrderType::Market);
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.price.is_none());
        assert!(order.client_order_id.as_str().starts_with("core_"));
    }

    #[test]
    fn test_order_stop_loss_limit_creation() {
        let order = Order::new_stop_loss_limit(
            Uuid::now_v7(),
            Symbol::from_pair("BTCUSDT").unwrap(),
            OrderSide::Sell,
            Quantity::new(dec!(0.1)).unwrap(),
            Price::new(dec!(93500)).unwrap(),
            Price::new(dec!(93400)).unwrap(),
            ClientOrderId::core(Uuid::now_v7()),
        );

        assert_eq!(order.order_type, OrderType::StopLossLimit);
        assert_eq!(order.stop_price.unwrap().as_decimal(), dec!(93500));
        assert_eq!(order.price.unwrap().as_decimal(), dec!(93400));
    }

    #[test]
    fn test_order_fill_lifecycle() {
        let mut order = Order::new_market(
            Uuid::now_v7(),
            Symbol::from_pair("BTCUSDT").unwrap(),
            OrderSide::Buy,
            Quantity::new(dec!(0.1)).unwrap(),
            ClientOrderId::core(Uuid::now_v7()),
        );

        order.mark_submitted("12345".to_string());
        assert_eq!(order.status, OrderStatus::Submitted);

        order
            .mark_filled(
                Price::new(dec!(95000)).unwrap(),
                Quantity::new(dec!(0.1)).unwrap(),
                dec!(0.95),
            )
            .unwrap();

        assert!(order.is_filled());
        assert_eq!(order.fill_price.unwrap().as_decimal(), dec!(95000));

        // A second fill on a Filled order is a transition error
        let again = order.mark_filled(
            Price::new(dec!(95000)).unwrap(),
            Quantity::new(dec!(0.1)).unwrap(),
            dec!(0.95),
        );
        assert!(again.is_err());
    }
}
