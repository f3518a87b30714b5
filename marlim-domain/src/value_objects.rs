//! Value objects for the Marlim domain.
//!
//! Immutable, validated domain primitives.
//! All value objects enforce their invariants at construction time.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Domain errors for value object and transition validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Price/quantity must be a positive, in-bounds decimal
    #[error("Invalid numeric value: {0}")]
    InvalidNumeric(String),

    /// Symbol must be a valid trading pair
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    /// Stop distance validation error
    #[error("Invalid stop distance: {0}")]
    InvalidStopDistance(String),

    /// RiskConfig validation error
    #[error("Invalid risk config: {0}")]
    InvalidRiskConfig(String),

    /// Position sizing error
    #[error("Position sizing error: {0}")]
    SizingError(String),

    /// Risk budget cannot cover the minimum step size
    #[error("Insufficient capital: {0}")]
    InsufficientCapital(String),

    /// Signal does not match the target position
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    /// Event is not valid for the current position state
    #[error("Invalid transition: {event} in state {state}")]
    InvalidTransition {
        /// Current state name
        state: String,
        /// Offending event type
        event: String,
    },
}

// =============================================================================
// Price
// =============================================================================

/// Price represents a positive decimal price in the quote asset.
///
/// # Invariants
/// - Must be > 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Price(Decimal);

impl Price {
    /// Create a new Price with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidNumeric` if value <= 0
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value <= Decimal::ZERO {
            return Err(DomainError::InvalidNumeric("price must be positive".to_string()));
        }
        Ok(Self(value))
    }

    /// Get the underlying Decimal value
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Internal construction for trailing-stop arithmetic whose positivity is
// guaranteed by the caller's invariants.
impl From<Decimal> for Price {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

// =============================================================================
// Quantity
// =============================================================================

/// Quantity represents a positive decimal amount of the base asset.
///
/// # Invariants
/// - Must be > 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Quantity(Decimal);

impl Quantity {
    /// Create a new Quantity with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidNumeric` if value <= 0
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value <= Decimal::ZERO {
            return Err(DomainError::InvalidNumeric("quantity must be positive".to_string()));
        }
        Ok(Self(value))
    }

    /// Get the underlying Decimal value
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Symbol
// =============================================================================

/// Symbol represents a trading pair (e.g. BTCUSDT, also accepted as BTC/USDT)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    base: String,
    quote: String,
}

impl Symbol {
    /// Create a Symbol from a trading pair string.
    ///
    /// Accepts both `BTCUSDT` and `BTC/USDT` spellings.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidSymbol` if the pair cannot be parsed
    pub fn from_pair(pair: &str) -> Result<Self, DomainError> {
        if let Some((base, quote)) = pair.split_once('/') {
            return Self::new(base.to_string(), quote.to_string());
        }

        const QUOTE_CURRENCIES: &[&str] = &["USDT", "BUSD", "USDC", "BTC", "ETH", "BNB"];

        for quote in QUOTE_CURRENCIES {
            if let Some(base) = pair.strip_suffix(quote) {
                if !base.is_empty() {
                    return Ok(Self {
                        base: base.to_string(),
                        quote: quote.to_string(),
                    });
                }
            }
        }

        Err(DomainError::InvalidSymbol(format!("cannot parse trading pair: {}", pair)))
    }

    /// Create a Symbol from explicit base and quote
    pub fn new(base: String, quote: String) -> Result<Self, DomainError> {
        if base.is_empty() || quote.is_empty() {
            return Err(DomainError::InvalidSymbol(
                "base and quote must be non-empty".to_string(),
            ));
        }
        Ok(Self { base, quote })
    }

    /// Get the base asset
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Get the quote asset
    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Get the trading pair as the exchange spells it (e.g. "BTCUSDT")
    pub fn as_pair(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_pair())
    }
}

// =============================================================================
// Side
// =============================================================================

/// Side represents the position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Long position (buy low, sell high)
    Long,
    /// Short position (sell high, buy low)
    Short,
}

impl Side {
    /// The opposite direction
    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Order side that opens a position of this direction
    ///
    /// Long → Buy, Short → Sell
    pub fn entry_action(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position of this direction
    ///
    /// Long → Sell, Short → Buy
    pub fn exit_action(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }

    /// Sign applied to (exit − entry) in PnL math: +1 for Long, −1 for Short
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => -Decimal::ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// OrderSide represents the order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    /// Buy order
    Buy,
    /// Sell order
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

// =============================================================================
// SymbolFilters
// =============================================================================

/// Per-symbol exchange filters constraining prices and quantities.
///
/// Rounding is always toward the conservative side:
/// - quantities round DOWN to the step (risk never exceeds the budget)
/// - stop prices round toward entry (the stop fires earlier, never later)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolFilters {
    /// Minimum price increment
    pub tick_size: Decimal,
    /// Minimum quantity increment
    pub step_size: Decimal,
}

impl SymbolFilters {
    /// Create filters with validation
    pub fn new(tick_size: Decimal, step_size: Decimal) -> Result<Self, DomainError> {
        if tick_size <= Decimal::ZERO || step_size <= Decimal::ZERO {
            return Err(DomainError::InvalidNumeric(
                "tick_size and step_size must be positive".to_string(),
            ));
        }
        Ok(Self { tick_size, step_size })
    }

    /// Floor a raw quantity to the step grid (conservative: smaller qty).
    pub fn floor_to_step(&self, qty: Decimal) -> Decimal {
        (qty / self.step_size).floor() * self.step_size
    }

    /// Round a stop price to the tick grid, toward the entry side.
    ///
    /// Long stops sit below price, so rounding UP tightens them;
    /// Short stops sit above price, so rounding DOWN tightens them.
    pub fn round_stop_to_tick(&self, stop: Decimal, side: Side) -> Decimal {
        match side {
            Side::Long => (stop / self.tick_size).ceil() * self.tick_size,
            Side::Short => (stop / self.tick_size).floor() * self.tick_size,
        }
    }
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            tick_size: Decimal::new(1, 2),  // 0.01
            step_size: Decimal::new(1, 5),  // 0.00001
        }
    }
}

// =============================================================================
// RiskConfig
// =============================================================================

/// Risk configuration for position sizing.
///
/// With fixed 10x isolated-margin leverage, position size derives from:
///
/// ```text
/// Position Size = (Capital × Risk%) / Stop Distance
/// ```
///
/// # Example
///
/// ```
/// # use marlim_domain::value_objects::RiskConfig;
/// # use rust_decimal_macros::dec;
/// let config = RiskConfig::new(dec!(10000), dec!(1)).unwrap();
/// assert_eq!(config.max_risk_amount(), dec!(100)); // 1% of 10000
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Available capital in quote asset (e.g. USDT)
    capital: Decimal,
    /// Risk per trade as a percentage (1 = 1%)
    risk_fraction_pct: Decimal,
}

impl RiskConfig {
    /// Fixed leverage for all positions (10x isolated margin).
    /// Never stored per position; sizing already accounts for it
    /// through the risk budget.
    pub const LEVERAGE: u8 = 10;

    /// Create a new RiskConfig with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidRiskConfig` if capital <= 0 or
    /// the risk fraction is outside (0, 5]%.
    pub fn new(capital: Decimal, risk_fraction_pct: Decimal) -> Result<Self, DomainError> {
        if capital <= Decimal::ZERO {
            return Err(DomainError::InvalidRiskConfig("capital must be positive".to_string()));
        }

        if risk_fraction_pct <= Decimal::ZERO {
            return Err(DomainError::InvalidRiskConfig(
                "risk fraction must be positive".to_string(),
            ));
        }

        if risk_fraction_pct > Decimal::from(5) {
            return Err(DomainError::InvalidRiskConfig(
                "risk fraction cannot exceed 5%".to_string(),
            ));
        }

        Ok(Self { capital, risk_fraction_pct })
    }

    /// Get capital
    pub fn capital(&self) -> Decimal {
        self.capital
    }

    /// Get the risk fraction percentage
    pub fn risk_fraction_pct(&self) -> Decimal {
        self.risk_fraction_pct
    }

    /// Max risk amount in quote asset: Capital × Risk% / 100
    pub fn max_risk_amount(&self) -> Decimal {
        self.capital * self.risk_fraction_pct / Decimal::from(100)
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            capital: Decimal::from(10000),
            risk_fraction_pct: Decimal::ONE, // 1%
        }
    }
}

impl fmt::Display for RiskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RiskConfig {{ capital: {}, risk: {}%, leverage: {}x }}",
            self.capital,
            self.risk_fraction_pct,
            Self::LEVERAGE
        )
    }
}

// =============================================================================
// TechStopDistance
// =============================================================================

/// The fixed price distance from entry to the technical invalidation level.
///
/// This is the structural foundation of position sizing AND of the trailing
/// stop: the same distance sizes the position and trails the stop as price
/// moves favorably. It is chosen at arm time and never changes afterwards.
///
/// # Trailing rule (1x span)
///
/// For LONG positions the stop is always `peak − distance` and only moves
/// up; for SHORT positions it is `trough + distance` and only moves down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechStopDistance(Decimal);

impl TechStopDistance {
    /// Create a validated stop distance.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStopDistance` if distance <= 0
    pub fn new(distance: Decimal) -> Result<Self, DomainError> {
        if distance <= Decimal::ZERO {
            return Err(DomainError::InvalidStopDistance(
                "stop distance must be positive".to_string(),
            ));
        }
        Ok(Self(distance))
    }

    /// Derive from an entry price and a technical stop level, validating
    /// the stop sits on the correct side for the direction.
    pub fn from_entry_and_stop(
        entry: Price,
        initial_stop: Price,
        side: Side,
    ) -> Result<Self, DomainError> {
        match side {
            Side::Long if initial_stop.as_decimal() >= entry.as_decimal() => {
                return Err(DomainError::InvalidStopDistance(
                    "LONG requires stop below entry".to_string(),
                ));
            },
            Side::Short if initial_stop.as_decimal() <= entry.as_decimal() => {
                return Err(DomainError::InvalidStopDistance(
                    "SHORT requires stop above entry".to_string(),
                ));
            },
            _ => {},
        }

        Self::new((entry.as_decimal() - initial_stop.as_decimal()).abs())
    }

    /// The absolute distance in quote asset
    pub fn distance(&self) -> Decimal {
        self.0
    }

    /// Distance as a percentage of a reference price
    pub fn pct_of(&self, reference: Price) -> Decimal {
        self.0 / reference.as_decimal() * Decimal::from(100)
    }

    /// Policy bounds on the distance relative to entry: [0.1%, 10%].
    ///
    /// Enforced at entry time, not at construction; the distance itself is
    /// chosen before the entry price is known.
    pub fn validate_against(&self, entry: Price) -> Result<(), DomainError> {
        let pct = self.pct_of(entry);

        if pct > Decimal::from(10) {
            return Err(DomainError::InvalidStopDistance("stop too wide (>10%)".to_string()));
        }

        if pct < Decimal::new(1, 1) {
            // 0.1%
            return Err(DomainError::InvalidStopDistance("stop too tight (<0.1%)".to_string()));
        }

        Ok(())
    }

    /// Trailing stop for the favorable extreme seen so far.
    ///
    /// Long: `extreme − distance`. Short: `extreme + distance`.
    /// Monotonicity is the caller's job: only adopt the result when it is
    /// more favorable than the current stop.
    pub fn trailing_stop_for(&self, side: Side, favorable_extreme: Price) -> Price {
        match side {
            Side::Long => Price::from(favorable_extreme.as_decimal() - self.0),
            Side::Short => Price::from(favorable_extreme.as_decimal() + self.0),
        }
    }

    /// Check whether a trade price breaches the trailing stop.
    ///
    /// Long: exit when price <= stop. Short: exit when price >= stop.
    pub fn is_stop_breached(&self, side: Side, last_price: Price, trailing_stop: Price) -> bool {
        match side {
            Side::Long => last_price.as_decimal() <= trailing_stop.as_decimal(),
            Side::Short => last_price.as_decimal() >= trailing_stop.as_decimal(),
        }
    }
}

impl fmt::Display for TechStopDistance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// ClientOrderId
// =============================================================================

/// Origin namespace of an exchange-bound order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderNamespace {
    /// Placed by the core engine
    Core,
    /// Placed by the safety-net monitor
    Safety,
}

impl OrderNamespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            OrderNamespace::Core => "core",
            OrderNamespace::Safety => "safety",
        }
    }
}

/// Deterministic exchange-side idempotency key: `<namespace>_<intent_id>`.
///
/// Retries of the same intent MUST reuse the same ClientOrderId so the
/// exchange can deduplicate; a new id is a new order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Key for a core-engine intent
    pub fn core(intent_id: Uuid) -> Self {
        Self(format!("core_{}", intent_id.simple()))
    }

    /// Key for a safety-net intent
    pub fn safety(intent_id: Uuid) -> Self {
        Self(format!("safety_{}", intent_id.simple()))
    }

    /// The raw string sent to the exchange
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a key seen on the exchange back into namespace + intent id.
    ///
    /// Returns `None` for orders not placed by this system.
    pub fn parse(raw: &str) -> Option<(OrderNamespace, Uuid)> {
        let (ns, id) = raw.split_once('_')?;
        let namespace = match ns {
            "core" => OrderNamespace::Core,
            "safety" => OrderNamespace::Safety,
            _ => return None,
        };
        Uuid::parse_str(id).ok().map(|uuid| (namespace, uuid))
    }

    /// Namespace of this key, if it is one of ours
    pub fn namespace(&self) -> Option<OrderNamespace> {
        Self::parse(&self.0).map(|(ns, _)| ns)
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
