//! Marlim domain layer.
//!
//! Type-safe, validated primitives that make invalid states
//! unrepresentable, plus the position state machine and its event stream.
//!
//! # Layers
//!
//! - `value_objects`: Price, Quantity, Symbol, Side, filters, risk config,
//!   the technical stop distance and client-order-id namespaces
//! - `entities`: Position (snapshot + state machine), Order, sizing
//! - `events`: the append-only event vocabulary and `Position::apply`
//! - `signal`: entry signals with correlation ids
//! - `detected_position`: safety-net detections and fixed-percent stops
//!
//! Everything here is pure: no I/O, no clocks beyond timestamping at
//! construction, no global state.

#![warn(clippy::all)]

pub mod detected_position;
pub mod entities;
pub mod events;
pub mod intent;
pub mod signal;
pub mod value_objects;

pub use detected_position::{DetectedPosition, DetectionKey, SafetyStop};
pub use entities::{
    calculate_position_size, margin_required, notional_value, AccountId, ExitReason, IntentId,
    Order, OrderId, OrderStatus, OrderType, Position, PositionId, PositionState, SignalId,
};
pub use events::Event;
pub use intent::{Intent, IntentKind, IntentStatus};
pub use signal::EntrySignal;
pub use value_objects::{
    ClientOrderId, DomainError, OrderNamespace, OrderSide, Price, Quantity, RiskConfig, Side,
    Symbol, SymbolFilters, TechStopDistance,
};
