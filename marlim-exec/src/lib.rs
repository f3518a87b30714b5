//! Marlim execution layer.
//!
//! Idempotent execution of engine decisions against an exchange:
//!
//! - **ports**: `ExchangePort` / `MarketDataPort` abstractions and the
//!   normalized views (`OrderAck`, `OrderStatusView`, fill/tick streams
//!   with gap markers)
//! - **error**: the failure taxonomy the engine reasons about
//!   (Transient / RateLimited / Rejected / Unknown)
//! - **intent**: the journal making every side effect exactly-once across
//!   crashes, with startup replay via `lookup_order`
//! - **executor**: engine-action execution through journal and port
//! - **stub**: test doubles with failure injection

#![warn(clippy::all)]

mod error;
mod executor;
mod intent;
mod ports;
mod stub;

pub use error::{ExecError, ExecResult, ExchangeError};
pub use executor::{ActionResult, Executor, OrderIntentPayload};
pub use intent::{IntentJournal, RecordOutcome, ReplayOutcome, Resolution};
pub use ports::{
    ExchangePort, ExchangePositionView, FillEvent, FillStreamEvent, MarketDataPort,
    MarketStreamEvent, OpenOrderView, OrderAck, OrderStatusView,
};
pub use stub::{InjectedFailure, StubExchange, StubMarketData};
