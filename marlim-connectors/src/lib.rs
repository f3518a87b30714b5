//! Marlim exchange connectors.
//!
//! Binance isolated-margin adapters implementing the execution-layer
//! ports. Exchange-specific wire formats, signing, rate-limit codes and
//! listen-key plumbing stay inside this crate; the engine only sees the
//! normalized `ExchangePort`/`MarketDataPort` surface.

#![warn(clippy::all)]

mod binance_rest;
mod market_ws;
mod user_stream;

pub use binance_rest::{BinanceExchange, BinanceRestError};
pub use market_ws::BinanceMarketData;
