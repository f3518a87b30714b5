//! Execution layer port definitions.
//!
//! The engine depends only on these abstractions; adapters implement them
//! for specific venues (`StubExchange` for tests, the Binance adapter in
//! marlim-connectors for live trading). Credentials, request signing,
//! timestamps, rate-limit pacing and session/listen-key renewal are all
//! adapter concerns; the engine never sees them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use marlim_domain::{AccountId, ClientOrderId, OrderSide, OrderStatus, Price, Quantity, Side, Symbol};
use marlim_engine::Tick;

use crate::error::ExchangeError;

// =============================================================================
// Exchange port
// =============================================================================

/// Outbound port for order placement and account state.
///
/// Implementations MUST use the provided `client_order_id` as the
/// exchange-side idempotency key, and MUST treat a duplicate-id rejection
/// as success of a prior submit (resolved via `lookup_order`).
#[async_trait]
pub trait ExchangePort: Send + Sync {
    /// Place a market order.
    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Quantity,
        client_order_id: &ClientOrderId,
    ) -> Result<OrderAck, ExchangeError>;

    /// Place a stop-loss limit order (insurance stop).
    async fn place_stop_limit(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Quantity,
        stop_price: Price,
        limit_price: Price,
        client_order_id: &ClientOrderId,
    ) -> Result<OrderAck, ExchangeError>;

    /// Cancel an order by exchange id.
    async fn cancel_order(
        &self,
        symbol: &Symbol,
        exchange_order_id: &str,
    ) -> Result<(), ExchangeError>;

    /// Look up an order by its client id. Idempotent; safe to retry.
    ///
    /// `None` means the exchange never accepted an order with this id.
    async fn lookup_order(
        &self,
        symbol: &Symbol,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<OrderStatusView>, ExchangeError>;

    /// Resting (unfilled or partially filled) orders for a symbol.
    ///
    /// The reconciler walks these to find orders the local state does not
    /// own: an order accepted just before a crash can exist on the
    /// exchange without a journal record, and only a listing can surface
    /// it for adoption or cancellation.
    async fn open_orders(
        &self,
        symbol: &Symbol,
    ) -> Result<Vec<OpenOrderView>, ExchangeError>;

    /// Open positions for the account.
    async fn positions(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<ExchangePositionView>, ExchangeError>;

    /// Subscribe to order fill events for the account.
    ///
    /// After a transport drop the adapter resubscribes automatically and
    /// emits `GapDetected` so the consumer can reconcile.
    async fn subscribe_fills(
        &self,
    ) -> Result<tokio::sync::mpsc::Receiver<FillStreamEvent>, ExchangeError>;

    /// Connectivity check.
    async fn ping(&self) -> Result<(), ExchangeError>;
}

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    /// Opaque exchange-assigned id
    pub exchange_order_id: String,
    /// Echo of the idempotency key
    pub client_order_id: String,
    pub accepted_qty: Quantity,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of an order, from `lookup_order`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusView {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: Option<Quantity>,
    pub avg_fill_price: Option<Price>,
    /// Cumulative fee, normalized to the quote asset
    pub fee_paid: Decimal,
}

impl OrderStatusView {
    pub fn is_filled(&self) -> bool {
        matches!(self.status, OrderStatus::Filled)
    }
}

/// A resting order from `open_orders`.
///
/// Richer than `OrderStatusView`: adoption needs the original side,
/// quantity and prices, which a status lookup does not carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrderView {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub quantity: Quantity,
    /// Limit price; None for market orders still working
    pub price: Option<Price>,
    /// Stop trigger price for stop orders
    pub stop_price: Option<Price>,
    pub status: OrderStatus,
}

/// An exchange position as the venue reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePositionView {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    pub entry_price: Price,
}

/// Fill subscription events.
#[derive(Debug, Clone, PartialEq)]
pub enum FillStreamEvent {
    /// An order changed status (partial or full fill, cancel, reject)
    Fill(FillEvent),
    /// The transport dropped and resubscribed; state may have been missed.
    /// The consumer must reconcile.
    GapDetected,
}

/// A fill notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: Quantity,
    pub avg_fill_price: Price,
    /// Fee in the quote asset
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Market data port
// =============================================================================

/// Tick subscription events.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketStreamEvent {
    Tick(Tick),
    /// Stream dropped and resubscribed; trigger reconciliation.
    GapDetected,
}

/// Inbound port for market data.
#[async_trait]
pub trait MarketDataPort: Send + Sync {
    /// Subscribe to trade ticks for a symbol.
    async fn subscribe_ticks(
        &self,
        symbol: &Symbol,
    ) -> Result<tokio::sync::mpsc::Receiver<MarketStreamEvent>, ExchangeError>;

    /// Snapshot of the last trade price.
    async fn last_price(&self, symbol: &Symbol) -> Result<Price, ExchangeError>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_status_view_serialization() {
        let view = OrderStatusView {
            exchange_order_id: "12345".to_string(),
            client_order_id: "core_abc".to_string(),
            status: OrderStatus::Filled,
            filled_qty: Some(Quantity::new(dec!(0.2)).unwrap()),
            avg_fill_price: Some(Price::new(dec!(100000)).unwrap()),
            fee_paid: dec!(20),
        };

        let json = serde_json::to_string(&view).unwrap();
        let parsed: OrderStatusView = serde_json::from_str(&json).unwrap();

        assert!(parsed.is_filled());
        assert_eq!(parsed.avg_fill_price.unwrap().as_decimal(), dec!(100000));
    }

    #[test]
    fn test_open_order_view_serialization() {
        let view = OpenOrderView {
            exchange_order_id: "77".to_string(),
            client_order_id: "core_abc".to_string(),
            symbol: Symbol::from_pair("BTCUSDT").unwrap(),
            side: OrderSide::Sell,
            quantity: Quantity::new(dec!(0.2)).unwrap(),
            price: Some(Price::new(dec!(99200)).unwrap()),
            stop_price: Some(Price::new(dec!(99300)).unwrap()),
            status: OrderStatus::Submitted,
        };

        let json = serde_json::to_string(&view).unwrap();
        let parsed: OpenOrderView = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.side, OrderSide::Sell);
        assert_eq!(parsed.stop_price.unwrap().as_decimal(), dec!(99300));
    }

    #[test]
    fn test_exchange_error_classification() {
        assert!(ExchangeError::Transient("io".into()).is_retriable());
        assert!(ExchangeError::RateLimited("429".into()).is_retriable());
        assert!(!ExchangeError::Rejected("bad qty".into()).is_retriable());
        assert!(!ExchangeError::Unknown("timeout".into()).is_retriable());
        assert!(ExchangeError::Unknown("timeout".into()).is_ambiguous());
    }
}
