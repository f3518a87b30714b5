//! Stub implementations for testing.
//!
//! `StubExchange` simulates the normalized adapter surface: immediate fills
//! at a configured price, client-order-id deduplication, configurable
//! failures (including the ambiguous submit-then-timeout), delayed fills
//! visible only through `lookup_order`, and fill/gap stream events.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc;

use marlim_domain::{
    AccountId, ClientOrderId, OrderSide, OrderStatus, Price, Quantity, Symbol,
};
use marlim_engine::Tick;

use crate::error::ExchangeError;
use crate::ports::{
    ExchangePort, ExchangePositionView, FillEvent, FillStreamEvent, MarketDataPort,
    MarketStreamEvent, OpenOrderView, OrderAck, OrderStatusView,
};

/// Failure the stub should inject on the next call.
#[derive(Debug, Clone)]
pub enum InjectedFailure {
    Transient,
    RateLimited,
    Rejected(String),
    /// Fail the call with Unknown. If `accept_anyway` the order is still
    /// recorded on the "exchange": the submit actually landed.
    Unknown { accept_anyway: bool },
}

struct StubOrder {
    view: OrderStatusView,
    symbol: Symbol,
    side: OrderSide,
    price: Option<Price>,
    stop_price: Option<Price>,
    /// Number of lookups remaining before the order reports Filled
    lookups_until_fill: u32,
    final_fill: (Quantity, Price, Decimal),
}

/// Stub exchange for tests.
pub struct StubExchange {
    prices: RwLock<HashMap<String, Decimal>>,
    default_price: Decimal,
    fee_rate: Decimal,
    orders: RwLock<HashMap<String, StubOrder>>,
    positions: RwLock<Vec<ExchangePositionView>>,
    fail_next: Mutex<Option<InjectedFailure>>,
    /// When set, newly placed orders fill only after this many lookups
    fill_after_lookups: Mutex<u32>,
    order_counter: Mutex<u64>,
    fill_subscribers: Mutex<Vec<mpsc::Sender<FillStreamEvent>>>,
}

impl StubExchange {
    pub fn new(default_price: Decimal) -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            default_price,
            fee_rate: Decimal::new(1, 3), // 0.1%
            orders: RwLock::new(HashMap::new()),
            positions: RwLock::new(Vec::new()),
            fail_next: Mutex::new(None),
            fill_after_lookups: Mutex::new(0),
            order_counter: Mutex::new(0),
            fill_subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().unwrap().insert(symbol.to_string(), price);
    }

    pub fn price_for(&self, symbol: &str) -> Decimal {
        self.prices
            .read()
            .unwrap()
            .get(symbol)
            .copied()
            .unwrap_or(self.default_price)
    }

    /// Inject a failure into the next order-placing call.
    pub fn fail_next(&self, failure: InjectedFailure) {
        *self.fail_next.lock().unwrap() = Some(failure);
    }

    /// Newly placed orders report Submitted until looked up N times.
    pub fn set_fill_after_lookups(&self, lookups: u32) {
        *self.fill_after_lookups.lock().unwrap() = lookups;
    }

    /// Replace the account positions the stub reports.
    pub fn set_positions(&self, positions: Vec<ExchangePositionView>) {
        *self.positions.write().unwrap() = positions;
    }

    /// Push a gap marker to all fill subscribers.
    pub async fn emit_fill_gap(&self) {
        let senders: Vec<_> = self.fill_subscribers.lock().unwrap().clone();
        for sender in senders {
            let _ = sender.send(FillStreamEvent::GapDetected).await;
        }
    }

    /// Number of orders the "exchange" has accepted.
    pub fn accepted_order_count(&self) -> usize {
        self.orders.read().unwrap().len()
    }

    /// Client order ids the "exchange" has accepted.
    pub fn accepted_client_ids(&self) -> Vec<String> {
        self.orders.read().unwrap().keys().cloned().collect()
    }

    fn next_order_id(&self) -> String {
        let mut counter = self.order_counter.lock().unwrap();
        *counter += 1;
        format!("STUB-{}", *counter)
    }

    fn take_failure(&self) -> Option<InjectedFailure> {
        self.fail_next.lock().unwrap().take()
    }

    async fn notify_fill(&self, event: FillEvent) {
        let senders: Vec<_> = self.fill_subscribers.lock().unwrap().clone();
        for sender in senders {
            let _ = sender.send(FillStreamEvent::Fill(event.clone())).await;
        }
    }

    fn accept_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Quantity,
        client_order_id: &ClientOrderId,
        immediate_fill: bool,
    ) -> (OrderAck, Option<FillEvent>) {
        let price = Price::new(self.price_for(&symbol.as_pair())).unwrap();
        let fee = price.as_decimal() * quantity.as_decimal() * self.fee_rate;
        let exchange_order_id = self.next_order_id();
        let lookups_until_fill = if immediate_fill {
            0
        } else {
            *self.fill_after_lookups.lock().unwrap()
        };

        let filled_now = lookups_until_fill == 0;
        let view = OrderStatusView {
            exchange_order_id: exchange_order_id.clone(),
            client_order_id: client_order_id.as_str().to_string(),
            status: if filled_now { OrderStatus::Filled } else { OrderStatus::Submitted },
            filled_qty: filled_now.then_some(quantity),
            avg_fill_price: filled_now.then_some(price),
            fee_paid: if filled_now { fee } else { Decimal::ZERO },
        };

        self.orders.write().unwrap().insert(
            client_order_id.as_str().to_string(),
            StubOrder {
                view: view.clone(),
                symbol: symbol.clone(),
                side,
                price: None,
                stop_price: None,
                lookups_until_fill,
                final_fill: (quantity, price, fee),
            },
        );

        let ack = OrderAck {
            exchange_order_id: exchange_order_id.clone(),
            client_order_id: client_order_id.as_str().to_string(),
            accepted_qty: quantity,
            timestamp: Utc::now(),
        };

        let fill = filled_now.then(|| FillEvent {
            exchange_order_id,
            client_order_id: client_order_id.as_str().to_string(),
            status: OrderStatus::Filled,
            filled_qty: quantity,
            avg_fill_price: price,
            fee,
            timestamp: Utc::now(),
        });

        (ack, fill)
    }
}

#[async_trait]
impl ExchangePort for StubExchange {
    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Quantity,
        client_order_id: &ClientOrderId,
    ) -> Result<OrderAck, ExchangeError> {
        // Duplicate client id: the prior submit stands, echo its ack
        if let Some(existing) = self.orders.read().unwrap().get(client_order_id.as_str()) {
            return Ok(OrderAck {
                exchange_order_id: existing.view.exchange_order_id.clone(),
                client_order_id: client_order_id.as_str().to_string(),
                accepted_qty: quantity,
                timestamp: Utc::now(),
            });
        }

        if let Some(failure) = self.take_failure() {
            match failure {
                InjectedFailure::Transient => {
                    return Err(ExchangeError::Transient("stub: connection reset".to_string()));
                },
                InjectedFailure::RateLimited => {
                    return Err(ExchangeError::RateLimited("stub: 429".to_string()));
                },
                InjectedFailure::Rejected(reason) => {
                    return Err(ExchangeError::Rejected(reason));
                },
                InjectedFailure::Unknown { accept_anyway } => {
                    if accept_anyway {
                        // The submit landed; only the response was lost
                        let fill_gate = *self.fill_after_lookups.lock().unwrap() > 0;
                        let (_, fill) =
                            self.accept_order(symbol, side, quantity, client_order_id, !fill_gate);
                        if let Some(fill) = fill {
                            self.notify_fill(fill).await;
                        }
                    }
                    return Err(ExchangeError::Unknown("stub: response timeout".to_string()));
                },
            }
        }

        let fill_gate = *self.fill_after_lookups.lock().unwrap() > 0;
        let (ack, fill) = self.accept_order(symbol, side, quantity, client_order_id, !fill_gate);
        if let Some(fill) = fill {
            self.notify_fill(fill).await;
        }
        Ok(ack)
    }

    async fn place_stop_limit(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Quantity,
        stop_price: Price,
        limit_price: Price,
        client_order_id: &ClientOrderId,
    ) -> Result<OrderAck, ExchangeError> {
        if let Some(failure) = self.take_failure() {
            if let InjectedFailure::Rejected(reason) = failure {
                return Err(ExchangeError::Rejected(reason));
            }
            return Err(ExchangeError::Transient("stub: connection reset".to_string()));
        }

        // Stop orders rest; they never auto-fill in the stub
        let exchange_order_id = self.next_order_id();
        let view = OrderStatusView {
            exchange_order_id: exchange_order_id.clone(),
            client_order_id: client_order_id.as_str().to_string(),
            status: OrderStatus::Submitted,
            filled_qty: None,
            avg_fill_price: None,
            fee_paid: Decimal::ZERO,
        };
        self.orders.write().unwrap().insert(
            client_order_id.as_str().to_string(),
            StubOrder {
                view,
                symbol: symbol.clone(),
                side,
                price: Some(limit_price),
                stop_price: Some(stop_price),
                lookups_until_fill: u32::MAX,
                final_fill: (
                    quantity,
                    Price::new(self.price_for(&symbol.as_pair())).unwrap(),
                    Decimal::ZERO,
                ),
            },
        );

        Ok(OrderAck {
            exchange_order_id,
            client_order_id: client_order_id.as_str().to_string(),
            accepted_qty: quantity,
            timestamp: Utc::now(),
        })
    }

    async fn cancel_order(
        &self,
        _symbol: &Symbol,
        exchange_order_id: &str,
    ) -> Result<(), ExchangeError> {
        let mut orders = self.orders.write().unwrap();
        let order = orders
            .values_mut()
            .find(|o| o.view.exchange_order_id == exchange_order_id);

        match order {
            Some(order) => {
                order.view.status = OrderStatus::Cancelled;
                Ok(())
            },
            None => Err(ExchangeError::Rejected("order not found".to_string())),
        }
    }

    async fn lookup_order(
        &self,
        _symbol: &Symbol,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<OrderStatusView>, ExchangeError> {
        let mut orders = self.orders.write().unwrap();
        let Some(order) = orders.get_mut(client_order_id.as_str()) else {
            return Ok(None);
        };

        // Delayed fills become visible after the configured lookup count
        if order.view.status == OrderStatus::Submitted
            && order.lookups_until_fill != u32::MAX
            && order.lookups_until_fill > 0
        {
            order.lookups_until_fill -= 1;
            if order.lookups_until_fill == 0 {
                let (qty, price, fee) = order.final_fill;
                order.view.status = OrderStatus::Filled;
                order.view.filled_qty = Some(qty);
                order.view.avg_fill_price = Some(price);
                order.view.fee_paid = fee;
            }
        }

        Ok(Some(order.view.clone()))
    }

    async fn open_orders(
        &self,
        symbol: &Symbol,
    ) -> Result<Vec<OpenOrderView>, ExchangeError> {
        let orders = self.orders.read().unwrap();
        Ok(orders
            .values()
            .filter(|o| {
                o.symbol == *symbol
                    && matches!(o.view.status, OrderStatus::Submitted | OrderStatus::Partial)
            })
            .map(|o| OpenOrderView {
                exchange_order_id: o.view.exchange_order_id.clone(),
                client_order_id: o.view.client_order_id.clone(),
                symbol: o.symbol.clone(),
                side: o.side,
                quantity: o.final_fill.0,
                price: o.price,
                stop_price: o.stop_price,
                status: o.view.status,
            })
            .collect())
    }

    async fn positions(
        &self,
        _account_id: AccountId,
    ) -> Result<Vec<ExchangePositionView>, ExchangeError> {
        Ok(self.positions.read().unwrap().clone())
    }

    async fn subscribe_fills(
        &self,
    ) -> Result<mpsc::Receiver<FillStreamEvent>, ExchangeError> {
        let (tx, rx) = mpsc::channel(100);
        self.fill_subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn ping(&self) -> Result<(), ExchangeError> {
        Ok(())
    }
}

// =============================================================================
// Stub market data
// =============================================================================

/// Stub market data provider: prices are injected by the test.
pub struct StubMarketData {
    prices: RwLock<HashMap<String, Decimal>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<MarketStreamEvent>>>>,
}

impl StubMarketData {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Set the price and deliver a tick to all subscribers of the symbol.
    pub async fn push_tick(&self, symbol: &Symbol, price: Decimal) {
        self.prices.write().unwrap().insert(symbol.as_pair(), price);

        let senders: Vec<_> = self
            .subscribers
            .lock()
            .unwrap()
            .get(&symbol.as_pair())
            .cloned()
            .unwrap_or_default();

        let tick = Tick::new(symbol.clone(), Price::new(price).unwrap());
        for sender in senders {
            let _ = sender.send(MarketStreamEvent::Tick(tick.clone())).await;
        }
    }

    /// Push a gap marker to all subscribers of the symbol.
    pub async fn push_gap(&self, symbol: &Symbol) {
        let senders: Vec<_> = self
            .subscribers
            .lock()
            .unwrap()
            .get(&symbol.as_pair())
            .cloned()
            .unwrap_or_default();

        for sender in senders {
            let _ = sender.send(MarketStreamEvent::GapDetected).await;
        }
    }
}

impl Default for StubMarketData {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataPort for StubMarketData {
    async fn subscribe_ticks(
        &self,
        symbol: &Symbol,
    ) -> Result<mpsc::Receiver<MarketStreamEvent>, ExchangeError> {
        let (tx, rx) = mpsc::channel(100);
        self.subscribers
            .lock()
            .unwrap()
            .entry(symbol.as_pair())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn last_price(&self, symbol: &Symbol) -> Result<Price, ExchangeError> {
        let prices = self.prices.read().unwrap();
        let price = prices
            .get(&symbol.as_pair())
            .copied()
            .ok_or_else(|| ExchangeError::Transient(format!("no price for {}", symbol)))?;
        Ok(Price::new(price).map_err(|e| ExchangeError::Transient(e.to_string()))?)
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

    fn btc() -> Symbol {
        Symbol::from_pair("BTCUSDT").unwrap()
    }

    fn qty(v: Decimal) -> Quantity {
        Quantity::new(v).unwrap()
    }

    #[tokio::test]
    async fn test_place_order_fills_at_price() {
        let exchange = StubExchange::new(dec!(100000));
        let id = ClientOrderId::core(Uuid::now_v7());

        let ack = exchange
            .place_market_order(&btc(), OrderSide::Buy, qty(dec!(0.2)), &id)
            .await
            .unwrap();
        assert_eq!(ack.accepted_qty.as_decimal(), dec!(0.2));

        let view = exchange.lookup_order(&btc(), &id).await.unwrap().unwrap();
        assert!(view.is_filled());
        assert_eq!(view.avg_fill_price.unwrap().as_decimal(), dec!(100000));
    }

    #[tokio::test]
    async fn test_duplicate_client_id_returns_prior_ack() {
        let exchange = StubExchange::new(dec!(100000));
        let id = ClientOrderId::core(Uuid::now_v7());

        let first = exchange
            .place_market_order(&btc(), OrderSide::Buy, qty(dec!(0.2)), &id)
            .await
            .unwrap();
        let second = exchange
            .place_market_order(&btc(), OrderSide::Buy, qty(dec!(0.2)), &id)
            .await
            .unwrap();

        // One order on the exchange, same exchange id echoed back
        assert_eq!(first.exchange_order_id, second.exchange_order_id);
        assert_eq!(exchange.accepted_order_count(), 1);
    }

    #[tokio::test]
    async fn test_ambiguous_submit_is_discoverable_via_lookup() {
        let exchange = StubExchange::new(dec!(100000));
        let id = ClientOrderId::core(Uuid::now_v7());

        exchange.fail_next(InjectedFailure::Unknown { accept_anyway: true });

        let result = exchange
            .place_market_order(&btc(), OrderSide::Buy, qty(dec!(0.2)), &id)
            .await;
        assert!(matches!(result, Err(ExchangeError::Unknown(_))));

        // The order landed; lookup with the same id discovers it
        let view = exchange.lookup_order(&btc(), &id).await.unwrap();
        assert!(view.is_some());
    }

    #[tokio::test]
    async fn test_delayed_fill_via_lookups() {
        let exchange = StubExchange::new(dec!(100000));
        exchange.set_fill_after_lookups(2);
        let id = ClientOrderId::core(Uuid::now_v7());

        exchange
            .place_market_order(&btc(), OrderSide::Buy, qty(dec!(0.2)), &id)
            .await
            .unwrap();

        // First lookup: still open. Second: filled.
        let first = exchange.lookup_order(&btc(), &id).await.unwrap().unwrap();
        assert_eq!(first.status, OrderStatus::Submitted);

        let second = exchange.lookup_order(&btc(), &id).await.unwrap().unwrap();
        assert!(second.is_filled());
    }

    #[tokio::test]
    async fn test_fill_stream_delivery() {
        let exchange = StubExchange::new(dec!(100000));
        let mut fills = exchange.subscribe_fills().await.unwrap();
        let id = ClientOrderId::core(Uuid::now_v7());

        exchange
            .place_market_order(&btc(), OrderSide::Buy, qty(dec!(0.2)), &id)
            .await
            .unwrap();

        match fills.recv().await.unwrap() {
            FillStreamEvent::Fill(fill) => {
                assert_eq!(fill.client_order_id, id.as_str());
                assert!(fill.fee > Decimal::ZERO);
            },
            other => panic!("expected Fill, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_rejected() {
        let exchange = StubExchange::new(dec!(100000));
        let result = exchange.cancel_order(&btc(), "NOPE").await;
        assert!(matches!(result, Err(ExchangeError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_open_orders_lists_resting_only() {
        let exchange = StubExchange::new(dec!(100000));

        // A resting stop-limit and a filled market order
        let resting = ClientOrderId::core(Uuid::now_v7());
        exchange
            .place_stop_limit(
                &btc(),
                OrderSide::Sell,
                qty(dec!(0.2)),
                Price::new(dec!(99300)).unwrap(),
                Price::new(dec!(99200)).unwrap(),
                &resting,
            )
            .await
            .unwrap();
        exchange
            .place_market_order(
                &btc(),
                OrderSide::Buy,
                qty(dec!(0.2)),
                &ClientOrderId::core(Uuid::now_v7()),
            )
            .await
            .unwrap();

        let open = exchange.open_orders(&btc()).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].client_order_id, resting.as_str());
        assert_eq!(open[0].side, OrderSide::Sell);
        assert_eq!(open[0].stop_price.unwrap().as_decimal(), dec!(99300));

        // Other symbols see nothing
        let eth = Symbol::from_pair("ETHUSDT").unwrap();
        assert!(exchange.open_orders(&eth).await.unwrap().is_empty());

        // Cancelled orders drop out of the listing
        let id = open[0].exchange_order_id.clone();
        exchange.cancel_order(&btc(), &id).await.unwrap();
        assert!(exchange.open_orders(&btc()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_market_data_ticks_and_gap() {
        let market = StubMarketData::new();
        let symbol = btc();
        let mut rx = market.subscribe_ticks(&symbol).await.unwrap();

        market.push_tick(&symbol, dec!(100500)).await;
        match rx.recv().await.unwrap() {
            MarketStreamEvent::Tick(tick) => {
                assert_eq!(tick.last_price.as_decimal(), dec!(100500));
            },
            other => panic!("expected Tick, got {:?}", other),
        }

        market.push_gap(&symbol).await;
        assert!(matches!(rx.recv().await.unwrap(), MarketStreamEvent::GapDetected));

        assert_eq!(market.last_price(&symbol).await.unwrap().as_decimal(), dec!(100500));
    }
}
