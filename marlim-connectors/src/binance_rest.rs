//! Binance isolated-margin REST adapter.
//!
//! Implements `ExchangePort` against the Binance Spot/Margin API:
//! - HMAC SHA256 signed requests (`X-MBX-APIKEY` header, `signature` and
//!   `timestamp` query parameters)
//! - `newClientOrderId` as the exchange-side idempotency key; a duplicate
//!   client-id rejection is treated as success of a prior submit and
//!   resolved through `lookup_order`
//! - the §taxonomy mapping: 429/-1003 → RateLimited, transport failures
//!   before send → Transient, response timeout after a submit → Unknown,
//!   every other API error → Rejected
//! - fees normalized to the quote asset

use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use async_trait::async_trait;
use marlim_domain::{
    AccountId, ClientOrderId, OrderSide, OrderStatus, Price, Quantity, Side, Symbol,
};
use marlim_exec::{
    ExchangeError, ExchangePort, ExchangePositionView, FillStreamEvent, OpenOrderView, OrderAck,
    OrderStatusView,
};

use crate::user_stream::spawn_user_stream;

// =============================================================================
// Constants
// =============================================================================

/// Binance REST API base URL (Spot/Margin)
const BINANCE_API_URL: &str = "https://api.binance.com";

/// Binance testnet base URL
const BINANCE_TESTNET_URL: &str = "https://testnet.binance.vision";

/// Request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Binance error code: rate limit exceeded
const CODE_RATE_LIMIT: i64 = -1003;

/// Binance error code: duplicate client order id
const CODE_DUPLICATE_CLIENT_ID: i64 = -2010;

/// Binance error code: order does not exist
const CODE_ORDER_NOT_FOUND: i64 = -2013;

// =============================================================================
// Errors
// =============================================================================

/// Low-level Binance REST errors, before taxonomy mapping.
#[derive(Debug, Clone, Error)]
pub enum BinanceRestError {
    #[error("Failed to build signature: {0}")]
    Signature(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Binance API error: {code} - {msg}")]
    Api { code: i64, msg: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Request timed out")]
    Timeout,
}

impl BinanceRestError {
    /// Map to the engine's taxonomy. `submitted` tells whether the request
    /// may already have reached the matching engine (order placement after
    /// the request went on the wire); those timeouts are ambiguous, not
    /// transient.
    fn into_exchange_error(self, submitted: bool) -> ExchangeError {
        match self {
            BinanceRestError::Timeout if submitted => {
                ExchangeError::Unknown("response timeout after submit".to_string())
            },
            BinanceRestError::Timeout => ExchangeError::Transient("request timeout".to_string()),
            BinanceRestError::RequestFailed(msg) if submitted => ExchangeError::Unknown(msg),
            BinanceRestError::RequestFailed(msg) => ExchangeError::Transient(msg),
            BinanceRestError::Api { code: CODE_RATE_LIMIT, msg } => {
                ExchangeError::RateLimited(msg)
            },
            BinanceRestError::Api { code, msg } if code == -1001 || code == -1021 => {
                // Internal disconnect / timestamp out of sync: retriable
                ExchangeError::Transient(format!("{}: {}", code, msg))
            },
            BinanceRestError::Api { code, msg } => {
                ExchangeError::Rejected(format!("{}: {}", code, msg))
            },
            BinanceRestError::Signature(msg) | BinanceRestError::Parse(msg) => {
                ExchangeError::Rejected(msg)
            },
        }
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// Binance isolated-margin exchange adapter.
pub struct BinanceExchange {
    client: Client,
    api_key: String,
    api_secret: String,
    testnet: bool,
}

impl BinanceExchange {
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            api_secret,
            testnet: false,
        }
    }

    pub fn testnet(api_key: String, api_secret: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            api_secret,
            testnet: true,
        }
    }

    pub(crate) fn base_url(&self) -> &str {
        if self.testnet {
            BINANCE_TESTNET_URL
        } else {
            BINANCE_API_URL
        }
    }

    pub(crate) fn api_key(&self) -> &str {
        &self.api_key
    }

    pub(crate) fn http(&self) -> &Client {
        &self.client
    }

    pub(crate) fn is_testnet(&self) -> bool {
        self.testnet
    }

    /// Build the signed query string: sorted params + timestamp, HMAC
    /// SHA256 signature appended.
    fn build_signed_query(
        &self,
        mut params: Vec<(&str, String)>,
    ) -> Result<String, BinanceRestError> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        params.push(("timestamp", timestamp));
        params.sort_by(|a, b| a.0.cmp(b.0));

        let query_string: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        type HmacSha256 = Hmac<Sha256>;

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| BinanceRestError::Signature(format!("HMAC error: {}", e)))?;
        mac.update(query_string.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{}&signature={}", query_string, signature))
    }

    async fn send(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        query: String,
    ) -> Result<String, BinanceRestError> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url(), endpoint)
        } else {
            format!("{}{}?{}", self.base_url(), endpoint, query)
        };

        let request = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key);

        let response = timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS), request.send())
            .await
            .map_err(|_| BinanceRestError::Timeout)?
            .map_err(|e| BinanceRestError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BinanceRestError::Parse(e.to_string()))?;

        if status.as_u16() == 429 {
            return Err(BinanceRestError::Api {
                code: CODE_RATE_LIMIT,
                msg: "HTTP 429".to_string(),
            });
        }

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<BinanceErrorResponse>(&body) {
                return Err(BinanceRestError::Api { code: err.code, msg: err.msg });
            }
            return Err(BinanceRestError::RequestFailed(format!("HTTP {}: {}", status, body)));
        }

        Ok(body)
    }

    async fn get_signed(
        &self,
        endpoint: &str,
        params: Vec<(&str, String)>,
    ) -> Result<String, BinanceRestError> {
        let query = self.build_signed_query(params)?;
        self.send(reqwest::Method::GET, endpoint, query).await
    }

    async fn post_signed(
        &self,
        endpoint: &str,
        params: Vec<(&str, String)>,
    ) -> Result<String, BinanceRestError> {
        let query = self.build_signed_query(params)?;
        self.send(reqwest::Method::POST, endpoint, query).await
    }

    async fn delete_signed(
        &self,
        endpoint: &str,
        params: Vec<(&str, String)>,
    ) -> Result<String, BinanceRestError> {
        let query = self.build_signed_query(params)?;
        self.send(reqwest::Method::DELETE, endpoint, query).await
    }

    fn ack_from_response(response: BinanceOrderResponse) -> OrderAck {
        OrderAck {
            exchange_order_id: response.order_id.to_string(),
            client_order_id: response.client_order_id,
            accepted_qty: Quantity::new(response.orig_qty)
                .unwrap_or_else(|_| Quantity::new(Decimal::new(1, 9)).unwrap()),
            timestamp: Utc::now(),
        }
    }

    fn status_view_from_response(response: BinanceOrderResponse) -> OrderStatusView {
        let status = map_order_status(&response.status);
        let filled = response.executed_qty > Decimal::ZERO;
        let avg_price = if filled && response.executed_qty > Decimal::ZERO {
            // Market fills report price=0; derive from the quote volume
            let avg = response.cummulative_quote_qty / response.executed_qty;
            Price::new(avg).ok()
        } else {
            None
        };

        OrderStatusView {
            exchange_order_id: response.order_id.to_string(),
            client_order_id: response.client_order_id,
            status,
            filled_qty: filled.then(|| Quantity::new(response.executed_qty).ok()).flatten(),
            avg_fill_price: avg_price,
            // Query responses carry no commission detail; the user stream
            // fills it in. Zero here, corrected by the fill event.
            fee_paid: Decimal::ZERO,
        }
    }
}

fn map_order_status(raw: &str) -> OrderStatus {
    match raw {
        "NEW" => OrderStatus::Submitted,
        "PARTIALLY_FILLED" => OrderStatus::Partial,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "EXPIRED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::Pending,
    }
}

#[async_trait]
impl ExchangePort for BinanceExchange {
    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Quantity,
        client_order_id: &ClientOrderId,
    ) -> Result<OrderAck, ExchangeError> {
        let params = vec![
            ("symbol", symbol.as_pair()),
            ("isIsolated", "TRUE".to_string()),
            ("side", side.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.as_decimal().to_string()),
            ("newClientOrderId", client_order_id.as_str().to_string()),
        ];

        match self.post_signed("/sapi/v1/margin/order", params).await {
            Ok(body) => {
                let response: BinanceOrderResponse = serde_json::from_str(&body)
                    .map_err(|e| ExchangeError::Unknown(format!("unparseable ack: {}", e)))?;
                debug!(
                    symbol = %symbol.as_pair(),
                    order_id = response.order_id,
                    client_order_id = %client_order_id,
                    "Market order accepted"
                );
                Ok(Self::ack_from_response(response))
            },
            Err(BinanceRestError::Api { code: CODE_DUPLICATE_CLIENT_ID, .. }) => {
                // The prior submit with this client id stands; surface it
                // through lookup so the caller gets the original ack.
                warn!(client_order_id = %client_order_id, "Duplicate client order id, resolving via lookup");
                match self.lookup_order(symbol, client_order_id).await? {
                    Some(view) => Ok(OrderAck {
                        exchange_order_id: view.exchange_order_id,
                        client_order_id: view.client_order_id,
                        accepted_qty: view.filled_qty.unwrap_or(quantity),
                        timestamp: Utc::now(),
                    }),
                    None => Err(ExchangeError::Unknown(
                        "duplicate client id but order not found".to_string(),
                    )),
                }
            },
            Err(e) => Err(e.into_exchange_error(true)),
        }
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
        let params = vec![
            ("symbol", symbol.as_pair()),
            ("isIsolated", "TRUE".to_string()),
            ("side", side.to_string()),
            ("type", "STOP_LOSS_LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", quantity.as_decimal().to_string()),
            ("stopPrice", stop_price.as_decimal().to_string()),
            ("price", limit_price.as_decimal().to_string()),
            ("newClientOrderId", client_order_id.as_str().to_string()),
        ];

        match self.post_signed("/sapi/v1/margin/order", params).await {
            Ok(body) => {
                let response: BinanceOrderResponse = serde_json::from_str(&body)
                    .map_err(|e| ExchangeError::Unknown(format!("unparseable ack: {}", e)))?;
                Ok(Self::ack_from_response(response))
            },
            Err(e) => Err(e.into_exchange_error(true)),
        }
    }

    async fn cancel_order(
        &self,
        symbol: &Symbol,
        exchange_order_id: &str,
    ) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol", symbol.as_pair()),
            ("isIsolated", "TRUE".to_string()),
            ("orderId", exchange_order_id.to_string()),
        ];

        match self.delete_signed("/sapi/v1/margin/order", params).await {
            Ok(_) => Ok(()),
            Err(BinanceRestError::Api { code: CODE_ORDER_NOT_FOUND, msg }) => {
                Err(ExchangeError::Rejected(format!("not found: {}", msg)))
            },
            Err(e) => Err(e.into_exchange_error(false)),
        }
    }

    async fn lookup_order(
        &self,
        symbol: &Symbol,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<OrderStatusView>, ExchangeError> {
        let params = vec![
            ("symbol", symbol.as_pair()),
            ("isIsolated", "TRUE".to_string()),
            ("origClientOrderId", client_order_id.as_str().to_string()),
        ];

        match self.get_signed("/sapi/v1/margin/order", params).await {
            Ok(body) => {
                let response: BinanceOrderResponse = serde_json::from_str(&body)
                    .map_err(|e| ExchangeError::Transient(format!("unparseable order: {}", e)))?;
                Ok(Some(Self::status_view_from_response(response)))
            },
            Err(BinanceRestError::Api { code: CODE_ORDER_NOT_FOUND, .. }) => Ok(None),
            Err(e) => Err(e.into_exchange_error(false)),
        }
    }

    async fn open_orders(
        &self,
        symbol: &Symbol,
    ) -> Result<Vec<OpenOrderView>, ExchangeError> {
        let params = vec![
            ("symbol", symbol.as_pair()),
            ("isIsolated", "TRUE".to_string()),
        ];

        let body = self
            .get_signed("/sapi/v1/margin/openOrders", params)
            .await
            .map_err(|e| e.into_exchange_error(false))?;

        let raw: Vec<BinanceOpenOrder> = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Transient(format!("unparseable open orders: {}", e)))?;

        Ok(raw
            .into_iter()
            .filter_map(|order| open_order_view(symbol, order))
            .collect())
    }

    async fn positions(
        &self,
        _account_id: AccountId,
    ) -> Result<Vec<ExchangePositionView>, ExchangeError> {
        let body = self
            .get_signed("/sapi/v1/margin/isolated/account", vec![])
            .await
            .map_err(|e| e.into_exchange_error(false))?;

        let account: IsolatedMarginAccountInfo = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Transient(format!("unparseable account: {}", e)))?;

        let mut positions = Vec::new();
        for entry in account.assets {
            let symbol = match Symbol::from_pair(&entry.symbol) {
                Ok(s) => s,
                Err(_) => continue,
            };

            let base = &entry.base_asset;
            // A long holds base; a short has borrowed base
            let borrowed = base.borrowed;
            let net = base.net_asset;

            let (side, qty) = if borrowed > Decimal::ZERO {
                (Side::Short, borrowed)
            } else if net > Decimal::ZERO {
                (Side::Long, net)
            } else {
                continue;
            };

            let Ok(quantity) = Quantity::new(qty) else { continue };
            let Ok(entry_price) = Price::new(entry.index_price) else { continue };

            positions.push(ExchangePositionView {
                symbol,
                side,
                quantity,
                entry_price,
            });
        }

        Ok(positions)
    }

    async fn subscribe_fills(
        &self,
    ) -> Result<mpsc::Receiver<FillStreamEvent>, ExchangeError> {
        spawn_user_stream(self).await
    }

    async fn ping(&self) -> Result<(), ExchangeError> {
        self.send(reqwest::Method::GET, "/api/v3/ping", String::new())
            .await
            .map(|_| ())
            .map_err(|e| e.into_exchange_error(false))
    }
}

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Deserialize)]
struct BinanceErrorResponse {
    code: i64,
    msg: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BinanceOrderResponse {
    pub order_id: u64,
    pub client_order_id: String,
    #[serde(default)]
    pub orig_qty: Decimal,
    #[serde(default)]
    pub executed_qty: Decimal,
    #[serde(default)]
    pub cummulative_quote_qty: Decimal,
    #[serde(default)]
    pub status: String,
}

/// An entry from the open-orders listing. Richer than the ack/lookup
/// response: side, working quantity and prices are needed for adoption.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BinanceOpenOrder {
    pub order_id: u64,
    pub client_order_id: String,
    pub side: String,
    #[serde(default)]
    pub orig_qty: Decimal,
    #[serde(default)]
    pub executed_qty: Decimal,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub stop_price: Decimal,
    #[serde(default)]
    pub status: String,
}

/// Normalize one open-order entry; unparseable rows are dropped.
fn open_order_view(symbol: &Symbol, order: BinanceOpenOrder) -> Option<OpenOrderView> {
    let side = match order.side.as_str() {
        "BUY" => OrderSide::Buy,
        "SELL" => OrderSide::Sell,
        _ => return None,
    };

    Some(OpenOrderView {
        exchange_order_id: order.order_id.to_string(),
        client_order_id: order.client_order_id,
        symbol: symbol.clone(),
        side,
        quantity: Quantity::new(order.orig_qty).ok()?,
        price: Price::new(order.price).ok(),
        stop_price: Price::new(order.stop_price).ok(),
        status: if order.executed_qty > Decimal::ZERO {
            OrderStatus::Partial
        } else {
            map_order_status(&order.status)
        },
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IsolatedMarginAccountInfo {
    assets: Vec<IsolatedMarginPair>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IsolatedMarginPair {
    symbol: String,
    base_asset: IsolatedMarginAsset,
    #[allow(dead_code)]
    quote_asset: IsolatedMarginAsset,
    index_price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IsolatedMarginAsset {
    #[allow(dead_code)]
    asset: String,
    #[serde(default)]
    borrowed: Decimal,
    #[serde(default)]
    net_asset: Decimal,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_signed_query_contains_signature_and_timestamp() {
        let adapter = BinanceExchange::new("key".to_string(), "secret".to_string());

        let query = adapter
            .build_signed_query(vec![("symbol", "BTCUSDT".to_string())])
            .unwrap();

        assert!(query.contains("timestamp="));
        assert!(query.contains("signature="));
        assert!(query.contains("symbol=BTCUSDT"));
    }

    #[test]
    fn test_build_signed_query_sorts_params() {
        let adapter = BinanceExchange::new("key".to_string(), "secret".to_string());

        let query = adapter
            .build_signed_query(vec![
                ("symbol", "BTCUSDT".to_string()),
                ("side", "SELL".to_string()),
            ])
            .unwrap();

        let side_idx = query.find("side=").unwrap();
        let symbol_idx = query.find("symbol=").unwrap();
        assert!(side_idx < symbol_idx);
    }

    #[test]
    fn test_error_taxonomy_mapping() {
        // Timeout after submit is ambiguous
        let e = BinanceRestError::Timeout.into_exchange_error(true);
        assert!(matches!(e, ExchangeError::Unknown(_)));

        // Timeout on a read is transient
        let e = BinanceRestError::Timeout.into_exchange_error(false);
        assert!(matches!(e, ExchangeError::Transient(_)));

        // Rate limit code
        let e = BinanceRestError::Api { code: CODE_RATE_LIMIT, msg: "limit".into() }
            .into_exchange_error(true);
        assert!(matches!(e, ExchangeError::RateLimited(_)));

        // Arbitrary API errors are rejections
        let e = BinanceRestError::Api { code: -2015, msg: "bad key".into() }
            .into_exchange_error(true);
        assert!(matches!(e, ExchangeError::Rejected(_)));
    }

    #[test]
    fn test_map_order_status() {
        assert_eq!(map_order_status("NEW"), OrderStatus::Submitted);
        assert_eq!(map_order_status("PARTIALLY_FILLED"), OrderStatus::Partial);
        assert_eq!(map_order_status("FILLED"), OrderStatus::Filled);
        assert_eq!(map_order_status("CANCELED"), OrderStatus::Cancelled);
        assert_eq!(map_order_status("REJECTED"), OrderStatus::Rejected);
    }

    #[test]
    fn test_open_order_view_mapping() {
        let symbol = Symbol::from_pair("BTCUSDT").unwrap();
        let raw = r#"{
            "symbol": "BTCUSDT",
            "orderId": 77,
            "clientOrderId": "core_0190f3a0a0aa7aa3b7f0c2e5d8f9a1b2",
            "side": "SELL",
            "type": "STOP_LOSS_LIMIT",
            "origQty": "0.200",
            "executedQty": "0",
            "price": "99200.0",
            "stopPrice": "99300.0",
            "status": "NEW"
        }"#;

        let order: BinanceOpenOrder = serde_json::from_str(raw).unwrap();
        let view = open_order_view(&symbol, order).unwrap();

        assert_eq!(view.exchange_order_id, "77");
        assert_eq!(view.side, OrderSide::Sell);
        assert_eq!(view.quantity.as_decimal(), Decimal::new(200, 3));
        assert_eq!(view.stop_price.unwrap().as_decimal(), Decimal::new(993000, 1));
        assert_eq!(view.status, OrderStatus::Submitted);
    }

    #[test]
    fn test_open_order_view_drops_unknown_side() {
        let symbol = Symbol::from_pair("BTCUSDT").unwrap();
        let order = BinanceOpenOrder {
            order_id: 1,
            client_order_id: "x".to_string(),
            side: "HOLD".to_string(),
            orig_qty: Decimal::ONE,
            executed_qty: Decimal::ZERO,
            price: Decimal::ZERO,
            stop_price: Decimal::ZERO,
            status: "NEW".to_string(),
        };
        assert!(open_order_view(&symbol, order).is_none());
    }

    #[test]
    fn test_status_view_derives_avg_price_from_quote_volume() {
        let response = BinanceOrderResponse {
            order_id: 42,
            client_order_id: "core_x".to_string(),
            orig_qty: Decimal::new(2, 1),              // 0.2
            executed_qty: Decimal::new(2, 1),          // 0.2
            cummulative_quote_qty: Decimal::from(20000), // avg 100,000
            status: "FILLED".to_string(),
        };

        let view = BinanceExchange::status_view_from_response(response);
        assert!(view.is_filled());
        assert_eq!(view.avg_fill_price.unwrap().as_decimal(), Decimal::from(100000));
    }
}
