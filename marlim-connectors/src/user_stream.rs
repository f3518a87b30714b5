//! Binance user-data stream: order fill events.
//!
//! Obtains a listen key over REST, connects the user-data WebSocket, and
//! forwards `executionReport` events as normalized `FillEvent`s. The
//! listen key is kept alive every 30 minutes (Binance expires it after
//! 60). On any transport drop the task reconnects with backoff and emits
//! `GapDetected` first, so the consumer reconciles before trusting the
//! stream again.

use std::time::Duration;

use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use marlim_domain::{OrderStatus, Price, Quantity};
use marlim_exec::{ExchangeError, FillEvent, FillStreamEvent};

use crate::binance_rest::BinanceExchange;

/// Keepalive interval for the listen key
const KEEPALIVE_SECS: u64 = 30 * 60;

/// Reconnect backoff cap
const RECONNECT_MAX_SECS: u64 = 30;

fn ws_base(testnet: bool) -> &'static str {
    if testnet {
        "wss://testnet.binance.vision"
    } else {
        "wss://stream.binance.com:9443"
    }
}

/// Create the listen key for the margin user-data stream.
async fn create_listen_key(adapter: &BinanceExchange) -> Result<String, ExchangeError> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ListenKeyResponse {
        listen_key: String,
    }

    let url = format!("{}/sapi/v1/userDataStream", adapter.base_url());
    let response = adapter
        .http()
        .post(&url)
        .header("X-MBX-APIKEY", adapter.api_key())
        .send()
        .await
        .map_err(|e| ExchangeError::Transient(e.to_string()))?;

    let body = response
        .text()
        .await
        .map_err(|e| ExchangeError::Transient(e.to_string()))?;

    let parsed: ListenKeyResponse = serde_json::from_str(&body)
        .map_err(|e| ExchangeError::Transient(format!("listen key parse: {}", e)))?;
    Ok(parsed.listen_key)
}

/// Spawn the user-stream task; the receiver yields fills and gap markers.
pub(crate) async fn spawn_user_stream(
    adapter: &BinanceExchange,
) -> Result<mpsc::Receiver<FillStreamEvent>, ExchangeError> {
    let (tx, rx) = mpsc::channel(256);

    let api_key = adapter.api_key().to_string();
    let base_url = adapter.base_url().to_string();
    let http = adapter.http().clone();
    let testnet = adapter.is_testnet();

    // First connection happens before spawning so subscribe errors surface
    let listen_key = create_listen_key(adapter).await?;

    tokio::spawn(async move {
        let mut listen_key = listen_key;
        let mut first_connection = true;
        let mut backoff_secs = 1u64;
        let mut last_keepalive = tokio::time::Instant::now();

        loop {
            let url = format!("{}/ws/{}", ws_base(testnet), listen_key);
            let ws = match connect_async(&url).await {
                Ok((ws, _)) => {
                    info!("User data stream connected");
                    backoff_secs = 1;
                    ws
                },
                Err(e) => {
                    warn!(error = %e, "User stream connect failed, retrying");
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(RECONNECT_MAX_SECS);
                    continue;
                },
            };

            // Every connection after the first is a potential gap
            if !first_connection && tx.send(FillStreamEvent::GapDetected).await.is_err() {
                return;
            }
            first_connection = false;

            let (_, mut read) = ws.split();

            loop {
                if last_keepalive.elapsed() >= Duration::from_secs(KEEPALIVE_SECS) {
                    let url = format!(
                        "{}/sapi/v1/userDataStream?listenKey={}",
                        base_url, listen_key
                    );
                    if let Err(e) = http
                        .put(&url)
                        .header("X-MBX-APIKEY", &api_key)
                        .send()
                        .await
                    {
                        warn!(error = %e, "Listen key keepalive failed");
                    }
                    last_keepalive = tokio::time::Instant::now();
                }

                match tokio::time::timeout(Duration::from_secs(60), read.next()).await {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if let Some(fill) = parse_execution_report(&text) {
                            if tx.send(FillStreamEvent::Fill(fill)).await.is_err() {
                                return;
                            }
                        }
                    },
                    Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => {},
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        warn!("User stream closed, reconnecting");
                        break;
                    },
                    Ok(Some(Ok(_))) => {},
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "User stream receive error, reconnecting");
                        break;
                    },
                    Err(_) => {
                        // Idle timeout: the listen key may have lapsed
                        debug!("User stream idle, refreshing listen key");
                        break;
                    },
                }
            }

            // Refresh the key on reconnect; an expired key would 404 the WS
            match recreate_listen_key(&http, &base_url, &api_key).await {
                Ok(key) => listen_key = key,
                Err(e) => warn!(error = %e, "Listen key refresh failed, reusing old key"),
            }
        }
    });

    Ok(rx)
}

async fn recreate_listen_key(
    http: &reqwest::Client,
    base_url: &str,
    api_key: &str,
) -> Result<String, String> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ListenKeyResponse {
        listen_key: String,
    }

    let url = format!("{}/sapi/v1/userDataStream", base_url);
    let body = http
        .post(&url)
        .header("X-MBX-APIKEY", api_key)
        .send()
        .await
        .map_err(|e| e.to_string())?
        .text()
        .await
        .map_err(|e| e.to_string())?;

    serde_json::from_str::<ListenKeyResponse>(&body)
        .map(|r| r.listen_key)
        .map_err(|e| e.to_string())
}

/// Execution report payload (single-letter fields per Binance protocol).
#[derive(Debug, Deserialize)]
struct ExecutionReport {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    client_order_id: String,
    #[serde(rename = "i")]
    order_id: u64,
    #[serde(rename = "X")]
    order_status: String,
    #[serde(rename = "z")]
    cumulative_filled_qty: Decimal,
    #[serde(rename = "Z")]
    cumulative_quote_qty: Decimal,
    #[serde(rename = "L")]
    last_fill_price: Decimal,
    #[serde(rename = "n")]
    commission: Decimal,
    #[serde(rename = "N")]
    commission_asset: Option<String>,
}

fn parse_execution_report(text: &str) -> Option<FillEvent> {
    let report: ExecutionReport = serde_json::from_str(text).ok()?;
    if report.event_type != "executionReport" {
        return None;
    }

    let status = match report.order_status.as_str() {
        "NEW" => return None, // acks arrive over REST; only fills matter here
        "PARTIALLY_FILLED" => OrderStatus::Partial,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "EXPIRED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        _ => return None,
    };

    let filled_qty = Quantity::new(report.cumulative_filled_qty).ok()?;
    let avg_fill_price = if report.cumulative_filled_qty > Decimal::ZERO {
        Price::new(report.cumulative_quote_qty / report.cumulative_filled_qty).ok()?
    } else {
        Price::new(report.last_fill_price).ok()?
    };

    Some(FillEvent {
        exchange_order_id: report.order_id.to_string(),
        client_order_id: report.client_order_id,
        status,
        filled_qty,
        avg_fill_price,
        fee: normalize_fee(
            report.commission,
            report.commission_asset.as_deref(),
            &report.symbol,
            report.last_fill_price,
        ),
        timestamp: chrono::Utc::now(),
    })
}

/// Normalize the commission into the quote asset.
///
/// Base-asset commissions convert at the fill price. Commissions in a
/// third asset (e.g. BNB discounts) cannot be priced here and count as
/// zero, with a warning.
fn normalize_fee(
    commission: Decimal,
    commission_asset: Option<&str>,
    symbol: &str,
    fill_price: Decimal,
) -> Decimal {
    let Some(asset) = commission_asset else {
        return Decimal::ZERO;
    };

    if symbol.ends_with(asset) {
        // Quote-denominated already
        commission
    } else if symbol.starts_with(asset) {
        // Base-denominated: price it in quote
        commission * fill_price
    } else {
        warn!(%asset, %symbol, "Commission in third asset, not normalized");
        Decimal::ZERO
    }
}

// =============================================================================
// Tests
// =============================================================================
