//! Binance market-data WebSocket client.
//!
//! Implements `MarketDataPort` over the public trade stream
//! (`<symbol>@trade`). Each subscription runs its own task with automatic
//! reconnection; every reconnect after the first connection emits a
//! `GapDetected` marker before any further ticks, so the engine
//! reconciles before trusting prices again.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use marlim_domain::{Price, Symbol};
use marlim_engine::Tick;
use marlim_exec::{ExchangeError, MarketDataPort, MarketStreamEvent};

/// Reconnect backoff cap
const RECONNECT_MAX_SECS: u64 = 30;

/// Binance market data over WebSocket.
pub struct BinanceMarketData {
    http: Client,
    testnet: bool,
}

impl BinanceMarketData {
    pub fn new(testnet: bool) -> Self {
        Self {
            http: Client::new(),
            testnet,
        }
    }

    fn ws_base(&self) -> &'static str {
        if self.testnet {
            "wss://testnet.binance.vision"
        } else {
            "wss://stream.binance.com:9443"
        }
    }

    fn rest_base(&self) -> &'static str {
        if self.testnet {
            "https://testnet.binance.vision"
        } else {
            "https://api.binance.com"
        }
    }
}

/// Trade stream payload (single-letter fields per Binance protocol).
#[derive(Debug, Deserialize)]
struct TradeMessage {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "p")]
    price: Decimal,
}

#[async_trait]
impl MarketDataPort for BinanceMarketData {
    async fn subscribe_ticks(
        &self,
        symbol: &Symbol,
    ) -> Result<mpsc::Receiver<MarketStreamEvent>, ExchangeError> {
        let (tx, rx) = mpsc::channel(1024);
        let url = format!("{}/ws/{}@trade", self.ws_base(), symbol.as_pair().to_lowercase());
        let symbol = symbol.clone();

        tokio::spawn(async move {
            let mut first_connection = true;
            let mut backoff_secs = 1u64;

            loop {
                let ws = match connect_async(&url).await {
                    Ok((ws, _)) => {
                        info!(symbol = %symbol.as_pair(), "Trade stream connected");
                        backoff_secs = 1;
                        ws
                    },
                    Err(e) => {
                        warn!(symbol = %symbol.as_pair(), error = %e, "Trade stream connect failed");
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        backoff_secs = (backoff_secs * 2).min(RECONNECT_MAX_SECS);
                        continue;
                    },
                };

                if !first_connection && tx.send(MarketStreamEvent::GapDetected).await.is_err() {
                    return;
                }
                first_connection = false;

                let (_, mut read) = ws.split();

                while let Some(message) = read.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            let Ok(trade) = serde_json::from_str::<TradeMessage>(&text) else {
                                continue;
                            };
                            if trade.event_type != "trade" {
                                continue;
                            }
                            let Ok(price) = Price::new(trade.price) else { continue };

                            let tick = Tick::new(symbol.clone(), price);
                            if tx.send(MarketStreamEvent::Tick(tick)).await.is_err() {
                                return;
                            }
                        },
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {},
                        Ok(Message::Close(_)) => {
                            warn!(symbol = %symbol.as_pair(), "Trade stream closed, reconnecting");
                            break;
                        },
                        Ok(_) => {},
                        Err(e) => {
                            warn!(symbol = %symbol.as_pair(), error = %e, "Trade stream error, reconnecting");
                            break;
                        },
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn last_price(&self, symbol: &Symbol) -> Result<Price, ExchangeError> {
        #[derive(Deserialize)]
        struct PriceResponse {
            price: Decimal,
        }

        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.rest_base(),
            symbol.as_pair()
        );

        let body = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?
            .text()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;

        let parsed: PriceResponse = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Transient(format!("ticker parse: {}", e)))?;

        Price::new(parsed.price).map_err(|e| ExchangeError::Transient(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_message_parse() {
        let raw = r#"{"e":"trade","E":1700000000000,"s":"BTCUSDT","t":12345,
            "p":"100500.00","q":"0.01","T":1700000000000,"m":true,"M":true}"#;

        let trade: TradeMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(trade.event_type, "trade");
        assert_eq!(trade.price, Decimal::from(100500));
    }

    #[test]
    fn test_urls_by_environment() {
        let live = BinanceMarketData::new(false);
        assert!(live.ws_base().contains("stream.binance.com"));

        let test = BinanceMarketData::new(true);
        assert!(test.ws_base().contains("testnet"));
    }
}
