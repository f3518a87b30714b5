//! Safety net: protective stops for positions the engine does not own.
//!
//! An independent loop that polls the exchange account, registers any
//! position no engine Position owns (e.g. opened manually on the exchange
//! UI), applies a deliberately coarse fixed-percent stop, and market-closes
//! when it is breached.
//!
//! Three layers guarantee it never acts on an engine-owned position:
//! 1. the in-memory exclusion cache maintained from the bus
//!    (`CorePositionOpened/Closed`),
//! 2. a store lookup for a live engine position on the (symbol, side),
//! 3. the `safety_` client-order-id namespace on everything it submits.
//!
//! The bus is best-effort, so layer 2 backs up layer 1 against missed
//! events. Safety intents go through the same journal discipline as core
//! intents.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use marlim_domain::{
    AccountId, DetectedPosition, DetectionKey, Intent, IntentId, IntentKind, Side, Symbol,
};
use marlim_exec::{
    ActionResult, ExchangePort, Executor, MarketDataPort, OrderIntentPayload,
};
use marlim_store::Store;

use crate::config::SafetyConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::{BusEvent, EventBus};
use crate::metrics::Metrics;

// =============================================================================
// Execution attempts
// =============================================================================

/// Per-detection execution attempt log. Retries reuse the intent id so
/// the exchange sees one idempotency key per protective exit.
#[derive(Debug, Clone)]
pub struct ExecutionAttempt {
    pub intent_id: IntentId,
    pub attempted_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub panic_mode: bool,
}

impl ExecutionAttempt {
    fn new() -> Self {
        Self {
            intent_id: Uuid::now_v7(),
            attempted_at: Utc::now(),
            consecutive_failures: 0,
            last_error: None,
            panic_mode: false,
        }
    }

    fn can_retry(&self, cooldown: std::time::Duration) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.attempted_at);
        elapsed.num_milliseconds() as u128 > cooldown.as_millis()
    }

    fn record_failure(&mut self, error: String, max_failures: u32) {
        self.consecutive_failures += 1;
        self.last_error = Some(error);
        self.panic_mode = self.consecutive_failures >= max_failures;
    }
}

/// Safety-net status for the operator surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SafetyStatus {
    pub detected: usize,
    pub excluded: usize,
    pub pending_attempts: usize,
    pub panic_mode: usize,
}

// =============================================================================
// Safety net
// =============================================================================

/// The safety-net monitor.
pub struct SafetyNet<E: ExchangePort, S: Store, M: MarketDataPort> {
    executor: Arc<Executor<E, S>>,
    store: Arc<S>,
    market: Arc<M>,
    bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
    config: SafetyConfig,
    account_id: AccountId,
    exclusion_set: RwLock<HashSet<DetectionKey>>,
    detected: RwLock<HashMap<DetectionKey, DetectedPosition>>,
    attempts: RwLock<HashMap<DetectionKey, ExecutionAttempt>>,
    cancel: CancellationToken,
}

impl<E, S, M> SafetyNet<E, S, M>
where
    E: ExchangePort + 'static,
    S: Store + 'static,
    M: MarketDataPort + 'static,
{
    pub fn new(
        executor: Arc<Executor<E, S>>,
        store: Arc<S>,
        market: Arc<M>,
        bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
        config: SafetyConfig,
        account_id: AccountId,
    ) -> Self {
        Self {
            executor,
            store,
            market,
            bus,
            metrics,
            config,
            account_id,
            exclusion_set: RwLock::new(HashSet::new()),
            detected: RwLock::new(HashMap::new()),
            attempts: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Start the monitor loop.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut bus_rx = self.bus.subscribe();
            let mut poll = tokio::time::interval(self.config.poll_interval);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(
                interval = ?self.config.poll_interval,
                stop_pct = %self.config.stop_pct,
                "Safety net started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    Some(event) = bus_rx.recv() => {
                        match event {
                            Ok(event) => self.handle_bus_event(event).await,
                            Err(missed) => {
                                // Missed events: the store lookup (layer 2)
                                // still protects correctness
                                warn!(missed, "Safety net lagged on the bus");
                            },
                        }
                    }

                    _ = poll.tick() => {
                        if let Err(e) = self.poll_once().await {
                            error!(error = %e, "Safety net poll failed");
                        }
                    }
                }
            }

            info!("Safety net stopped");
        })
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn handle_bus_event(&self, event: BusEvent) {
        match event {
            BusEvent::CorePositionOpened { symbol, side, .. } => {
                let key = DetectionKey::new(symbol, side);
                self.exclusion_set.write().await.insert(key.clone());
                // Drop a racing detection for the same pair: the engine
                // owns it now
                if self.detected.write().await.remove(&key).is_some() {
                    info!(%key, "Dropped detection, core owns the pair");
                }
                debug!(%key, "Exclusion added");
            },
            BusEvent::CorePositionClosed { symbol, side, .. } => {
                let key = DetectionKey::new(symbol, side);
                self.exclusion_set.write().await.remove(&key);
                debug!(%key, "Exclusion removed");
            },
            _ => {},
        }
    }

    /// One poll pass: detect, verify, and fire breached stops.
    pub async fn poll_once(&self) -> DaemonResult<()> {
        let views = self
            .executor
            .exchange()
            .positions(self.account_id)
            .await
            .map_err(marlim_exec::ExecError::from)?;

        let mut seen = HashSet::new();

        for view in views {
            let key = DetectionKey::new(view.symbol.clone(), view.side);
            seen.insert(key.clone());

            if self.is_engine_owned(&key).await? {
                debug!(%key, "Skipping engine-owned position");
                continue;
            }

            let current_price = match self.market.last_price(&view.symbol).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(%key, error = %e, "No price, skipping check this cycle");
                    continue;
                },
            };

            let stop_hit = {
                let mut detected = self.detected.write().await;
                match detected.get_mut(&key) {
                    Some(existing) => {
                        existing.mark_verified();
                        existing.is_stop_hit(current_price).unwrap_or(false)
                    },
                    None => {
                        let mut detection = DetectedPosition::new(
                            view.symbol.clone(),
                            view.side,
                            view.entry_price,
                            view.quantity,
                        );
                        let stop = detection.calculate_safety_stop(self.config.stop_pct);

                        info!(
                            %key,
                            entry = %view.entry_price,
                            qty = %view.quantity,
                            stop = %stop.stop_price,
                            "Rogue position detected, safety stop registered"
                        );

                        let hit = detection.is_stop_hit(current_price).unwrap_or(false);
                        detected.insert(key.clone(), detection);
                        hit
                    },
                }
            };

            if stop_hit {
                self.execute_stop(&key, current_price).await?;
            }
        }

        // Positions that vanished from the exchange were closed elsewhere
        self.cleanup_gone(&seen).await;

        Ok(())
    }

    /// Layer 1 (exclusion cache) + layer 2 (store lookup).
    async fn is_engine_owned(&self, key: &DetectionKey) -> DaemonResult<bool> {
        if self.exclusion_set.read().await.contains(key) {
            return Ok(true);
        }

        match self
            .store
            .positions()
            .find_live_by_symbol_side(&key.symbol, key.side)
            .await
        {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => {
                // Fail safe: on storage trouble, do not risk double
                // execution against the engine
                warn!(%key, error = %e, "Owner lookup failed, failing safe");
                Ok(true)
            },
        }
    }

    /// Execute the protective close, with cooldown and panic tracking.
    async fn execute_stop(
        &self,
        key: &DetectionKey,
        current_price: marlim_domain::Price,
    ) -> DaemonResult<()> {
        // Layer 1 again right before acting: a core entry may have raced
        // the poll
        if self.exclusion_set.read().await.contains(key) {
            info!(%key, "Execution skipped, core took the pair");
            return Ok(());
        }

        let Some(detection) = self.detected.read().await.get(key).cloned() else {
            return Ok(());
        };

        // Cooldown / panic gate
        let intent_id = {
            let mut attempts = self.attempts.write().await;
            let attempt = attempts.entry(key.clone()).or_insert_with(ExecutionAttempt::new);

            if attempt.panic_mode {
                warn!(
                    %key,
                    failures = attempt.consecutive_failures,
                    "Panic mode, holding until cooldown"
                );
                if !attempt.can_retry(self.config.execution_cooldown) {
                    return Ok(());
                }
                attempt.panic_mode = false;
            } else if attempt.consecutive_failures > 0
                && !attempt.can_retry(self.config.execution_cooldown)
            {
                debug!(%key, "Cooldown, skipping this cycle");
                return Ok(());
            }

            attempt.attempted_at = Utc::now();
            attempt.intent_id
        };

        let stop_price = detection
            .safety_stop
            .as_ref()
            .map(|s| s.stop_price)
            .unwrap_or(current_price);

        info!(
            %key,
            entry = %detection.entry_price,
            stop = %stop_price,
            price = %current_price,
            "Safety stop breached, closing"
        );

        // Journaled safety intent; namespace safety_, same discipline as
        // core. The detection key has no engine position, so the intent is
        // scoped under a synthetic position id derived from the intent.
        let payload = OrderIntentPayload {
            symbol: key.symbol.as_pair(),
            side: detection.key.side.exit_action(),
            quantity: detection.quantity,
        };
        let intent = Intent::with_id(
            intent_id,
            intent_id, // synthetic scope: one intent per detection attempt
            IntentKind::SafetyExit,
            serde_json::to_value(&payload)
                .map_err(|e| DaemonError::Config(e.to_string()))?,
        );

        match self.executor.journal().record(&intent).await {
            Ok(marlim_exec::RecordOutcome::AlreadyProcessed) => {
                // A previous cycle already closed it; drop the detection
                self.forget(key).await;
                return Ok(());
            },
            Ok(_) => {},
            Err(e) => return Err(e.into()),
        }
        self.executor
            .journal()
            .begin(intent.id, intent.position_id)
            .await?;

        match self.executor.submit_intent(&intent).await? {
            ActionResult::OrderAccepted(ack) => {
                info!(
                    %key,
                    exchange_order_id = %ack.exchange_order_id,
                    "Safety exit executed"
                );
                self.metrics.safety_exits.inc();
                self.forget(key).await;
                self.bus.publish(BusEvent::SafetyExitExecuted {
                    symbol: key.symbol.clone(),
                    side: key.side,
                    exchange_order_id: ack.exchange_order_id,
                });
                Ok(())
            },
            ActionResult::OrderRejected { reason, .. } => {
                self.record_failure(key, reason.clone()).await;
                self.bus.publish(BusEvent::SafetyExitFailed {
                    symbol: key.symbol.clone(),
                    side: key.side,
                    error: reason,
                });
                Ok(())
            },
            ActionResult::OrderUnresolved { .. } => {
                // Same intent id next cycle: the exchange dedupes, the
                // lookup inside submit resolves duplicates
                self.record_failure(key, "unresolved submit".to_string()).await;
                Ok(())
            },
            other => {
                debug!(%key, ?other, "Unexpected safety submit result");
                Ok(())
            },
        }
    }

    async fn record_failure(&self, key: &DetectionKey, error: String) {
        let mut attempts = self.attempts.write().await;
        let attempt = attempts.entry(key.clone()).or_insert_with(ExecutionAttempt::new);
        attempt.record_failure(error.clone(), self.config.max_retry_attempts);

        if attempt.panic_mode {
            error!(
                %key,
                failures = attempt.consecutive_failures,
                %error,
                "Safety net panic mode"
            );
        }
    }

    async fn forget(&self, key: &DetectionKey) {
        self.detected.write().await.remove(key);
        self.attempts.write().await.remove(key);
    }

    async fn cleanup_gone(&self, seen: &HashSet<DetectionKey>) {
        let gone: Vec<DetectionKey> = {
            let detected = self.detected.read().await;
            detected
                .keys()
                .filter(|k| !seen.contains(*k))
                .cloned()
                .collect()
        };

        for key in gone {
            info!(%key, "Position closed externally, dropping detection");
            self.forget(&key).await;
        }
    }

    // =========================================================================
    // Operator surface
    // =========================================================================

    pub async fn status(&self) -> SafetyStatus {
        let attempts = self.attempts.read().await;
        SafetyStatus {
            detected: self.detected.read().await.len(),
            excluded: self.exclusion_set.read().await.len(),
            pending_attempts: attempts.len(),
            panic_mode: attempts.values().filter(|a| a.panic_mode).count(),
        }
    }

    /// Connectivity self-test: ping the exchange and count visible
    /// positions. Places no orders.
    pub async fn self_test(&self) -> DaemonResult<usize> {
        self.executor
            .exchange()
            .ping()
            .await
            .map_err(marlim_exec::ExecError::from)?;
        let views = self
            .executor
            .exchange()
            .positions(self.account_id)
            .await
            .map_err(marlim_exec::ExecError::from)?;
        Ok(views.len())
    }

    pub async fn detections(&self) -> Vec<DetectedPosition> {
        self.detected.read().await.values().cloned().collect()
    }

    #[cfg(test)]
    async fn add_exclusion(&self, symbol: &Symbol, side: Side) {
        self.exclusion_set
            .write()
            .await
            .insert(DetectionKey::new(symbol.clone(), side));
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use marlim_domain::{Price, Quantity};
    use marlim_exec::{ExchangePositionView, StubExchange, StubMarketData};
    use marlim_store::{EventRepository as _, MemoryStore};
    use rust_decimal_macros::dec;

    struct World {
        net: SafetyNet<StubExchange, MemoryStore, StubMarketData>,
        exchange: Arc<StubExchange>,
        market: Arc<StubMarketData>,
        store: Arc<MemoryStore>,
        bus: Arc<EventBus>,
    }

    fn world() -> World {
        let exchange = Arc::new(StubExchange::new(dec!(2000)));
        let store = Arc::new(MemoryStore::new());
        let market = Arc::new(StubMarketData::new());
        let executor = Arc::new(Executor::new(exchange.clone(), store.clone()));
        let bus = Arc::new(EventBus::new(64));

        let config = SafetyConfig {
            enabled: true,
            poll_interval: std::time::Duration::from_millis(50),
            stop_pct: dec!(2),
            max_retry_attempts: 3,
            execution_cooldown: std::time::Duration::from_millis(10),
        };

        let net = SafetyNet::new(
            executor,
            store.clone(),
            market.clone(),
            bus.clone(),
            Arc::new(Metrics::new()),
            config,
            Uuid::now_v7(),
        );

        World { net, exchange, market, store, bus }
    }

    fn eth_short() -> ExchangePositionView {
        ExchangePositionView {
            symbol: Symbol::from_pair("ETHUSDT").unwrap(),
            side: Side::Short,
            quantity: Quantity::new(dec!(5)).unwrap(),
            entry_price: Price::new(dec!(2000)).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_detects_and_registers_stop() {
        let w = world();
        let symbol = Symbol::from_pair("ETHUSDT").unwrap();
        w.exchange.set_positions(vec![eth_short()]);
        w.market.push_tick(&symbol, dec!(2000)).await;

        w.net.poll_once().await.unwrap();

        let detections = w.net.detections().await;
        assert_eq!(detections.len(), 1);

        // 2% above the 2,000 short entry
        let stop = detections[0].safety_stop.as_ref().unwrap();
        assert_eq!(stop.stop_price.as_decimal(), dec!(2040.00));
    }

    #[tokio::test]
    async fn test_executes_on_breach_with_safety_namespace() {
        let w = world();
        let symbol = Symbol::from_pair("ETHUSDT").unwrap();
        w.exchange.set_positions(vec![eth_short()]);

        // First poll registers at 2,000
        w.market.push_tick(&symbol, dec!(2000)).await;
        w.net.poll_once().await.unwrap();

        // Price rises through the 2,040 stop
        w.market.push_tick(&symbol, dec!(2041)).await;
        let mut bus_rx = w.bus.subscribe();
        w.net.poll_once().await.unwrap();

        // Exactly one exchange order, safety_ namespaced
        assert_eq!(w.exchange.accepted_order_count(), 1);

        match bus_rx.recv().await.unwrap().unwrap() {
            BusEvent::SafetyExitExecuted { symbol: s, side, .. } => {
                assert_eq!(s.as_pair(), "ETHUSDT");
                assert_eq!(side, Side::Short);
            },
            other => panic!("expected SafetyExitExecuted, got {:?}", other),
        }

        // Detection dropped after the close
        assert!(w.net.detections().await.is_empty());
    }

    #[tokio::test]
    async fn test_never_touches_engine_owned_pair_via_cache() {
        let w = world();
        let symbol = Symbol::from_pair("ETHUSDT").unwrap();
        w.exchange.set_positions(vec![eth_short()]);
        w.market.push_tick(&symbol, dec!(2041)).await;

        // Layer 1: exclusion cache from the bus
        w.net.add_exclusion(&symbol, Side::Short).await;

        w.net.poll_once().await.unwrap();

        assert!(w.net.detections().await.is_empty());
        assert_eq!(w.exchange.accepted_order_count(), 0);
    }

    #[tokio::test]
    async fn test_never_touches_engine_owned_pair_via_store() {
        // Layer 2: missed bus event, but the store knows the engine owns
        // the pair
        let w = world();
        let symbol = Symbol::from_pair("ETHUSDT").unwrap();

        let position = marlim_domain::Position::arm(
            Uuid::now_v7(),
            symbol.clone(),
            Side::Short,
            marlim_domain::RiskConfig::new(dec!(10000), dec!(1)).unwrap(),
            marlim_domain::TechStopDistance::new(dec!(40)).unwrap(),
            marlim_domain::SymbolFilters::new(dec!(0.01), dec!(0.001)).unwrap(),
        )
        .unwrap();
        let event = marlim_domain::Event::PositionArmed {
            position_id: position.id,
            account_id: position.account_id,
            symbol: symbol.clone(),
            side: Side::Short,
            risk_config: position.risk_config,
            tech_stop_distance: position.tech_stop_distance,
            filters: position.filters,
            timestamp: position.created_at,
        };
        w.store.append(&event, &position).await.unwrap();

        w.exchange.set_positions(vec![eth_short()]);
        w.market.push_tick(&symbol, dec!(2041)).await;

        w.net.poll_once().await.unwrap();

        assert!(w.net.detections().await.is_empty());
        assert_eq!(w.exchange.accepted_order_count(), 0);
    }

    #[tokio::test]
    async fn test_core_open_event_drops_racing_detection() {
        // The brief race where both could see the pair
        let w = world();
        let symbol = Symbol::from_pair("ETHUSDT").unwrap();
        w.exchange.set_positions(vec![eth_short()]);
        w.market.push_tick(&symbol, dec!(2000)).await;
        w.net.poll_once().await.unwrap();
        assert_eq!(w.net.detections().await.len(), 1);

        w.net
            .handle_bus_event(BusEvent::CorePositionOpened {
                position_id: Uuid::now_v7(),
                symbol: symbol.clone(),
                side: Side::Short,
                exchange_position_id: None,
            })
            .await;

        assert!(w.net.detections().await.is_empty());
        let status = w.net.status().await;
        assert_eq!(status.excluded, 1);
    }

    #[tokio::test]
    async fn test_externally_closed_position_is_forgotten() {
        let w = world();
        let symbol = Symbol::from_pair("ETHUSDT").unwrap();
        w.exchange.set_positions(vec![eth_short()]);
        w.market.push_tick(&symbol, dec!(2000)).await;
        w.net.poll_once().await.unwrap();
        assert_eq!(w.net.detections().await.len(), 1);

        // The position disappears from the exchange
        w.exchange.set_positions(vec![]);
        w.net.poll_once().await.unwrap();

        assert!(w.net.detections().await.is_empty());
    }

    #[tokio::test]
    async fn test_self_test_counts_positions() {
        let w = world();
        w.exchange.set_positions(vec![eth_short()]);
        assert_eq!(w.net.self_test().await.unwrap(), 1);
    }

    #[test]
    fn test_attempt_failure_tracking() {
        let mut attempt = ExecutionAttempt::new();
        assert!(!attempt.panic_mode);

        attempt.record_failure("e1".to_string(), 3);
        attempt.record_failure("e2".to_string(), 3);
        assert!(!attempt.panic_mode);

        attempt.record_failure("e3".to_string(), 3);
        assert!(attempt.panic_mode);
        assert_eq!(attempt.consecutive_failures, 3);
    }
}
