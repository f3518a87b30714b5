//! Daemon: the runtime host.
//!
//! Wires the components together and supervises the main loop:
//!
//! 1. Reconcile (startup is a discontinuity by definition)
//! 2. Restore live position tasks from the store
//! 3. Bridge exchange fill/tick streams into the manager, re-running the
//!    reconciler whenever a stream reports a gap
//! 4. Serve the operator API
//! 5. On SIGINT/SIGTERM: drain tasks (bounded), release leases, stop
//!
//! The fill and tick bridges are tasks of their own; the main loop only
//! coordinates shutdown and gap-triggered reconciliation.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use marlim_domain::AccountId;
use marlim_engine::{Engine, InsurancePolicy};
use marlim_exec::{
    ExchangePort, Executor, FillStreamEvent, MarketDataPort, MarketStreamEvent, StubExchange,
    StubMarketData,
};
use marlim_lease::{LeaseManager, MemoryLeaseManager};
use marlim_store::{MemoryStore, Store};

use crate::api::{create_router, ApiState};
use crate::config::Config;
use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::EventBus;
use crate::metrics::Metrics;
use crate::position_manager::PositionManager;
use crate::position_task::TaskBudgets;
use crate::reconciler::Reconciler;
use crate::safety_net::SafetyNet;

/// Drain budget for graceful shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// The assembled daemon.
pub struct Daemon<E: ExchangePort + 'static, S: Store + 'static, M: MarketDataPort + 'static> {
    config: Config,
    manager: Arc<PositionManager<E, S>>,
    safety: Arc<SafetyNet<E, S, M>>,
    reconciler: Arc<Reconciler<E, S>>,
    store: Arc<S>,
    exchange: Arc<E>,
    market: Arc<M>,
    metrics: Arc<Metrics>,
    degraded: Arc<AtomicBool>,
    account_id: AccountId,
}

impl Daemon<StubExchange, MemoryStore, StubMarketData> {
    /// Paper-mode daemon: stub exchange and market data, in-memory store
    /// and leases.
    pub fn new_paper(config: Config) -> Self {
        let exchange = Arc::new(StubExchange::new(Decimal::from(100000)));
        let market = Arc::new(StubMarketData::new());
        let store = Arc::new(MemoryStore::new());
        let lease_manager: Arc<dyn LeaseManager> = Arc::new(MemoryLeaseManager::new());
        Self::assemble(config, exchange, market, store, lease_manager, Uuid::now_v7())
    }
}

impl<E, S, M> Daemon<E, S, M>
where
    E: ExchangePort + 'static,
    S: Store + 'static,
    M: MarketDataPort + 'static,
{
    /// Wire a daemon from explicit components.
    pub fn assemble(
        config: Config,
        exchange: Arc<E>,
        market: Arc<M>,
        store: Arc<S>,
        lease_manager: Arc<dyn LeaseManager>,
        account_id: AccountId,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let degraded = Arc::new(AtomicBool::new(false));
        let bus = Arc::new(EventBus::default());
        let executor = Arc::new(Executor::new(exchange.clone(), store.clone()));

        let insurance = if config.insurance_enabled() {
            InsurancePolicy::enabled(config.engine.insurance_buffer_pct)
        } else {
            InsurancePolicy::disabled()
        };
        let engine = Engine::new(insurance, config.engine.fill_tolerance_pct);

        let budgets = TaskBudgets {
            entry_ack_timeout: config.engine.entry_ack_timeout,
            ..TaskBudgets::default()
        };

        let manager = Arc::new(PositionManager::new(
            engine,
            executor.clone(),
            store.clone(),
            lease_manager,
            config.lease.clone(),
            bus.clone(),
            metrics.clone(),
            budgets,
            degraded.clone(),
        ));

        let safety = Arc::new(SafetyNet::new(
            executor.clone(),
            store.clone(),
            market.clone(),
            bus.clone(),
            metrics.clone(),
            config.safety.clone(),
            account_id,
        ));

        let reconciler = Arc::new(Reconciler::new(
            executor,
            store.clone(),
            account_id,
            metrics.clone(),
            degraded.clone(),
        ));

        Self {
            config,
            manager,
            safety,
            reconciler,
            store,
            exchange,
            market,
            metrics,
            degraded,
            account_id,
        }
    }

    pub fn manager(&self) -> Arc<PositionManager<E, S>> {
        self.manager.clone()
    }

    /// Run until shutdown.
    pub async fn run(self) -> DaemonResult<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            "Starting marlimd"
        );

        // 1. Startup reconciliation, then restore tasks
        self.reconciler.run().await?;
        self.manager.restore().await?;

        // 2. Safety net
        let safety_handle = if self.config.safety.enabled {
            Some(self.safety.clone().start())
        } else {
            info!("Safety net disabled by config");
            None
        };

        // 3. Stream bridges: fills and ticks into the manager, gaps into
        //    the reconcile channel
        let (gap_tx, mut gap_rx) = mpsc::channel::<&'static str>(8);
        let shutdown = CancellationToken::new();

        self.spawn_fill_bridge(gap_tx.clone(), shutdown.clone()).await?;
        self.spawn_symbol_watcher(gap_tx.clone(), shutdown.clone());

        // 4. Operator API
        let api_addr = self.start_api_server().await?;
        info!(%api_addr, "Operator API listening");

        // 5. Main loop
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }

                Some(source) = gap_rx.recv() => {
                    warn!(source, "Stream gap, reconciling");
                    if let Err(e) = self.reconciler.run().await {
                        error!(error = %e, "Gap reconciliation failed");
                    }
                }
            }
        }

        // 6. Graceful shutdown: no new intents, drain, release
        shutdown.cancel();
        self.manager.shutdown(SHUTDOWN_DRAIN).await;
        self.safety.shutdown();
        if let Some(handle) = safety_handle {
            let _ = handle.await;
        }

        info!("marlimd stopped");
        Ok(())
    }

    /// Bridge exchange fills into position mailboxes.
    async fn spawn_fill_bridge(
        &self,
        gap_tx: mpsc::Sender<&'static str>,
        shutdown: CancellationToken,
    ) -> DaemonResult<()> {
        let mut fills = self
            .exchange
            .subscribe_fills()
            .await
            .map_err(marlim_exec::ExecError::from)?;
        let manager = self.manager.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = fills.recv() => match event {
                        Some(FillStreamEvent::Fill(fill)) => {
                            manager.route_fill(fill).await;
                        },
                        Some(FillStreamEvent::GapDetected) => {
                            let _ = gap_tx.send("fills").await;
                        },
                        None => {
                            warn!("Fill stream ended");
                            let _ = gap_tx.send("fills-closed").await;
                            break;
                        },
                    }
                }
            }
        });

        Ok(())
    }

    /// Watch live symbols and keep one tick subscription per symbol.
    fn spawn_symbol_watcher(
        &self,
        gap_tx: mpsc::Sender<&'static str>,
        shutdown: CancellationToken,
    ) {
        let store = self.store.clone();
        let market = self.market.clone();
        let manager = self.manager.clone();

        tokio::spawn(async move {
            let mut watched: HashSet<String> = HashSet::new();
            let mut scan = tokio::time::interval(Duration::from_secs(2));
            scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = scan.tick() => {}
                }

                let live = match store.positions().list_active().await {
                    Ok(live) => live,
                    Err(e) => {
                        warn!(error = %e, "Symbol scan failed");
                        continue;
                    },
                };

                for position in live {
                    let pair = position.symbol.as_pair();
                    if watched.contains(&pair) {
                        continue;
                    }

                    match market.subscribe_ticks(&position.symbol).await {
                        Ok(mut ticks) => {
                            info!(symbol = %pair, "Tick subscription started");
                            watched.insert(pair);

                            let manager = manager.clone();
                            let gap_tx = gap_tx.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                loop {
                                    tokio::select! {
                                        _ = shutdown.cancelled() => break,
                                        event = ticks.recv() => match event {
                                            Some(MarketStreamEvent::Tick(tick)) => {
                                                manager.route_tick(tick).await;
                                            },
                                            Some(MarketStreamEvent::GapDetected) => {
                                                let _ = gap_tx.send("ticks").await;
                                            },
                                            None => break,
                                        }
                                    }
                                }
                            });
                        },
                        Err(e) => {
                            warn!(symbol = %pair, error = %e, "Tick subscribe failed");
                        },
                    }
                }
            }
        });
    }

    async fn start_api_server(&self) -> DaemonResult<SocketAddr> {
        let state = Arc::new(ApiState {
            manager: self.manager.clone(),
            safety: self.safety.clone(),
            store: self.store.clone(),
            exchange: self.exchange.clone(),
            metrics: self.metrics.clone(),
            degraded: self.degraded.clone(),
            default_account: self.account_id,
            risk_fraction_pct: self.config.engine.risk_fraction_pct,
        });

        let router = create_router(state);
        let addr = format!("{}:{}", self.config.api.host, self.config.api.port);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| DaemonError::Config(format!("bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DaemonError::Config(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "API server error");
            }
        });

        Ok(local_addr)
    }
}

// =============================================================================
// Tests
// =============================================================================
