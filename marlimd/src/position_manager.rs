//! Position manager: owns the per-position tasks.
//!
//! Arms new positions, acquires their leases, spawns and supervises the
//! engine tasks, and routes inbound messages (signals, ticks, fills,
//! operator commands) into the right mailbox.
//!
//! Supervision: a panicked task is restarted from its persisted snapshot
//! with exponential backoff up to a cap, then the position is parked in
//! Error. A task that loses its lease is respawned only after the lease is
//! reacquired, and the daemon reconciles before new entries resume.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use marlim_domain::{
    ClientOrderId, EntrySignal, Event, OrderNamespace, Position, PositionId, RiskConfig, Side,
    Symbol, SymbolFilters, TechStopDistance,
};
use marlim_engine::{Engine, Tick};
use marlim_exec::{ExchangePort, Executor, FillEvent};
use marlim_lease::{LeaseKey, LeaseManager};
use marlim_store::Store;

use crate::config::LeaseConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::EventBus;
use crate::metrics::Metrics;
use crate::position_task::{
    PositionCommand, PositionMsg, PositionTask, TaskBudgets, TaskExit,
};
use crate::signal_port::{CrossoverDetector, DetectorConfig};

/// Restart policy for panicked tasks.
const MAX_RESTARTS: u32 = 5;
const RESTART_BACKOFF_START: Duration = Duration::from_millis(200);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(30);

struct TaskHandle {
    sender: mpsc::Sender<PositionMsg>,
    cancel: CancellationToken,
    symbol: Symbol,
}

struct DetectorHandle {
    ticks: mpsc::Sender<Tick>,
    cancel: CancellationToken,
    symbol: Symbol,
}

/// Manages position lifecycle tasks.
pub struct PositionManager<E: ExchangePort + 'static, S: Store + 'static> {
    engine: Engine,
    executor: Arc<Executor<E, S>>,
    store: Arc<S>,
    lease_manager: Arc<dyn LeaseManager>,
    lease_config: LeaseConfig,
    bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
    budgets: TaskBudgets,
    degraded: Arc<AtomicBool>,
    tasks: RwLock<HashMap<PositionId, TaskHandle>>,
    detectors: RwLock<HashMap<PositionId, DetectorHandle>>,
}

impl<E: ExchangePort + 'static, S: Store + 'static> PositionManager<E, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Engine,
        executor: Arc<Executor<E, S>>,
        store: Arc<S>,
        lease_manager: Arc<dyn LeaseManager>,
        lease_config: LeaseConfig,
        bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
        budgets: TaskBudgets,
        degraded: Arc<AtomicBool>,
    ) -> Self {
        Self {
            engine,
            executor,
            store,
            lease_manager,
            lease_config,
            bus,
            metrics,
            budgets,
            degraded,
            tasks: RwLock::new(HashMap::new()),
            detectors: RwLock::new(HashMap::new()),
        }
    }

    pub fn degraded_flag(&self) -> Arc<AtomicBool> {
        self.degraded.clone()
    }

    // =========================================================================
    // Arm / restore
    // =========================================================================

    /// Arm a new position and spawn its engine task.
    pub async fn arm_position(
        self: &Arc<Self>,
        account_id: Uuid,
        symbol: Symbol,
        side: Side,
        risk_config: RiskConfig,
        tech_stop_distance: TechStopDistance,
        filters: SymbolFilters,
    ) -> DaemonResult<Position> {
        let position = Position::arm(
            account_id,
            symbol.clone(),
            side,
            risk_config,
            tech_stop_distance,
            filters,
        )?;

        // Lease first: an arm that cannot take the (account, symbol) key
        // must leave no trace in the log.
        let key = LeaseKey::new(account_id, symbol.clone());
        let lease = self
            .lease_manager
            .acquire(&key, self.lease_config.ttl)
            .await?;

        let event = Event::PositionArmed {
            position_id: position.id,
            account_id,
            symbol: symbol.clone(),
            side,
            risk_config,
            tech_stop_distance,
            filters,
            timestamp: position.created_at,
        };
        self.store.events().append(&event, &position).await?;
        self.metrics.positions_armed.inc();

        info!(
            position_id = %position.id,
            symbol = %symbol.as_pair(),
            %side,
            distance = %tech_stop_distance,
            "Position armed"
        );

        self.spawn_with_lease(position.clone(), key, lease).await;
        Ok(position)
    }

    /// Respawn tasks for every live position in the store (startup, after
    /// the reconciler has aligned state).
    pub async fn restore(self: &Arc<Self>) -> DaemonResult<usize> {
        let live = self.store.positions().list_active().await?;
        let count = live.len();

        for position in live {
            if let Err(e) = self.spawn_task(position.clone()).await {
                error!(position_id = %position.id, error = %e, "Failed to restore position task");
            }
        }

        if count > 0 {
            info!(count, "Restored live position tasks");
        }
        Ok(count)
    }

    /// Spawn the supervised engine task for a position, acquiring its lease.
    async fn spawn_task(self: &Arc<Self>, position: Position) -> DaemonResult<()> {
        let key = LeaseKey::new(position.account_id, position.symbol.clone());
        let lease = self
            .lease_manager
            .acquire(&key, self.lease_config.ttl)
            .await?;
        self.spawn_with_lease(position, key, lease).await;
        Ok(())
    }

    async fn spawn_with_lease(
        self: &Arc<Self>,
        position: Position,
        key: LeaseKey,
        lease: marlim_lease::Lease,
    ) {
        let position_id = position.id;
        let cancel = CancellationToken::new();
        let (sender, receiver) = mpsc::channel(256);

        self.tasks.write().await.insert(
            position_id,
            TaskHandle {
                sender,
                cancel: cancel.clone(),
                symbol: position.symbol.clone(),
            },
        );
        self.metrics
            .active_positions
            .set(self.tasks.read().await.len() as i64);

        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .supervise(position, key, lease, receiver, cancel)
                .await;
        });
    }

    /// Supervision loop: run, and restart on panic or lease loss.
    async fn supervise(
        self: Arc<Self>,
        mut position: Position,
        key: LeaseKey,
        mut lease: marlim_lease::Lease,
        mut receiver: mpsc::Receiver<PositionMsg>,
        cancel: CancellationToken,
    ) {
        let position_id = position.id;
        let mut restarts = 0u32;
        let mut backoff = RESTART_BACKOFF_START;

        loop {
            let task = PositionTask::new(
                position.clone(),
                self.engine.clone(),
                self.executor.clone(),
                self.store.clone(),
                self.lease_manager.clone(),
                lease.clone(),
                self.lease_config.clone(),
                self.bus.clone(),
                self.metrics.clone(),
                self.budgets.clone(),
                self.degraded.clone(),
            );

            let join = tokio::spawn(task.run(receiver, cancel.clone())).await;

            match join {
                Ok(TaskExit::Terminal) | Ok(TaskExit::Cancelled) => break,

                Ok(TaskExit::LeaseLost) => {
                    warn!(%position_id, "Reacquiring lost lease");
                    lease = match self.reacquire(&key, &cancel).await {
                        Some(lease) => lease,
                        None => break, // cancelled while waiting
                    };
                    // No intents were issued since the loss; resume from
                    // the persisted snapshot after reconciliation.
                    match self.store.positions().load_snapshot(position_id).await {
                        Ok(Some(snapshot)) => position = snapshot,
                        _ => break,
                    }
                    let (tx, rx) = mpsc::channel(256);
                    self.replace_sender(position_id, tx).await;
                    receiver = rx;
                },

                Err(join_error) => {
                    if !join_error.is_panic() {
                        break;
                    }
                    restarts += 1;
                    error!(
                        %position_id,
                        restarts,
                        "Position task panicked"
                    );

                    if restarts > MAX_RESTARTS {
                        self.park_in_error(position_id, "task panicked past restart budget")
                            .await;
                        break;
                    }

                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RESTART_BACKOFF_CAP);

                    lease = match self.reacquire(&key, &cancel).await {
                        Some(lease) => lease,
                        None => break,
                    };
                    match self.store.positions().load_snapshot(position_id).await {
                        Ok(Some(snapshot)) if snapshot.is_live() => position = snapshot,
                        _ => break,
                    }
                    let (tx, rx) = mpsc::channel(256);
                    self.replace_sender(position_id, tx).await;
                    receiver = rx;
                },
            }
        }

        self.tasks.write().await.remove(&position_id);
        self.detectors.write().await.remove(&position_id);
        self.metrics
            .active_positions
            .set(self.tasks.read().await.len() as i64);
        debug!(%position_id, "Supervision ended");
    }

    /// Acquire a lease, retrying until success or cancellation. The old
    /// holder's TTL bounds the wait.
    async fn reacquire(
        &self,
        key: &LeaseKey,
        cancel: &CancellationToken,
    ) -> Option<marlim_lease::Lease> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match self.lease_manager.acquire(key, self.lease_config.ttl).await {
                Ok(lease) => return Some(lease),
                Err(e) => {
                    debug!(%key, error = %e, "Lease reacquire pending");
                    tokio::time::sleep(self.lease_config.renew_interval()).await;
                },
            }
        }
    }

    async fn replace_sender(&self, position_id: PositionId, sender: mpsc::Sender<PositionMsg>) {
        if let Some(handle) = self.tasks.write().await.get_mut(&position_id) {
            handle.sender = sender;
        }
    }

    async fn park_in_error(&self, position_id: PositionId, reason: &str) {
        let Ok(Some(position)) = self.store.positions().load_snapshot(position_id).await else {
            return;
        };
        if position.is_terminal() {
            return;
        }

        let event = Event::PositionError {
            position_id,
            error: reason.to_string(),
            recoverable: false,
            timestamp: chrono::Utc::now(),
        };
        if let Ok(next) = position.apply(&event) {
            if let Err(e) = self.store.events().append(&event, &next).await {
                error!(%position_id, error = %e, "Failed to persist error state");
            }
        }
        self.metrics.positions_errored.inc();
    }

    // =========================================================================
    // Detectors
    // =========================================================================

    /// Spawn the crossover detector for an armed position.
    pub async fn spawn_detector(self: &Arc<Self>, position: &Position) -> DaemonResult<()> {
        let config = DetectorConfig::from_position(position)?;
        let detector = CrossoverDetector::new(config)?;

        let (ticks_tx, ticks_rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();

        self.detectors.write().await.insert(
            position.id,
            DetectorHandle {
                ticks: ticks_tx,
                cancel: cancel.clone(),
                symbol: position.symbol.clone(),
            },
        );

        // Single-shot: publishes SignalFired on the bus and exits
        detector.spawn(ticks_rx, self.bus.clone(), cancel);
        Ok(())
    }

    async fn kill_detector(&self, position_id: PositionId) {
        if let Some(handle) = self.detectors.write().await.remove(&position_id) {
            handle.cancel.cancel();
            debug!(%position_id, "Detector cancelled");
        }
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Route an entry signal to its position task.
    pub async fn route_signal(&self, signal: EntrySignal) -> DaemonResult<()> {
        // The detector is single-shot; drop it as soon as its signal lands
        self.kill_detector(signal.position_id).await;

        let tasks = self.tasks.read().await;
        let Some(handle) = tasks.get(&signal.position_id) else {
            warn!(position_id = %signal.position_id, "Signal for unknown position");
            return Err(DaemonError::PositionNotFound(signal.position_id));
        };

        handle
            .sender
            .send(PositionMsg::Signal(signal))
            .await
            .map_err(|_| DaemonError::Shutdown)?;
        Ok(())
    }

    /// Fan a tick out to every task and detector on the symbol.
    pub async fn route_tick(&self, tick: Tick) {
        {
            let tasks = self.tasks.read().await;
            for handle in tasks.values().filter(|h| h.symbol == tick.symbol) {
                let _ = handle.sender.send(PositionMsg::Tick(tick.clone())).await;
            }
        }
        {
            let detectors = self.detectors.read().await;
            for handle in detectors.values().filter(|h| h.symbol == tick.symbol) {
                let _ = handle.ticks.send(tick.clone()).await;
            }
        }
    }

    /// Route a fill notification to the owning position task.
    ///
    /// Only `core_` fills concern the engine; `safety_` fills belong to the
    /// safety net, and foreign client ids are not ours at all.
    pub async fn route_fill(&self, fill: FillEvent) {
        match ClientOrderId::parse(&fill.client_order_id) {
            Some((OrderNamespace::Core, _)) => {},
            _ => return,
        }

        let position_id = match self
            .store
            .orders()
            .find_by_client_id(&fill.client_order_id)
            .await
        {
            Ok(Some(order)) => order.position_id,
            _ => {
                debug!(client_order_id = %fill.client_order_id, "Fill without an order row");
                return;
            },
        };

        let tasks = self.tasks.read().await;
        if let Some(handle) = tasks.get(&position_id) {
            let _ = handle.sender.send(PositionMsg::Fill(fill)).await;
        }
    }

    // =========================================================================
    // Operator commands
    // =========================================================================

    pub async fn disarm(&self, position_id: PositionId, force: bool) -> DaemonResult<()> {
        self.kill_detector(position_id).await;

        let tasks = self.tasks.read().await;
        let handle = tasks
            .get(&position_id)
            .ok_or(DaemonError::PositionNotFound(position_id))?;

        handle
            .sender
            .send(PositionMsg::Command(PositionCommand::Disarm { force }))
            .await
            .map_err(|_| DaemonError::Shutdown)?;
        Ok(())
    }

    /// Panic: force exit of all (or one symbol's) live positions.
    pub async fn panic(&self, symbol: Option<&Symbol>) -> DaemonResult<Vec<PositionId>> {
        let tasks = self.tasks.read().await;
        let mut hit = Vec::new();

        for (position_id, handle) in tasks.iter() {
            if let Some(filter) = symbol {
                if &handle.symbol != filter {
                    continue;
                }
            }
            if handle
                .sender
                .send(PositionMsg::Command(PositionCommand::Panic))
                .await
                .is_ok()
            {
                hit.push(*position_id);
            }
        }

        warn!(count = hit.len(), "Panic dispatched");
        Ok(hit)
    }

    // =========================================================================
    // Queries / shutdown
    // =========================================================================

    pub async fn get_position(&self, position_id: PositionId) -> DaemonResult<Option<Position>> {
        Ok(self.store.positions().load_snapshot(position_id).await?)
    }

    pub async fn live_positions(&self) -> DaemonResult<Vec<Position>> {
        Ok(self.store.positions().list_active().await?)
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Graceful shutdown: cancel every task and wait (bounded) for their
    /// mailboxes to close. In-flight intents resolve at next startup.
    pub async fn shutdown(&self, drain_budget: Duration) {
        info!("Draining position tasks");

        {
            let tasks = self.tasks.read().await;
            for handle in tasks.values() {
                handle.cancel.cancel();
            }
            let detectors = self.detectors.read().await;
            for handle in detectors.values() {
                handle.cancel.cancel();
            }
        }

        let deadline = tokio::time::Instant::now() + drain_budget;
        while tokio::time::Instant::now() < deadline {
            if self.tasks.read().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let left = self.tasks.read().await.len();
        if left > 0 {
            warn!(left, "Shutdown drain budget exhausted");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position_task::degraded_flag;
    use marlim_exec::StubExchange;
    use marlim_lease::MemoryLeaseManager;
    use marlim_store::MemoryStore;
    use rust_decimal_macros::dec;

    struct World {
        manager: Arc<PositionManager<StubExchange, MemoryStore>>,
        store: Arc<MemoryStore>,
        exchange: Arc<StubExchange>,
        bus: Arc<EventBus>,
    }

    fn world() -> World {
        let exchange = Arc::new(StubExchange::new(dec!(100000)));
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(Executor::new(exchange.clone(), store.clone()));
        let bus = Arc::new(EventBus::new(128));
        let lease_manager: Arc<dyn LeaseManager> = Arc::new(MemoryLeaseManager::new());

        let manager = Arc::new(PositionManager::new(
            Engine::default_paper(),
            executor,
            store.clone(),
            lease_manager,
            LeaseConfig { ttl: Duration::from_secs(10) },
            bus.clone(),
            Arc::new(Metrics::new()),
            TaskBudgets::fast(),
            degraded_flag(),
        ));

        World { manager, store, exchange, bus }
    }

    async fn arm(world: &World, symbol: &str, side: Side) -> Position {
        world
            .manager
            .arm_position(
                Uuid::now_v7(),
                Symbol::from_pair(symbol).unwrap(),
                side,
                RiskConfig::new(dec!(10000), dec!(1)).unwrap(),
                TechStopDistance::new(dec!(500)).unwrap(),
                SymbolFilters::new(dec!(0.01), dec!(0.001)).unwrap(),
            )
            .await
            .unwrap()
    }

    async fn wait_state(world: &World, id: PositionId, state: &str) -> Position {
        use marlim_store::Store as _;
        for _ in 0..200 {
            if let Some(p) = world.store.positions().load_snapshot(id).await.unwrap() {
                if p.state.name() == state {
                    return p;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("never reached {}", state);
    }

    #[tokio::test]
    async fn test_arm_spawns_task_and_persists() {
        let w = world();
        let position = arm(&w, "BTCUSDT", Side::Long).await;

        assert_eq!(w.manager.task_count().await, 1);

        use marlim_store::Store as _;
        let stored = w
            .store
            .positions()
            .load_snapshot(position.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state.name(), "armed");
    }

    #[tokio::test]
    async fn test_second_arm_same_pair_conflicts_on_lease() {
        let w = world();
        arm(&w, "BTCUSDT", Side::Long).await;

        // One writer per (account, symbol). Different accounts are
        // independent keys, so use the same account to collide.
        let first = w.manager.live_positions().await.unwrap().pop().unwrap();
        let result = w
            .manager
            .arm_position(
                first.account_id,
                first.symbol.clone(),
                Side::Short,
                RiskConfig::new(dec!(10000), dec!(1)).unwrap(),
                TechStopDistance::new(dec!(500)).unwrap(),
                SymbolFilters::new(dec!(0.01), dec!(0.001)).unwrap(),
            )
            .await;

        assert!(matches!(result, Err(DaemonError::Lease(_))));
    }

    #[tokio::test]
    async fn test_signal_routing_full_lifecycle() {
        let w = world();
        let position = arm(&w, "BTCUSDT", Side::Long).await;

        let signal = EntrySignal::new(
            position.id,
            position.symbol.clone(),
            position.side,
            marlim_domain::Price::new(dec!(100000)).unwrap(),
        );
        w.manager.route_signal(signal).await.unwrap();
        wait_state(&w, position.id, "active").await;

        // Ticks route by symbol
        w.manager
            .route_tick(Tick::new(
                position.symbol.clone(),
                marlim_domain::Price::new(dec!(99400)).unwrap(),
            ))
            .await;

        let closed = wait_state(&w, position.id, "closed").await;
        assert!(closed.closed_at.is_some());

        // Task unregisters itself after the terminal state
        for _ in 0..100 {
            if w.manager.task_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(w.manager.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_panic_filters_by_symbol() {
        let w = world();
        let btc = arm(&w, "BTCUSDT", Side::Long).await;
        let eth = arm(&w, "ETHUSDT", Side::Long).await;

        let hit = w.manager.panic(Some(&btc.symbol)).await.unwrap();
        assert_eq!(hit, vec![btc.id]);

        // BTC disarms (it was still Armed), ETH stays armed
        wait_state(&w, btc.id, "closed").await;
        let eth_state = w
            .manager
            .get_position(eth.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(eth_state.state.name(), "armed");
    }

    #[tokio::test]
    async fn test_restore_respawns_live_tasks() {
        let w = world();
        let position = arm(&w, "BTCUSDT", Side::Long).await;

        // Simulate restart: drop all tasks
        w.manager.shutdown(Duration::from_millis(500)).await;
        assert_eq!(w.manager.task_count().await, 0);

        let restored = w.manager.restore().await.unwrap();
        assert_eq!(restored, 1);
        assert_eq!(w.manager.task_count().await, 1);

        let stored = w.manager.get_position(position.id).await.unwrap().unwrap();
        assert_eq!(stored.state.name(), "armed");
    }

    #[tokio::test]
    async fn test_fill_routing_ignores_foreign_namespaces() {
        let w = world();
        arm(&w, "BTCUSDT", Side::Long).await;

        // Fills with safety_ or foreign ids are never routed to core tasks
        let fill = FillEvent {
            exchange_order_id: "X-1".to_string(),
            client_order_id: "safety_0190aaaa000070008000000000000000".to_string(),
            status: marlim_domain::OrderStatus::Filled,
            filled_qty: marlim_domain::Quantity::new(dec!(1)).unwrap(),
            avg_fill_price: marlim_domain::Price::new(dec!(2000)).unwrap(),
            fee: dec!(0),
            timestamp: chrono::Utc::now(),
        };
        w.manager.route_fill(fill).await; // must not panic or mis-route

        let _ = w.bus.receiver_count();
    }
}
