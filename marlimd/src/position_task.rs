//! Per-position engine task.
//!
//! Each live position is owned by exactly one cooperative task holding the
//! (account, symbol) lease. The task owns a mailbox receiving signals,
//! ticks, fills and operator commands; messages are processed strictly one
//! at a time, so there is no concurrency on a single position's state.
//! Cross-position concurrency is free.
//!
//! Cancellation drains safely: an in-flight intent is never re-submitted
//! by a dying task; its resolution is the intent journal's job at the
//! next startup (`replay_pending`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use marlim_domain::{
    ClientOrderId, EntrySignal, Event, ExitReason, IntentId, Position, PositionState, Price,
};
use marlim_engine::{Engine, Tick, TickOutcome};
use marlim_exec::{
    ActionResult, ExchangePort, Executor, FillEvent, OrderStatusView,
};
use marlim_lease::{Lease, LeaseError, LeaseManager};
use marlim_store::Store;

use crate::config::LeaseConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::{BusEvent, EventBus};
use crate::metrics::Metrics;

// =============================================================================
// Messages
// =============================================================================

/// Operator commands routed into the mailbox.
#[derive(Debug, Clone)]
pub enum PositionCommand {
    /// Cancel an armed position; `force` escalates to a panic exit when
    /// the position is already live
    Disarm { force: bool },
    /// Force an immediate market exit
    Panic,
}

/// Mailbox messages. Processed one at a time, in arrival order.
#[derive(Debug, Clone)]
pub enum PositionMsg {
    Signal(EntrySignal),
    Tick(Tick),
    Fill(FillEvent),
    Command(PositionCommand),
}

/// Why the task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
    /// Position reached a terminal state
    Terminal,
    /// Lease lost; the owner must reconcile before respawning
    LeaseLost,
    /// Cancelled (shutdown)
    Cancelled,
}

/// Retry budgets (spec'd defaults in `Default`).
#[derive(Debug, Clone)]
pub struct TaskBudgets {
    /// Entry submit-to-ack budget before the lookup ladder starts
    pub entry_ack_timeout: Duration,
    /// Lookup attempts before an unresolved entry goes to Error
    pub entry_lookup_attempts: u32,
    /// First lookup backoff; doubles up to the cap
    pub lookup_backoff_start: Duration,
    pub lookup_backoff_cap: Duration,
    /// Rejected-exit resubmit attempts before ExitFailed
    pub exit_reject_attempts: u32,
}

impl Default for TaskBudgets {
    fn default() -> Self {
        Self {
            entry_ack_timeout: Duration::from_secs(10),
            entry_lookup_attempts: 5,
            lookup_backoff_start: Duration::from_millis(500),
            lookup_backoff_cap: Duration::from_secs(8),
            exit_reject_attempts: 5,
        }
    }
}

impl TaskBudgets {
    /// Short budgets for tests.
    pub fn fast() -> Self {
        Self {
            entry_ack_timeout: Duration::from_millis(100),
            entry_lookup_attempts: 5,
            lookup_backoff_start: Duration::from_millis(5),
            lookup_backoff_cap: Duration::from_millis(20),
            exit_reject_attempts: 3,
        }
    }
}

// =============================================================================
// Task
// =============================================================================

/// The engine task for one position.
pub struct PositionTask<E: ExchangePort, S: Store> {
    position: Position,
    engine: Engine,
    executor: Arc<Executor<E, S>>,
    store: Arc<S>,
    lease_manager: Arc<dyn LeaseManager>,
    lease: Lease,
    lease_config: LeaseConfig,
    bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
    budgets: TaskBudgets,
    /// Degraded mode: ticks are processed, new entries are not
    degraded: Arc<AtomicBool>,
    /// Panic arrived while Entering; exit as soon as the fill lands
    panic_pending: bool,
    /// Deadline for the in-flight order's fill before the lookup ladder
    /// starts (entry and exit share the same budget)
    ack_deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl<E: ExchangePort, S: Store> PositionTask<E, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        position: Position,
        engine: Engine,
        executor: Arc<Executor<E, S>>,
        store: Arc<S>,
        lease_manager: Arc<dyn LeaseManager>,
        lease: Lease,
        lease_config: LeaseConfig,
        bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
        budgets: TaskBudgets,
        degraded: Arc<AtomicBool>,
    ) -> Self {
        Self {
            position,
            engine,
            executor,
            store,
            lease_manager,
            lease,
            lease_config,
            bus,
            metrics,
            budgets,
            degraded,
            panic_pending: false,
            ack_deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn position_id(&self) -> marlim_domain::PositionId {
        self.position.id
    }

    /// Run the task to completion.
    pub async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<PositionMsg>,
        cancel: CancellationToken,
    ) -> TaskExit {
        self.cancel = cancel.clone();
        let mut renew = tokio::time::interval(self.lease_config.renew_interval());
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        renew.tick().await; // first tick fires immediately; skip it

        info!(
            position_id = %self.position.id,
            symbol = %self.position.symbol.as_pair(),
            state = self.position.state.name(),
            lease_token = self.lease.token,
            "Position task started"
        );

        let exit = loop {
            if self.position.is_terminal() {
                break TaskExit::Terminal;
            }

            let ack_deadline = self.ack_deadline;

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(position_id = %self.position.id, "Position task cancelled");
                    break TaskExit::Cancelled;
                }

                _ = renew.tick() => {
                    match self
                        .lease_manager
                        .renew(&self.lease, self.lease_config.ttl)
                        .await
                    {
                        Ok(lease) => self.lease = lease,
                        Err(LeaseError::Lost(key)) => {
                            // Stop issuing intents NOW; the manager
                            // reacquires and reconciles before respawning.
                            warn!(position_id = %self.position.id, %key, "Lease lost");
                            break TaskExit::LeaseLost;
                        },
                        Err(e) => {
                            warn!(position_id = %self.position.id, error = %e, "Lease renew backend error");
                        },
                    }
                }

                _ = async move {
                    match ack_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.ack_deadline = None;
                    let result = match &self.position.state {
                        PositionState::Entering { .. } => self.resolve_entry_by_lookup().await,
                        PositionState::Exiting { intent_id, .. } => {
                            let intent_id = *intent_id;
                            self.resolve_exit_by_lookup(intent_id).await
                        },
                        _ => Ok(()),
                    };
                    if let Err(e) = result {
                        error!(position_id = %self.position.id, error = %e, "Order resolution failed");
                        self.fail_position(format!("order resolution: {}", e)).await;
                    }
                }

                msg = mailbox.recv() => {
                    let Some(msg) = msg else { break TaskExit::Cancelled };
                    if let Err(e) = self.handle(msg).await {
                        error!(position_id = %self.position.id, error = %e, "Message handling failed");
                        self.fail_position(e.to_string()).await;
                    }
                }
            }
        };

        self.lease_manager.release(&self.lease).await;
        info!(
            position_id = %self.position.id,
            state = self.position.state.name(),
            ?exit,
            "Position task stopped"
        );
        exit
    }

    // =========================================================================
    // Message handling
    // =========================================================================

    async fn handle(&mut self, msg: PositionMsg) -> DaemonResult<()> {
        match msg {
            PositionMsg::Signal(signal) => self.handle_signal(signal).await,
            PositionMsg::Tick(tick) => self.handle_tick(tick).await,
            PositionMsg::Fill(fill) => self.handle_fill(fill).await,
            PositionMsg::Command(command) => self.handle_command(command).await,
        }
    }

    async fn handle_signal(&mut self, signal: EntrySignal) -> DaemonResult<()> {
        if self.degraded.load(Ordering::Relaxed) {
            info!(
                position_id = %self.position.id,
                signal_id = %signal.signal_id,
                "Degraded mode: entry signal dropped"
            );
            return Ok(());
        }

        // Only Armed (or a duplicate of the in-flight signal) is relevant
        let relevant = match &self.position.state {
            PositionState::Armed => true,
            PositionState::Entering { signal_id, .. } => *signal_id == signal.signal_id,
            _ => false,
        };
        if !relevant {
            debug!(
                position_id = %self.position.id,
                state = self.position.state.name(),
                "Signal ignored in this state"
            );
            return Ok(());
        }

        let intent_id = Uuid::now_v7();
        let decision = self.engine.decide_entry(&self.position, &signal, intent_id)?;
        if !decision.has_actions() {
            // Duplicate delivery of the same correlation id
            return Ok(());
        }

        let (position, results) = self
            .executor
            .execute(&self.position, decision.actions)
            .await?;
        self.position = position;

        for result in results {
            match result {
                ActionResult::OrderAccepted(ack) => {
                    debug!(
                        position_id = %self.position.id,
                        exchange_order_id = %ack.exchange_order_id,
                        "Entry order accepted, awaiting fill"
                    );
                    self.ack_deadline = Some(Instant::now() + self.budgets.entry_ack_timeout);
                },
                ActionResult::OrderUnresolved { .. } => {
                    // Ambiguous submit: the lookup ladder decides
                    self.resolve_entry_by_lookup().await?;
                },
                ActionResult::OrderRejected { reason, .. } => {
                    warn!(position_id = %self.position.id, %reason, "Entry rejected");
                    self.append_event(Event::EntryFailed {
                        position_id: self.position.id,
                        intent_id,
                        reason,
                        timestamp: chrono::Utc::now(),
                    })
                    .await?;
                    self.metrics.positions_errored.inc();
                },
                _ => {},
            }
        }

        Ok(())
    }

    async fn handle_tick(&mut self, tick: Tick) -> DaemonResult<()> {
        if !matches!(self.position.state, PositionState::Active { .. }) {
            return Ok(());
        }

        match self.engine.process_tick(&self.position, &tick)? {
            TickOutcome::NoAction => Ok(()),

            TickOutcome::StopAdvanced(decision) => {
                let (position, _) = self
                    .executor
                    .execute(&self.position, decision.actions)
                    .await?;
                self.position = position;
                self.metrics.trailing_updates.inc();
                Ok(())
            },

            TickOutcome::StopBreached { trigger_price, stop_price } => {
                info!(
                    position_id = %self.position.id,
                    trigger = %trigger_price,
                    stop = %stop_price,
                    "Trailing stop breached, exiting"
                );
                self.begin_exit(ExitReason::TrailingStop, trigger_price).await
            },
        }
    }

    async fn handle_fill(&mut self, fill: FillEvent) -> DaemonResult<()> {
        // Keep the order row current regardless of routing below
        self.executor.record_fill(&fill).await?;

        if !fill.status.eq(&marlim_domain::OrderStatus::Filled) {
            debug!(
                position_id = %self.position.id,
                client_order_id = %fill.client_order_id,
                status = ?fill.status,
                "Non-final fill event"
            );
            return Ok(());
        }

        match &self.position.state {
            PositionState::Entering { intent_id, .. } => {
                let expected = ClientOrderId::core(*intent_id);
                if fill.client_order_id != expected.as_str() {
                    return Ok(());
                }
                self.apply_entry_fill(fill.avg_fill_price, fill.filled_qty, fill.fee)
                    .await
            },

            PositionState::Exiting { intent_id, .. } => {
                let expected = ClientOrderId::core(*intent_id);
                if fill.client_order_id != expected.as_str() {
                    return Ok(());
                }
                self.apply_exit_fill(fill.avg_fill_price, fill.filled_qty, fill.fee)
                    .await
            },

            _ => Ok(()),
        }
    }

    async fn handle_command(&mut self, command: PositionCommand) -> DaemonResult<()> {
        match command {
            PositionCommand::Disarm { force } => match &self.position.state {
                PositionState::Armed => {
                    info!(position_id = %self.position.id, "Disarming");
                    self.append_event(Event::PositionDisarmed {
                        position_id: self.position.id,
                        timestamp: chrono::Utc::now(),
                    })
                    .await?;
                    Ok(())
                },
                PositionState::Active { current_price, .. } if force => {
                    let price = *current_price;
                    warn!(position_id = %self.position.id, "Forced disarm of a live position, panic exit");
                    self.begin_exit(ExitReason::OperatorPanic, price).await
                },
                other => Err(DaemonError::InvalidPositionState {
                    expected: "armed".to_string(),
                    actual: other.name().to_string(),
                }),
            },

            PositionCommand::Panic => match &self.position.state {
                PositionState::Armed => {
                    self.append_event(Event::PositionDisarmed {
                        position_id: self.position.id,
                        timestamp: chrono::Utc::now(),
                    })
                    .await
                },
                PositionState::Active { current_price, .. } => {
                    let price = *current_price;
                    self.begin_exit(ExitReason::OperatorPanic, price).await
                },
                PositionState::Entering { .. } => {
                    // Exit as soon as the entry fill lands
                    warn!(position_id = %self.position.id, "Panic while entering; exit queued");
                    self.panic_pending = true;
                    Ok(())
                },
                PositionState::Exiting { .. } => {
                    // A second panic could escalate to manual override;
                    // documented, not automatic.
                    info!(position_id = %self.position.id, "Already exiting");
                    Ok(())
                },
                other => Err(DaemonError::InvalidPositionState {
                    expected: "armed|entering|active".to_string(),
                    actual: other.name().to_string(),
                }),
            },
        }
    }

    // =========================================================================
    // Entry resolution
    // =========================================================================

    async fn apply_entry_fill(
        &mut self,
        fill_price: Price,
        filled_qty: marlim_domain::Quantity,
        fee: rust_decimal::Decimal,
    ) -> DaemonResult<()> {
        let decision = self
            .engine
            .process_entry_fill(&self.position, fill_price, filled_qty, fee)?;
        if !decision.has_actions() {
            return Ok(()); // replay on an already-active position
        }

        let (position, _) = self
            .executor
            .execute(&self.position, decision.actions)
            .await?;
        self.position = position;
        self.ack_deadline = None;
        self.metrics.positions_opened.inc();

        self.bus.publish(BusEvent::CorePositionOpened {
            position_id: self.position.id,
            symbol: self.position.symbol.clone(),
            side: self.position.side,
            exchange_position_id: self.position.exchange_position_id.clone(),
        });

        if self.panic_pending {
            self.panic_pending = false;
            return self.begin_exit(ExitReason::OperatorPanic, fill_price).await;
        }

        Ok(())
    }

    /// The bounded lookup ladder for an unresolved entry.
    ///
    /// Never resubmits: either the exchange confirms the order (and we
    /// proceed on its truth), or the entry fails after the budget.
    async fn resolve_entry_by_lookup(&mut self) -> DaemonResult<()> {
        let PositionState::Entering { intent_id, .. } = self.position.state else {
            return Ok(());
        };
        let client_order_id = ClientOrderId::core(intent_id);

        let mut backoff = self.budgets.lookup_backoff_start;
        for attempt in 1..=self.budgets.entry_lookup_attempts {
            match self
                .executor
                .exchange()
                .lookup_order(&self.position.symbol, &client_order_id)
                .await
            {
                Ok(Some(view)) if view.is_filled() => {
                    info!(
                        position_id = %self.position.id,
                        attempt,
                        "Lookup confirmed entry fill"
                    );
                    let (price, qty, fee) = fill_from_view(&view)?;
                    return self.apply_entry_fill(price, qty, fee).await;
                },
                Ok(Some(_)) => {
                    debug!(position_id = %self.position.id, attempt, "Order still open");
                },
                Ok(None) => {
                    debug!(position_id = %self.position.id, attempt, "Order not on exchange");
                },
                Err(e) => {
                    warn!(position_id = %self.position.id, attempt, error = %e, "Lookup failed");
                },
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.budgets.lookup_backoff_cap);
        }

        warn!(position_id = %self.position.id, "Entry unresolved past the lookup budget");
        self.append_event(Event::EntryFailed {
            position_id: self.position.id,
            intent_id,
            reason: "unresolved past lookup budget".to_string(),
            timestamp: chrono::Utc::now(),
        })
        .await?;
        self.metrics.positions_errored.inc();
        Ok(())
    }

    // =========================================================================
    // Exit path
    // =========================================================================

    async fn begin_exit(&mut self, reason: ExitReason, trigger_price: Price) -> DaemonResult<()> {
        let intent_id = Uuid::now_v7();
        let decision = self
            .engine
            .decide_exit(&self.position, reason, trigger_price, intent_id)?;
        if !decision.has_actions() {
            return Ok(()); // already exiting
        }

        let (position, results) = self
            .executor
            .execute(&self.position, decision.actions)
            .await?;
        self.position = position;

        for result in results {
            match result {
                ActionResult::OrderAccepted(_) => {
                    self.ack_deadline = Some(Instant::now() + self.budgets.entry_ack_timeout);
                },
                ActionResult::OrderUnresolved { .. } => {
                    self.resolve_exit_by_lookup(intent_id).await?;
                },
                ActionResult::OrderRejected { reason, .. } => {
                    self.retry_rejected_exit(intent_id, reason).await?;
                },
                _ => {},
            }
        }

        Ok(())
    }

    async fn apply_exit_fill(
        &mut self,
        fill_price: Price,
        filled_qty: marlim_domain::Quantity,
        fee: rust_decimal::Decimal,
    ) -> DaemonResult<()> {
        let decision = self
            .engine
            .process_exit_fill(&self.position, fill_price, filled_qty, fee)?;
        if !decision.has_actions() {
            return Ok(());
        }

        let (position, _) = self
            .executor
            .execute(&self.position, decision.actions)
            .await?;
        self.position = position;
        self.ack_deadline = None;
        self.metrics.positions_closed.inc();

        self.bus.publish(BusEvent::CorePositionClosed {
            position_id: self.position.id,
            symbol: self.position.symbol.clone(),
            side: self.position.side,
        });

        Ok(())
    }

    /// Unbounded exit resolution: the operator must always be able to get
    /// flat, so this keeps looking (and resubmitting the SAME intent when
    /// the exchange never saw it) with capped backoff.
    async fn resolve_exit_by_lookup(&mut self, intent_id: IntentId) -> DaemonResult<()> {
        let client_order_id = ClientOrderId::core(intent_id);
        let mut backoff = self.budgets.lookup_backoff_start;

        loop {
            if self.cancel.is_cancelled() {
                // Resolution continues via replay_pending at next startup
                return Ok(());
            }

            match self
                .executor
                .exchange()
                .lookup_order(&self.position.symbol, &client_order_id)
                .await
            {
                Ok(Some(view)) if view.is_filled() => {
                    let (price, qty, fee) = fill_from_view(&view)?;
                    return self.apply_exit_fill(price, qty, fee).await;
                },
                Ok(Some(_)) => {
                    debug!(position_id = %self.position.id, "Exit order still open");
                },
                Ok(None) => {
                    // Never reached the exchange: resubmit with the same id
                    if let Some(intent) = self
                        .executor
                        .journal()
                        .find(intent_id, self.position.id)
                        .await?
                    {
                        match self.executor.submit_intent(&intent).await? {
                            ActionResult::OrderAccepted(_) => {},
                            ActionResult::OrderRejected { reason, .. } => {
                                return Box::pin(self.retry_rejected_exit(intent_id, reason)).await;
                            },
                            _ => {},
                        }
                    }
                },
                Err(e) => {
                    warn!(position_id = %self.position.id, error = %e, "Exit lookup failed");
                },
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.budgets.lookup_backoff_cap);
        }
    }

    async fn retry_rejected_exit(
        &mut self,
        intent_id: IntentId,
        first_reason: String,
    ) -> DaemonResult<()> {
        let mut backoff = self.budgets.lookup_backoff_start;
        let mut last_reason = first_reason;

        for attempt in 1..=self.budgets.exit_reject_attempts {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.budgets.lookup_backoff_cap);

            let Some(intent) = self
                .executor
                .journal()
                .find(intent_id, self.position.id)
                .await?
            else {
                break;
            };

            warn!(
                position_id = %self.position.id,
                attempt,
                reason = %last_reason,
                "Retrying rejected exit"
            );

            match self.executor.submit_intent(&intent).await? {
                ActionResult::OrderAccepted(_) => return Ok(()),
                ActionResult::OrderRejected { reason, .. } => last_reason = reason,
                ActionResult::OrderUnresolved { .. } => {
                    return Box::pin(self.resolve_exit_by_lookup(intent_id)).await;
                },
                _ => return Ok(()),
            }
        }

        error!(
            position_id = %self.position.id,
            reason = %last_reason,
            "Exit rejected past the retry budget"
        );
        self.append_event(Event::ExitFailed {
            position_id: self.position.id,
            intent_id,
            reason: last_reason,
            timestamp: chrono::Utc::now(),
        })
        .await?;
        self.metrics.positions_errored.inc();
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Apply and persist an event, with bounded storage retries. The state
    /// never advances past an unpersisted event.
    async fn append_event(&mut self, event: Event) -> DaemonResult<()> {
        let next = self.position.apply(&event)?;

        let mut backoff = Duration::from_millis(100);
        let mut last_error = None;
        for _ in 0..3 {
            match self.store.events().append(&event, &next).await {
                Ok(_) => {
                    self.position = next;
                    return Ok(());
                },
                Err(e) => {
                    warn!(position_id = %self.position.id, error = %e, "Event append failed, retrying");
                    last_error = Some(e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 3;
                },
            }
        }

        Err(DaemonError::Store(last_error.expect("retry loop ran")))
    }

    async fn fail_position(&mut self, reason: String) {
        let event = Event::PositionError {
            position_id: self.position.id,
            error: reason,
            recoverable: true,
            timestamp: chrono::Utc::now(),
        };

        if let Ok(next) = self.position.apply(&event) {
            if self.store.events().append(&event, &next).await.is_ok() {
                self.position = next;
            }
        }
        self.metrics.positions_errored.inc();
    }
}

fn fill_from_view(
    view: &OrderStatusView,
) -> DaemonResult<(Price, marlim_domain::Quantity, rust_decimal::Decimal)> {
    let price = view.avg_fill_price.ok_or_else(|| DaemonError::InvalidPositionState {
        expected: "filled order with price".to_string(),
        actual: "filled order without price".to_string(),
    })?;
    let qty = view.filled_qty.ok_or_else(|| DaemonError::InvalidPositionState {
        expected: "filled order with qty".to_string(),
        actual: "filled order without qty".to_string(),
    })?;
    Ok((price, qty, view.fee_paid))
}

/// Shared degraded-mode flag (reconciler sets, tasks read).
pub fn degraded_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use marlim_domain::{RiskConfig, Side, Symbol, SymbolFilters, TechStopDistance};
    use marlim_exec::{StubExchange, InjectedFailure};
    use marlim_lease::{LeaseKey, MemoryLeaseManager};
    use marlim_store::{MemoryStore, Store as _};
    use rust_decimal_macros::dec;

    struct Harness {
        tx: mpsc::Sender<PositionMsg>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<TaskExit>,
        store: Arc<MemoryStore>,
        exchange: Arc<StubExchange>,
        position_id: marlim_domain::PositionId,
        bus: Arc<EventBus>,
    }

    async fn spawn_armed(side: Side) -> Harness {
        let exchange = Arc::new(StubExchange::new(dec!(100000)));
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(Executor::new(exchange.clone(), store.clone()));
        let bus = Arc::new(EventBus::new(64));
        let metrics = Arc::new(Metrics::new());
        let lease_manager: Arc<dyn LeaseManager> = Arc::new(MemoryLeaseManager::new());

        let position = Position::arm(
            Uuid::now_v7(),
            Symbol::from_pair("BTCUSDT").unwrap(),
            side,
            RiskConfig::new(dec!(10000), dec!(1)).unwrap(),
            TechStopDistance::new(dec!(500)).unwrap(),
            SymbolFilters::new(dec!(0.01), dec!(0.001)).unwrap(),
        )
        .unwrap();
        let position_id = position.id;

        // Persist the armed event the way the manager does
        let armed_event = Event::PositionArmed {
            position_id,
            account_id: position.account_id,
            symbol: position.symbol.clone(),
            side: position.side,
            risk_config: position.risk_config,
            tech_stop_distance: position.tech_stop_distance,
            filters: position.filters,
            timestamp: position.created_at,
        };
        store.events().append(&armed_event, &position).await.unwrap();

        let lease_config = LeaseConfig { ttl: Duration::from_secs(10) };
        let key = LeaseKey::new(position.account_id, position.symbol.clone());
        let lease = lease_manager.acquire(&key, lease_config.ttl).await.unwrap();

        let task = PositionTask::new(
            position,
            Engine::default_paper(),
            executor,
            store.clone(),
            lease_manager,
            lease,
            lease_config,
            bus.clone(),
            metrics,
            TaskBudgets::fast(),
            degraded_flag(),
        );

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task.run(rx, cancel.clone()));

        Harness {
            tx,
            cancel,
            handle,
            store,
            exchange,
            position_id,
            bus,
        }
    }

    async fn snapshot(h: &Harness) -> Position {
        h.store
            .positions()
            .load_snapshot(h.position_id)
            .await
            .unwrap()
            .unwrap()
    }

    async fn wait_for_state(h: &Harness, state: &str) -> Position {
        for _ in 0..200 {
            let position = snapshot(h).await;
            if position.state.name() == state {
                return position;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("never reached state {}", state);
    }

    fn signal_for(position: &Position, price: rust_decimal::Decimal) -> EntrySignal {
        EntrySignal::new(
            position.id,
            position.symbol.clone(),
            position.side,
            Price::new(price).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_signal_to_active() {
        let h = spawn_armed(Side::Long).await;
        let position = snapshot(&h).await;

        let mut bus_rx = h.bus.subscribe();
        h.tx.send(PositionMsg::Signal(signal_for(&position, dec!(100000))))
            .await
            .unwrap();

        let active = wait_for_state(&h, "active").await;
        assert_eq!(active.trailing_stop().unwrap().as_decimal(), dec!(99500.00));

        // CorePositionOpened published for the safety net
        match bus_rx.recv().await.unwrap().unwrap() {
            BusEvent::CorePositionOpened { position_id, .. } => {
                assert_eq!(position_id, h.position_id);
            },
            other => panic!("expected CorePositionOpened, got {:?}", other),
        }

        h.cancel.cancel();
        assert_eq!(h.handle.await.unwrap(), TaskExit::Cancelled);
    }

    #[tokio::test]
    async fn test_duplicate_signal_single_entry() {
        let h = spawn_armed(Side::Long).await;
        let position = snapshot(&h).await;
        let signal = signal_for(&position, dec!(100000));

        // Same correlation id delivered twice
        h.tx.send(PositionMsg::Signal(signal.clone())).await.unwrap();
        h.tx.send(PositionMsg::Signal(signal)).await.unwrap();

        wait_for_state(&h, "active").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Exactly one EntryRequested event and one accepted order
        let events = h.store.events().events_for(h.position_id).await.unwrap();
        let entry_requests = events
            .iter()
            .filter(|e| e.event_type() == "entry_requested")
            .count();
        assert_eq!(entry_requests, 1);
        assert_eq!(h.exchange.accepted_order_count(), 1);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_trail_and_exit() {
        let h = spawn_armed(Side::Long).await;
        let position = snapshot(&h).await;
        let symbol = position.symbol.clone();

        h.tx.send(PositionMsg::Signal(signal_for(&position, dec!(100000))))
            .await
            .unwrap();
        wait_for_state(&h, "active").await;

        // The happy-path tick sequence
        for price in [dec!(100500), dec!(101000), dec!(100800), dec!(100600)] {
            h.tx.send(PositionMsg::Tick(Tick::new(
                symbol.clone(),
                Price::new(price).unwrap(),
            )))
            .await
            .unwrap();
        }
        // First tick at or below the 100,500 stop triggers the exit
        h.tx.send(PositionMsg::Tick(Tick::new(
            symbol.clone(),
            Price::new(dec!(100400)).unwrap(),
        )))
        .await
        .unwrap();

        let closed = wait_for_state(&h, "closed").await;

        // PnL: (100400 − 100000) × 0.2 − fees. Stub fee = 0.1% per side.
        let gross = dec!(400) * dec!(0.200);
        assert_eq!(closed.realized_pnl, gross - closed.fees_paid);
        assert!(closed.closed_at.is_some());

        assert_eq!(h.handle.await.unwrap(), TaskExit::Terminal);
    }

    #[tokio::test]
    async fn test_panic_exits_active_position() {
        let h = spawn_armed(Side::Long).await;
        let position = snapshot(&h).await;

        h.tx.send(PositionMsg::Signal(signal_for(&position, dec!(100000))))
            .await
            .unwrap();
        wait_for_state(&h, "active").await;

        h.tx.send(PositionMsg::Command(PositionCommand::Panic))
            .await
            .unwrap();

        let closed = wait_for_state(&h, "closed").await;
        match closed.state {
            PositionState::Closed { exit_reason, .. } => {
                assert_eq!(exit_reason, ExitReason::OperatorPanic);
            },
            other => panic!("expected Closed, got {:?}", other.name()),
        }

        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_disarm_closes_armed() {
        let h = spawn_armed(Side::Short).await;

        h.tx.send(PositionMsg::Command(PositionCommand::Disarm { force: false }))
            .await
            .unwrap();

        let closed = wait_for_state(&h, "closed").await;
        match closed.state {
            PositionState::Closed { exit_reason, exit_price, .. } => {
                assert_eq!(exit_reason, ExitReason::Disarmed);
                assert!(exit_price.is_none());
            },
            other => panic!("expected Closed, got {:?}", other.name()),
        }

        assert_eq!(h.handle.await.unwrap(), TaskExit::Terminal);
    }

    #[tokio::test]
    async fn test_ambiguous_entry_resolved_by_lookup() {
        let h = spawn_armed(Side::Long).await;
        let position = snapshot(&h).await;

        // Submit times out but the order actually landed
        h.exchange.fail_next(InjectedFailure::Unknown { accept_anyway: true });

        h.tx.send(PositionMsg::Signal(signal_for(&position, dec!(100000))))
            .await
            .unwrap();

        // The lookup ladder discovers the fill; exactly one order exists
        wait_for_state(&h, "active").await;
        assert_eq!(h.exchange.accepted_order_count(), 1);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_entry_rejection_goes_to_error() {
        let h = spawn_armed(Side::Long).await;
        let position = snapshot(&h).await;

        h.exchange.fail_next(InjectedFailure::Rejected("margin insufficient".to_string()));

        h.tx.send(PositionMsg::Signal(signal_for(&position, dec!(100000))))
            .await
            .unwrap();

        let errored = wait_for_state(&h, "error").await;
        assert!(matches!(errored.state, PositionState::Error { .. }));

        // EntryFailed recorded in the log
        let events = h.store.events().events_for(h.position_id).await.unwrap();
        assert!(events.iter().any(|e| e.event_type() == "entry_failed"));

        assert_eq!(h.handle.await.unwrap(), TaskExit::Terminal);
    }

    #[tokio::test]
    async fn test_fold_matches_snapshot_after_lifecycle() {
        // Fold-equals-snapshot driven through the live task
        let h = spawn_armed(Side::Long).await;
        let position = snapshot(&h).await;
        let symbol = position.symbol.clone();

        h.tx.send(PositionMsg::Signal(signal_for(&position, dec!(100000))))
            .await
            .unwrap();
        wait_for_state(&h, "active").await;

        h.tx.send(PositionMsg::Tick(Tick::new(
            symbol.clone(),
            Price::new(dec!(101000)).unwrap(),
        )))
        .await
        .unwrap();
        h.tx.send(PositionMsg::Tick(Tick::new(
            symbol,
            Price::new(dec!(100400)).unwrap(),
        )))
        .await
        .unwrap();

        wait_for_state(&h, "closed").await;
        h.handle.await.unwrap();

        // The stored snapshot equals the event fold
        let rebuilt = h.store.verify_snapshot(h.position_id).await.unwrap();
        assert_eq!(rebuilt.state.name(), "closed");
    }
}
