//! Reconciler: aligns store, memory and exchange after any discontinuity.
//!
//! Runs at startup, after a lease reacquisition, and whenever a stream
//! reports `GapDetected`. While it runs the daemon is in degraded mode:
//! ticks are still processed for monitoring, but no new entry intents are
//! issued (exits remain allowed; the operator must always be able to get
//! flat).
//!
//! The event log is authoritative. Snapshots that disagree with their
//! event fold are healed from the fold; exchange truth resolves in-flight
//! intents; whatever cannot be decided is parked in Error for human
//! review.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use marlim_domain::{
    AccountId, ClientOrderId, Event, Order, OrderNamespace, Position, PositionId, PositionState,
    Side, Symbol,
};
use marlim_exec::{ExchangePort, Executor, OrderStatusView};
use marlim_store::{snapshots_equal, Store};

use crate::error::DaemonResult;
use crate::metrics::Metrics;

/// Classification of one position after reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Snapshot, event log and exchange agree; resume normally
    Aligned,
    /// Snapshot diverged from the event fold and was healed from it
    Healed,
    /// The exchange confirmed a fill the snapshot was missing; the fill
    /// event was replayed and the position advanced
    MissingFillReplayed,
    /// An in-flight order never reached the exchange; the position was
    /// moved out of its in-flight state
    InFlightFailed,
    /// Exchange truth contradicts the snapshot in a way the window cannot
    /// decide; parked in Error for human review
    Ambiguous,
    /// A resting exchange order the local state did not track was adopted
    /// onto this position (its client id carried the core namespace)
    OrphanOrder,
    /// Exchange holds quantity no engine position owns; left for the
    /// safety net
    OrphanForSafetyNet,
}

/// Reconciliation report.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub outcomes: Vec<(PositionId, ReconcileOutcome)>,
    pub orphan_positions: usize,
    /// Untracked resting orders found on the exchange (adopted + cancelled)
    pub orphan_orders: usize,
    pub intents_resolved: usize,
}

/// The reconciler.
pub struct Reconciler<E: ExchangePort, S: Store> {
    executor: Arc<Executor<E, S>>,
    store: Arc<S>,
    account_id: AccountId,
    metrics: Arc<Metrics>,
    degraded: Arc<AtomicBool>,
}

impl<E: ExchangePort, S: Store> Reconciler<E, S> {
    pub fn new(
        executor: Arc<Executor<E, S>>,
        store: Arc<S>,
        account_id: AccountId,
        metrics: Arc<Metrics>,
        degraded: Arc<AtomicBool>,
    ) -> Self {
        Self {
            executor,
            store,
            account_id,
            metrics,
            degraded,
        }
    }

    /// Run a full reconciliation pass.
    pub async fn run(&self) -> DaemonResult<ReconcileReport> {
        self.degraded.store(true, Ordering::Relaxed);
        self.metrics.reconcile_runs.inc();
        info!("Reconciliation started (degraded mode on)");

        let result = self.run_inner().await;

        self.degraded.store(false, Ordering::Relaxed);
        match &result {
            Ok(report) => info!(
                positions = report.outcomes.len(),
                orphan_positions = report.orphan_positions,
                orphan_orders = report.orphan_orders,
                intents = report.intents_resolved,
                "Reconciliation finished (degraded mode off)"
            ),
            Err(e) => error!(error = %e, "Reconciliation failed"),
        }
        result
    }

    async fn run_inner(&self) -> DaemonResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        // 1. Resolve every Pending/Processing intent against the exchange.
        let resolutions = self
            .executor
            .journal()
            .replay_pending(self.executor.exchange(), |intent| {
                // Symbol comes from the self-contained intent payload
                intent
                    .payload
                    .get("symbol")
                    .and_then(|s| s.as_str())
                    .and_then(|s| marlim_domain::Symbol::from_pair(s).ok())
            })
            .await?;
        report.intents_resolved = resolutions.len();

        // 2. Per live position: heal the snapshot from the fold, then
        //    resolve in-flight state against exchange truth.
        let live = self.store.positions().list_active().await?;
        for position in &live {
            let outcome = self.reconcile_position(position).await?;
            report.outcomes.push((position.id, outcome));
        }

        // 3. Exchange positions nobody owns go to the safety net; the
        //    symbols they trade on also feed the orphan-order sweep below.
        let mut symbols: HashSet<Symbol> = live.iter().map(|p| p.symbol.clone()).collect();
        match self.executor.exchange().positions(self.account_id).await {
            Ok(exchange_positions) => {
                for view in exchange_positions {
                    symbols.insert(view.symbol.clone());
                    let owned = self
                        .store
                        .positions()
                        .find_live_by_symbol_side(&view.symbol, view.side)
                        .await?
                        .is_some();
                    if !owned {
                        info!(
                            symbol = %view.symbol.as_pair(),
                            side = %view.side,
                            qty = %view.quantity,
                            "Orphan exchange position, safety net will cover it"
                        );
                        report.orphan_positions += 1;
                    }
                }
            },
            Err(e) => {
                warn!(error = %e, "Exchange positions unavailable, skipping orphan scan");
            },
        }

        // 4. Resting orders the local state does not track: adopt core_
        //    orders onto their owning position, cancel everything else
        //    best-effort. An order accepted right before a crash can exist
        //    on the exchange without a journal record, so only this
        //    listing can find it.
        for symbol in symbols {
            self.reconcile_open_orders(&symbol, &mut report).await;
        }

        Ok(report)
    }

    /// Walk the symbol's resting orders and classify the untracked ones.
    async fn reconcile_open_orders(&self, symbol: &Symbol, report: &mut ReconcileReport) {
        let open = match self.executor.exchange().open_orders(symbol).await {
            Ok(open) => open,
            Err(e) => {
                warn!(symbol = %symbol.as_pair(), error = %e, "Open-order listing unavailable");
                return;
            },
        };

        for order in open {
            // Tracked orders have a local row keyed by their client id
            match self.store.orders().find_by_client_id(&order.client_order_id).await {
                Ok(Some(_)) => continue,
                Ok(None) => {},
                Err(e) => {
                    warn!(error = %e, "Order lookup failed, skipping orphan check");
                    continue;
                },
            }

            report.orphan_orders += 1;

            let owner = match ClientOrderId::parse(&order.client_order_id) {
                Some((OrderNamespace::Core, _)) => {
                    match self.find_owner(symbol, order.side).await {
                        Ok(owner) => owner,
                        Err(e) => {
                            warn!(error = %e, "Owner lookup failed, leaving order in place");
                            continue;
                        },
                    }
                },
                // Foreign ids and untracked safety ids have no position to
                // attach to
                _ => None,
            };

            match owner {
                Some(position) => {
                    info!(
                        position_id = %position.id,
                        client_order_id = %order.client_order_id,
                        exchange_order_id = %order.exchange_order_id,
                        "Adopting orphan order"
                    );
                    if let Err(e) = self.adopt_order(&position, &order).await {
                        warn!(position_id = %position.id, error = %e, "Adoption failed");
                        continue;
                    }
                    report.outcomes.push((position.id, ReconcileOutcome::OrphanOrder));
                },
                None => {
                    info!(
                        client_order_id = %order.client_order_id,
                        exchange_order_id = %order.exchange_order_id,
                        "Cancelling unowned orphan order"
                    );
                    if let Err(e) = self
                        .executor
                        .exchange()
                        .cancel_order(symbol, &order.exchange_order_id)
                        .await
                    {
                        // Best effort; not-found means it resolved itself
                        warn!(
                            exchange_order_id = %order.exchange_order_id,
                            error = %e,
                            "Orphan cancel failed"
                        );
                    }
                },
            }
        }
    }

    /// The live position an orphan core order belongs to: a closing-side
    /// order attaches to the position it would close.
    async fn find_owner(
        &self,
        symbol: &Symbol,
        order_side: marlim_domain::OrderSide,
    ) -> DaemonResult<Option<Position>> {
        for side in [Side::Long, Side::Short] {
            if let Some(position) = self
                .store
                .positions()
                .find_live_by_symbol_side(symbol, side)
                .await?
            {
                // Exit-side orders (stops, closes) attach to the open
                // position; entry-side orders only to one still entering
                let owns = if side.exit_action() == order_side {
                    matches!(
                        position.state,
                        PositionState::Active { .. } | PositionState::Exiting { .. }
                    )
                } else {
                    matches!(position.state, PositionState::Entering { .. })
                };
                if owns {
                    return Ok(Some(position));
                }
            }
        }
        Ok(None)
    }

    /// Record the orphan order locally. A resting stop on an Active
    /// position without one is its insurance stop: replay the placement
    /// event so the trail manages it from here on.
    async fn adopt_order(
        &self,
        position: &Position,
        order: &marlim_exec::OpenOrderView,
    ) -> DaemonResult<()> {
        let client_order_id = match ClientOrderId::parse(&order.client_order_id) {
            Some((OrderNamespace::Core, intent_id)) => ClientOrderId::core(intent_id),
            _ => return Ok(()),
        };

        let mut row = match order.stop_price {
            Some(stop_price) => Order::new_stop_loss_limit(
                position.id,
                order.symbol.clone(),
                order.side,
                order.quantity,
                stop_price,
                order.price.unwrap_or(stop_price),
                client_order_id,
            ),
            None => Order::new_market(
                position.id,
                order.symbol.clone(),
                order.side,
                order.quantity,
                client_order_id,
            ),
        };
        row.mark_submitted(order.exchange_order_id.clone());
        self.store.orders().save(&row).await?;

        if let (Some(stop_price), PositionState::Active { insurance_stop_id: None, .. }) =
            (order.stop_price, &position.state)
        {
            let mut position = position.clone();
            let position_id = position.id;
            self.append(
                &mut position,
                Event::InsuranceStopPlaced {
                    position_id,
                    exchange_order_id: order.exchange_order_id.clone(),
                    stop_price,
                    limit_price: order.price.unwrap_or(stop_price),
                    timestamp: chrono::Utc::now(),
                },
            )
            .await?;
        }

        Ok(())
    }

    async fn reconcile_position(&self, stored: &Position) -> DaemonResult<ReconcileOutcome> {
        // Event fold is authoritative over the snapshot cache
        let rebuilt = self.store.rebuild_snapshot(stored.id).await?;
        let mut position = if snapshots_equal(stored, &rebuilt) {
            stored.clone()
        } else {
            warn!(
                position_id = %stored.id,
                stored_state = stored.state.name(),
                rebuilt_state = rebuilt.state.name(),
                "Snapshot diverged from event fold, healing"
            );
            self.store.positions().heal_snapshot(&rebuilt).await?;
            rebuilt
        };
        let healed = !snapshots_equal(stored, &position);

        let outcome = match position.state.clone() {
            PositionState::Entering { intent_id, .. } => {
                let client_order_id = ClientOrderId::core(intent_id);
                match self
                    .executor
                    .exchange()
                    .lookup_order(&position.symbol, &client_order_id)
                    .await
                {
                    Ok(Some(view)) if view.is_filled() => {
                        info!(position_id = %position.id, "Missing entry fill, replaying");
                        self.replay_entry_fill(&mut position, intent_id, &view).await?;
                        ReconcileOutcome::MissingFillReplayed
                    },
                    Ok(Some(_)) => ReconcileOutcome::Aligned, // still working
                    Ok(None) => {
                        info!(position_id = %position.id, "Entry never reached the exchange");
                        let position_id = position.id;
                        self.append(
                            &mut position,
                            Event::EntryFailed {
                                position_id,
                                intent_id,
                                reason: "not found during reconciliation".to_string(),
                                timestamp: chrono::Utc::now(),
                            },
                        )
                        .await?;
                        ReconcileOutcome::InFlightFailed
                    },
                    Err(e) => {
                        warn!(position_id = %position.id, error = %e, "Entry lookup failed, ambiguous");
                        self.park(&mut position, "entry unresolved in reconcile window")
                            .await?;
                        ReconcileOutcome::Ambiguous
                    },
                }
            },

            PositionState::Exiting { intent_id, .. } => {
                let client_order_id = ClientOrderId::core(intent_id);
                match self
                    .executor
                    .exchange()
                    .lookup_order(&position.symbol, &client_order_id)
                    .await
                {
                    Ok(Some(view)) if view.is_filled() => {
                        info!(position_id = %position.id, "Missing exit fill, replaying");
                        self.replay_exit_fill(&mut position, intent_id, &view).await?;
                        ReconcileOutcome::MissingFillReplayed
                    },
                    // Open or never-submitted exits resume with the task
                    // (the exit path retries indefinitely)
                    Ok(_) => ReconcileOutcome::Aligned,
                    Err(e) => {
                        warn!(position_id = %position.id, error = %e, "Exit lookup failed");
                        ReconcileOutcome::Aligned
                    },
                }
            },

            PositionState::Active { .. } => {
                // Verify the exchange still holds the quantity
                match self.executor.exchange().positions(self.account_id).await {
                    Ok(views) => {
                        let held = views
                            .iter()
                            .any(|v| v.symbol == position.symbol && v.side == position.side);
                        if held {
                            if healed {
                                ReconcileOutcome::Healed
                            } else {
                                ReconcileOutcome::Aligned
                            }
                        } else {
                            // Quantity gone: insurance stop fired, manual
                            // close, or liquidation. Cannot settle PnL
                            // without the fill; human review.
                            warn!(
                                position_id = %position.id,
                                "Active position missing on exchange"
                            );
                            self.park(&mut position, "active but not held on exchange")
                                .await?;
                            ReconcileOutcome::Ambiguous
                        }
                    },
                    Err(e) => {
                        warn!(position_id = %position.id, error = %e, "Exchange positions unavailable");
                        if healed {
                            ReconcileOutcome::Healed
                        } else {
                            ReconcileOutcome::Aligned
                        }
                    },
                }
            },

            // Armed positions have nothing on the exchange yet
            _ => {
                if healed {
                    ReconcileOutcome::Healed
                } else {
                    ReconcileOutcome::Aligned
                }
            },
        };

        Ok(outcome)
    }

    async fn replay_entry_fill(
        &self,
        position: &mut Position,
        intent_id: marlim_domain::IntentId,
        view: &OrderStatusView,
    ) -> DaemonResult<()> {
        let (Some(fill_price), Some(filled_qty)) = (view.avg_fill_price, view.filled_qty) else {
            self.park(position, "filled entry without fill details").await?;
            return Ok(());
        };

        let initial_stop = position
            .tech_stop_distance
            .trailing_stop_for(position.side, fill_price);

        self.append(
            position,
            Event::EntryFilled {
                position_id: position.id,
                intent_id,
                fill_price,
                filled_quantity: filled_qty,
                fee: view.fee_paid,
                initial_stop,
                timestamp: chrono::Utc::now(),
            },
        )
        .await
    }

    async fn replay_exit_fill(
        &self,
        position: &mut Position,
        intent_id: marlim_domain::IntentId,
        view: &OrderStatusView,
    ) -> DaemonResult<()> {
        let (Some(fill_price), Some(filled_qty)) = (view.avg_fill_price, view.filled_qty) else {
            self.park(position, "filled exit without fill details").await?;
            return Ok(());
        };

        let exit_reason = match &position.state {
            PositionState::Exiting { exit_reason, .. } => *exit_reason,
            _ => marlim_domain::ExitReason::Reconciled,
        };
        let entry_price = match position.entry_price {
            Some(p) => p,
            None => {
                self.park(position, "exit fill without entry price").await?;
                return Ok(());
            },
        };

        let total_fees = position.fees_paid + view.fee_paid;
        let realized_pnl = (fill_price.as_decimal() - entry_price.as_decimal())
            * filled_qty.as_decimal()
            * position.side.sign()
            - total_fees;

        self.append(
            position,
            Event::ExitFilled {
                position_id: position.id,
                intent_id,
                fill_price,
                filled_quantity: filled_qty,
                fee: view.fee_paid,
                timestamp: chrono::Utc::now(),
            },
        )
        .await?;

        self.append(
            position,
            Event::PositionClosed {
                position_id: position.id,
                exit_reason,
                entry_price,
                exit_price: fill_price,
                realized_pnl,
                total_fees,
                timestamp: chrono::Utc::now(),
            },
        )
        .await
    }

    async fn append(&self, position: &mut Position, event: Event) -> DaemonResult<()> {
        let next = position.apply(&event)?;
        self.store.events().append(&event, &next).await?;
        *position = next;
        Ok(())
    }

    async fn park(&self, position: &mut Position, reason: &str) -> DaemonResult<()> {
        self.metrics.positions_errored.inc();
        self.append(
            position,
            Event::PositionError {
                position_id: position.id,
                error: reason.to_string(),
                recoverable: true,
                timestamp: chrono::Utc::now(),
            },
        )
        .await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use marlim_domain::{
        EntrySignal, OrderSide, OrderStatus, Price, Quantity, RiskConfig, Side, Symbol,
        SymbolFilters, TechStopDistance,
    };
    use marlim_engine::Engine;
    use marlim_exec::{ExchangePositionView, InjectedFailure, StubExchange};
    use marlim_store::MemoryStore;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    struct World {
        reconciler: Reconciler<StubExchange, MemoryStore>,
        executor: Arc<Executor<StubExchange, MemoryStore>>,
        store: Arc<MemoryStore>,
        exchange: Arc<StubExchange>,
        engine: Engine,
        account_id: AccountId,
    }

    fn world() -> World {
        let exchange = Arc::new(StubExchange::new(dec!(100000)));
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(Executor::new(exchange.clone(), store.clone()));
        let account_id = Uuid::now_v7();

        let reconciler = Reconciler::new(
            executor.clone(),
            store.clone(),
            account_id,
            Arc::new(Metrics::new()),
            Arc::new(AtomicBool::new(false)),
        );

        World {
            reconciler,
            executor,
            store,
            exchange,
            engine: Engine::default_paper(),
            account_id,
        }
    }

    async fn armed_in_store(w: &World) -> Position {
        let position = Position::arm(
            w.account_id,
            Symbol::from_pair("BTCUSDT").unwrap(),
            Side::Long,
            RiskConfig::new(dec!(10000), dec!(1)).unwrap(),
            TechStopDistance::new(dec!(500)).unwrap(),
            SymbolFilters::new(dec!(0.01), dec!(0.001)).unwrap(),
        )
        .unwrap();

        let event = Event::PositionArmed {
            position_id: position.id,
            account_id: position.account_id,
            symbol: position.symbol.clone(),
            side: position.side,
            risk_config: position.risk_config,
            tech_stop_distance: position.tech_stop_distance,
            filters: position.filters,
            timestamp: position.created_at,
        };
        w.store.events().append(&event, &position).await.unwrap();
        position
    }

    /// Drive Armed → Entering with the order landed on the exchange but no
    /// fill processed locally (the crash window).
    async fn entering_with_landed_order(w: &World) -> Position {
        let position = armed_in_store(w).await;
        let signal = EntrySignal::new(
            position.id,
            position.symbol.clone(),
            position.side,
            Price::new(dec!(100000)).unwrap(),
        );
        let decision = w
            .engine
            .decide_entry(&position, &signal, Uuid::now_v7())
            .unwrap();
        let (entering, _) = w.executor.execute(&position, decision.actions).await.unwrap();
        entering
    }

    #[tokio::test]
    async fn test_reconcile_replays_missing_entry_fill() {
        let w = world();
        let entering = entering_with_landed_order(&w).await;
        assert_eq!(entering.state.name(), "entering");

        let report = w.reconciler.run().await.unwrap();

        assert!(report
            .outcomes
            .iter()
            .any(|(id, o)| *id == entering.id && *o == ReconcileOutcome::MissingFillReplayed));

        let healed = w
            .store
            .positions()
            .load_snapshot(entering.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(healed.state.name(), "active");
        assert_eq!(healed.trailing_stop().unwrap().as_decimal(), dec!(99500));
    }

    #[tokio::test]
    async fn test_reconcile_fails_entry_never_submitted() {
        let w = world();

        // Entering state recorded, but the submit never happened (crash
        // before the exchange call): inject Unknown without acceptance.
        let position = armed_in_store(&w).await;
        let signal = EntrySignal::new(
            position.id,
            position.symbol.clone(),
            position.side,
            Price::new(dec!(100000)).unwrap(),
        );
        let decision = w
            .engine
            .decide_entry(&position, &signal, Uuid::now_v7())
            .unwrap();
        w.exchange.fail_next(InjectedFailure::Unknown { accept_anyway: false });
        let (entering, _) = w.executor.execute(&position, decision.actions).await.unwrap();
        assert_eq!(entering.state.name(), "entering");

        let report = w.reconciler.run().await.unwrap();
        assert!(report
            .outcomes
            .iter()
            .any(|(id, o)| *id == entering.id && *o == ReconcileOutcome::InFlightFailed));

        let after = w
            .store
            .positions()
            .load_snapshot(entering.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.state.name(), "error");
    }

    #[tokio::test]
    async fn test_reconcile_heals_diverged_snapshot() {
        let w = world();
        let position = armed_in_store(&w).await;

        // Corrupt the snapshot cache; the event log still says Armed
        let mut corrupted = position.clone();
        corrupted.state = PositionState::Error {
            error: "bitflip".to_string(),
            recoverable: false,
        };
        w.store.positions().heal_snapshot(&corrupted).await.unwrap();

        // The corrupted snapshot is terminal so list_active skips it; heal
        // via direct reconcile of the stored position
        let outcome = w.reconciler.reconcile_position(&corrupted).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Healed);

        let healed = w
            .store
            .positions()
            .load_snapshot(position.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(healed.state.name(), "armed");
    }

    #[tokio::test]
    async fn test_reconcile_counts_orphan_positions() {
        let w = world();

        // The exchange reports an ETH short nobody armed
        w.exchange.set_positions(vec![ExchangePositionView {
            symbol: Symbol::from_pair("ETHUSDT").unwrap(),
            side: Side::Short,
            quantity: Quantity::new(dec!(5)).unwrap(),
            entry_price: Price::new(dec!(2000)).unwrap(),
        }]);

        let report = w.reconciler.run().await.unwrap();
        assert_eq!(report.orphan_positions, 1);
    }

    #[tokio::test]
    async fn test_reconcile_parks_active_position_missing_on_exchange() {
        let w = world();
        let entering = entering_with_landed_order(&w).await;

        // First reconcile advances to Active (the order had landed)
        w.reconciler.run().await.unwrap();

        // Exchange now reports NO position for the pair: someone closed it
        // behind our back. Window cannot decide → Error.
        w.exchange.set_positions(vec![]);
        let report = w.reconciler.run().await.unwrap();

        assert!(report
            .outcomes
            .iter()
            .any(|(id, o)| *id == entering.id && *o == ReconcileOutcome::Ambiguous));

        let parked = w
            .store
            .positions()
            .load_snapshot(entering.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parked.state.name(), "error");
    }

    #[tokio::test]
    async fn test_reconcile_adopts_orphan_insurance_stop() {
        let w = world();
        let entering = entering_with_landed_order(&w).await;

        // First pass replays the missing fill; the position goes Active.
        // The exchange reports the held quantity so the Active check holds.
        w.exchange.set_positions(vec![ExchangePositionView {
            symbol: entering.symbol.clone(),
            side: Side::Long,
            quantity: Quantity::new(dec!(0.2)).unwrap(),
            entry_price: Price::new(dec!(100000)).unwrap(),
        }]);
        w.reconciler.run().await.unwrap();

        // A stop rested on the exchange right before a "crash": core
        // namespace, but no journal record and no local order row
        let stranded = ClientOrderId::core(Uuid::now_v7());
        w.exchange
            .place_stop_limit(
                &entering.symbol,
                OrderSide::Sell,
                Quantity::new(dec!(0.2)).unwrap(),
                Price::new(dec!(99300)).unwrap(),
                Price::new(dec!(99200)).unwrap(),
                &stranded,
            )
            .await
            .unwrap();

        let report = w.reconciler.run().await.unwrap();
        assert_eq!(report.orphan_orders, 1);
        assert!(report
            .outcomes
            .iter()
            .any(|(id, o)| *id == entering.id && *o == ReconcileOutcome::OrphanOrder));

        // Adopted: a local order row tracks it now...
        let row = w
            .store
            .orders()
            .find_by_client_id(stranded.as_str())
            .await
            .unwrap()
            .expect("adopted order row");
        assert_eq!(row.position_id, entering.id);

        // ...and the position carries it as its insurance stop
        let position = w
            .store
            .positions()
            .load_snapshot(entering.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.insurance_stop_id, row.exchange_order_id);

        // The next pass finds nothing new to adopt
        let again = w.reconciler.run().await.unwrap();
        assert_eq!(again.orphan_orders, 0);
    }

    #[tokio::test]
    async fn test_reconcile_cancels_unowned_orphan_order() {
        let w = world();

        // A core-namespaced stop rests on a symbol with no live engine
        // position (its position was lost before any record was durable)
        let eth = Symbol::from_pair("ETHUSDT").unwrap();
        let stranded = ClientOrderId::core(Uuid::now_v7());
        w.exchange.set_price("ETHUSDT", dec!(2000));
        w.exchange
            .place_stop_limit(
                &eth,
                OrderSide::Buy,
                Quantity::new(dec!(5)).unwrap(),
                Price::new(dec!(2040)).unwrap(),
                Price::new(dec!(2050)).unwrap(),
                &stranded,
            )
            .await
            .unwrap();
        // The symbol enters the sweep through the exchange position scan
        w.exchange.set_positions(vec![ExchangePositionView {
            symbol: eth.clone(),
            side: Side::Short,
            quantity: Quantity::new(dec!(5)).unwrap(),
            entry_price: Price::new(dec!(2000)).unwrap(),
        }]);

        let report = w.reconciler.run().await.unwrap();
        assert_eq!(report.orphan_orders, 1);

        // Cancelled best-effort; the listing no longer shows it
        let view = w.exchange.lookup_order(&eth, &stranded).await.unwrap().unwrap();
        assert_eq!(view.status, OrderStatus::Cancelled);
        assert!(w.exchange.open_orders(&eth).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_degraded_mode_toggles_around_run() {
        let w = world();
        assert!(!w.reconciler.degraded.load(Ordering::Relaxed));
        w.reconciler.run().await.unwrap();
        assert!(!w.reconciler.degraded.load(Ordering::Relaxed));
    }
}
