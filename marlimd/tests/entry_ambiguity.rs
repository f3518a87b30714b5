//! E2E: ambiguous entries and duplicate signals.
//!
//! Submit-then-timeout: the network eats the response but the order
//! landed. The engine must not resubmit; the lookup ladder with the same
//! client_order_id discovers the fill and exactly one order exists.
//!
//! Duplicate delivery: the same correlation id delivered twice produces exactly one
//! entry intent.

use std::sync::Arc;
use std::time::Duration;

use marlim_domain::{
    EntrySignal, Position, PositionId, Price, RiskConfig, Side, Symbol, SymbolFilters,
    TechStopDistance,
};
use marlim_engine::Engine;
use marlim_exec::{Executor, InjectedFailure, StubExchange};
use marlim_lease::{LeaseManager, MemoryLeaseManager};
use marlim_store::{MemoryStore, Store};
use marlimd::config::LeaseConfig;
use marlimd::event_bus::EventBus;
use marlimd::metrics::Metrics;
use marlimd::position_task::degraded_flag;
use marlimd::{PositionManager, TaskBudgets};
use rust_decimal_macros::dec;
use uuid::Uuid;

struct World {
    manager: Arc<PositionManager<StubExchange, MemoryStore>>,
    store: Arc<MemoryStore>,
    exchange: Arc<StubExchange>,
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
        bus,
        Arc::new(Metrics::new()),
        TaskBudgets::fast(),
        degraded_flag(),
    ));

    World { manager, store, exchange }
}

async fn arm(world: &World) -> Position {
    world
        .manager
        .arm_position(
            Uuid::now_v7(),
            Symbol::from_pair("BTCUSDT").unwrap(),
            Side::Long,
            RiskConfig::new(dec!(10000), dec!(1)).unwrap(),
            TechStopDistance::new(dec!(500)).unwrap(),
            SymbolFilters::new(dec!(0.01), dec!(0.001)).unwrap(),
        )
        .await
        .unwrap()
}

async fn wait_state(world: &World, id: PositionId, state: &str) -> Position {
    for _ in 0..400 {
        if let Some(position) = world.store.positions().load_snapshot(id).await.unwrap() {
            if position.state.name() == state {
                return position;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("position never reached state {}", state);
}

#[tokio::test]
async fn ambiguous_submit_resolves_via_lookup() {
    let world = world();
    let position = arm(&world).await;

    // The submit response is lost, but the order landed and fills only
    // after a couple of lookups (Pending at t+1, Filled at t+3 in spec
    // terms)
    world.exchange.set_fill_after_lookups(2);
    world
        .exchange
        .fail_next(InjectedFailure::Unknown { accept_anyway: true });

    let signal = EntrySignal::new(
        position.id,
        position.symbol.clone(),
        position.side,
        Price::new(dec!(100000)).unwrap(),
    );
    world.manager.route_signal(signal).await.unwrap();

    // Armed → Entering → Active exactly once
    let active = wait_state(&world, position.id, "active").await;
    assert_eq!(active.entry_price.unwrap().as_decimal(), dec!(100000));

    // No second order exists at the exchange
    assert_eq!(world.exchange.accepted_order_count(), 1);

    // The entry transitioned exactly once: one entry_requested, one
    // entry_filled
    let events = world.store.events().events_for(position.id).await.unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type() == "entry_requested")
            .count(),
        1
    );
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type() == "entry_filled")
            .count(),
        1
    );
}

#[tokio::test]
async fn duplicate_signal_is_single_entry() {
    let world = world();
    let position = arm(&world).await;

    let signal = EntrySignal::new(
        position.id,
        position.symbol.clone(),
        position.side,
        Price::new(dec!(100000)).unwrap(),
    );

    // Delivered twice back to back, before the first produced any event
    world.manager.route_signal(signal.clone()).await.unwrap();
    world.manager.route_signal(signal).await.unwrap();

    wait_state(&world, position.id, "active").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = world.store.events().events_for(position.id).await.unwrap();
    let entry_requests = events
        .iter()
        .filter(|e| e.event_type() == "entry_requested")
        .count();
    assert_eq!(entry_requests, 1, "exactly one EntryRequested event");

    let intents = world.store.intents().by_position(position.id).await.unwrap();
    let entries = intents
        .iter()
        .filter(|i| i.kind == marlim_domain::IntentKind::EnterMarket)
        .count();
    assert_eq!(entries, 1, "exactly one entry intent");

    assert_eq!(world.exchange.accepted_order_count(), 1);
}

#[tokio::test]
async fn entry_unresolved_past_budget_goes_to_error() {
    let world = world();
    let position = arm(&world).await;

    // The submit response is lost AND the order never landed; every
    // lookup comes back empty. Entries are never resubmitted, so past the
    // ladder budget the position parks in Error for review.
    world
        .exchange
        .fail_next(InjectedFailure::Unknown { accept_anyway: false });

    let signal = EntrySignal::new(
        position.id,
        position.symbol.clone(),
        position.side,
        Price::new(dec!(100000)).unwrap(),
    );
    world.manager.route_signal(signal).await.unwrap();

    let errored = wait_state(&world, position.id, "error").await;
    assert_eq!(errored.state.name(), "error");
    assert_eq!(world.exchange.accepted_order_count(), 0);

    let events = world.store.events().events_for(position.id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type() == "entry_failed"));
}
