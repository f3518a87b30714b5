//! Prometheus metrics for the daemon.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Daemon metric set, registered once at startup.
pub struct Metrics {
    registry: Registry,
    pub positions_armed: IntCounter,
    pub positions_opened: IntCounter,
    pub positions_closed: IntCounter,
    pub positions_errored: IntCounter,
    pub trailing_updates: IntCounter,
    pub safety_exits: IntCounter,
    pub reconcile_runs: IntCounter,
    pub active_positions: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let positions_armed =
            IntCounter::new("marlim_positions_armed_total", "Positions armed").unwrap();
        let positions_opened =
            IntCounter::new("marlim_positions_opened_total", "Entries filled").unwrap();
        let positions_closed =
            IntCounter::new("marlim_positions_closed_total", "Positions closed").unwrap();
        let positions_errored =
            IntCounter::new("marlim_positions_errored_total", "Positions in error").unwrap();
        let trailing_updates =
            IntCounter::new("marlim_trailing_updates_total", "Trailing stop advances").unwrap();
        let safety_exits =
            IntCounter::new("marlim_safety_exits_total", "Safety-net exits executed").unwrap();
        let reconcile_runs =
            IntCounter::new("marlim_reconcile_runs_total", "Reconciler runs").unwrap();
        let active_positions =
            IntGauge::new("marlim_active_positions", "Live engine positions").unwrap();

        for collector in [
            Box::new(positions_armed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(positions_opened.clone()),
            Box::new(positions_closed.clone()),
            Box::new(positions_errored.clone()),
            Box::new(trailing_updates.clone()),
            Box::new(safety_exits.clone()),
            Box::new(reconcile_runs.clone()),
            Box::new(active_positions.clone()),
        ] {
            registry.register(collector).unwrap();
        }

        Self {
            registry,
            positions_armed,
            positions_opened,
            positions_closed,
            positions_errored,
            trailing_updates,
            safety_exits,
            reconcile_runs,
            active_positions,
        }
    }

    /// Encode the registry in the Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
