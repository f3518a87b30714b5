//! Signal port: entry-signal producers.
//!
//! Signals are opaque triggers carrying a correlation id; the engine
//! routes each to at most one armed position and ignores re-deliveries of
//! the same id. Two producers ship with the daemon:
//!
//! - the operator surface (`POST /positions/:id/signal`) publishes a
//!   manual signal on the bus, and
//! - `CrossoverDetector`, a per-position single-shot task that watches the
//!   tick stream and fires on an SMA crossover in the position's
//!   direction. It emits exactly one signal, then terminates.

use std::collections::VecDeque;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use marlim_domain::{EntrySignal, Position, PositionId, Price, Side, Symbol};
use marlim_engine::Tick;

use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::{BusEvent, EventBus};

/// Detector configuration, extracted from an armed position.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub position_id: PositionId,
    pub symbol: Symbol,
    pub side: Side,
    /// Fast SMA period (short-term momentum)
    pub fast_period: usize,
    /// Slow SMA period (trend confirmation)
    pub slow_period: usize,
}

impl DetectorConfig {
    /// Defaults: 9/21 SMA crossover.
    pub fn from_position(position: &Position) -> DaemonResult<Self> {
        if !position.can_enter() {
            return Err(DaemonError::InvalidPositionState {
                expected: "armed".to_string(),
                actual: position.state.name().to_string(),
            });
        }

        Ok(Self {
            position_id: position.id,
            symbol: position.symbol.clone(),
            side: position.side,
            fast_period: 9,
            slow_period: 21,
        })
    }

    pub fn validate(&self) -> DaemonResult<()> {
        if self.fast_period < 2 || self.fast_period >= self.slow_period {
            return Err(DaemonError::Config(format!(
                "fast period {} must be in [2, slow {})",
                self.fast_period, self.slow_period
            )));
        }
        Ok(())
    }
}

/// Rolling SMA window.
struct SmaWindow {
    period: usize,
    values: VecDeque<Decimal>,
    sum: Decimal,
}

impl SmaWindow {
    fn new(period: usize) -> Self {
        Self {
            period,
            values: VecDeque::with_capacity(period),
            sum: Decimal::ZERO,
        }
    }

    fn push(&mut self, value: Decimal) {
        self.values.push_back(value);
        self.sum += value;
        if self.values.len() > self.period {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
    }

    fn value(&self) -> Option<Decimal> {
        if self.values.len() < self.period {
            return None;
        }
        Some(self.sum / Decimal::from(self.period as u64))
    }
}

/// Single-shot SMA crossover detector for one armed position.
pub struct CrossoverDetector {
    config: DetectorConfig,
}

impl CrossoverDetector {
    pub fn new(config: DetectorConfig) -> DaemonResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Spawn the detector loop.
    ///
    /// Consumes ticks until a crossover fires the signal (published on the
    /// bus), then exits. Cancellation exits without a signal.
    pub fn spawn(
        self,
        mut ticks: mpsc::Receiver<Tick>,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<EntrySignal>> {
        tokio::spawn(async move {
            let config = self.config;
            let mut fast = SmaWindow::new(config.fast_period);
            let mut slow = SmaWindow::new(config.slow_period);
            let mut prev_delta: Option<Decimal> = None;

            info!(
                position_id = %config.position_id,
                symbol = %config.symbol.as_pair(),
                side = %config.side,
                fast = config.fast_period,
                slow = config.slow_period,
                "Detector started"
            );

            loop {
                let tick = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(position_id = %config.position_id, "Detector cancelled");
                        return None;
                    }
                    tick = ticks.recv() => match tick {
                        Some(t) => t,
                        None => {
                            warn!(position_id = %config.position_id, "Detector tick stream ended");
                            return None;
                        }
                    }
                };

                if tick.symbol != config.symbol {
                    continue;
                }

                let price = tick.last_price.as_decimal();
                fast.push(price);
                slow.push(price);

                let (Some(fast_ma), Some(slow_ma)) = (fast.value(), slow.value()) else {
                    continue;
                };

                let delta = fast_ma - slow_ma;

                // Only the crossover fires, never the standing relation
                let crossed = match (prev_delta, config.side) {
                    (Some(prev), Side::Long) => prev <= Decimal::ZERO && delta > Decimal::ZERO,
                    (Some(prev), Side::Short) => prev >= Decimal::ZERO && delta < Decimal::ZERO,
                    (None, _) => false,
                };
                prev_delta = Some(delta);

                if crossed {
                    let signal = EntrySignal::new(
                        config.position_id,
                        config.symbol.clone(),
                        config.side,
                        tick.last_price,
                    );

                    info!(
                        position_id = %config.position_id,
                        signal_id = %signal.signal_id,
                        price = %tick.last_price,
                        "Crossover detected, signal fired"
                    );

                    bus.publish(BusEvent::SignalFired(signal.clone()));
                    return Some(signal);
                }
            }
        })
    }
}

/// Build a manual (operator-issued) signal for an armed position.
pub fn manual_signal(position: &Position, entry_price: Price) -> DaemonResult<EntrySignal> {
    if !position.can_enter() {
        return Err(DaemonError::InvalidPositionState {
            expected: "armed".to_string(),
            actual: position.state.name().to_string(),
        });
    }

    Ok(EntrySignal::new(
        position.id,
        position.symbol.clone(),
        position.side,
        entry_price,
    ))
}

// =============================================================================
// Tests
// =============================================================================
