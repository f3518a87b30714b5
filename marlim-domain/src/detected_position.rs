//! Safety net: positions detected outside the engine.
//!
//! Types for exchange positions that no engine Position owns (e.g. opened
//! manually on the exchange UI). The safety-net monitor registers them and
//! applies a deliberately coarse fixed-percent protective stop.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::value_objects::{Price, Quantity, Side, Symbol};

/// Key identifying a detected position: one per (symbol, side).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DetectionKey {
    pub symbol: Symbol,
    pub side: Side,
}

impl DetectionKey {
    pub fn new(symbol: Symbol, side: Side) -> Self {
        Self { symbol, side }
    }
}

impl std::fmt::Display for DetectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.symbol.as_pair(), self.side)
    }
}

/// An exchange position not created through the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPosition {
    pub key: DetectionKey,
    /// Average entry price reported by the exchange
    pub entry_price: Price,
    pub quantity: Quantity,
    /// When the safety net first saw this position
    pub detected_at: DateTime<Utc>,
    /// Last poll that confirmed it still exists
    pub last_verified_at: DateTime<Utc>,
    pub safety_stop: Option<SafetyStop>,
}

impl DetectedPosition {
    pub fn new(symbol: Symbol, side: Side, entry_price: Price, quantity: Quantity) -> Self {
        let now = Utc::now();
        Self {
            key: DetectionKey::new(symbol, side),
            entry_price,
            quantity,
            detected_at: now,
            last_verified_at: now,
            safety_stop: None,
        }
    }

    /// Calculate the protective stop at a fixed percentage from entry.
    ///
    /// - LONG:  stop = entry × (1 − pct/100)
    /// - SHORT: stop = entry × (1 + pct/100)
    ///
    /// This is intentionally coarser than the core engine's technical-stop
    /// logic; the safety net bounds loss, it does not trade.
    pub fn calculate_safety_stop(&mut self, stop_pct: Decimal) -> SafetyStop {
        let entry = self.entry_price.as_decimal();
        let fraction = stop_pct / Decimal::from(100);

        let stop_value = match self.key.side {
            Side::Long => entry * (Decimal::ONE - fraction),
            Side::Short => entry * (Decimal::ONE + fraction),
        };

        let stop = SafetyStop {
            stop_price: Price::from(stop_value),
            distance_pct: stop_pct,
            calculated_at: Utc::now(),
        };

        self.safety_stop = Some(stop.clone());
        stop
    }

    /// Check whether the current price breaches the safety stop.
    ///
    /// Returns `None` when no stop has been calculated yet.
    pub fn is_stop_hit(&self, current_price: Price) -> Option<bool> {
        let stop = self.safety_stop.as_ref()?;
        Some(stop.is_hit(self.key.side, current_price))
    }

    /// Record that a poll confirmed the position still exists.
    pub fn mark_verified(&mut self) {
        self.last_verified_at = Utc::now();
    }
}

/// A calculated protective stop for a detected position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStop {
    pub stop_price: Price,
    /// Distance as a percentage of entry price
    pub distance_pct: Decimal,
    pub calculated_at: DateTime<Utc>,
}

impl SafetyStop {
    /// True when the price is at or beyond the stop for the given side.
    pub fn is_hit(&self, side: Side, current_price: Price) -> bool {
        match side {
            Side::Long => current_price.as_decimal() <= self.stop_price.as_decimal(),
            Side::Short => current_price.as_decimal() >= self.stop_price.as_decimal(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
