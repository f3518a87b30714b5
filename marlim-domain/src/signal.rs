//! Entry signals.
//!
//! A signal is an opaque trigger from a detector (or the operator surface)
//! telling an armed position to enter. The engine routes each signal to at
//! most one armed position whose predicate matches.
//!
//! # Idempotency
//!
//! `signal_id` is the correlation id: delivering the same signal twice must
//! not produce a second entry. The engine checks the id recorded in the
//! `Entering` state before acting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{Position, PositionId, SignalId};
use crate::value_objects::{DomainError, Price, Side, Symbol};

/// Signal from a detector to trigger entry on an armed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySignal {
    /// Correlation id for idempotent processing
    pub signal_id: SignalId,
    /// Position this signal targets (detectors are per-position)
    pub position_id: PositionId,
    pub symbol: Symbol,
    pub side: Side,
    /// Market price observed when the signal fired
    pub entry_price: Price,
    pub timestamp: DateTime<Utc>,
}

impl EntrySignal {
    /// Create a new signal with a fresh correlation id.
    pub fn new(position_id: PositionId, symbol: Symbol, side: Side, entry_price: Price) -> Self {
        Self {
            signal_id: Uuid::now_v7(),
            position_id,
            symbol,
            side,
            entry_price,
            timestamp: Utc::now(),
        }
    }

    /// Validate the signal matches the target position's predicate.
    pub fn validate_for_position(&self, position: &Position) -> Result<(), DomainError> {
        if self.position_id != position.id {
            return Err(DomainError::InvalidSignal(format!(
                "signal position_id {} does not match position {}",
                self.position_id, position.id
            )));
        }

        if self.symbol != position.symbol {
            return Err(DomainError::InvalidSignal(format!(
                "signal symbol {} does not match position symbol {}",
                self.symbol, position.symbol
            )));
        }

        if self.side != position.side {
            return Err(DomainError::InvalidSignal(format!(
                "signal side {} does not match position side {}",
                self.side, position.side
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_objects::{RiskConfig, SymbolFilters, TechStopDistance};
    use rust_decimal_macros::dec;

    fn armed_position(side: Side) -> Position {
        Position::arm(
            Uuid::now_v7(),
            Symbol::from_pair("BTCUSDT").unwrap(),
            side,
            RiskConfig::new(dec!(10000), dec!(1)).unwrap(),
            TechStopDistance::new(dec!(500)).unwrap(),
            SymbolFilters::new(dec!(0.01), dec!(0.001)).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_signal_matches_position() {
        let position = armed_position(Side::Long);
        let signal = EntrySignal::new(
            position.id,
            position.symbol.clone(),
            position.side,
            Price::new(dec!(100000)).unwrap(),
        );

        assert!(signal.validate_for_position(&position).is_ok());
    }

    #[test]
    fn test_signal_rejects_wrong_position() {
        let position = armed_position(Side::Long);
        let signal = EntrySignal::new(
            Uuid::now_v7(),
            position.symbol.clone(),
            position.side,
            Price::new(dec!(100000)).unwrap(),
        );

        assert!(signal.validate_for_position(&position).is_err());
    }

    #[test]
    fn test_signal_rejects_wrong_side() {
        let position = armed_position(Side::Long);
        let signal = EntrySignal::new(
            position.id,
            position.symbol.clone(),
            Side::Short,
            Price::new(dec!(100000)).unwrap(),
        );

        assert!(signal.validate_for_position(&position).is_err());
    }

    #[test]
    fn test_signal_rejects_wrong_symbol() {
        let position = armed_position(Side::Long);
        let signal = EntrySignal::new(
            position.id,
            Symbol::from_pair("ETHUSDT").unwrap(),
            position.side,
            Price::new(dec!(3000)).unwrap(),
        );

        assert!(signal.validate_for_position(&position).is_err());
    }
}
