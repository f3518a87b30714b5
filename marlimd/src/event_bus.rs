//! In-process event bus.
//!
//! Decoupled fan-out between the core engine and the safety net, built on
//! tokio broadcast channels. The bus is best-effort by design: it is an
//! optimization, never a correctness mechanism. Subscribers that lag (or
//! start late) must tolerate missed events by consulting the event store.

use marlim_domain::{EntrySignal, PositionId, Side, Symbol};
use tokio::sync::broadcast;

/// Events published on the daemon bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A core position finished entering and is live on the exchange
    CorePositionOpened {
        position_id: PositionId,
        symbol: Symbol,
        side: Side,
        exchange_position_id: Option<String>,
    },

    /// A core position closed (filled exit or disarm)
    CorePositionClosed {
        position_id: PositionId,
        symbol: Symbol,
        side: Side,
    },

    /// A detector fired an entry signal
    SignalFired(EntrySignal),

    /// Safety net executed a protective exit
    SafetyExitExecuted {
        symbol: Symbol,
        side: Side,
        exchange_order_id: String,
    },

    /// Safety net failed to execute a protective exit
    SafetyExitFailed {
        symbol: Symbol,
        side: Side,
        error: String,
    },
}

/// Bus wrapper over a broadcast channel.
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send to all subscribers; returns the number of receivers reached.
    pub fn publish(&self, event: BusEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> BusReceiver {
        BusReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Lag-tolerant receiver.
pub struct BusReceiver {
    receiver: broadcast::Receiver<BusEvent>,
}

impl BusReceiver {
    /// Next event; `None` when the bus is gone, `Err(lag)` when events
    /// were missed (the subscriber must re-check the store).
    pub async fn recv(&mut self) -> Option<Result<BusEvent, u64>> {
        match self.receiver.recv().await {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::RecvError::Closed) => None,
            Err(broadcast::error::RecvError::Lagged(count)) => Some(Err(count)),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let position_id = Uuid::now_v7();
        bus.publish(BusEvent::CorePositionOpened {
            position_id,
            symbol: Symbol::from_pair("BTCUSDT").unwrap(),
            side: Side::Long,
            exchange_position_id: None,
        });

        match rx.recv().await.unwrap().unwrap() {
            BusEvent::CorePositionOpened { position_id: id, .. } => {
                assert_eq!(id, position_id);
            },
            other => panic!("expected CorePositionOpened, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fanout_to_multiple_receivers() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.receiver_count(), 2);

        bus.publish(BusEvent::CorePositionClosed {
            position_id: Uuid::now_v7(),
            symbol: Symbol::from_pair("BTCUSDT").unwrap(),
            side: Side::Long,
        });

        assert!(a.recv().await.unwrap().is_ok());
        assert!(b.recv().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_publish_without_receivers_is_fine() {
        let bus = EventBus::new(16);
        let reached = bus.publish(BusEvent::SafetyExitFailed {
            symbol: Symbol::from_pair("BTCUSDT").unwrap(),
            side: Side::Short,
            error: "x".to_string(),
        });
        assert_eq!(reached, 0);
    }
}
