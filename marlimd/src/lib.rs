//! marlimd: runtime host for the Marlim position lifecycle engine.
//!
//! # Architecture
//!
//! ```text
//! Operator API ──▶ Position Manager ──▶ per-position tasks ──▶ Engine
//!                       ▲                     ▲    │
//!                  Event Bus ◀────────────────┘    ▼
//!                       ▲                 Executor / Intent journal
//!                 Safety Net                       │
//!                       ▲                          ▼
//!                  Reconciler ◀──────────── Exchange adapter
//! ```
//!
//! # Components
//!
//! - **Daemon**: wiring, main loop, graceful shutdown
//! - **PositionManager**: task supervision and message routing
//! - **PositionTask**: the per-position mailbox state machine host
//! - **Reconciler**: startup/gap alignment of store, memory and exchange
//! - **SafetyNet**: protective stops for engine-foreign positions
//! - **signal_port**: manual signals and the SMA crossover detector
//! - **api**: axum operator surface (`/healthz`, `/readyz`, arm/panic/…)

#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod daemon;
pub mod error;
pub mod event_bus;
pub mod metrics;
pub mod position_manager;
pub mod position_task;
pub mod reconciler;
pub mod safety_net;
pub mod signal_port;

pub use config::{Config, Environment};
pub use daemon::Daemon;
pub use error::{DaemonError, DaemonResult};
pub use event_bus::{BusEvent, EventBus};
pub use position_manager::PositionManager;
pub use position_task::{PositionCommand, PositionMsg, PositionTask, TaskBudgets, TaskExit};
pub use reconciler::{ReconcileOutcome, ReconcileReport, Reconciler};
pub use safety_net::{SafetyNet, SafetyStatus};
