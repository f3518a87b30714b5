//! Marlim storage layer.
//!
//! Durable, append-only event log per position plus a mutable snapshot
//! table maintained as a cache, and the intent journal rows.
//!
//! # Architecture
//!
//! - **Repository traits**: the storage ports
//! - **MemoryStore**: in-process implementation for tests and paper mode
//! - **PgStore**: PostgreSQL implementation (feature `postgres`)
//!
//! # Guarantees
//!
//! - A successful `append` commits the event and the snapshot atomically
//! - The snapshot is always reconstructible from events (`rebuild_snapshot`)
//! - `(intents.id, position_id)` is unique; duplicates are rejected

#![warn(clippy::all)]

mod error;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod repository;

pub use error::StoreError;
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::{PgStore, SCHEMA};
pub use repository::{
    snapshots_equal, EventRepository, IntentRepository, OrderRepository, PositionRepository,
    Store,
};
