//! NestDB engine: a durable in-memory document database core.
//!
//! Documents are schemaless JSON objects held in per-collection row
//! tables. Every mutation appends one command to the collection's log;
//! replaying the log reconstructs the collection. Secondary indexes
//! (unique map, ordered btree, hash multi-map) update transactionally
//! with writes, and committed commands fan out on an in-process bus that
//! feeds replication to secondaries.
//!
//! Modules:
//! * `persistence`: pluggable log storage drivers (`file`, `snappy`).
//! * `collection`: the row table, index set and command log engine.
//! * `database`: collection registry and lifecycle.
//! * `replication`: live bus, history replay, secondary agent, forwarder.
//! * `service`: the facade every frontend adapter consumes.

pub mod collection;
pub mod config;
pub mod database;
pub mod persistence;
pub mod replication;
pub mod service;

// Re-export commonly used types at the base
pub use collection::{Collection, Command, Row};
pub use config::DatabaseConfig;
pub use database::{Database, Status};
pub use nestdb_common::{NestError, Result};
pub use replication::{Bus, Event, Forwarder, Secondary};
pub use service::Service;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
