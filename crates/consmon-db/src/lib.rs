//! Key/value store access for consmon.
//!
//! The configuration and state stores are logical databases resolved by
//! name from a JSON topology file (`database_config.json`): numeric DB id,
//! socket path or host, and key separator all come from that file, never
//! from code. [`Store`] wraps one logical database with hash-level
//! operations that preserve foreign fields (merge writes, field-level
//! deletes), and [`Store::subscribe`] turns the store's keyspace
//! notifications into a plain event queue a supervisor thread can poll
//! with a timeout.

pub mod client;
pub mod config;
pub mod error;

pub use client::{KeyEvent, Store, Subscription};
pub use config::{StoreConfig, DEFAULT_DB_CONFIG_PATH};
pub use error::{DbError, Result};

/// Logical database holding configuration tables.
pub const CONFIG_DB: &str = "CONFIG_DB";
/// Logical database holding operational state tables.
pub const STATE_DB: &str = "STATE_DB";
