//! PostgreSQL adapters for `stockcmd`.
//!
//! - [`PostgresBroker`]: a durable command queue with leases and dead
//!   letters, implementing the [`stockcmd::broker`] traits.
//! - [`PostgresWriteStore`] / [`PostgresReadStore`]: the inventory write
//!   model with its reconciliation outbox, and the query-side read model.
//!
//! All three share one schema; apply it with [`migrate`] before use.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod config;
pub mod errors;
pub mod stores;

pub use broker::{PostgresBroker, PostgresChannel, PostgresConnection};
pub use config::{migrate, MaxConnections, PostgresConfig};
pub use errors::PostgresError;
pub use stores::{PostgresReadStore, PostgresWriteStore};
