//! Test support for `stockcmd` durable queue adapters.
//!
//! - [`contract`]: behavioral scenarios every [`stockcmd::Broker`] must pass,
//!   exposed through the [`broker_contract_tests!`] macro
//! - [`chaos`]: a broker wrapper that injects connection and publish failures

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chaos;
pub mod contract;

pub use chaos::{ChaosBroker, ChaosBrokerExt, ChaosChannel, ChaosConfig, ChaosConnection, Probability};
