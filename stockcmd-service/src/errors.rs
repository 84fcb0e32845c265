use std::path::PathBuf;

use stockcmd::{BrokerError, ConfigError, QueueName, RegistryError, RuntimeError};
use stockcmd_inventory::FAMILIES;
use stockcmd_postgres::PostgresError;
use thiserror::Error;

/// Top-level failures of the service process. Each one ends the process
/// with exit code 1.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),

    #[error("database setup failed")]
    Postgres(#[from] PostgresError),

    #[error("handler registration failed")]
    Registry(#[from] RegistryError),

    #[error("broker operation failed")]
    Broker(#[from] BrokerError),

    #[error("consumer of {queue} stopped")]
    Runtime {
        queue: QueueName,
        #[source]
        source: RuntimeError,
    },

    #[error("unknown command family `{0}`, expected one of: {families}", families = FAMILIES.join(", "))]
    UnknownFamily(String),

    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not a valid catalogue export", .path.display())]
    Catalogue {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{failed} of {total} catalogue rows were not published")]
    IncompleteImport { failed: usize, total: usize },

    #[error("interrupted before completion")]
    Interrupted,
}

pub type ServiceResult<T> = Result<T, ServiceError>;
