//! Connection pool and queue polling configuration.

use std::num::NonZeroU32;
use std::time::Duration;

use nutype::nutype;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Pool, Postgres};
use stockcmd::{ConfigResult, ConfigSource};

use crate::errors::PostgresError;

/// Maximum number of database connections in the pool.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(NonZeroU32);

/// Configuration of the PostgreSQL adapters.
///
/// | variable | default |
/// |---|---|
/// | `STOCKCMD_DATABASE_URL` | required |
/// | `STOCKCMD_DB_MAX_CONNECTIONS` | `10` |
/// | `STOCKCMD_DB_ACQUIRE_TIMEOUT_MS` | `30000` |
/// | `STOCKCMD_DB_IDLE_TIMEOUT_MS` | `600000` |
/// | `STOCKCMD_LEASE_MS` | `300000` |
/// | `STOCKCMD_POLL_INTERVAL_MS` | `100` |
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Connection string
    pub url: String,
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
    /// How long a delivery stays leased to a channel without renewal
    /// before it is handed to another consumer (default: 5 minutes)
    pub lease_duration: Duration,
    /// Delay between polls of an empty queue (default: 100ms)
    pub poll_interval: Duration,
}

impl PostgresConfig {
    /// Default configuration for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        const DEFAULT_MAX_CONNECTIONS: NonZeroU32 = match NonZeroU32::new(10) {
            Some(value) => value,
            None => unreachable!(),
        };

        Self {
            url: url.into(),
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            lease_duration: Duration::from_secs(300),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_source(&ConfigSource::env())
    }

    /// Reads the configuration from `source`.
    pub fn from_source(source: &ConfigSource) -> ConfigResult<Self> {
        let defaults = Self::new(source.require("STOCKCMD_DATABASE_URL")?);
        Ok(Self {
            max_connections: source
                .parse::<NonZeroU32>("STOCKCMD_DB_MAX_CONNECTIONS")?
                .map_or(defaults.max_connections, MaxConnections::new),
            acquire_timeout: source
                .millis("STOCKCMD_DB_ACQUIRE_TIMEOUT_MS")?
                .unwrap_or(defaults.acquire_timeout),
            idle_timeout: source
                .millis("STOCKCMD_DB_IDLE_TIMEOUT_MS")?
                .unwrap_or(defaults.idle_timeout),
            lease_duration: source
                .millis("STOCKCMD_LEASE_MS")?
                .unwrap_or(defaults.lease_duration),
            poll_interval: source
                .millis("STOCKCMD_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poll_interval),
            ..defaults
        })
    }

    /// Opens a connection pool.
    pub async fn connect(&self) -> Result<PgPool, PostgresError> {
        let max_connections: NonZeroU32 = self.max_connections.into();
        PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout)
            .connect(&self.url)
            .await
            .map_err(PostgresError::ConnectionFailed)
    }
}

/// Applies the bundled schema migrations.
pub async fn migrate(pool: &Pool<Postgres>) -> Result<(), PostgresError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(PostgresError::MigrationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockcmd::ConfigError;

    #[test]
    fn database_url_is_required() {
        let result = PostgresConfig::from_source(&ConfigSource::from_pairs::<_, String, String>([]));

        assert!(matches!(result, Err(ConfigError::Missing(key)) if key == "STOCKCMD_DATABASE_URL"));
    }

    #[test]
    fn overrides_keep_unset_defaults() {
        let config = PostgresConfig::from_source(&ConfigSource::from_pairs([
            ("STOCKCMD_DATABASE_URL", "postgres://localhost/stock"),
            ("STOCKCMD_DB_MAX_CONNECTIONS", "4"),
            ("STOCKCMD_POLL_INTERVAL_MS", "25"),
        ]))
        .unwrap();

        assert_eq!(u32::from(NonZeroU32::from(config.max_connections)), 4);
        assert_eq!(config.poll_interval, Duration::from_millis(25));
        assert_eq!(config.lease_duration, Duration::from_secs(300));
    }

    #[test]
    fn zero_connections_are_refused() {
        let result = PostgresConfig::from_source(&ConfigSource::from_pairs([
            ("STOCKCMD_DATABASE_URL", "postgres://localhost/stock"),
            ("STOCKCMD_DB_MAX_CONNECTIONS", "0"),
        ]));

        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
