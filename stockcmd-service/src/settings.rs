//! Process settings.

use stockcmd::logging::LogFormat;
use stockcmd::{ConfigResult, ConfigSource, ConsumerConfig, PublisherConfig};
use stockcmd_postgres::PostgresConfig;

/// Everything the service reads from the environment.
///
/// `STOCKCMD_LOG_FORMAT` selects `json` (default) or `pretty` output; the
/// other variables are documented on the config types they feed.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub log_format: LogFormat,
    pub consumer: ConsumerConfig,
    pub publisher: PublisherConfig,
    pub postgres: PostgresConfig,
}

impl ServiceSettings {
    pub fn from_source(source: &ConfigSource) -> ConfigResult<Self> {
        Ok(Self {
            log_format: log_format(source)?,
            consumer: ConsumerConfig::from_source(source)?,
            publisher: PublisherConfig::from_source(source)?,
            postgres: PostgresConfig::from_source(source)?,
        })
    }
}

/// Reads only the log format, so logging can be installed before the rest
/// of the settings are validated.
pub fn log_format(source: &ConfigSource) -> ConfigResult<LogFormat> {
    Ok(source
        .parse::<LogFormat>("STOCKCMD_LOG_FORMAT")?
        .unwrap_or_default())
}
