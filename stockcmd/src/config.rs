//! Configuration for publishers and consumer runtimes.
//!
//! Every struct has a `Default` suitable for development and a `from_env`
//! constructor reading `STOCKCMD_*` variables. Absent variables keep their
//! default; present but unparsable ones are a [`ConfigError`].
//!
//! | variable | default |
//! |---|---|
//! | `STOCKCMD_SYSTEM` | `gestionfm1` |
//! | `STOCKCMD_PREFETCH` | `1` |
//! | `STOCKCMD_MAX_ATTEMPTS` | `3` |
//! | `STOCKCMD_GRACE_PERIOD_MS` | `30000` |
//! | `STOCKCMD_RECONNECT_BASE_MS` | `250` |
//! | `STOCKCMD_RECONNECT_MAX_MS` | `30000` |
//! | `STOCKCMD_STARTUP_ATTEMPTS` | `10` |
//! | `STOCKCMD_REQUEUE_BASE_MS` | `100` |
//! | `STOCKCMD_REQUEUE_MAX_MS` | `5000` |
//! | `STOCKCMD_FAIL_FAST` | `false` |
//! | `STOCKCMD_UNHEALTHY_AFTER` | `3` |
//! | `STOCKCMD_PUBLISH_TIMEOUT_MS` | `5000` |

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::envelope::Command;
use crate::errors::{ConfigError, ConfigResult};
use crate::retry::RetryStrategy;
use crate::types::{MaxAttempts, PrefetchCount, QueueName};

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Key/value source configuration is read from.
pub struct ConfigSource {
    lookup: Lookup,
}

impl ConfigSource {
    /// Reads from the process environment.
    pub fn env() -> Self {
        Self {
            lookup: Box::new(|key| std::env::var(key).ok()),
        }
    }

    /// Reads from fixed pairs; used by tests and embedders.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values: HashMap<String, String> = pairs
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        Self {
            lookup: Box::new(move |key| values.get(key).cloned()),
        }
    }

    /// The trimmed value of `key`; blank values count as absent.
    pub fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    /// The value of `key`, which must be present.
    pub fn require(&self, key: &str) -> ConfigResult<String> {
        self.raw(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    /// Parses `key` with [`FromStr`].
    pub fn parse<T>(&self, key: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.raw(key)
            .map(|value| {
                value.parse().map_err(|error: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.clone(),
                    reason: error.to_string(),
                })
            })
            .transpose()
    }

    /// Parses `key` as a number of milliseconds.
    pub fn millis(&self, key: &str) -> ConfigResult<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    /// Parses `key` as a boolean (`true/false`, `1/0`, `yes/no`, `on/off`).
    pub fn flag(&self, key: &str) -> ConfigResult<Option<bool>> {
        self.raw(key)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(invalid(key, &value, "expected a boolean")),
            })
            .transpose()
    }

    /// Parses `key` and validates it through a smart constructor.
    pub fn validated<R, T, E>(
        &self,
        key: &str,
        construct: impl FnOnce(R) -> Result<T, E>,
    ) -> ConfigResult<Option<T>>
    where
        R: FromStr + Display + Copy,
        R::Err: Display,
        E: Display,
    {
        self.parse::<R>(key)?
            .map(|raw| construct(raw).map_err(|error| invalid(key, &raw.to_string(), error)))
            .transpose()
    }
}

impl std::fmt::Debug for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSource").finish_non_exhaustive()
    }
}

fn invalid(key: &str, value: &str, reason: impl Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Derives queue names: `<system>.<family>.commands`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNaming {
    system: String,
}

impl Default for QueueNaming {
    fn default() -> Self {
        Self {
            system: "gestionfm1".to_string(),
        }
    }
}

impl QueueNaming {
    /// Naming scheme for a system prefix.
    pub fn new(system: impl Into<String>) -> ConfigResult<Self> {
        let naming = Self {
            system: system.into(),
        };
        naming
            .queue_for_family("composent")
            .map_err(|error| invalid("STOCKCMD_SYSTEM", &naming.system, error))?;
        Ok(naming)
    }

    /// Reads `STOCKCMD_SYSTEM`.
    pub fn from_source(source: &ConfigSource) -> ConfigResult<Self> {
        source
            .raw("STOCKCMD_SYSTEM")
            .map_or_else(|| Ok(Self::default()), Self::new)
    }

    /// The system prefix.
    pub fn system(&self) -> &str {
        &self.system
    }

    /// Queue carrying the commands of `family`.
    ///
    /// The name must leave room for its dead-letter queue name.
    pub fn queue_for_family(&self, family: &str) -> ConfigResult<QueueName> {
        let name = format!("{}.{family}.commands", self.system);
        let queue =
            QueueName::try_new(name.clone()).map_err(|error| invalid("queue name", &name, error))?;
        queue.dead_letter().map_err(|error| {
            invalid("queue name", &name, format!("dead-letter queue name {error}"))
        })?;
        Ok(queue)
    }

    /// Queue carrying commands of type `C`.
    pub fn queue_for<C: Command>(&self) -> ConfigResult<QueueName> {
        self.queue_for_family(C::FAMILY)
    }
}

/// Consumer runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Maximum unsettled deliveries, and dispatch concurrency
    pub prefetch: PrefetchCount,
    /// Deliveries allowed for a transiently failing command
    pub max_attempts: MaxAttempts,
    /// How long in-flight dispatches may run after shutdown was requested
    pub grace_period: Duration,
    /// Backoff between connection attempts; `max_attempts` is the
    /// fail-fast startup budget
    pub reconnect: RetryStrategy,
    /// Backoff before a transiently failed delivery is requeued
    pub requeue_backoff: RetryStrategy,
    /// Give up when the first session cannot be established
    pub fail_fast: bool,
    /// Consecutive connection failures after which the runtime reports
    /// itself unhealthy
    pub unhealthy_threshold: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: PrefetchCount::default(),
            max_attempts: MaxAttempts::default(),
            grace_period: Duration::from_secs(30),
            reconnect: RetryStrategy {
                max_attempts: 10,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(30),
                backoff_multiplier: 2.0,
                use_jitter: true,
            },
            requeue_backoff: RetryStrategy::default(),
            fail_fast: false,
            unhealthy_threshold: 3,
        }
    }
}

impl ConsumerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_source(&ConfigSource::env())
    }

    /// Reads the configuration from `source`.
    pub fn from_source(source: &ConfigSource) -> ConfigResult<Self> {
        let defaults = Self::default();

        let reconnect = RetryStrategy {
            max_attempts: source
                .parse("STOCKCMD_STARTUP_ATTEMPTS")?
                .unwrap_or(defaults.reconnect.max_attempts),
            base_delay: source
                .millis("STOCKCMD_RECONNECT_BASE_MS")?
                .unwrap_or(defaults.reconnect.base_delay),
            max_delay: source
                .millis("STOCKCMD_RECONNECT_MAX_MS")?
                .unwrap_or(defaults.reconnect.max_delay),
            ..defaults.reconnect
        };
        let requeue_backoff = RetryStrategy {
            base_delay: source
                .millis("STOCKCMD_REQUEUE_BASE_MS")?
                .unwrap_or(defaults.requeue_backoff.base_delay),
            max_delay: source
                .millis("STOCKCMD_REQUEUE_MAX_MS")?
                .unwrap_or(defaults.requeue_backoff.max_delay),
            ..defaults.requeue_backoff
        };

        Ok(Self {
            prefetch: source
                .validated("STOCKCMD_PREFETCH", PrefetchCount::try_new)?
                .unwrap_or(defaults.prefetch),
            max_attempts: source
                .validated("STOCKCMD_MAX_ATTEMPTS", MaxAttempts::try_new)?
                .unwrap_or(defaults.max_attempts),
            grace_period: source
                .millis("STOCKCMD_GRACE_PERIOD_MS")?
                .unwrap_or(defaults.grace_period),
            reconnect,
            requeue_backoff,
            fail_fast: source
                .flag("STOCKCMD_FAIL_FAST")?
                .unwrap_or(defaults.fail_fast),
            unhealthy_threshold: source
                .parse("STOCKCMD_UNHEALTHY_AFTER")?
                .unwrap_or(defaults.unhealthy_threshold),
        })
    }
}

/// Publisher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Queue naming scheme
    pub naming: QueueNaming,
    /// How long to wait for the broker to confirm a publish
    pub confirm_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            naming: QueueNaming::default(),
            confirm_timeout: Duration::from_secs(5),
        }
    }
}

impl PublisherConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_source(&ConfigSource::env())
    }

    /// Reads the configuration from `source`.
    pub fn from_source(source: &ConfigSource) -> ConfigResult<Self> {
        Ok(Self {
            naming: QueueNaming::from_source(source)?,
            confirm_timeout: source
                .millis("STOCKCMD_PUBLISH_TIMEOUT_MS")?
                .unwrap_or_else(|| Self::default().confirm_timeout),
        })
    }
}
