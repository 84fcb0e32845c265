//! Reaching the database at boot.
//!
//! A consumer that loses its database keeps reconnecting, so a consumer that
//! boots before its database does the same unless `STOCKCMD_FAIL_FAST` is set.

use std::fmt::{Debug, Display};
use std::future::Future;

use stockcmd::{retry_operation, ConsumerConfig, RetryError, RetryStrategy, ShutdownSignal};
use tracing::info;

/// Backoff for opening the database at boot.
///
/// Fail-fast deployments give up after `reconnect.max_attempts`; the others
/// wait as long as it takes.
pub fn startup_strategy(consumer: &ConsumerConfig) -> RetryStrategy {
    if consumer.fail_fast {
        consumer.reconnect.clone()
    } else {
        RetryStrategy {
            max_attempts: u32::MAX,
            ..consumer.reconnect.clone()
        }
    }
}

/// Runs `open` under [`startup_strategy`] until it succeeds, fails for good,
/// or shutdown is requested. Returns `Ok(None)` in the last case.
pub async fn open_with_retry<T, E, F, Fut, R>(
    consumer: &ConsumerConfig,
    operation: &str,
    is_retryable: R,
    open: F,
    shutdown: &mut ShutdownSignal,
) -> Result<Option<T>, E>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send,
    E: Display + Debug + Send,
    R: Fn(&E) -> bool + Send,
{
    let strategy = startup_strategy(consumer);
    tokio::select! {
        opened = retry_operation(&strategy, operation, is_retryable, open) => {
            opened.map(Some).map_err(RetryError::into_inner)
        }
        () = shutdown.triggered() => {
            info!(operation, "shutdown requested during startup");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use stockcmd::shutdown_channel;

    #[derive(Debug, PartialEq)]
    enum Database {
        Unreachable,
        Corrupt,
    }

    impl Display for Database {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Unreachable => write!(f, "connection refused"),
                Self::Corrupt => write!(f, "migration checksum mismatch"),
            }
        }
    }

    fn consumer(fail_fast: bool) -> ConsumerConfig {
        ConsumerConfig {
            reconnect: RetryStrategy::immediate(3),
            fail_fast,
            ..ConsumerConfig::default()
        }
    }

    fn unreachable_until(attempts: &AtomicU32, up_at: u32) -> Result<&'static str, Database> {
        if attempts.fetch_add(1, Ordering::SeqCst) + 1 < up_at {
            Err(Database::Unreachable)
        } else {
            Ok("pool")
        }
    }

    #[test]
    fn only_fail_fast_bounds_the_startup_budget() {
        assert_eq!(startup_strategy(&consumer(true)).max_attempts, 3);
        assert_eq!(startup_strategy(&consumer(false)).max_attempts, u32::MAX);
        assert_eq!(
            startup_strategy(&consumer(false)).base_delay,
            consumer(false).reconnect.base_delay
        );
    }

    #[tokio::test]
    async fn startup_outlasts_the_reconnect_budget_without_fail_fast() {
        let (_trigger, mut signal) = shutdown_channel();
        let attempts = &AtomicU32::new(0);

        let opened = open_with_retry(
            &consumer(false),
            "open database",
            |error: &Database| *error == Database::Unreachable,
            || async move { unreachable_until(attempts, 8) },
            &mut signal,
        )
        .await;

        assert_eq!(opened, Ok(Some("pool")));
        assert_eq!(attempts.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn fail_fast_startup_gives_up_after_the_reconnect_budget() {
        let (_trigger, mut signal) = shutdown_channel();
        let attempts = &AtomicU32::new(0);

        let opened = open_with_retry(
            &consumer(true),
            "open database",
            |error: &Database| *error == Database::Unreachable,
            || async move { unreachable_until(attempts, 8) },
            &mut signal,
        )
        .await;

        assert_eq!(opened, Err(Database::Unreachable));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_end_startup_immediately() {
        let (_trigger, mut signal) = shutdown_channel();
        let attempts = &AtomicU32::new(0);

        let opened: Result<Option<()>, _> = open_with_retry(
            &consumer(false),
            "migrate database",
            |error: &Database| *error == Database::Unreachable,
            || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Database::Corrupt)
            },
            &mut signal,
        )
        .await;

        assert_eq!(opened, Err(Database::Corrupt));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_waiting_for_the_database() {
        let (trigger, mut signal) = shutdown_channel();
        let slow = ConsumerConfig {
            reconnect: RetryStrategy {
                base_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(20),
                ..RetryStrategy::immediate(3)
            },
            ..consumer(false)
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });

        let opened: Result<Option<()>, _> = tokio::time::timeout(
            Duration::from_secs(5),
            open_with_retry(
                &slow,
                "open database",
                |error: &Database| *error == Database::Unreachable,
                || async { Err(Database::Unreachable) },
                &mut signal,
            ),
        )
        .await
        .unwrap();

        assert_eq!(opened, Ok(None));
    }
}
