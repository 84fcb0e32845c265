//! Error types and `sqlx` error translation.

use stockcmd::{BrokerError, BrokerOperation};
use stockcmd_inventory::StoreError;
use thiserror::Error;
use tracing::{error, warn};

/// Errors raised while setting up the PostgreSQL adapters.
#[derive(Debug, Error)]
pub enum PostgresError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// The schema migrations could not be applied.
    #[error("failed to apply postgres migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
}

/// Whether `error` means the database could not be reached.
fn is_unreachable(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_)
    )
}

pub(crate) fn map_broker_error(error: sqlx::Error, operation: BrokerOperation) -> BrokerError {
    if is_unreachable(&error) {
        warn!(error = %error, operation = %operation, "[postgres.unreachable] database connection lost");
        return BrokerError::ConnectionLost(error.to_string());
    }

    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] queue operation failed"
    );
    BrokerError::Operation {
        operation,
        detail: error.to_string(),
    }
}

pub(crate) fn map_store_error(error: sqlx::Error) -> StoreError {
    if is_unreachable(&error) {
        warn!(error = %error, "[postgres.unreachable] database connection lost");
        return StoreError::Unavailable(error.to_string());
    }
    if let sqlx::Error::Database(db_error) = &error {
        // 23505: unique violation, 23503: foreign key violation
        match db_error.code().as_deref() {
            Some("23505") => return StoreError::Conflict(db_error.to_string()),
            Some("23503" | "23514") => return StoreError::Invalid(db_error.to_string()),
            // 40001: serialization failure, 40P01: deadlock; both succeed on retry
            Some("40001" | "40P01") => return StoreError::Unavailable(db_error.to_string()),
            _ => {}
        }
    }

    error!(error = %error, "[postgres.database_error] store operation failed");
    StoreError::Unavailable(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_is_a_lost_connection() {
        let mapped = map_broker_error(sqlx::Error::PoolTimedOut, BrokerOperation::Publish);
        assert!(mapped.is_connection_level());
    }

    #[test]
    fn unexpected_rows_are_operation_failures() {
        let mapped = map_broker_error(sqlx::Error::RowNotFound, BrokerOperation::Ack);
        assert!(matches!(
            mapped,
            BrokerError::Operation {
                operation: BrokerOperation::Ack,
                ..
            }
        ));
    }

    #[test]
    fn unreachable_store_is_transient() {
        assert!(map_store_error(sqlx::Error::PoolClosed).is_transient());
    }
}
