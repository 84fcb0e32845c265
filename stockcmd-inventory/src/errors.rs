//! Store failures and their mapping onto handler outcomes.
//!
//! Unavailable stores and stale writes are transient: the delivery is
//! requeued and the retry reloads the entity. Conflicts and invalid changes
//! reject the command.

use stockcmd::Outcome;
use thiserror::Error;

/// Failures of the write and read stores.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached; retrying may succeed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The change contradicts existing state.
    #[error("store conflict: {0}")]
    Conflict(String),

    /// The entity was changed by another command after it was loaded.
    #[error("stale write: {0}")]
    Stale(String),

    /// The change is invalid for the store.
    #[error("invalid change: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Stale(_))
    }

    /// The handler outcome this failure maps to.
    pub fn into_outcome(self) -> Outcome {
        if self.is_transient() {
            Outcome::transient(self.to_string())
        } else {
            Outcome::rejected(self.to_string())
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailability_and_stale_writes_are_retried() {
        assert_eq!(
            StoreError::Unavailable("pool timed out".into()).into_outcome(),
            Outcome::TransientFailure("store unavailable: pool timed out".into())
        );
        assert_eq!(
            StoreError::Conflict("serial already used".into()).into_outcome(),
            Outcome::Rejected("store conflict: serial already used".into())
        );
        assert!(!StoreError::Invalid("negative stock".into()).is_transient());
        assert!(StoreError::Stale("component c-1 is at version 3".into()).is_transient());
    }
}
