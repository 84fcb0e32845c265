//! Error types for the command pipeline.
//!
//! Failures are split by the layer that observes them:
//!
//! - **PublishError**: surfaced synchronously to the producer; a publish
//!   failure means the change is *not* guaranteed.
//! - **EnvelopeError**: a message that cannot be parsed. Always a poison
//!   message on the consumer side.
//! - **BrokerError**: transport and connection failures. Connection-level
//!   variants trigger reconnection, they are never per-message outcomes.
//! - **RegistryError**: handler registry construction failures.
//! - **RuntimeError**: consumer runtime lifecycle failures.
//! - **ConfigError**: invalid configuration values.
//!
//! Per-message handler failures are not errors at all: they are expressed as
//! [`Outcome`](crate::handler::Outcome) values and resolved by the
//! acknowledgment policy.

use thiserror::Error;

use crate::runtime::RuntimeState;
use crate::types::{CommandType, DeliveryTag, QueueName, SchemaVersion};

/// Errors raised while building or parsing a command envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// The message body was not valid UTF-8.
    #[error("message body is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    /// The message body was not a well-formed envelope.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The command payload could not be serialized.
    #[error("failed to serialize payload for {command_type}: {detail}")]
    SerializationFailed {
        /// The command being serialized
        command_type: String,
        /// Serializer message
        detail: String,
    },

    /// The payload did not match the command's schema.
    #[error("payload of {command_type} does not match its schema: {detail}")]
    PayloadMismatch {
        /// The command type carried by the envelope
        command_type: CommandType,
        /// Deserializer message
        detail: String,
    },

    /// The envelope was produced by a newer schema than the handler knows.
    #[error("{command_type} schema version {found} is newer than supported version {supported}")]
    UnsupportedSchemaVersion {
        /// The command type carried by the envelope
        command_type: CommandType,
        /// Version found in the envelope
        found: SchemaVersion,
        /// Highest version the handler understands
        supported: SchemaVersion,
    },
}

/// Identifies the broker operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerOperation {
    /// Opening a connection.
    Connect,
    /// Opening a channel on a connection.
    OpenChannel,
    /// Declaring a queue.
    DeclareQueue,
    /// Publishing a message.
    Publish,
    /// Setting the channel prefetch.
    SetPrefetch,
    /// Starting a consumer.
    Consume,
    /// Acknowledging a delivery.
    Ack,
    /// Negatively acknowledging a delivery.
    Nack,
    /// Listing dead letters.
    InspectDeadLetters,
    /// Closing a channel or connection.
    Close,
}

impl std::fmt::Display for BrokerOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::OpenChannel => write!(f, "open_channel"),
            Self::DeclareQueue => write!(f, "declare_queue"),
            Self::Publish => write!(f, "publish"),
            Self::SetPrefetch => write!(f, "set_prefetch"),
            Self::Consume => write!(f, "consume"),
            Self::Ack => write!(f, "ack"),
            Self::Nack => write!(f, "nack"),
            Self::InspectDeadLetters => write!(f, "inspect_dead_letters"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// Errors surfaced by a durable queue adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("broker refused connection: {0}")]
    ConnectionRefused(String),

    /// An established connection dropped.
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),

    /// The channel was closed, by us or by the broker.
    #[error("channel closed")]
    ChannelClosed,

    /// A queue already exists with different attributes.
    #[error("queue {queue} already declared with different attributes: {detail}")]
    QueueDeclarationConflict {
        /// The conflicting queue
        queue: QueueName,
        /// What differs
        detail: String,
    },

    /// The queue was never declared.
    #[error("queue {0} does not exist")]
    QueueNotFound(QueueName),

    /// The queue name leaves no room for its dead-letter queue name.
    #[error("queue {queue} has no valid dead-letter queue name: {reason}")]
    DeadLetterNameTooLong {
        /// The command queue
        queue: QueueName,
        /// Why the derived name was refused
        reason: String,
    },

    /// The delivery handle is unknown or already settled.
    #[error("delivery tag {0} is unknown or already settled")]
    UnknownDeliveryTag(DeliveryTag),

    /// Any other failure of a broker operation.
    #[error("{operation} operation failed: {detail}")]
    Operation {
        /// The operation that failed
        operation: BrokerOperation,
        /// Adapter-specific detail
        detail: String,
    },
}

impl BrokerError {
    /// Whether the error means the connection or channel is gone and the
    /// session has to be re-established.
    pub const fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused(_) | Self::ConnectionLost(_) | Self::ChannelClosed
        )
    }
}

/// Errors returned to a producer by [`CommandPublisher`](crate::publisher::CommandPublisher).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The broker was unavailable; the command was not enqueued.
    #[error("command not enqueued, broker unavailable: {0}")]
    Unavailable(#[source] BrokerError),

    /// The target queue cannot be used as configured. Retrying fails the
    /// same way until the queue or its naming is fixed.
    #[error("command not enqueued, queue misconfigured: {0}")]
    QueueMisconfigured(#[source] BrokerError),

    /// The command failed producer-side validation.
    #[error("invalid {command_type} command: {reason}")]
    Invalid {
        /// The command type
        command_type: String,
        /// Why it is invalid
        reason: String,
    },

    /// The command could not be serialized.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl PublishError {
    /// Whether publishing the same command again may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<BrokerError> for PublishError {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::QueueDeclarationConflict { .. }
            | BrokerError::QueueNotFound(_)
            | BrokerError::DeadLetterNameTooLong { .. } => Self::QueueMisconfigured(error),
            other => Self::Unavailable(other),
        }
    }
}

/// Errors raised while building a [`HandlerRegistry`](crate::registry::HandlerRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Two handlers were registered for the same command type.
    #[error("a handler is already registered for {0}")]
    DuplicateHandler(CommandType),

    /// A command declared an invalid type name.
    #[error("invalid command type `{0}`")]
    InvalidCommandType(String),
}

/// Errors raised by the consumer runtime lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// `run` was called while the runtime was not stopped.
    #[error("invalid runtime state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state
        from: RuntimeState,
        /// Requested state
        to: RuntimeState,
    },

    /// The broker stayed unreachable for the whole startup retry budget.
    #[error("startup failed after {attempts} attempts: {last_error}")]
    StartupFailed {
        /// Number of attempts made
        attempts: u32,
        /// The last broker error observed
        last_error: BrokerError,
    },
}

/// Errors raised while reading configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A variable was present but could not be parsed.
    #[error("invalid value `{value}` for {key}: {reason}")]
    InvalidValue {
        /// Environment variable name
        key: String,
        /// The raw value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// A required variable was absent.
    #[error("missing required setting {0}")]
    Missing(String),
}

/// Result alias for publishing.
pub type PublishResult<T> = Result<T, PublishError>;

/// Result alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Result alias for runtime lifecycle operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Result alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_level_errors_are_classified() {
        assert!(BrokerError::ConnectionLost("reset".to_string()).is_connection_level());
        assert!(BrokerError::ConnectionRefused("refused".to_string()).is_connection_level());
        assert!(BrokerError::ChannelClosed.is_connection_level());
        assert!(!BrokerError::UnknownDeliveryTag(DeliveryTag::new(4)).is_connection_level());
        assert!(!BrokerError::Operation {
            operation: BrokerOperation::Publish,
            detail: "boom".to_string(),
        }
        .is_connection_level());
    }

    #[test]
    fn queue_setup_failures_are_not_reported_as_unavailability() {
        let queue = QueueName::try_new("gestionfm1.composent.commands").unwrap();
        let conflict: PublishError = BrokerError::QueueDeclarationConflict {
            queue,
            detail: "durable true != false".to_string(),
        }
        .into();
        assert!(matches!(conflict, PublishError::QueueMisconfigured(_)));
        assert!(!conflict.is_retryable());

        let refused: PublishError = BrokerError::ConnectionRefused("db:5432".to_string()).into();
        assert!(matches!(refused, PublishError::Unavailable(_)));
        assert!(refused.is_retryable());
    }

    #[test]
    fn error_messages_are_descriptive() {
        let err = PublishError::Unavailable(BrokerError::ConnectionRefused(
            "localhost:5672".to_string(),
        ));
        assert_eq!(
            err.to_string(),
            "command not enqueued, broker unavailable: broker refused connection: localhost:5672"
        );

        let err = BrokerError::UnknownDeliveryTag(DeliveryTag::new(7));
        assert_eq!(err.to_string(), "delivery tag 7 is unknown or already settled");

        let err = RuntimeError::InvalidStateTransition {
            from: RuntimeState::Listening,
            to: RuntimeState::Starting,
        };
        assert_eq!(
            err.to_string(),
            "invalid runtime state transition from listening to starting"
        );
    }

    #[test]
    fn envelope_errors_convert_into_publish_errors() {
        let err: PublishError = EnvelopeError::Malformed("eof".to_string()).into();
        assert!(matches!(err, PublishError::Envelope(EnvelopeError::Malformed(_))));
    }
}
