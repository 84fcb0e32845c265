//! The command handler contract.
//!
//! A handler executes one command type against the write model and reports an
//! explicit [`Outcome`]. Handlers never acknowledge anything themselves; the
//! acknowledgment policy turns the outcome into an ack or nack.
//!
//! Handlers must be idempotent per correlation id: a redelivered envelope
//! whose effect was already applied has to report [`Outcome::Applied`]
//! without applying it again.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::envelope::{Command, CommandEnvelope};
use crate::errors::EnvelopeError;
use crate::types::{CommandType, CorrelationId, DeliveryCount};

/// Result of executing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The write model was mutated (or already was, for this correlation id)
    /// and the read model reconciled.
    Applied,
    /// Business validation failed. Never retried.
    Rejected(String),
    /// A dependency was temporarily unavailable. Eligible for retry.
    TransientFailure(String),
}

impl Outcome {
    /// Shorthand for [`Outcome::Rejected`].
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    /// Shorthand for [`Outcome::TransientFailure`].
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientFailure(reason.into())
    }

    /// Whether the outcome is [`Outcome::Applied`].
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => write!(f, "applied"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::TransientFailure(reason) => write!(f, "transient failure: {reason}"),
        }
    }
}

/// Delivery metadata passed to a handler alongside its command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerContext {
    correlation_id: CorrelationId,
    command_type: CommandType,
    delivery_count: DeliveryCount,
    published_at: DateTime<Utc>,
}

impl HandlerContext {
    /// Builds the context for a delivered envelope.
    pub fn for_envelope(envelope: &CommandEnvelope, delivery_count: DeliveryCount) -> Self {
        Self {
            correlation_id: envelope.correlation_id().clone(),
            command_type: envelope.command_type().clone(),
            delivery_count,
            published_at: envelope.published_at(),
        }
    }

    /// Correlation id of the envelope; the idempotency key.
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Command type of the envelope.
    pub const fn command_type(&self) -> &CommandType {
        &self.command_type
    }

    /// How many times the envelope has been delivered.
    pub const fn delivery_count(&self) -> DeliveryCount {
        self.delivery_count
    }

    /// When the envelope was published.
    pub const fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }
}

/// Executes one command type.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// The command this handler executes.
    type Command: Command;

    /// Executes the command.
    async fn handle(&self, command: Self::Command, context: &HandlerContext) -> Outcome;
}

/// Type-erased handler stored in the registry.
///
/// Implemented for every [`CommandHandler`] through [`TypedHandler`]; it
/// decodes the payload before invoking the typed handler.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// The command type this handler is registered under.
    fn command_type(&self) -> &CommandType;

    /// Decodes the envelope payload and executes the command.
    async fn handle_envelope(
        &self,
        envelope: &CommandEnvelope,
        context: &HandlerContext,
    ) -> Result<Outcome, EnvelopeError>;
}

/// Adapts a typed [`CommandHandler`] to [`EnvelopeHandler`].
pub struct TypedHandler<H> {
    handler: H,
    command_type: CommandType,
}

impl<H: CommandHandler> TypedHandler<H> {
    /// Wraps a typed handler.
    pub fn new(handler: H) -> Result<Self, EnvelopeError> {
        Ok(Self {
            handler,
            command_type: H::Command::command_type()?,
        })
    }
}

#[async_trait]
impl<H: CommandHandler> EnvelopeHandler for TypedHandler<H> {
    fn command_type(&self) -> &CommandType {
        &self.command_type
    }

    async fn handle_envelope(
        &self,
        envelope: &CommandEnvelope,
        context: &HandlerContext,
    ) -> Result<Outcome, EnvelopeError> {
        let command = envelope.decode::<H::Command>()?;
        Ok(self.handler.handle(command, context).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Command for Ping {
        const COMMAND_TYPE: &'static str = "Ping";
        const FAMILY: &'static str = "test";
    }

    struct EvenOnly;

    #[async_trait]
    impl CommandHandler for EvenOnly {
        type Command = Ping;

        async fn handle(&self, command: Ping, _context: &HandlerContext) -> Outcome {
            if command.n % 2 == 0 {
                Outcome::Applied
            } else {
                Outcome::rejected(format!("{} is odd", command.n))
            }
        }
    }

    fn envelope(payload: serde_json::Value) -> CommandEnvelope {
        CommandEnvelope::from_parts(
            CommandType::try_new("Ping").unwrap(),
            crate::types::SchemaVersion::initial(),
            payload,
            CorrelationId::try_new("c-1").unwrap(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn typed_handler_decodes_and_executes() {
        let handler = TypedHandler::new(EvenOnly).unwrap();
        let envelope = envelope(json!({"n": 4}));
        let context = HandlerContext::for_envelope(&envelope, DeliveryCount::first());

        assert_eq!(handler.command_type().as_ref(), "Ping");
        assert_eq!(
            handler.handle_envelope(&envelope, &context).await,
            Ok(Outcome::Applied)
        );

        let odd = self::envelope(json!({"n": 3}));
        assert_eq!(
            handler.handle_envelope(&odd, &context).await,
            Ok(Outcome::Rejected("3 is odd".to_string()))
        );
    }

    #[tokio::test]
    async fn payload_mismatch_is_an_envelope_error() {
        let handler = TypedHandler::new(EvenOnly).unwrap();
        let envelope = envelope(json!({"n": "four"}));
        let context = HandlerContext::for_envelope(&envelope, DeliveryCount::first());

        assert!(matches!(
            handler.handle_envelope(&envelope, &context).await,
            Err(EnvelopeError::PayloadMismatch { .. })
        ));
    }

    #[test]
    fn context_carries_envelope_metadata() {
        let envelope = envelope(json!({"n": 2}));
        let context = HandlerContext::for_envelope(&envelope, DeliveryCount::first().next());

        assert_eq!(context.correlation_id().as_ref(), "c-1");
        assert_eq!(context.command_type().as_ref(), "Ping");
        assert_eq!(u32::from(context.delivery_count()), 2);
        assert_eq!(context.published_at(), envelope.published_at());
    }

    #[test]
    fn outcome_display_names_the_reason() {
        assert_eq!(Outcome::Applied.to_string(), "applied");
        assert_eq!(
            Outcome::transient("db down").to_string(),
            "transient failure: db down"
        );
    }
}
