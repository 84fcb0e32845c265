//! Per-delivery dispatch.
//!
//! [`Dispatcher::dispatch`] turns one delivery into one [`DispatchOutcome`]:
//! parse the envelope, resolve the handler, run it with panics caught. It
//! never settles the delivery and never returns an error; every failure mode
//! is an outcome the acknowledgment policy can act on.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, field, instrument, warn, Span};

use crate::broker::Delivery;
use crate::envelope::CommandEnvelope;
use crate::handler::{HandlerContext, Outcome};
use crate::registry::HandlerRegistry;
use crate::types::CommandType;

/// What happened to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran and reported an outcome.
    Handled(Outcome),
    /// The body could not be parsed into an envelope or a typed command.
    Malformed(String),
    /// No handler is registered for the command type.
    RegistryMiss(CommandType),
    /// The handler panicked.
    Panicked(String),
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handled(outcome) => write!(f, "{outcome}"),
            Self::Malformed(detail) => write!(f, "malformed: {detail}"),
            Self::RegistryMiss(command_type) => write!(f, "no handler for {command_type}"),
            Self::Panicked(message) => write!(f, "handler panicked: {message}"),
        }
    }
}

/// Routes deliveries to their handlers.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    /// Creates a dispatcher over a registry.
    pub const fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this dispatcher resolves handlers from.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Dispatches one delivery.
    #[instrument(
        name = "dispatch",
        skip_all,
        fields(
            queue = %delivery.queue,
            delivery_tag = %delivery.tag,
            delivery_count = %delivery.delivery_count,
            command_type = field::Empty,
            correlation_id = field::Empty,
        )
    )]
    pub async fn dispatch(&self, delivery: &Delivery) -> DispatchOutcome {
        let envelope = match CommandEnvelope::from_slice(&delivery.body) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(error = %error, "delivery body is not a valid envelope");
                return DispatchOutcome::Malformed(error.to_string());
            }
        };

        let span = Span::current();
        span.record("command_type", field::display(envelope.command_type()));
        span.record("correlation_id", field::display(envelope.correlation_id()));

        let handler = match self.registry.resolve(envelope.command_type()) {
            Ok(handler) => handler,
            Err(miss) => {
                warn!("{miss}");
                return DispatchOutcome::RegistryMiss(miss.0);
            }
        };

        let context = HandlerContext::for_envelope(&envelope, delivery.delivery_count);
        let invocation = AssertUnwindSafe(handler.handle_envelope(&envelope, &context));

        match invocation.catch_unwind().await {
            Ok(Ok(outcome)) => DispatchOutcome::Handled(outcome),
            Ok(Err(error)) => {
                warn!(error = %error, "payload rejected by handler decoder");
                DispatchOutcome::Malformed(error.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "handler panicked");
                DispatchOutcome::Panicked(message)
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Command;
    use crate::handler::CommandHandler;
    use crate::types::{CorrelationId, DeliveryCount, DeliveryTag, QueueName};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use tracing_test::traced_test;

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Adjust {
        sn: String,
        delta: i32,
    }

    impl Command for Adjust {
        const COMMAND_TYPE: &'static str = "Adjust";
        const FAMILY: &'static str = "stock";
    }

    struct AdjustHandler;

    #[async_trait]
    impl CommandHandler for AdjustHandler {
        type Command = Adjust;

        async fn handle(&self, command: Adjust, _context: &HandlerContext) -> Outcome {
            match command.delta {
                0 => Outcome::rejected("nothing to adjust"),
                i32::MIN => panic!("delta underflow for {}", command.sn),
                _ => Outcome::Applied,
            }
        }
    }

    fn dispatcher() -> Dispatcher {
        let registry = HandlerRegistry::new().register(AdjustHandler).unwrap();
        Dispatcher::new(Arc::new(registry))
    }

    fn delivery(body: &[u8]) -> Delivery {
        Delivery {
            tag: DeliveryTag::new(1),
            body: body.to_vec(),
            delivery_count: DeliveryCount::first(),
            queue: QueueName::try_new("gestionfm1.stock.commands").unwrap(),
        }
    }

    fn sealed(command: &Adjust) -> Vec<u8> {
        CommandEnvelope::seal(command, CorrelationId::try_new("c-1").unwrap())
            .unwrap()
            .to_bytes()
            .unwrap()
    }

    #[tokio::test]
    async fn handled_outcomes_are_passed_through() {
        let dispatcher = dispatcher();

        let applied = dispatcher
            .dispatch(&delivery(&sealed(&Adjust { sn: "SN1".into(), delta: 2 })))
            .await;
        let rejected = dispatcher
            .dispatch(&delivery(&sealed(&Adjust { sn: "SN1".into(), delta: 0 })))
            .await;

        assert_eq!(applied, DispatchOutcome::Handled(Outcome::Applied));
        assert_eq!(
            rejected,
            DispatchOutcome::Handled(Outcome::Rejected("nothing to adjust".to_string()))
        );
    }

    #[tokio::test]
    async fn non_json_body_is_malformed() {
        let outcome = dispatcher().dispatch(&delivery(b"not json")).await;
        assert!(matches!(outcome, DispatchOutcome::Malformed(_)));
    }

    #[tokio::test]
    async fn payload_that_does_not_fit_the_command_is_malformed() {
        let body = br#"{"commandType":"Adjust","payload":{"sn":1},"correlationId":"c-2","publishedAt":"2024-05-02T09:30:00Z"}"#;
        let outcome = dispatcher().dispatch(&delivery(body)).await;
        assert!(matches!(outcome, DispatchOutcome::Malformed(detail) if detail.contains("Adjust")));
    }

    #[tokio::test]
    async fn unknown_command_type_is_a_registry_miss() {
        let body = br#"{"commandType":"Teleport","payload":{},"correlationId":"c-3","publishedAt":"2024-05-02T09:30:00Z"}"#;
        let outcome = dispatcher().dispatch(&delivery(body)).await;
        assert_eq!(
            outcome,
            DispatchOutcome::RegistryMiss(CommandType::try_new("Teleport").unwrap())
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn handler_panics_are_captured() {
        let outcome = dispatcher()
            .dispatch(&delivery(&sealed(&Adjust {
                sn: "SN9".into(),
                delta: i32::MIN,
            })))
            .await;

        assert_eq!(
            outcome,
            DispatchOutcome::Panicked("delta underflow for SN9".to_string())
        );
        assert!(logs_contain("handler panicked"));
        assert!(logs_contain("correlation_id=c-1"));
    }

    #[test]
    fn panic_messages_are_extracted_from_common_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "non-string panic payload");
    }
}
