//! Command publisher.
//!
//! Validates commands, seals them into envelopes and enqueues them on their
//! family's queue. A successful return means the broker confirmed the
//! message is persisted; any failure means the command is not guaranteed to
//! be executed and the producer must decide whether to retry.

use std::collections::HashSet;

use tokio::sync::Mutex;
use tracing::{debug, field, info, instrument, warn, Span};

use crate::broker::{Broker, BrokerConnection, Channel, OutboundMessage, QueueDeclaration};
use crate::config::{PublisherConfig, QueueNaming};
use crate::envelope::{Command, CommandEnvelope};
use crate::errors::{BrokerError, BrokerOperation, BrokerResult, PublishError, PublishResult};
use crate::types::{CorrelationId, QueueName};

type ChannelOf<B> = <<B as Broker>::Connection as BrokerConnection>::Channel;

struct PublisherSession<B: Broker> {
    connection: B::Connection,
    channel: ChannelOf<B>,
    declared: HashSet<QueueName>,
}

/// Publishes commands to their durable queues.
///
/// The broker session is opened lazily on the first publish and cached. A
/// failed publish drops the cached session so the next call reconnects.
pub struct CommandPublisher<B: Broker> {
    broker: B,
    config: PublisherConfig,
    session: Mutex<Option<PublisherSession<B>>>,
}

impl<B: Broker> std::fmt::Debug for CommandPublisher<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPublisher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<B: Broker> CommandPublisher<B> {
    /// Creates a publisher. No connection is opened until the first publish.
    pub fn new(broker: B, config: PublisherConfig) -> Self {
        Self {
            broker,
            config,
            session: Mutex::new(None),
        }
    }

    /// Queue naming used to route commands.
    pub const fn naming(&self) -> &QueueNaming {
        &self.config.naming
    }

    /// Publishes `command`, returning its correlation id.
    ///
    /// The command's own correlation id is used when it carries one;
    /// otherwise a fresh one is generated.
    pub async fn publish<C: Command>(&self, command: &C) -> PublishResult<CorrelationId> {
        let correlation_id = command
            .correlation_id()
            .unwrap_or_else(CorrelationId::generate);
        self.publish_with(command, correlation_id).await
    }

    /// Publishes `command` under an explicit correlation id.
    #[instrument(
        name = "publish",
        skip_all,
        fields(command_type = C::COMMAND_TYPE, correlation_id = %correlation_id, queue = field::Empty)
    )]
    pub async fn publish_with<C: Command>(
        &self,
        command: &C,
        correlation_id: CorrelationId,
    ) -> PublishResult<CorrelationId> {
        command
            .validate()
            .map_err(|reason| PublishError::Invalid {
                command_type: C::COMMAND_TYPE.to_string(),
                reason,
            })?;

        let queue = self
            .config
            .naming
            .queue_for::<C>()
            .map_err(|error| PublishError::Invalid {
                command_type: C::COMMAND_TYPE.to_string(),
                reason: error.to_string(),
            })?;
        Span::current().record("queue", field::display(&queue));

        let envelope = CommandEnvelope::seal(command, correlation_id.clone())?;
        self.publish_envelope(&queue, &envelope).await?;

        info!("command published");
        Ok(correlation_id)
    }

    /// Publishes an already sealed envelope to `queue`.
    pub async fn publish_envelope(
        &self,
        queue: &QueueName,
        envelope: &CommandEnvelope,
    ) -> PublishResult<()> {
        let message = OutboundMessage::from_envelope(envelope)?;
        let mut slot = self.session.lock().await;

        let sent =
            tokio::time::timeout(self.config.confirm_timeout, self.send(&mut *slot, queue, message))
                .await
                .unwrap_or_else(|_| {
                    Err(BrokerError::Operation {
                        operation: BrokerOperation::Publish,
                        detail: format!(
                            "no confirmation within {}ms",
                            self.config.confirm_timeout.as_millis()
                        ),
                    })
                });

        if let Err(failure) = sent {
            warn!(error = %failure, "publish failed, dropping broker session");
            if let Some(session) = slot.take() {
                close_quietly::<B>(&session).await;
            }
            return Err(failure.into());
        }
        Ok(())
    }

    /// Closes the cached broker session, if any.
    pub async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            close_quietly::<B>(&session).await;
        }
    }

    async fn send(
        &self,
        slot: &mut Option<PublisherSession<B>>,
        queue: &QueueName,
        message: OutboundMessage,
    ) -> BrokerResult<()> {
        let reusable = slot
            .as_ref()
            .is_some_and(|session| session.connection.is_open());
        if !reusable {
            if let Some(stale) = slot.take() {
                close_quietly::<B>(&stale).await;
            }
            *slot = Some(self.connect().await?);
        }

        let session = slot.as_mut().ok_or(BrokerError::ChannelClosed)?;
        if !session.declared.contains(queue) {
            session
                .channel
                .declare_queue(&QueueDeclaration::dead_letter_queue(queue)?)
                .await?;
            session
                .channel
                .declare_queue(&QueueDeclaration::command_queue(queue.clone())?)
                .await?;
            session.declared.insert(queue.clone());
        }

        session.channel.publish(queue, message).await
    }

    async fn connect(&self) -> BrokerResult<PublisherSession<B>> {
        let connection = self.broker.connect().await?;
        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(failure) => {
                if let Err(close_error) = connection.close().await {
                    debug!(error = %close_error, "closing half-open connection failed");
                }
                return Err(failure);
            }
        };
        debug!("publisher session opened");
        Ok(PublisherSession {
            connection,
            channel,
            declared: HashSet::new(),
        })
    }
}

async fn close_quietly<B: Broker>(session: &PublisherSession<B>) {
    if let Err(failure) = session.channel.close().await {
        debug!(error = %failure, "publisher channel close failed");
    }
    if let Err(failure) = session.connection.close().await {
        debug!(error = %failure, "publisher connection close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DeliveryStream, Disposition};
    use crate::types::{DeliveryTag, PrefetchCount};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize)]
    struct Reorder {
        reason: String,
    }

    impl Command for Reorder {
        const COMMAND_TYPE: &'static str = "Reorder";
        const FAMILY: &'static str = "stock";

        fn validate(&self) -> Result<(), String> {
            if self.reason.trim().is_empty() {
                Err("reason is required".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[derive(Clone, Default)]
    struct Unreachable {
        attempts: Arc<AtomicU32>,
    }

    struct NoConnection;
    struct NoChannel;

    #[async_trait]
    impl Broker for Unreachable {
        type Connection = NoConnection;

        async fn connect(&self) -> BrokerResult<NoConnection> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::ConnectionRefused("localhost:5672".to_string()))
        }
    }

    #[async_trait]
    impl BrokerConnection for NoConnection {
        type Channel = NoChannel;

        async fn open_channel(&self) -> BrokerResult<NoChannel> {
            Err(BrokerError::ChannelClosed)
        }

        fn is_open(&self) -> bool {
            false
        }

        async fn close(&self) -> BrokerResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Channel for NoChannel {
        async fn declare_queue(&self, _declaration: &QueueDeclaration) -> BrokerResult<()> {
            Err(BrokerError::ChannelClosed)
        }

        async fn publish(&self, _queue: &QueueName, _message: OutboundMessage) -> BrokerResult<()> {
            Err(BrokerError::ChannelClosed)
        }

        async fn set_prefetch(&self, _prefetch: PrefetchCount) -> BrokerResult<()> {
            Err(BrokerError::ChannelClosed)
        }

        async fn consume(&self, _queue: &QueueName) -> BrokerResult<DeliveryStream> {
            Err(BrokerError::ChannelClosed)
        }

        async fn ack(&self, tag: DeliveryTag) -> BrokerResult<()> {
            Err(BrokerError::UnknownDeliveryTag(tag))
        }

        async fn nack(&self, tag: DeliveryTag, _disposition: Disposition) -> BrokerResult<()> {
            Err(BrokerError::UnknownDeliveryTag(tag))
        }

        async fn close(&self) -> BrokerResult<()> {
            Ok(())
        }
    }

    /// Accepts connections but refuses to redeclare its queues.
    #[derive(Clone, Default)]
    struct Conflicting {
        published: Arc<AtomicU32>,
    }

    struct OpenConnection(Conflicting);
    struct ConflictingChannel(Conflicting);

    #[async_trait]
    impl Broker for Conflicting {
        type Connection = OpenConnection;

        async fn connect(&self) -> BrokerResult<OpenConnection> {
            Ok(OpenConnection(self.clone()))
        }
    }

    #[async_trait]
    impl BrokerConnection for OpenConnection {
        type Channel = ConflictingChannel;

        async fn open_channel(&self) -> BrokerResult<ConflictingChannel> {
            Ok(ConflictingChannel(self.0.clone()))
        }

        fn is_open(&self) -> bool {
            true
        }

        async fn close(&self) -> BrokerResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Channel for ConflictingChannel {
        async fn declare_queue(&self, declaration: &QueueDeclaration) -> BrokerResult<()> {
            Err(BrokerError::QueueDeclarationConflict {
                queue: declaration.name.clone(),
                detail: "durable false != true".to_string(),
            })
        }

        async fn publish(&self, _queue: &QueueName, _message: OutboundMessage) -> BrokerResult<()> {
            self.0.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn set_prefetch(&self, _prefetch: PrefetchCount) -> BrokerResult<()> {
            Ok(())
        }

        async fn consume(&self, _queue: &QueueName) -> BrokerResult<DeliveryStream> {
            Err(BrokerError::ChannelClosed)
        }

        async fn ack(&self, tag: DeliveryTag) -> BrokerResult<()> {
            Err(BrokerError::UnknownDeliveryTag(tag))
        }

        async fn nack(&self, tag: DeliveryTag, _disposition: Disposition) -> BrokerResult<()> {
            Err(BrokerError::UnknownDeliveryTag(tag))
        }

        async fn close(&self) -> BrokerResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn invalid_commands_are_refused_before_connecting() {
        let broker = Unreachable::default();
        let publisher = CommandPublisher::new(broker.clone(), PublisherConfig::default());

        let result = publisher
            .publish(&Reorder {
                reason: "  ".to_string(),
            })
            .await;

        assert_eq!(
            result,
            Err(PublishError::Invalid {
                command_type: "Reorder".to_string(),
                reason: "reason is required".to_string(),
            })
        );
        assert_eq!(broker.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_broker_surfaces_as_unavailable() {
        let broker = Unreachable::default();
        let publisher = CommandPublisher::new(broker.clone(), PublisherConfig::default());
        let command = Reorder {
            reason: "stock below threshold".to_string(),
        };

        let first = publisher.publish(&command).await;
        let second = publisher.publish(&command).await;

        assert!(matches!(
            first,
            Err(PublishError::Unavailable(BrokerError::ConnectionRefused(_)))
        ));
        assert!(second.is_err());
        assert_eq!(broker.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn conflicting_queue_declaration_is_a_misconfiguration() {
        let broker = Conflicting::default();
        let publisher = CommandPublisher::new(broker.clone(), PublisherConfig::default());

        let result = publisher
            .publish(&Reorder {
                reason: "stock below threshold".to_string(),
            })
            .await;

        match result {
            Err(PublishError::QueueMisconfigured(BrokerError::QueueDeclarationConflict {
                queue,
                ..
            })) => assert_eq!(queue.as_ref(), "gestionfm1.stock.commands.dead-letter"),
            other => panic!("expected a queue misconfiguration, got {other:?}"),
        }
        assert_eq!(broker.published.load(Ordering::SeqCst), 0);
    }
}
