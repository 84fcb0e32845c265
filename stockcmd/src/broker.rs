//! Durable queue abstraction.
//!
//! The pipeline talks to a message broker through three layers, mirroring an
//! AMQP client: a [`Broker`] hands out connections, a [`BrokerConnection`]
//! opens channels, and a [`Channel`] declares queues, publishes, consumes and
//! settles deliveries.
//!
//! Adapters must provide these guarantees:
//!
//! - published messages are persisted before `publish` returns
//! - a delivery is held by exactly one channel until it is settled
//! - `ack`/`nack` are terminal; settling a tag twice returns
//!   [`BrokerError::UnknownDeliveryTag`]
//! - closing a channel returns its unsettled deliveries to the queue, and the
//!   next delivery of such an envelope carries an incremented delivery count
//! - a channel never holds more unsettled deliveries than its prefetch count

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::envelope::CommandEnvelope;
use crate::errors::{BrokerError, BrokerResult, EnvelopeError};
use crate::types::{CorrelationId, DeliveryCount, DeliveryTag, PrefetchCount, QueueName};

/// Entry point of a durable queue adapter.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Connection type produced by this broker.
    type Connection: BrokerConnection;

    /// Opens a new connection.
    async fn connect(&self) -> BrokerResult<Self::Connection>;
}

/// An open connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Channel type opened on this connection.
    type Channel: Channel;

    /// Opens a channel on this connection.
    async fn open_channel(&self) -> BrokerResult<Self::Channel>;

    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;

    /// Closes the connection and every channel opened on it.
    async fn close(&self) -> BrokerResult<()>;
}

/// A channel on a broker connection.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Declares a queue. Declaring an existing queue with the same
    /// attributes is a no-op; different attributes are a
    /// [`BrokerError::QueueDeclarationConflict`](crate::errors::BrokerError::QueueDeclarationConflict).
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> BrokerResult<()>;

    /// Publishes a persistent message and waits for the broker's confirmation.
    async fn publish(&self, queue: &QueueName, message: OutboundMessage) -> BrokerResult<()>;

    /// Limits the number of unsettled deliveries held by this channel.
    async fn set_prefetch(&self, prefetch: PrefetchCount) -> BrokerResult<()>;

    /// Starts consuming with manual acknowledgment.
    ///
    /// The stream ends or yields a connection-level error when the channel
    /// is lost.
    async fn consume(&self, queue: &QueueName) -> BrokerResult<DeliveryStream>;

    /// Acknowledges a delivery, removing it from the queue.
    async fn ack(&self, tag: DeliveryTag) -> BrokerResult<()>;

    /// Negatively acknowledges a delivery.
    async fn nack(&self, tag: DeliveryTag, disposition: Disposition) -> BrokerResult<()>;

    /// Closes the channel, returning unsettled deliveries to their queue.
    async fn close(&self) -> BrokerResult<()>;
}

/// Read access to dead-lettered messages.
#[async_trait]
pub trait DeadLetterInspector: Send + Sync {
    /// Lists the dead letters of `queue`, oldest first.
    async fn dead_letters(&self, queue: &QueueName) -> BrokerResult<Vec<DeadLetterEntry>>;
}

/// Stream of deliveries returned by [`Channel::consume`].
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// Attributes of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    /// Queue name
    pub name: QueueName,
    /// Survives broker restarts
    pub durable: bool,
    /// Restricted to the declaring connection
    pub exclusive: bool,
    /// Deleted when the last consumer goes away
    pub auto_delete: bool,
    /// Queue that receives dead-lettered messages
    pub dead_letter: Option<QueueName>,
}

/// Name of the dead-letter queue paired with `queue`.
pub fn dead_letter_name(queue: &QueueName) -> BrokerResult<QueueName> {
    queue
        .dead_letter()
        .map_err(|error| BrokerError::DeadLetterNameTooLong {
            queue: queue.clone(),
            reason: error.to_string(),
        })
}

impl QueueDeclaration {
    /// A durable, shared, persistent command queue routing its dead letters
    /// to `<name>.dead-letter`.
    pub fn command_queue(name: QueueName) -> BrokerResult<Self> {
        let dead_letter = dead_letter_name(&name)?;
        Ok(Self {
            name,
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter: Some(dead_letter),
        })
    }

    /// The durable dead-letter queue paired with a command queue.
    pub fn dead_letter_queue(command_queue: &QueueName) -> BrokerResult<Self> {
        Ok(Self {
            name: dead_letter_name(command_queue)?,
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter: None,
        })
    }

    /// Describes how `self` differs from `other`, if at all.
    pub fn conflict_with(&self, other: &Self) -> Option<String> {
        let mut differences = Vec::new();
        if self.durable != other.durable {
            differences.push(format!("durable {} != {}", self.durable, other.durable));
        }
        if self.exclusive != other.exclusive {
            differences.push(format!("exclusive {} != {}", self.exclusive, other.exclusive));
        }
        if self.auto_delete != other.auto_delete {
            differences.push(format!(
                "auto_delete {} != {}",
                self.auto_delete, other.auto_delete
            ));
        }
        if self.dead_letter != other.dead_letter {
            differences.push(format!(
                "dead_letter {:?} != {:?}",
                self.dead_letter.as_ref().map(AsRef::<str>::as_ref),
                other.dead_letter.as_ref().map(AsRef::<str>::as_ref)
            ));
        }

        if differences.is_empty() {
            None
        } else {
            Some(differences.join(", "))
        }
    }
}

/// A message handed to [`Channel::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// UTF-8 JSON envelope
    pub body: Vec<u8>,
    /// Correlation id message property
    pub correlation_id: Option<CorrelationId>,
}

impl OutboundMessage {
    /// Builds a message from a sealed envelope.
    pub fn from_envelope(envelope: &CommandEnvelope) -> Result<Self, EnvelopeError> {
        Ok(Self {
            body: envelope.to_bytes()?,
            correlation_id: Some(envelope.correlation_id().clone()),
        })
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Per-channel handle used to settle the delivery
    pub tag: DeliveryTag,
    /// Raw message body
    pub body: Vec<u8>,
    /// How many times this message has been delivered, starting at 1
    pub delivery_count: DeliveryCount,
    /// Queue the message was consumed from
    pub queue: QueueName,
}

impl Delivery {
    /// Whether the message was delivered before.
    pub fn is_redelivery(&self) -> bool {
        !self.delivery_count.is_first_attempt()
    }
}

/// How a negatively acknowledged delivery is disposed of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Return the message to the tail of its queue for redelivery.
    Requeue,
    /// Route the message to the queue's dead-letter queue.
    DeadLetter {
        /// Why the message was dead-lettered
        reason: String,
    },
}

/// A dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEntry {
    /// Raw message body
    pub body: Vec<u8>,
    /// Why the message was dead-lettered
    pub reason: String,
    /// Delivery count of the final attempt
    pub delivery_count: DeliveryCount,
    /// When the message was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
    /// Queue the message was consumed from
    pub original_queue: QueueName,
}

impl DeadLetterEntry {
    /// Parses the body as an envelope. Poison messages may not parse.
    pub fn envelope(&self) -> Result<CommandEnvelope, EnvelopeError> {
        CommandEnvelope::from_slice(&self.body)
    }
}
