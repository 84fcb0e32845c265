//! `stockcmd` - asynchronous command pipeline
//!
//! Decouples a write request from its durable execution. Producers publish
//! typed commands through a [`CommandPublisher`]; a [`ConsumerRuntime`] pulls
//! them from a durable queue, resolves their handler in a
//! [`HandlerRegistry`], and settles every delivery according to the
//! [`AckPolicy`]: ack when applied, requeue transient failures a bounded
//! number of times, dead-letter everything else.
//!
//! Delivery is at-least-once. Handlers make it effectively-once by keying
//! their effects on the envelope's correlation id.
//!
//! Broker access goes through the [`broker`] traits so that the runtime can
//! run against any durable queue adapter.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ack;
pub mod broker;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod errors;
pub mod handler;
pub mod logging;
pub mod publisher;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod types;

pub use ack::{AckDecision, AckPolicy, DeadLetterReason};
pub use broker::{
    dead_letter_name, Broker, BrokerConnection, Channel, DeadLetterEntry, DeadLetterInspector,
    Delivery, DeliveryStream, Disposition, OutboundMessage, QueueDeclaration,
};
pub use config::{ConfigSource, ConsumerConfig, PublisherConfig, QueueNaming};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use envelope::{Command, CommandEnvelope};
pub use errors::{
    BrokerError, BrokerOperation, BrokerResult, ConfigError, ConfigResult, EnvelopeError,
    PublishError, PublishResult, RegistryError, RuntimeError, RuntimeResult,
};
pub use handler::{CommandHandler, EnvelopeHandler, HandlerContext, Outcome};
pub use publisher::CommandPublisher;
pub use registry::{HandlerRegistry, RegistryMiss};
pub use retry::{retry_operation, RetryError, RetryStrategy};
pub use runtime::shutdown::channel as shutdown_channel;
pub use runtime::{
    ConsumerRuntime, ConsumerRuntimeBuilder, HealthReport, HealthStatus, RecoveryTask,
    RuntimeState, RuntimeStats, RuntimeSummary, ShutdownSignal, ShutdownTrigger,
};
pub use types::{
    CommandType, CorrelationId, DeliveryCount, DeliveryTag, MaxAttempts, PrefetchCount,
    QueueName, SchemaVersion,
};
