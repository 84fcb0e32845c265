use std::sync::Arc;

use async_trait::async_trait;
use nutype::nutype;
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};
use stockcmd::{
    Broker, BrokerConnection, BrokerError, BrokerOperation, BrokerResult, Channel,
    DeadLetterEntry, DeadLetterInspector, DeliveryStream, DeliveryTag, Disposition,
    OutboundMessage, PrefetchCount, QueueDeclaration, QueueName,
};
use tracing::debug;

/// Probability value for chaos injection rates.
///
/// 0.0 never injects a failure and 1.0 always does.
///
/// ```ignore
/// use stockcmd_testing::chaos::Probability;
///
/// assert!(Probability::try_new(0.5).is_ok());
/// assert!(Probability::try_new(1.5).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

impl Probability {
    fn clamped(value: f32) -> Self {
        Self::try_new(value.clamp(0.0, 1.0)).expect("clamped value is always valid")
    }
}

/// Failure rates injected by [`ChaosBroker`].
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    connect_failure_probability: Probability,
    publish_failure_probability: Probability,
}

impl ChaosConfig {
    /// A config with a fixed seed, so injected failures repeat across runs.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Chance that `connect` is refused.
    #[must_use]
    pub fn with_connect_failure_probability(mut self, probability: f32) -> Self {
        self.connect_failure_probability = Probability::clamped(probability);
        self
    }

    /// Chance that `publish` fails without persisting the message.
    #[must_use]
    pub fn with_publish_failure_probability(mut self, probability: f32) -> Self {
        self.publish_failure_probability = Probability::clamped(probability);
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            connect_failure_probability: Probability::clamped(0.0),
            publish_failure_probability: Probability::clamped(0.0),
        }
    }
}

#[derive(Debug)]
struct Injector {
    config: ChaosConfig,
    rng: Mutex<StdRng>,
}

impl Injector {
    fn should_inject(&self, probability: Probability) -> bool {
        let probability: f32 = probability.into();
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        self.rng.lock().random_bool(f64::from(probability))
    }
}

/// Wraps a broker and injects connection and publish failures.
#[derive(Debug, Clone)]
pub struct ChaosBroker<B> {
    broker: B,
    injector: Arc<Injector>,
}

impl<B> ChaosBroker<B> {
    /// Wraps `broker`.
    pub fn new(broker: B, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };
        Self {
            broker,
            injector: Arc::new(Injector {
                config,
                rng: Mutex::new(rng),
            }),
        }
    }

    /// The wrapped broker.
    pub const fn inner(&self) -> &B {
        &self.broker
    }
}

/// Adds [`with_chaos`](ChaosBrokerExt::with_chaos) to every broker.
pub trait ChaosBrokerExt: Sized {
    /// Wraps `self` in a [`ChaosBroker`].
    fn with_chaos(self, config: ChaosConfig) -> ChaosBroker<Self>;
}

impl<B: Broker> ChaosBrokerExt for B {
    fn with_chaos(self, config: ChaosConfig) -> ChaosBroker<Self> {
        ChaosBroker::new(self, config)
    }
}

#[async_trait]
impl<B: Broker> Broker for ChaosBroker<B> {
    type Connection = ChaosConnection<B::Connection>;

    async fn connect(&self) -> BrokerResult<Self::Connection> {
        if self
            .injector
            .should_inject(self.injector.config.connect_failure_probability)
        {
            debug!("chaos: refusing connection");
            return Err(BrokerError::ConnectionRefused(
                "chaos: injected connection failure".to_string(),
            ));
        }
        let connection = self.broker.connect().await?;
        Ok(ChaosConnection {
            connection,
            injector: Arc::clone(&self.injector),
        })
    }
}

#[async_trait]
impl<B: DeadLetterInspector + Send + Sync> DeadLetterInspector for ChaosBroker<B> {
    async fn dead_letters(&self, queue: &QueueName) -> BrokerResult<Vec<DeadLetterEntry>> {
        self.broker.dead_letters(queue).await
    }
}

/// Connection opened by a [`ChaosBroker`].
#[derive(Debug)]
pub struct ChaosConnection<C> {
    connection: C,
    injector: Arc<Injector>,
}

#[async_trait]
impl<C: BrokerConnection> BrokerConnection for ChaosConnection<C> {
    type Channel = ChaosChannel<C::Channel>;

    async fn open_channel(&self) -> BrokerResult<Self::Channel> {
        let channel = self.connection.open_channel().await?;
        Ok(ChaosChannel {
            channel,
            injector: Arc::clone(&self.injector),
        })
    }

    fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    async fn close(&self) -> BrokerResult<()> {
        self.connection.close().await
    }
}

/// Channel opened by a [`ChaosConnection`].
#[derive(Debug)]
pub struct ChaosChannel<Ch> {
    channel: Ch,
    injector: Arc<Injector>,
}

#[async_trait]
impl<Ch: Channel> Channel for ChaosChannel<Ch> {
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> BrokerResult<()> {
        self.channel.declare_queue(declaration).await
    }

    async fn publish(&self, queue: &QueueName, message: OutboundMessage) -> BrokerResult<()> {
        if self
            .injector
            .should_inject(self.injector.config.publish_failure_probability)
        {
            debug!(%queue, "chaos: dropping publish");
            return Err(BrokerError::Operation {
                operation: BrokerOperation::Publish,
                detail: "chaos: injected publish failure".to_string(),
            });
        }
        self.channel.publish(queue, message).await
    }

    async fn set_prefetch(&self, prefetch: PrefetchCount) -> BrokerResult<()> {
        self.channel.set_prefetch(prefetch).await
    }

    async fn consume(&self, queue: &QueueName) -> BrokerResult<DeliveryStream> {
        self.channel.consume(queue).await
    }

    async fn ack(&self, tag: DeliveryTag) -> BrokerResult<()> {
        self.channel.ack(tag).await
    }

    async fn nack(&self, tag: DeliveryTag, disposition: Disposition) -> BrokerResult<()> {
        self.channel.nack(tag, disposition).await
    }

    async fn close(&self) -> BrokerResult<()> {
        self.channel.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockcmd_memory::InMemoryBroker;

    #[test]
    fn deterministic_config_sets_seed() {
        assert!(ChaosConfig::default().deterministic_seed.is_none());
        assert_eq!(ChaosConfig::deterministic().deterministic_seed, Some(0));
    }

    #[test]
    fn probabilities_are_clamped() {
        let config = ChaosConfig::default()
            .with_connect_failure_probability(4.0)
            .with_publish_failure_probability(-1.0);

        assert_eq!(
            config.connect_failure_probability,
            Probability::try_new(1.0).unwrap()
        );
        assert_eq!(
            config.publish_failure_probability,
            Probability::try_new(0.0).unwrap()
        );
    }

    #[tokio::test]
    async fn zero_probability_passes_through() {
        let broker = InMemoryBroker::new().with_chaos(ChaosConfig::deterministic());
        let connection = broker.connect().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        let queue = QueueName::try_new("chaos.passthrough").unwrap();

        channel
            .declare_queue(&QueueDeclaration::command_queue(queue.clone()).unwrap())
            .await
            .unwrap();
        channel
            .publish(
                &queue,
                OutboundMessage {
                    body: b"{}".to_vec(),
                    correlation_id: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(broker.inner().ready_count(&queue), 1);
    }

    #[tokio::test]
    async fn certain_connect_failure_is_always_refused() {
        let broker = InMemoryBroker::new().with_chaos(
            ChaosConfig::deterministic().with_connect_failure_probability(1.0),
        );

        for _ in 0..5 {
            assert!(matches!(
                broker.connect().await,
                Err(BrokerError::ConnectionRefused(_))
            ));
        }
    }

    #[tokio::test]
    async fn certain_publish_failure_persists_nothing() {
        let broker = InMemoryBroker::new().with_chaos(
            ChaosConfig::deterministic().with_publish_failure_probability(1.0),
        );
        let connection = broker.connect().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        let queue = QueueName::try_new("chaos.publish").unwrap();
        channel
            .declare_queue(&QueueDeclaration::command_queue(queue.clone()).unwrap())
            .await
            .unwrap();

        let result = channel
            .publish(
                &queue,
                OutboundMessage {
                    body: b"{}".to_vec(),
                    correlation_id: None,
                },
            )
            .await;

        assert!(matches!(result, Err(BrokerError::Operation { .. })));
        assert_eq!(broker.inner().ready_count(&queue), 0);
    }
}
