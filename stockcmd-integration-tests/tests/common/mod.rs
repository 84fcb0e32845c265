#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use stockcmd::{
    shutdown_channel, Broker, CommandPublisher, ConsumerConfig, ConsumerRuntime, MaxAttempts,
    PublisherConfig, QueueName, QueueNaming, RecoveryTask, RetryStrategy, RuntimeSummary,
    ShutdownTrigger,
};
use stockcmd_inventory::{
    inventory_registry, AssetId, InMemoryReadStore, InMemoryWriteStore, Reconciler,
    RegisterAsset, FAMILIES,
};
use stockcmd_memory::InMemoryBroker;
use tokio::task::JoinHandle;

pub const SITE: &str = "TUN-042";

pub fn fast_config() -> ConsumerConfig {
    ConsumerConfig {
        max_attempts: MaxAttempts::try_new(3).unwrap(),
        grace_period: Duration::from_secs(2),
        reconnect: RetryStrategy {
            max_attempts: 5,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            use_jitter: false,
        },
        requeue_backoff: RetryStrategy::immediate(3),
        ..ConsumerConfig::default()
    }
}

pub fn queue(family: &str) -> QueueName {
    QueueNaming::default().queue_for_family(family).unwrap()
}

pub fn site_asset() -> RegisterAsset {
    RegisterAsset {
        asset_id: AssetId::for_site(SITE),
        site_code: SITE.to_string(),
        device_type: "FM1".to_string(),
        ps_serial: "PS-778".to_string(),
    }
}

/// Stores and reconciler shared by a pipeline.
#[derive(Clone)]
pub struct Stores {
    pub write: InMemoryWriteStore,
    pub read: InMemoryReadStore,
    pub reconciler: Reconciler,
}

impl Stores {
    pub fn new() -> Self {
        let write = InMemoryWriteStore::new();
        let read = InMemoryReadStore::new();
        let reconciler = Reconciler::new(Arc::new(write.clone()), Arc::new(read.clone()));
        Self {
            write,
            read,
            reconciler,
        }
    }
}

/// One consumer runtime per family, running in the background.
pub struct Pipeline<B: Broker + Clone> {
    pub runtimes: Vec<Arc<ConsumerRuntime<B>>>,
    trigger: ShutdownTrigger,
    running: Vec<JoinHandle<RuntimeSummary>>,
}

impl<B: Broker + Clone> Pipeline<B> {
    pub fn start(broker: &B, stores: &Stores, config: &ConsumerConfig) -> Self {
        let registry = Arc::new(inventory_registry(&stores.reconciler).unwrap());
        let recovery: Arc<dyn RecoveryTask> = Arc::new(stores.reconciler.clone());
        let (trigger, signal) = shutdown_channel();

        let runtimes: Vec<_> = FAMILIES
            .iter()
            .map(|family| {
                Arc::new(
                    ConsumerRuntime::builder(broker.clone(), queue(family), Arc::clone(&registry))
                        .config(config.clone())
                        .recovery_task(Arc::clone(&recovery))
                        .build(),
                )
            })
            .collect();
        let running = runtimes
            .iter()
            .map(|runtime| {
                let runtime = Arc::clone(runtime);
                let signal = signal.clone();
                tokio::spawn(async move { runtime.run(signal).await.unwrap() })
            })
            .collect();

        Self {
            runtimes,
            trigger,
            running,
        }
    }

    pub fn runtime(&self, family: &str) -> &ConsumerRuntime<B> {
        let queue = queue(family);
        self.runtimes
            .iter()
            .find(|runtime| runtime.queue() == &queue)
            .unwrap()
    }

    pub async fn stop(self) -> Vec<RuntimeSummary> {
        self.trigger.trigger();
        let mut summaries = Vec::with_capacity(self.running.len());
        for running in self.running {
            summaries.push(running.await.unwrap());
        }
        summaries
    }
}

pub fn publisher(broker: &InMemoryBroker) -> CommandPublisher<InMemoryBroker> {
    CommandPublisher::new(broker.clone(), PublisherConfig::default())
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(description: &str, mut condition: F)
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = bool> + Send,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {description}");
}
