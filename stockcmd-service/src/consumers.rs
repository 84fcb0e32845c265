//! One consumer runtime per command family, stopped together.

use std::sync::Arc;

use futures::future::join_all;
use stockcmd::{
    shutdown_channel, Broker, ConsumerConfig, ConsumerRuntime, QueueName, QueueNaming,
    RecoveryTask, RuntimeSummary, ShutdownSignal,
};
use stockcmd_inventory::{inventory_registry, Reconciler, FAMILIES};
use tracing::{error, info, warn};

use crate::errors::{ServiceError, ServiceResult};

/// Consumes every inventory family queue until `shutdown` fires.
///
/// When one runtime stops on its own (a failed fail-fast startup) the
/// others are drained too, and the first failure is returned.
pub async fn consume_families<B: Broker + Clone>(
    broker: &B,
    reconciler: &Reconciler,
    naming: &QueueNaming,
    config: &ConsumerConfig,
    mut shutdown: ShutdownSignal,
) -> ServiceResult<Vec<(QueueName, RuntimeSummary)>> {
    let registry = Arc::new(inventory_registry(reconciler)?);
    let recovery: Arc<dyn RecoveryTask> = Arc::new(reconciler.clone());

    let mut runtimes = Vec::with_capacity(FAMILIES.len());
    for (index, family) in FAMILIES.iter().enumerate() {
        let builder = ConsumerRuntime::builder(
            broker.clone(),
            naming.queue_for_family(family)?,
            Arc::clone(&registry),
        )
        .config(config.clone());
        // recovery replays pending reconciliations of every family
        let builder = if index == 0 {
            builder.recovery_task(Arc::clone(&recovery))
        } else {
            builder
        };
        runtimes.push(builder.build());
    }

    let (stop, mut stopped) = shutdown_channel();
    let runs = join_all(runtimes.iter().map(|runtime| {
        let signal = stop.subscribe();
        let stop = &stop;
        async move {
            let result = runtime.run(signal).await;
            stop.trigger();
            (runtime.queue().clone(), result)
        }
    }));
    let forward = async {
        tokio::select! {
            () = shutdown.triggered() => {
                info!("shutdown requested, draining consumers");
                stop.trigger();
            }
            () = stopped.triggered() => {}
        }
    };
    let (results, ()) = tokio::join!(runs, forward);

    let mut summaries = Vec::with_capacity(results.len());
    let mut failure = None;
    for (queue, result) in results {
        match result {
            Ok(summary) => {
                if !summary.drained_cleanly {
                    warn!(queue = %queue, "grace period expired before every dispatch finished");
                }
                info!(
                    queue = %queue,
                    sessions = summary.sessions,
                    deliveries = summary.deliveries_received,
                    "consumer stopped"
                );
                summaries.push((queue, summary));
            }
            Err(source) => {
                error!(queue = %queue, error = %source, "consumer failed");
                if failure.is_none() {
                    failure = Some(ServiceError::Runtime { queue, source });
                }
            }
        }
    }

    failure.map_or(Ok(summaries), Err)
}
