//! Consumer runtime.
//!
//! A [`ConsumerRuntime`] owns the broker session for one queue and moves
//! through `Stopped -> Starting -> Listening -> Draining -> Stopped`:
//!
//! - **Starting**: connect, open a channel, declare the command queue and its
//!   dead-letter queue, set the prefetch, run recovery tasks, start consuming.
//! - **Listening**: pull deliveries and dispatch them concurrently, bounded by
//!   the prefetch count, settling each one per the acknowledgment policy.
//! - **Draining**: stop pulling, give in-flight dispatches the grace period to
//!   finish, then close the session. Unsettled deliveries go back to the
//!   queue.
//!
//! When the session is lost the runtime goes back to `Starting` and reconnects
//! with exponential backoff. Per-message failures never end a run.

pub mod health;
pub mod shutdown;
mod stats;

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use crate::ack::{AckDecision, AckPolicy};
use crate::broker::{
    Broker, BrokerConnection, Channel, Delivery, DeliveryStream, Disposition, QueueDeclaration,
};
use crate::config::ConsumerConfig;
use crate::dispatch::Dispatcher;
use crate::errors::{BrokerError, BrokerResult, RuntimeError, RuntimeResult};
use crate::registry::HandlerRegistry;
use crate::types::QueueName;

pub use health::{HealthReport, HealthStatus};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use stats::RuntimeStats;

use stats::Counters;

type ChannelOf<B> = <<B as Broker>::Connection as BrokerConnection>::Channel;

/// Lifecycle state of a [`ConsumerRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeState {
    /// Not running; `run` may be called.
    Stopped,
    /// Establishing (or re-establishing) the broker session.
    Starting,
    /// Consuming deliveries.
    Listening,
    /// Finishing in-flight deliveries before stopping.
    Draining,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Listening => write!(f, "listening"),
            Self::Draining => write!(f, "draining"),
        }
    }
}

/// Work run while a session is being established, before consuming starts.
#[async_trait]
pub trait RecoveryTask: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Runs the recovery, returning how many items were repaired.
    async fn recover(&self) -> Result<usize, Box<dyn StdError + Send + Sync>>;
}

/// What a completed [`ConsumerRuntime::run`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSummary {
    /// Sessions established during the run
    pub sessions: u64,
    /// Deliveries pulled during the run
    pub deliveries_received: u64,
    /// Whether every in-flight dispatch finished within the grace period
    pub drained_cleanly: bool,
}

enum SessionEnd {
    Shutdown { drained_cleanly: bool },
    Lost(BrokerError),
}

struct Session<B: Broker> {
    connection: B::Connection,
    channel: Arc<ChannelOf<B>>,
    deliveries: DeliveryStream,
}

struct Inner<B: Broker> {
    broker: B,
    queue: QueueName,
    dispatcher: Dispatcher,
    policy: AckPolicy,
    config: ConsumerConfig,
    recovery: Vec<Arc<dyn RecoveryTask>>,
    state: watch::Sender<RuntimeState>,
    health: RwLock<HealthReport>,
    counters: Counters,
}

/// Long-lived consumer of one command queue.
///
/// Cloning is cheap and yields a handle to the same runtime, which is how
/// callers observe state while `run` is in progress.
pub struct ConsumerRuntime<B: Broker> {
    inner: Arc<Inner<B>>,
}

impl<B: Broker> Clone for ConsumerRuntime<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Broker> fmt::Debug for ConsumerRuntime<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRuntime")
            .field("queue", &self.inner.queue)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ConsumerRuntime`].
pub struct ConsumerRuntimeBuilder<B: Broker> {
    broker: B,
    queue: QueueName,
    registry: Arc<HandlerRegistry>,
    config: ConsumerConfig,
    recovery: Vec<Arc<dyn RecoveryTask>>,
}

impl<B: Broker> ConsumerRuntimeBuilder<B> {
    /// Replaces the default configuration.
    #[must_use]
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a task run on every session establishment.
    #[must_use]
    pub fn recovery_task(mut self, task: Arc<dyn RecoveryTask>) -> Self {
        self.recovery.push(task);
        self
    }

    /// Builds the runtime in the `Stopped` state.
    pub fn build(self) -> ConsumerRuntime<B> {
        let policy = AckPolicy::new(self.config.max_attempts, self.config.requeue_backoff.clone());
        let (state, _) = watch::channel(RuntimeState::Stopped);
        ConsumerRuntime {
            inner: Arc::new(Inner {
                broker: self.broker,
                queue: self.queue,
                dispatcher: Dispatcher::new(self.registry),
                policy,
                config: self.config,
                recovery: self.recovery,
                state,
                health: RwLock::new(HealthReport::degraded("not started")),
                counters: Counters::default(),
            }),
        }
    }
}

impl<B: Broker> ConsumerRuntime<B> {
    /// Starts building a runtime consuming `queue`.
    pub fn builder(
        broker: B,
        queue: QueueName,
        registry: impl Into<Arc<HandlerRegistry>>,
    ) -> ConsumerRuntimeBuilder<B> {
        ConsumerRuntimeBuilder {
            broker,
            queue,
            registry: registry.into(),
            config: ConsumerConfig::default(),
            recovery: Vec::new(),
        }
    }

    /// The consumed queue.
    pub fn queue(&self) -> &QueueName {
        &self.inner.queue
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RuntimeState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<RuntimeState> {
        self.inner.state.subscribe()
    }

    /// Latest health report.
    pub fn health(&self) -> HealthReport {
        self.inner.health.read().clone()
    }

    /// Counters accumulated since the runtime was built.
    pub fn stats(&self) -> RuntimeStats {
        self.inner.counters.snapshot()
    }

    /// Runs until `shutdown` fires, or until startup fails with `fail_fast`.
    ///
    /// Fails immediately with [`RuntimeError::InvalidStateTransition`] when
    /// the runtime is not `Stopped`. After it returns the runtime is
    /// `Stopped` again and may be run anew.
    #[instrument(name = "consumer_runtime", skip_all, fields(queue = %self.inner.queue))]
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> RuntimeResult<RuntimeSummary> {
        self.begin()?;
        let before = self.inner.counters.snapshot();

        let result = self.supervise(&mut shutdown).await;

        self.inner.set_state(RuntimeState::Stopped);
        if !matches!(result, Err(RuntimeError::StartupFailed { .. })) {
            *self.inner.health.write() = HealthReport::degraded("stopped");
        }
        info!("runtime stopped");

        let drained_cleanly = result?;
        let after = self.inner.counters.snapshot();
        Ok(RuntimeSummary {
            sessions: after.sessions - before.sessions,
            deliveries_received: after.deliveries_received - before.deliveries_received,
            drained_cleanly,
        })
    }

    fn begin(&self) -> RuntimeResult<()> {
        let mut current = RuntimeState::Stopped;
        let started = self.inner.state.send_if_modified(|state| {
            current = *state;
            if *state == RuntimeState::Stopped {
                *state = RuntimeState::Starting;
                true
            } else {
                false
            }
        });

        if started {
            info!("runtime starting");
            Ok(())
        } else {
            Err(RuntimeError::InvalidStateTransition {
                from: current,
                to: RuntimeState::Starting,
            })
        }
    }

    async fn supervise(&self, shutdown: &mut ShutdownSignal) -> RuntimeResult<bool> {
        let inner = &self.inner;
        let mut failures: u32 = 0;
        let mut established_once = false;

        loop {
            if shutdown.is_triggered() {
                inner.set_state(RuntimeState::Draining);
                return Ok(true);
            }

            match self.establish().await {
                Ok(session) => {
                    failures = 0;
                    established_once = true;
                    inner.counters.session_established();
                    *inner.health.write() =
                        HealthReport::healthy(format!("listening on {}", inner.queue));
                    inner.set_state(RuntimeState::Listening);
                    info!(prefetch = %inner.config.prefetch, "runtime listening");

                    match self.listen(session, shutdown).await {
                        SessionEnd::Shutdown { drained_cleanly } => return Ok(drained_cleanly),
                        SessionEnd::Lost(lost) => {
                            warn!(error = %lost, "broker session lost, reconnecting");
                            let mut report = HealthReport::degraded("broker session lost");
                            report.last_error = Some(lost.to_string());
                            *inner.health.write() = report;
                            inner.set_state(RuntimeState::Starting);
                        }
                    }
                }
                Err(failure) => {
                    failures = failures.saturating_add(1);
                    inner.counters.connection_failed();
                    let report = HealthReport::after_failures(
                        failures,
                        inner.config.unhealthy_threshold,
                        failure.to_string(),
                    );
                    if report.status == HealthStatus::Unhealthy {
                        error!(attempt = failures, error = %failure, "broker session could not be established");
                    } else {
                        warn!(attempt = failures, error = %failure, "broker session could not be established");
                    }
                    *inner.health.write() = report;

                    if inner.config.fail_fast
                        && !established_once
                        && failures >= inner.config.reconnect.max_attempts.max(1)
                    {
                        error!(attempts = failures, "startup retry budget exhausted");
                        return Err(RuntimeError::StartupFailed {
                            attempts: failures,
                            last_error: failure,
                        });
                    }

                    let delay = inner.config.reconnect.calculate_delay(failures);
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = shutdown.triggered() => {}
                    }
                }
            }
        }
    }

    #[instrument(name = "establish_session", skip_all, fields(queue = %self.inner.queue))]
    async fn establish(&self) -> BrokerResult<Session<B>> {
        let connection = self.inner.broker.connect().await?;

        match self.open_session(&connection).await {
            Ok((channel, deliveries)) => Ok(Session {
                connection,
                channel: Arc::new(channel),
                deliveries,
            }),
            Err(failure) => {
                if let Err(close_error) = connection.close().await {
                    debug!(error = %close_error, "closing half-open connection failed");
                }
                Err(failure)
            }
        }
    }

    async fn open_session(
        &self,
        connection: &B::Connection,
    ) -> BrokerResult<(ChannelOf<B>, DeliveryStream)> {
        let inner = &self.inner;
        let channel = connection.open_channel().await?;

        channel
            .declare_queue(&QueueDeclaration::dead_letter_queue(&inner.queue)?)
            .await?;
        channel
            .declare_queue(&QueueDeclaration::command_queue(inner.queue.clone())?)
            .await?;
        channel.set_prefetch(inner.config.prefetch).await?;

        inner.run_recovery().await;

        let deliveries = channel.consume(&inner.queue).await?;
        Ok((channel, deliveries))
    }

    async fn listen(&self, session: Session<B>, shutdown: &mut ShutdownSignal) -> SessionEnd {
        let Session {
            connection,
            channel,
            mut deliveries,
        } = session;
        let permits = Arc::new(Semaphore::new(usize::from(u16::from(
            self.inner.config.prefetch,
        ))));
        let mut in_flight = JoinSet::new();

        let lost = loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_join(joined);
            }

            let permit = tokio::select! {
                biased;
                () = shutdown.triggered() => break None,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Some(BrokerError::ChannelClosed),
                },
            };

            let next = tokio::select! {
                biased;
                () = shutdown.triggered() => break None,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.inner.counters.delivery_received();
                    let inner = Arc::clone(&self.inner);
                    let channel = Arc::clone(&channel);
                    in_flight.spawn(async move {
                        inner.process(channel.as_ref(), &delivery).await;
                        drop(permit);
                    });
                }
                Some(Err(failure)) => break Some(failure),
                None => break Some(BrokerError::ChannelClosed),
            }
        };
        drop(deliveries);

        if let Some(failure) = lost {
            self.drain(&mut in_flight).await;
            close_session::<B>(channel.as_ref(), &connection).await;
            return SessionEnd::Lost(failure);
        }

        self.inner.set_state(RuntimeState::Draining);
        info!(in_flight = in_flight.len(), "runtime draining");
        let drained_cleanly = self.drain(&mut in_flight).await;
        close_session::<B>(channel.as_ref(), &connection).await;
        SessionEnd::Shutdown { drained_cleanly }
    }

    async fn drain(&self, in_flight: &mut JoinSet<()>) -> bool {
        let grace = self.inner.config.grace_period;
        let finished = tokio::time::timeout(grace, async {
            while let Some(joined) = in_flight.join_next().await {
                log_join(joined);
            }
        })
        .await;

        if finished.is_ok() {
            return true;
        }

        warn!(
            remaining = in_flight.len(),
            grace_ms = grace.as_millis(),
            "grace period elapsed, aborting in-flight dispatches"
        );
        in_flight.abort_all();
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
        false
    }
}

impl<B: Broker> Inner<B> {
    fn set_state(&self, state: RuntimeState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "runtime state changed");
        }
    }

    async fn run_recovery(&self) {
        for task in &self.recovery {
            match task.recover().await {
                Ok(0) => debug!(task = task.name(), "nothing to recover"),
                Ok(repaired) => info!(task = task.name(), repaired, "recovery completed"),
                Err(failure) => warn!(task = task.name(), error = %failure, "recovery failed"),
            }
        }
    }

    #[instrument(
        name = "process",
        skip_all,
        fields(queue = %delivery.queue, delivery_tag = %delivery.tag, delivery_count = %delivery.delivery_count)
    )]
    async fn process(&self, channel: &ChannelOf<B>, delivery: &Delivery) {
        let outcome = self.dispatcher.dispatch(delivery).await;
        let decision = self.policy.decide(&outcome, delivery.delivery_count);
        self.settle(channel, delivery, decision).await;
    }

    async fn settle(&self, channel: &ChannelOf<B>, delivery: &Delivery, decision: AckDecision) {
        let settled = match &decision {
            AckDecision::Ack => channel.ack(delivery.tag).await,
            AckDecision::Requeue { delay } => {
                tokio::time::sleep(*delay).await;
                channel.nack(delivery.tag, Disposition::Requeue).await
            }
            AckDecision::DeadLetter(reason) => {
                channel
                    .nack(
                        delivery.tag,
                        Disposition::DeadLetter {
                            reason: reason.to_string(),
                        },
                    )
                    .await
            }
        };

        if let Err(failure) = settled {
            self.counters.settle_failed();
            warn!(decision = decision.label(), error = %failure, "broker refused settlement");
            return;
        }

        self.counters.settled(&decision);
        match &decision {
            AckDecision::Ack => info!(decision = decision.label(), "delivery acknowledged"),
            AckDecision::Requeue { delay } => warn!(
                decision = decision.label(),
                delay_ms = delay.as_millis(),
                "delivery requeued for retry"
            ),
            AckDecision::DeadLetter(reason) => error!(
                decision = decision.label(),
                reason = %reason,
                "delivery dead-lettered"
            ),
        }
    }
}

async fn close_session<B: Broker>(channel: &ChannelOf<B>, connection: &B::Connection) {
    if let Err(failure) = channel.close().await {
        debug!(error = %failure, "channel close failed");
    }
    if let Err(failure) = connection.close().await {
        debug!(error = %failure, "connection close failed");
    }
}

fn log_join(joined: Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(failure) if failure.is_cancelled() => debug!("in-flight dispatch cancelled"),
        Err(failure) => error!(error = %failure, "in-flight dispatch task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_render_in_lowercase() {
        let rendered: Vec<String> = [
            RuntimeState::Stopped,
            RuntimeState::Starting,
            RuntimeState::Listening,
            RuntimeState::Draining,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        assert_eq!(rendered, ["stopped", "starting", "listening", "draining"]);
    }
}
