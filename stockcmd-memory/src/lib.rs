//! In-memory durable queue adapter for `stockcmd`
//!
//! Implements the broker traits with process-local state. Messages survive
//! connection loss (they live as long as the [`InMemoryBroker`] value), so
//! the adapter exhibits the same redelivery behavior as a real broker:
//! unsettled deliveries return to their queue when a channel closes and are
//! redelivered with an incremented delivery count.
//!
//! Test hooks simulate outages: [`InMemoryBroker::disconnect_all`] drops every
//! open connection and [`InMemoryBroker::set_available`] makes new
//! connections fail.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use parking_lot::Mutex;
use stockcmd::{
    Broker, BrokerConnection, BrokerError, BrokerResult, Channel, DeadLetterEntry,
    DeadLetterInspector, Delivery, DeliveryCount, DeliveryStream, DeliveryTag, Disposition,
    OutboundMessage, PrefetchCount, QueueDeclaration, QueueName,
};
use tokio::sync::Notify;
use tracing::{debug, trace};

type ConnectionId = u64;
type ChannelId = u64;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    last_delivery: Option<DeliveryCount>,
}

#[derive(Debug)]
struct QueueState {
    declaration: QueueDeclaration,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug)]
struct InFlight {
    queue: QueueName,
    message: StoredMessage,
}

#[derive(Debug)]
struct ChannelRecord {
    connection: ConnectionId,
    prefetch: Option<u16>,
    next_tag: u64,
    unacked: BTreeMap<DeliveryTag, InFlight>,
}

#[derive(Debug, Default)]
struct Registry {
    queues: HashMap<QueueName, QueueState>,
    dead_letters: HashMap<QueueName, Vec<DeadLetterEntry>>,
    connections: HashMap<ConnectionId, Vec<ChannelId>>,
    channels: HashMap<ChannelId, ChannelRecord>,
    next_id: u64,
}

impl Registry {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_mut(&mut self, id: ChannelId) -> BrokerResult<&mut ChannelRecord> {
        self.channels.get_mut(&id).ok_or(BrokerError::ChannelClosed)
    }

    fn ensure_channel(&self, id: ChannelId) -> BrokerResult<()> {
        if self.channels.contains_key(&id) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    /// Returns the channel's unsettled deliveries to the front of their
    /// queues, preserving their original order.
    fn close_channel(&mut self, id: ChannelId) -> usize {
        let Some(record) = self.channels.remove(&id) else {
            return 0;
        };
        if let Some(channels) = self.connections.get_mut(&record.connection) {
            channels.retain(|channel| *channel != id);
        }

        let released = record.unacked.len();
        for (_, in_flight) in record.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&in_flight.queue) {
                queue.ready.push_front(in_flight.message);
            }
        }
        released
    }

    fn close_connection(&mut self, id: ConnectionId) -> usize {
        let channels = self.connections.remove(&id).unwrap_or_default();
        channels
            .into_iter()
            .map(|channel| self.close_channel(channel))
            .sum()
    }

    fn try_deliver(&mut self, channel: ChannelId, queue: &QueueName) -> BrokerResult<Option<Delivery>> {
        let record = self
            .channels
            .get(&channel)
            .ok_or_else(|| BrokerError::ConnectionLost("channel closed by broker".to_string()))?;
        if let Some(limit) = record.prefetch {
            if record.unacked.len() >= usize::from(limit) {
                return Ok(None);
            }
        }

        let state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.clone()))?;
        let Some(mut message) = state.ready.pop_front() else {
            return Ok(None);
        };
        let delivery_count = message
            .last_delivery
            .map_or_else(DeliveryCount::first, DeliveryCount::next);
        message.last_delivery = Some(delivery_count);

        let record = self.channel_mut(channel)?;
        record.next_tag += 1;
        let tag = DeliveryTag::new(record.next_tag);
        let body = message.body.clone();
        record.unacked.insert(
            tag,
            InFlight {
                queue: queue.clone(),
                message,
            },
        );

        Ok(Some(Delivery {
            tag,
            body,
            delivery_count,
            queue: queue.clone(),
        }))
    }
}

#[derive(Debug)]
struct Shared {
    registry: Mutex<Registry>,
    available: AtomicBool,
    changed: Notify,
}

/// Process-local broker.
///
/// Cloning yields another handle to the same queues.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates a broker with no queues.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                available: AtomicBool::new(true),
                changed: Notify::new(),
            }),
        }
    }

    /// Makes new connection attempts succeed (`true`) or be refused.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Drops every open connection, as a broker restart would.
    ///
    /// Unsettled deliveries go back to their queues and consumers see their
    /// delivery stream fail with a connection-level error.
    pub fn disconnect_all(&self) {
        let released: usize = {
            let mut registry = self.shared.registry.lock();
            let connections: Vec<_> = registry.connections.keys().copied().collect();
            connections
                .into_iter()
                .map(|connection| registry.close_connection(connection))
                .sum()
        };
        debug!(released, "in-memory broker dropped all connections");
        self.shared.changed.notify_waiters();
    }

    /// Messages waiting for delivery on `queue`.
    pub fn ready_count(&self, queue: &QueueName) -> usize {
        self.shared
            .registry
            .lock()
            .queues
            .get(queue)
            .map_or(0, |state| state.ready.len())
    }

    /// Deliveries from `queue` currently held by a consumer.
    pub fn unacked_count(&self, queue: &QueueName) -> usize {
        self.shared
            .registry
            .lock()
            .channels
            .values()
            .flat_map(|record| record.unacked.values())
            .filter(|in_flight| &in_flight.queue == queue)
            .count()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.lock().connections.len()
    }

    /// Whether `queue` has been declared.
    pub fn is_declared(&self, queue: &QueueName) -> bool {
        self.shared.registry.lock().queues.contains_key(queue)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    type Connection = InMemoryConnection;

    async fn connect(&self) -> BrokerResult<InMemoryConnection> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionRefused(
                "in-memory broker is unavailable".to_string(),
            ));
        }

        let id = {
            let mut registry = self.shared.registry.lock();
            let id = registry.allocate_id();
            registry.connections.insert(id, Vec::new());
            id
        };
        trace!(connection = id, "connection opened");
        Ok(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            id,
        })
    }
}

#[async_trait]
impl DeadLetterInspector for InMemoryBroker {
    async fn dead_letters(&self, queue: &QueueName) -> BrokerResult<Vec<DeadLetterEntry>> {
        let dead_letter_queue = self
            .shared
            .registry
            .lock()
            .queues
            .get(queue)
            .and_then(|state| state.declaration.dead_letter.clone());
        let dead_letter_queue = dead_letter_target(dead_letter_queue, queue);

        Ok(self
            .shared
            .registry
            .lock()
            .dead_letters
            .get(&dead_letter_queue)
            .cloned()
            .unwrap_or_default())
    }
}

/// Connection to an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryConnection {
    shared: Arc<Shared>,
    id: ConnectionId,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    type Channel = InMemoryChannel;

    async fn open_channel(&self) -> BrokerResult<InMemoryChannel> {
        let mut registry = self.shared.registry.lock();
        if !registry.connections.contains_key(&self.id) {
            return Err(BrokerError::ConnectionLost(
                "connection closed by broker".to_string(),
            ));
        }

        let id = registry.allocate_id();
        registry.channels.insert(
            id,
            ChannelRecord {
                connection: self.id,
                prefetch: None,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        if let Some(channels) = registry.connections.get_mut(&self.id) {
            channels.push(id);
        }
        drop(registry);

        Ok(InMemoryChannel {
            shared: Arc::clone(&self.shared),
            id,
        })
    }

    fn is_open(&self) -> bool {
        self.shared
            .registry
            .lock()
            .connections
            .contains_key(&self.id)
    }

    async fn close(&self) -> BrokerResult<()> {
        let released = self.shared.registry.lock().close_connection(self.id);
        if released > 0 {
            debug!(released, "closing connection returned unsettled deliveries");
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        if self.shared.registry.lock().close_connection(self.id) > 0 {
            self.shared.changed.notify_waiters();
        }
    }
}

/// Channel on an [`InMemoryConnection`].
#[derive(Debug)]
pub struct InMemoryChannel {
    shared: Arc<Shared>,
    id: ChannelId,
}

impl InMemoryChannel {
    fn settle(&self, tag: DeliveryTag) -> BrokerResult<InFlight> {
        let mut registry = self.shared.registry.lock();
        let record = registry.channel_mut(self.id)?;
        record
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> BrokerResult<()> {
        let mut registry = self.shared.registry.lock();
        registry.ensure_channel(self.id)?;

        if let Some(existing) = registry.queues.get(&declaration.name) {
            return match existing.declaration.conflict_with(declaration) {
                Some(detail) => Err(BrokerError::QueueDeclarationConflict {
                    queue: declaration.name.clone(),
                    detail,
                }),
                None => Ok(()),
            };
        }

        registry.queues.insert(
            declaration.name.clone(),
            QueueState {
                declaration: declaration.clone(),
                ready: VecDeque::new(),
            },
        );
        drop(registry);
        debug!(queue = %declaration.name, "queue declared");
        Ok(())
    }

    async fn publish(&self, queue: &QueueName, message: OutboundMessage) -> BrokerResult<()> {
        {
            let mut registry = self.shared.registry.lock();
            registry.ensure_channel(self.id)?;
            let state = registry
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.clone()))?;
            state.ready.push_back(StoredMessage {
                body: message.body,
                last_delivery: None,
            });
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn set_prefetch(&self, prefetch: PrefetchCount) -> BrokerResult<()> {
        let mut registry = self.shared.registry.lock();
        registry.channel_mut(self.id)?.prefetch = Some(prefetch.into());
        Ok(())
    }

    async fn consume(&self, queue: &QueueName) -> BrokerResult<DeliveryStream> {
        {
            let registry = self.shared.registry.lock();
            registry.ensure_channel(self.id)?;
            if !registry.queues.contains_key(queue) {
                return Err(BrokerError::QueueNotFound(queue.clone()));
            }
        }

        let cursor = Cursor {
            shared: Arc::clone(&self.shared),
            channel: self.id,
            queue: queue.clone(),
            finished: false,
        };
        let deliveries = stream::unfold(cursor, |mut cursor| async move {
            if cursor.finished {
                return None;
            }
            let next = cursor.next_delivery().await;
            cursor.finished = next.is_err();
            Some((next, cursor))
        });
        Ok(Box::pin(deliveries))
    }

    async fn ack(&self, tag: DeliveryTag) -> BrokerResult<()> {
        self.settle(tag)?;
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, disposition: Disposition) -> BrokerResult<()> {
        let in_flight = self.settle(tag)?;
        {
            let mut registry = self.shared.registry.lock();
            match disposition {
                Disposition::Requeue => {
                    if let Some(state) = registry.queues.get_mut(&in_flight.queue) {
                        state.ready.push_back(in_flight.message);
                    }
                }
                Disposition::DeadLetter { reason } => {
                    let declared = registry
                        .queues
                        .get(&in_flight.queue)
                        .and_then(|state| state.declaration.dead_letter.clone());
                    let dead_letter_queue = dead_letter_target(declared, &in_flight.queue);
                    let entry = DeadLetterEntry {
                        body: in_flight.message.body,
                        reason,
                        delivery_count: in_flight
                            .message
                            .last_delivery
                            .unwrap_or_else(DeliveryCount::first),
                        dead_lettered_at: Utc::now(),
                        original_queue: in_flight.queue,
                    };
                    registry
                        .dead_letters
                        .entry(dead_letter_queue)
                        .or_default()
                        .push(entry);
                }
            }
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        let released = self.shared.registry.lock().close_channel(self.id);
        if released > 0 {
            debug!(released, "closing channel returned unsettled deliveries");
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

/// A queue name too long to suffix keeps its dead letters under itself.
fn dead_letter_target(declared: Option<QueueName>, queue: &QueueName) -> QueueName {
    declared
        .or_else(|| queue.dead_letter().ok())
        .unwrap_or_else(|| queue.clone())
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        if self.shared.registry.lock().close_channel(self.id) > 0 {
            self.shared.changed.notify_waiters();
        }
    }
}

struct Cursor {
    shared: Arc<Shared>,
    channel: ChannelId,
    queue: QueueName,
    finished: bool,
}

impl Cursor {
    async fn next_delivery(&self) -> BrokerResult<Delivery> {
        loop {
            let mut changed = pin!(self.shared.changed.notified());
            changed.as_mut().enable();

            let ready = self
                .shared
                .registry
                .lock()
                .try_deliver(self.channel, &self.queue)?;
            if let Some(delivery) = ready {
                return Ok(delivery);
            }

            changed.await;
        }
    }
}
