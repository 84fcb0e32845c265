//! Durable command queue stored in PostgreSQL.
//!
//! Queues, messages and dead letters are rows. A consumer claims the oldest
//! unleased message with `FOR UPDATE SKIP LOCKED` and holds a lease on it
//! until it is settled. Each claim increments the message's delivery count.
//!
//! Leases are renewed while the channel polls. Closing a channel releases its
//! leases at once; a channel that disappears without closing (process crash,
//! dropped connection) loses its deliveries when their leases expire, after
//! which they are claimed again by any consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use sqlx::{query, PgPool, Row};
use stockcmd::{
    Broker, BrokerConnection, BrokerError, BrokerOperation, BrokerResult, Channel,
    DeadLetterEntry, DeadLetterInspector, Delivery, DeliveryCount, DeliveryStream, DeliveryTag,
    Disposition, OutboundMessage, PrefetchCount, QueueDeclaration, QueueName,
};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{migrate, PostgresConfig};
use crate::errors::{map_broker_error, PostgresError};

/// PostgreSQL queue adapter.
#[derive(Debug, Clone)]
pub struct PostgresBroker {
    pool: PgPool,
    config: Arc<PostgresConfig>,
}

impl PostgresBroker {
    /// Opens a connection pool for `config`.
    pub async fn open(config: PostgresConfig) -> Result<Self, PostgresError> {
        let pool = config.connect().await?;
        Ok(Self::from_pool(pool, config))
    }

    /// Uses an existing pool.
    pub fn from_pool(pool: PgPool, config: PostgresConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }

    /// Applies the schema migrations.
    pub async fn migrate(&self) -> Result<(), PostgresError> {
        migrate(&self.pool).await
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Number of messages in `queue`, leased or not.
    pub async fn message_count(&self, queue: &QueueName) -> BrokerResult<i64> {
        query("SELECT COUNT(*) FROM stockcmd_messages WHERE queue = $1")
            .bind(queue.as_ref())
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get(0))
            .map_err(|error| map_broker_error(error, BrokerOperation::Consume))
    }
}

#[async_trait]
impl Broker for PostgresBroker {
    type Connection = PostgresConnection;

    async fn connect(&self) -> BrokerResult<PostgresConnection> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| BrokerError::ConnectionRefused(error.to_string()))?;
        Ok(PostgresConnection {
            pool: self.pool.clone(),
            config: Arc::clone(&self.config),
            open: AtomicBool::new(true),
            channels: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DeadLetterInspector for PostgresBroker {
    async fn dead_letters(&self, queue: &QueueName) -> BrokerResult<Vec<DeadLetterEntry>> {
        let rows = query(
            "SELECT body, reason, delivery_count, dead_lettered_at
             FROM stockcmd_dead_letters
             WHERE original_queue = $1
             ORDER BY id",
        )
        .bind(queue.as_ref())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_broker_error(error, BrokerOperation::InspectDeadLetters))?;

        rows.into_iter()
            .map(|row| -> Result<DeadLetterEntry, sqlx::Error> {
                let count: i32 = row.try_get("delivery_count")?;
                let dead_lettered_at: DateTime<Utc> = row.try_get("dead_lettered_at")?;
                Ok(DeadLetterEntry {
                    body: row.try_get("body")?,
                    reason: row.try_get("reason")?,
                    delivery_count: delivery_count(count),
                    dead_lettered_at,
                    original_queue: queue.clone(),
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(|error| map_broker_error(error, BrokerOperation::InspectDeadLetters))
    }
}

fn delivery_count(raw: i32) -> DeliveryCount {
    u32::try_from(raw)
        .ok()
        .and_then(|count| DeliveryCount::try_new(count).ok())
        .unwrap_or_else(DeliveryCount::first)
}

/// A logical connection sharing the broker's pool.
#[derive(Debug)]
pub struct PostgresConnection {
    pool: PgPool,
    config: Arc<PostgresConfig>,
    open: AtomicBool,
    channels: Mutex<Vec<Arc<ChannelState>>>,
}

#[async_trait]
impl BrokerConnection for PostgresConnection {
    type Channel = PostgresChannel;

    async fn open_channel(&self) -> BrokerResult<PostgresChannel> {
        if !self.is_open() {
            return Err(BrokerError::ConnectionLost("connection closed".to_string()));
        }
        let state = Arc::new(ChannelState {
            id: Uuid::now_v7(),
            pool: self.pool.clone(),
            config: Arc::clone(&self.config),
            closed: AtomicBool::new(false),
            prefetch: AtomicU16::new(0),
            next_tag: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            last_renewal: Mutex::new(Instant::now()),
        });
        self.channels.lock().push(Arc::clone(&state));
        debug!(channel = %state.id, "channel opened");
        Ok(PostgresChannel { state })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.pool.is_closed()
    }

    async fn close(&self) -> BrokerResult<()> {
        self.open.store(false, Ordering::SeqCst);
        let channels = std::mem::take(&mut *self.channels.lock());
        let mut first_failure = None;
        for channel in channels {
            if let Err(failure) = channel.release().await {
                first_failure.get_or_insert(failure);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    message_id: i64,
    queue: QueueName,
}

#[derive(Debug)]
struct ChannelState {
    id: Uuid,
    pool: PgPool,
    config: Arc<PostgresConfig>,
    closed: AtomicBool,
    // 0 means unbounded
    prefetch: AtomicU16,
    next_tag: AtomicU64,
    in_flight: Mutex<HashMap<DeliveryTag, InFlight>>,
    wake: Notify,
    last_renewal: Mutex<Instant>,
}

impl ChannelState {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    fn has_capacity(&self) -> bool {
        let prefetch = usize::from(self.prefetch.load(Ordering::SeqCst));
        prefetch == 0 || self.in_flight.lock().len() < prefetch
    }

    fn lease_secs(&self) -> f64 {
        self.config.lease_duration.as_secs_f64()
    }

    async fn claim(&self, queue: &QueueName) -> BrokerResult<Option<Delivery>> {
        let row = query(
            "UPDATE stockcmd_messages
             SET channel_id = $2,
                 lease_expires_at = now() + make_interval(secs => $3),
                 delivery_count = delivery_count + 1
             WHERE id = (
                 SELECT id FROM stockcmd_messages
                 WHERE queue = $1 AND (channel_id IS NULL OR lease_expires_at < now())
                 ORDER BY position
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, body, delivery_count",
        )
        .bind(queue.as_ref())
        .bind(self.id)
        .bind(self.lease_secs())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_broker_error(error, BrokerOperation::Consume))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let claimed = (|| -> Result<_, sqlx::Error> {
            Ok((
                row.try_get::<i64, _>("id")?,
                row.try_get::<Vec<u8>, _>("body")?,
                row.try_get::<i32, _>("delivery_count")?,
            ))
        })();
        let (message_id, body, count) =
            claimed.map_err(|error| map_broker_error(error, BrokerOperation::Consume))?;

        if self.closed.load(Ordering::SeqCst) {
            self.release_message(message_id).await?;
            return Ok(None);
        }

        let tag = DeliveryTag::new(self.next_tag.fetch_add(1, Ordering::SeqCst) + 1);
        self.in_flight.lock().insert(
            tag,
            InFlight {
                message_id,
                queue: queue.clone(),
            },
        );
        Ok(Some(Delivery {
            tag,
            body,
            delivery_count: delivery_count(count),
            queue: queue.clone(),
        }))
    }

    async fn renew_leases(&self) -> BrokerResult<()> {
        if self.in_flight.lock().is_empty() {
            return Ok(());
        }
        {
            let mut last = self.last_renewal.lock();
            if last.elapsed() < self.config.lease_duration / 3 {
                return Ok(());
            }
            *last = Instant::now();
        }
        query(
            "UPDATE stockcmd_messages
             SET lease_expires_at = now() + make_interval(secs => $2)
             WHERE channel_id = $1",
        )
        .bind(self.id)
        .bind(self.lease_secs())
        .execute(&self.pool)
        .await
        .map_err(|error| map_broker_error(error, BrokerOperation::Consume))?;
        Ok(())
    }

    fn take(&self, tag: DeliveryTag) -> BrokerResult<InFlight> {
        self.ensure_open()?;
        self.in_flight
            .lock()
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))
    }

    fn restore(&self, tag: DeliveryTag, in_flight: InFlight) {
        self.in_flight.lock().insert(tag, in_flight);
    }

    async fn release_message(&self, message_id: i64) -> BrokerResult<()> {
        query(
            "UPDATE stockcmd_messages
             SET channel_id = NULL, lease_expires_at = NULL
             WHERE id = $1 AND channel_id = $2",
        )
        .bind(message_id)
        .bind(self.id)
        .execute(&self.pool)
        .await
        .map_err(|error| map_broker_error(error, BrokerOperation::Close))?;
        Ok(())
    }

    async fn release(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.wake.notify_waiters();
        let returned = self.in_flight.lock().drain().count();
        query(
            "UPDATE stockcmd_messages
             SET channel_id = NULL, lease_expires_at = NULL
             WHERE channel_id = $1",
        )
        .bind(self.id)
        .execute(&self.pool)
        .await
        .map_err(|error| map_broker_error(error, BrokerOperation::Close))?;
        debug!(channel = %self.id, returned, "channel closed");
        Ok(())
    }
}

/// A channel on a [`PostgresConnection`].
#[derive(Debug)]
pub struct PostgresChannel {
    state: Arc<ChannelState>,
}

#[async_trait]
impl Channel for PostgresChannel {
    #[instrument(name = "postgres.declare_queue", skip_all, fields(queue = %declaration.name))]
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> BrokerResult<()> {
        self.state.ensure_open()?;
        let pool = &self.state.pool;
        let failed = |error: sqlx::Error| map_broker_error(error, BrokerOperation::DeclareQueue);

        query(
            "INSERT INTO stockcmd_queues (name, durable, exclusive, auto_delete, dead_letter)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(declaration.name.as_ref())
        .bind(declaration.durable)
        .bind(declaration.exclusive)
        .bind(declaration.auto_delete)
        .bind(declaration.dead_letter.as_ref().map(AsRef::<str>::as_ref))
        .execute(pool)
        .await
        .map_err(failed)?;

        let row = query(
            "SELECT durable, exclusive, auto_delete, dead_letter
             FROM stockcmd_queues WHERE name = $1",
        )
        .bind(declaration.name.as_ref())
        .fetch_one(pool)
        .await
        .map_err(failed)?;

        let dead_letter: Option<String> = row.try_get("dead_letter").map_err(failed)?;
        let existing = QueueDeclaration {
            name: declaration.name.clone(),
            durable: row.try_get("durable").map_err(failed)?,
            exclusive: row.try_get("exclusive").map_err(failed)?,
            auto_delete: row.try_get("auto_delete").map_err(failed)?,
            dead_letter: dead_letter
                .map(QueueName::try_new)
                .transpose()
                .map_err(|error| BrokerError::Operation {
                    operation: BrokerOperation::DeclareQueue,
                    detail: error.to_string(),
                })?,
        };

        match existing.conflict_with(declaration) {
            Some(detail) => Err(BrokerError::QueueDeclarationConflict {
                queue: declaration.name.clone(),
                detail,
            }),
            None => Ok(()),
        }
    }

    #[instrument(name = "postgres.publish", skip_all, fields(queue = %queue))]
    async fn publish(&self, queue: &QueueName, message: OutboundMessage) -> BrokerResult<()> {
        self.state.ensure_open()?;
        let inserted = query(
            "INSERT INTO stockcmd_messages (queue, body, correlation_id)
             SELECT $1, $2, $3
             WHERE EXISTS (SELECT 1 FROM stockcmd_queues WHERE name = $1)",
        )
        .bind(queue.as_ref())
        .bind(message.body)
        .bind(message.correlation_id.as_ref().map(AsRef::<str>::as_ref))
        .execute(&self.state.pool)
        .await
        .map_err(|error| map_broker_error(error, BrokerOperation::Publish))?;

        if inserted.rows_affected() == 0 {
            return Err(BrokerError::QueueNotFound(queue.clone()));
        }
        Ok(())
    }

    async fn set_prefetch(&self, prefetch: PrefetchCount) -> BrokerResult<()> {
        self.state.ensure_open()?;
        self.state.prefetch.store(prefetch.into(), Ordering::SeqCst);
        self.state.wake.notify_waiters();
        Ok(())
    }

    #[instrument(name = "postgres.consume", skip_all, fields(queue = %queue, channel = %self.state.id))]
    async fn consume(&self, queue: &QueueName) -> BrokerResult<DeliveryStream> {
        self.state.ensure_open()?;
        let exists = query("SELECT 1 FROM stockcmd_queues WHERE name = $1")
            .bind(queue.as_ref())
            .fetch_optional(&self.state.pool)
            .await
            .map_err(|error| map_broker_error(error, BrokerOperation::Consume))?;
        if exists.is_none() {
            return Err(BrokerError::QueueNotFound(queue.clone()));
        }

        info!("consumer started");
        let cursor = Cursor {
            state: Arc::clone(&self.state),
            queue: queue.clone(),
            failed: false,
        };
        Ok(stream::unfold(cursor, |mut cursor| async move {
            if cursor.failed {
                return None;
            }
            let next = cursor.next_delivery().await?;
            cursor.failed = next.is_err();
            Some((next, cursor))
        })
        .boxed())
    }

    async fn ack(&self, tag: DeliveryTag) -> BrokerResult<()> {
        let in_flight = self.state.take(tag)?;
        let deleted = query("DELETE FROM stockcmd_messages WHERE id = $1 AND channel_id = $2")
            .bind(in_flight.message_id)
            .bind(self.state.id)
            .execute(&self.state.pool)
            .await;
        self.settled(tag, in_flight, deleted, BrokerOperation::Ack)
    }

    async fn nack(&self, tag: DeliveryTag, disposition: Disposition) -> BrokerResult<()> {
        let in_flight = self.state.take(tag)?;
        let fallback_dead_letter = in_flight.queue.dead_letter().ok();
        let result = match &disposition {
            Disposition::Requeue => {
                query(
                    "UPDATE stockcmd_messages
                     SET channel_id = NULL,
                         lease_expires_at = NULL,
                         position = nextval('stockcmd_message_position')
                     WHERE id = $1 AND channel_id = $2",
                )
                .bind(in_flight.message_id)
                .bind(self.state.id)
                .execute(&self.state.pool)
                .await
            }
            Disposition::DeadLetter { reason } => {
                query(
                    "WITH settled AS (
                         DELETE FROM stockcmd_messages
                         WHERE id = $1 AND channel_id = $2
                         RETURNING queue, body, delivery_count
                     )
                     INSERT INTO stockcmd_dead_letters
                         (queue, original_queue, body, reason, delivery_count)
                     SELECT COALESCE(q.dead_letter, $4), settled.queue, settled.body, $3,
                            settled.delivery_count
                     FROM settled LEFT JOIN stockcmd_queues q ON q.name = settled.queue",
                )
                .bind(in_flight.message_id)
                .bind(self.state.id)
                .bind(reason.as_str())
                .bind(fallback_dead_letter.as_ref().map(AsRef::<str>::as_ref))
                .execute(&self.state.pool)
                .await
            }
        };
        self.settled(tag, in_flight, result, BrokerOperation::Nack)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.state.release().await
    }
}

impl PostgresChannel {
    fn settled(
        &self,
        tag: DeliveryTag,
        in_flight: InFlight,
        result: Result<sqlx::postgres::PgQueryResult, sqlx::Error>,
        operation: BrokerOperation,
    ) -> BrokerResult<()> {
        let done = match result {
            Ok(done) => done,
            Err(error) => {
                self.state.restore(tag, in_flight);
                return Err(map_broker_error(error, operation));
            }
        };
        self.state.wake.notify_waiters();
        if done.rows_affected() == 0 {
            warn!(tag = %tag, message_id = in_flight.message_id, "lease expired before settlement");
            return Err(BrokerError::Operation {
                operation,
                detail: format!(
                    "lease on message {} expired before it was settled",
                    in_flight.message_id
                ),
            });
        }
        Ok(())
    }
}

struct Cursor {
    state: Arc<ChannelState>,
    queue: QueueName,
    failed: bool,
}

impl Cursor {
    async fn next_delivery(&self) -> Option<BrokerResult<Delivery>> {
        loop {
            if self.state.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Err(failure) = self.state.renew_leases().await {
                return Some(Err(failure));
            }
            if self.state.has_capacity() {
                match self.state.claim(&self.queue).await {
                    Ok(Some(delivery)) => return Some(Ok(delivery)),
                    Ok(None) => {}
                    Err(failure) => return Some(Err(failure)),
                }
            }

            let woken = self.state.wake.notified();
            tokio::select! {
                () = tokio::time::sleep(self.state.config.poll_interval) => {}
                () = woken => {}
            }
        }
    }
}
