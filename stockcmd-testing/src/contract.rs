//! Behavioral contract every durable queue adapter must satisfy.
//!
//! Each `test_*` function exercises one guarantee documented on
//! [`stockcmd::broker`] against a broker produced by `make_broker`. Adapters
//! run the whole suite through [`broker_contract_tests!`], so new scenarios
//! are picked up by every adapter automatically.

use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use stockcmd::{
    Broker, BrokerConnection, BrokerError, Channel, DeadLetterInspector, Delivery, DeliveryStream,
    Disposition, OutboundMessage, PrefetchCount, QueueDeclaration, QueueName,
};
use uuid::Uuid;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// A contract scenario that did not hold.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn broker_error(scenario: &'static str, operation: &'static str, error: BrokerError) -> Self {
        Self::new(
            scenario,
            format!("{operation} returned unexpected error: {error}"),
        )
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Result of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

type ChannelOf<B> = <<B as Broker>::Connection as BrokerConnection>::Channel;

struct Session<B: Broker> {
    connection: B::Connection,
    channel: ChannelOf<B>,
}

impl<B: Broker> Session<B> {
    async fn open(scenario: &'static str, broker: &B) -> Result<Self, ContractTestFailure> {
        let connection = broker
            .connect()
            .await
            .map_err(|error| ContractTestFailure::broker_error(scenario, "connect", error))?;
        let channel = connection
            .open_channel()
            .await
            .map_err(|error| ContractTestFailure::broker_error(scenario, "open_channel", error))?;
        Ok(Self {
            connection,
            channel,
        })
    }

    async fn declare(
        &self,
        scenario: &'static str,
        queue: &QueueName,
    ) -> Result<(), ContractTestFailure> {
        let declare =
            |error: BrokerError| ContractTestFailure::broker_error(scenario, "declare_queue", error);
        for declaration in [
            QueueDeclaration::dead_letter_queue(queue).map_err(declare)?,
            QueueDeclaration::command_queue(queue.clone()).map_err(declare)?,
        ] {
            self.channel
                .declare_queue(&declaration)
                .await
                .map_err(declare)?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        scenario: &'static str,
        queue: &QueueName,
        body: &str,
    ) -> Result<(), ContractTestFailure> {
        self.channel
            .publish(queue, message(body))
            .await
            .map_err(|error| ContractTestFailure::broker_error(scenario, "publish", error))
    }

    async fn consume(
        &self,
        scenario: &'static str,
        queue: &QueueName,
    ) -> Result<DeliveryStream, ContractTestFailure> {
        self.channel
            .consume(queue)
            .await
            .map_err(|error| ContractTestFailure::broker_error(scenario, "consume", error))
    }

    async fn close(self, scenario: &'static str) -> Result<(), ContractTestFailure> {
        self.channel
            .close()
            .await
            .map_err(|error| ContractTestFailure::broker_error(scenario, "close channel", error))?;
        self.connection
            .close()
            .await
            .map_err(|error| ContractTestFailure::broker_error(scenario, "close connection", error))
    }
}

fn contract_queue(scenario: &'static str) -> Result<QueueName, ContractTestFailure> {
    // Unique per run so scenarios can share one database.
    let raw = format!("contract.{scenario}.{}", Uuid::now_v7().simple());
    QueueName::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::new(scenario, format!("unable to build queue name `{raw}`: {error}"))
    })
}

fn message(body: &str) -> OutboundMessage {
    OutboundMessage {
        body: body.as_bytes().to_vec(),
        correlation_id: None,
    }
}

fn body_of(delivery: &Delivery) -> String {
    String::from_utf8_lossy(&delivery.body).into_owned()
}

async fn receive(
    scenario: &'static str,
    deliveries: &mut DeliveryStream,
) -> Result<Delivery, ContractTestFailure> {
    match tokio::time::timeout(RECEIVE_TIMEOUT, deliveries.next()).await {
        Ok(Some(Ok(delivery))) => Ok(delivery),
        Ok(Some(Err(error))) => Err(ContractTestFailure::broker_error(
            scenario,
            "delivery stream",
            error,
        )),
        Ok(None) => Err(ContractTestFailure::new(
            scenario,
            "delivery stream ended unexpectedly",
        )),
        Err(_) => Err(ContractTestFailure::new(
            scenario,
            format!("no delivery within {}ms", RECEIVE_TIMEOUT.as_millis()),
        )),
    }
}

async fn expect_quiet(
    scenario: &'static str,
    deliveries: &mut DeliveryStream,
    context: &str,
) -> ContractTestResult {
    match tokio::time::timeout(QUIET_PERIOD, deliveries.next()).await {
        Err(_) => Ok(()),
        Ok(Some(Ok(delivery))) => Err(ContractTestFailure::new(
            scenario,
            format!("{context}: unexpected delivery `{}`", body_of(&delivery)),
        )),
        Ok(other) => Err(ContractTestFailure::new(
            scenario,
            format!("{context}: stream yielded {other:?}"),
        )),
    }
}

/// Messages are delivered in publish order with a first delivery count.
pub async fn test_publish_then_consume_in_order<F, B>(make_broker: F) -> ContractTestResult
where
    F: Fn() -> B + Send + Sync + Clone + 'static,
    B: Broker,
{
    const SCENARIO: &str = "publish_then_consume_in_order";

    let broker = make_broker();
    let queue = contract_queue(SCENARIO)?;
    let session = Session::open(SCENARIO, &broker).await?;
    session.declare(SCENARIO, &queue).await?;

    for body in ["first", "second", "third"] {
        session.publish(SCENARIO, &queue, body).await?;
    }

    let mut deliveries = session.consume(SCENARIO, &queue).await?;
    for expected in ["first", "second", "third"] {
        let delivery = receive(SCENARIO, &mut deliveries).await?;
        if body_of(&delivery) != expected {
            return Err(ContractTestFailure::new(
                SCENARIO,
                format!("expected `{expected}` but received `{}`", body_of(&delivery)),
            ));
        }
        if !delivery.delivery_count.is_first_attempt() || delivery.is_redelivery() {
            return Err(ContractTestFailure::new(
                SCENARIO,
                format!(
                    "first delivery of `{expected}` carried count {}",
                    delivery.delivery_count
                ),
            ));
        }
        if delivery.queue != queue {
            return Err(ContractTestFailure::new(
                SCENARIO,
                format!("delivery reports queue {} instead of {queue}", delivery.queue),
            ));
        }
        session
            .channel
            .ack(delivery.tag)
            .await
            .map_err(|error| ContractTestFailure::broker_error(SCENARIO, "ack", error))?;
    }

    expect_quiet(SCENARIO, &mut deliveries, "acknowledged messages").await?;
    drop(deliveries);
    session.close(SCENARIO).await
}

/// Settling a delivery twice is rejected.
pub async fn test_settling_twice_is_an_error<F, B>(make_broker: F) -> ContractTestResult
where
    F: Fn() -> B + Send + Sync + Clone + 'static,
    B: Broker,
{
    const SCENARIO: &str = "settling_twice_is_an_error";

    let broker = make_broker();
    let queue = contract_queue(SCENARIO)?;
    let session = Session::open(SCENARIO, &broker).await?;
    session.declare(SCENARIO, &queue).await?;
    session.publish(SCENARIO, &queue, "once").await?;

    let mut deliveries = session.consume(SCENARIO, &queue).await?;
    let delivery = receive(SCENARIO, &mut deliveries).await?;
    session
        .channel
        .ack(delivery.tag)
        .await
        .map_err(|error| ContractTestFailure::broker_error(SCENARIO, "ack", error))?;

    match session.channel.ack(delivery.tag).await {
        Err(BrokerError::UnknownDeliveryTag(tag)) if tag == delivery.tag => {}
        Err(error) => return Err(ContractTestFailure::broker_error(SCENARIO, "second ack", error)),
        Ok(()) => {
            return Err(ContractTestFailure::new(
                SCENARIO,
                "second ack of the same tag succeeded",
            ))
        }
    }

    match session
        .channel
        .nack(delivery.tag, Disposition::Requeue)
        .await
    {
        Err(BrokerError::UnknownDeliveryTag(_)) => {}
        Err(error) => return Err(ContractTestFailure::broker_error(SCENARIO, "nack after ack", error)),
        Ok(()) => {
            return Err(ContractTestFailure::new(
                SCENARIO,
                "nack after ack succeeded",
            ))
        }
    }

    drop(deliveries);
    session.close(SCENARIO).await
}

/// A requeued message comes back with an incremented delivery count.
pub async fn test_requeue_increments_delivery_count<F, B>(make_broker: F) -> ContractTestResult
where
    F: Fn() -> B + Send + Sync + Clone + 'static,
    B: Broker,
{
    const SCENARIO: &str = "requeue_increments_delivery_count";

    let broker = make_broker();
    let queue = contract_queue(SCENARIO)?;
    let session = Session::open(SCENARIO, &broker).await?;
    session.declare(SCENARIO, &queue).await?;
    session.publish(SCENARIO, &queue, "flaky").await?;

    let mut deliveries = session.consume(SCENARIO, &queue).await?;
    let mut previous = None;
    for attempt in 1..=3_u32 {
        let delivery = receive(SCENARIO, &mut deliveries).await?;
        if u32::from(delivery.delivery_count) != attempt {
            return Err(ContractTestFailure::new(
                SCENARIO,
                format!(
                    "attempt {attempt} carried delivery count {}",
                    delivery.delivery_count
                ),
            ));
        }
        if previous == Some(delivery.tag) {
            return Err(ContractTestFailure::new(
                SCENARIO,
                "redelivery reused the previous delivery tag",
            ));
        }
        previous = Some(delivery.tag);

        let settle = if attempt < 3 {
            session.channel.nack(delivery.tag, Disposition::Requeue).await
        } else {
            session.channel.ack(delivery.tag).await
        };
        settle.map_err(|error| ContractTestFailure::broker_error(SCENARIO, "settle", error))?;
    }

    expect_quiet(SCENARIO, &mut deliveries, "after final ack").await?;
    drop(deliveries);
    session.close(SCENARIO).await
}

/// Dead-lettered messages are removed from the queue and inspectable.
pub async fn test_dead_letters_are_inspectable<F, B>(make_broker: F) -> ContractTestResult
where
    F: Fn() -> B + Send + Sync + Clone + 'static,
    B: Broker + DeadLetterInspector,
{
    const SCENARIO: &str = "dead_letters_are_inspectable";

    let broker = make_broker();
    let queue = contract_queue(SCENARIO)?;
    let session = Session::open(SCENARIO, &broker).await?;
    session.declare(SCENARIO, &queue).await?;
    session.publish(SCENARIO, &queue, "poison").await?;

    let mut deliveries = session.consume(SCENARIO, &queue).await?;
    let delivery = receive(SCENARIO, &mut deliveries).await?;
    session
        .channel
        .nack(
            delivery.tag,
            Disposition::DeadLetter {
                reason: "rejected: unknown asset".to_string(),
            },
        )
        .await
        .map_err(|error| ContractTestFailure::broker_error(SCENARIO, "nack", error))?;

    expect_quiet(SCENARIO, &mut deliveries, "after dead-lettering").await?;

    let dead_letters = broker
        .dead_letters(&queue)
        .await
        .map_err(|error| ContractTestFailure::broker_error(SCENARIO, "dead_letters", error))?;
    let [entry] = dead_letters.as_slice() else {
        return Err(ContractTestFailure::new(
            SCENARIO,
            format!("expected one dead letter, found {}", dead_letters.len()),
        ));
    };
    if entry.body != b"poison" || entry.reason != "rejected: unknown asset" {
        return Err(ContractTestFailure::new(
            SCENARIO,
            format!("dead letter does not match: {entry:?}"),
        ));
    }
    if entry.original_queue != queue || !entry.delivery_count.is_first_attempt() {
        return Err(ContractTestFailure::new(
            SCENARIO,
            format!("dead letter metadata does not match: {entry:?}"),
        ));
    }

    drop(deliveries);
    session.close(SCENARIO).await
}

/// Closing a channel returns its unsettled deliveries for redelivery.
pub async fn test_closing_returns_unsettled_deliveries<F, B>(make_broker: F) -> ContractTestResult
where
    F: Fn() -> B + Send + Sync + Clone + 'static,
    B: Broker,
{
    const SCENARIO: &str = "closing_returns_unsettled_deliveries";

    let broker = make_broker();
    let queue = contract_queue(SCENARIO)?;
    let first = Session::open(SCENARIO, &broker).await?;
    first.declare(SCENARIO, &queue).await?;
    first.publish(SCENARIO, &queue, "in-flight").await?;

    let mut deliveries = first.consume(SCENARIO, &queue).await?;
    let held = receive(SCENARIO, &mut deliveries).await?;
    drop(deliveries);
    first.close(SCENARIO).await?;

    let second = Session::open(SCENARIO, &broker).await?;
    second.declare(SCENARIO, &queue).await?;
    let mut deliveries = second.consume(SCENARIO, &queue).await?;
    let again = receive(SCENARIO, &mut deliveries).await?;

    if again.body != held.body {
        return Err(ContractTestFailure::new(
            SCENARIO,
            format!("redelivered `{}` instead of `in-flight`", body_of(&again)),
        ));
    }
    if !again.is_redelivery() || again.delivery_count <= held.delivery_count {
        return Err(ContractTestFailure::new(
            SCENARIO,
            format!(
                "redelivery count {} did not increase from {}",
                again.delivery_count, held.delivery_count
            ),
        ));
    }

    second
        .channel
        .ack(again.tag)
        .await
        .map_err(|error| ContractTestFailure::broker_error(SCENARIO, "ack", error))?;
    drop(deliveries);
    second.close(SCENARIO).await
}

/// A channel never holds more unsettled deliveries than its prefetch count.
pub async fn test_prefetch_bounds_unsettled_deliveries<F, B>(make_broker: F) -> ContractTestResult
where
    F: Fn() -> B + Send + Sync + Clone + 'static,
    B: Broker,
{
    const SCENARIO: &str = "prefetch_bounds_unsettled_deliveries";

    let broker = make_broker();
    let queue = contract_queue(SCENARIO)?;
    let session = Session::open(SCENARIO, &broker).await?;
    session.declare(SCENARIO, &queue).await?;
    session
        .channel
        .set_prefetch(PrefetchCount::default())
        .await
        .map_err(|error| ContractTestFailure::broker_error(SCENARIO, "set_prefetch", error))?;
    session.publish(SCENARIO, &queue, "a").await?;
    session.publish(SCENARIO, &queue, "b").await?;

    let mut deliveries = session.consume(SCENARIO, &queue).await?;
    let first = receive(SCENARIO, &mut deliveries).await?;
    expect_quiet(SCENARIO, &mut deliveries, "prefetch of one exceeded").await?;

    session
        .channel
        .ack(first.tag)
        .await
        .map_err(|error| ContractTestFailure::broker_error(SCENARIO, "ack", error))?;
    let second = receive(SCENARIO, &mut deliveries).await?;
    if body_of(&second) != "b" {
        return Err(ContractTestFailure::new(
            SCENARIO,
            format!("expected `b` after ack, received `{}`", body_of(&second)),
        ));
    }

    session
        .channel
        .ack(second.tag)
        .await
        .map_err(|error| ContractTestFailure::broker_error(SCENARIO, "ack", error))?;
    drop(deliveries);
    session.close(SCENARIO).await
}

/// Redeclaring is idempotent; changing attributes is a conflict.
pub async fn test_declarations_are_idempotent<F, B>(make_broker: F) -> ContractTestResult
where
    F: Fn() -> B + Send + Sync + Clone + 'static,
    B: Broker,
{
    const SCENARIO: &str = "declarations_are_idempotent";

    let broker = make_broker();
    let queue = contract_queue(SCENARIO)?;
    let session = Session::open(SCENARIO, &broker).await?;
    session.declare(SCENARIO, &queue).await?;
    session.declare(SCENARIO, &queue).await?;

    let transient = QueueDeclaration {
        durable: false,
        ..QueueDeclaration::command_queue(queue.clone())
            .map_err(|error| ContractTestFailure::broker_error(SCENARIO, "declare_queue", error))?
    };
    match session.channel.declare_queue(&transient).await {
        Err(BrokerError::QueueDeclarationConflict { queue: name, .. }) if name == queue => {}
        Err(error) => {
            return Err(ContractTestFailure::broker_error(
                SCENARIO,
                "conflicting declare_queue",
                error,
            ))
        }
        Ok(()) => {
            return Err(ContractTestFailure::new(
                SCENARIO,
                "conflicting declaration was accepted",
            ))
        }
    }

    session.close(SCENARIO).await
}

/// Publishing to a queue nobody declared fails instead of dropping the message.
pub async fn test_publish_to_undeclared_queue_fails<F, B>(make_broker: F) -> ContractTestResult
where
    F: Fn() -> B + Send + Sync + Clone + 'static,
    B: Broker,
{
    const SCENARIO: &str = "publish_to_undeclared_queue_fails";

    let broker = make_broker();
    let queue = contract_queue(SCENARIO)?;
    let session = Session::open(SCENARIO, &broker).await?;

    match session.channel.publish(&queue, message("lost")).await {
        Err(BrokerError::QueueNotFound(name)) if name == queue => {}
        Err(error) => return Err(ContractTestFailure::broker_error(SCENARIO, "publish", error)),
        Ok(()) => {
            return Err(ContractTestFailure::new(
                SCENARIO,
                "publish to an undeclared queue succeeded",
            ))
        }
    }

    session.close(SCENARIO).await
}

/// Generates one `#[tokio::test]` per broker contract scenario.
///
/// ```ignore
/// stockcmd_testing::contract::broker_contract_tests! {
///     suite = in_memory,
///     make_broker = stockcmd_memory::InMemoryBroker::new,
/// }
/// ```
///
/// Extra attributes for every generated test go in `attributes = [...]`,
/// e.g. `attributes = [ignore = "requires Docker"]`.
#[macro_export]
macro_rules! broker_contract_tests {
    (
        suite = $suite:ident,
        make_broker = $make_broker:expr
        $(, attributes = [$($attr:meta),* $(,)?])?
        $(,)?
    ) => {
        mod $suite {
            use $crate::contract::{
                test_closing_returns_unsettled_deliveries, test_dead_letters_are_inspectable,
                test_declarations_are_idempotent, test_prefetch_bounds_unsettled_deliveries,
                test_publish_then_consume_in_order, test_publish_to_undeclared_queue_fails,
                test_requeue_increments_delivery_count, test_settling_twice_is_an_error,
            };

            #[tokio::test(flavor = "multi_thread")]
            $($(#[$attr])*)?
            async fn publish_then_consume_in_order_contract() {
                test_publish_then_consume_in_order($make_broker)
                    .await
                    .expect("broker contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $($(#[$attr])*)?
            async fn settling_twice_is_an_error_contract() {
                test_settling_twice_is_an_error($make_broker)
                    .await
                    .expect("broker contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $($(#[$attr])*)?
            async fn requeue_increments_delivery_count_contract() {
                test_requeue_increments_delivery_count($make_broker)
                    .await
                    .expect("broker contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $($(#[$attr])*)?
            async fn dead_letters_are_inspectable_contract() {
                test_dead_letters_are_inspectable($make_broker)
                    .await
                    .expect("broker contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $($(#[$attr])*)?
            async fn closing_returns_unsettled_deliveries_contract() {
                test_closing_returns_unsettled_deliveries($make_broker)
                    .await
                    .expect("broker contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $($(#[$attr])*)?
            async fn prefetch_bounds_unsettled_deliveries_contract() {
                test_prefetch_bounds_unsettled_deliveries($make_broker)
                    .await
                    .expect("broker contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $($(#[$attr])*)?
            async fn declarations_are_idempotent_contract() {
                test_declarations_are_idempotent($make_broker)
                    .await
                    .expect("broker contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $($(#[$attr])*)?
            async fn publish_to_undeclared_queue_fails_contract() {
                test_publish_to_undeclared_queue_fails($make_broker)
                    .await
                    .expect("broker contract failed");
            }
        }
    };
}

pub use broker_contract_tests;
