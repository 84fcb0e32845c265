//! Core types for the `stockcmd` command pipeline.
//!
//! All identifiers use smart constructors so that an invalid queue name or an
//! empty command type cannot travel through the pipeline. Deserialization goes
//! through the same validation, which is what lets a consumer classify an
//! envelope with an empty `commandType` as malformed.

use nutype::nutype;
use uuid::Uuid;

/// Identifies the handler that must execute a command.
///
/// `CommandType` values are trimmed, non-empty and at most 128 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct CommandType(String);

/// Opaque identifier used for idempotency and tracing.
///
/// Producers generate it (or let the publisher assign one) and it stays the
/// same across every redelivery of the envelope.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generates a fresh, time-ordered correlation id.
    pub fn generate() -> Self {
        Self::try_new(Uuid::now_v7().to_string())
            .expect("a UUIDv7 string is never empty and always under 255 chars")
    }
}

fn is_queue_token(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Name of a durable queue, e.g. `gestionfm1.composent.commands`.
///
/// Queue names are restricted to ASCII alphanumerics plus `.`, `-` and `_`.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255, predicate = is_queue_token),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct QueueName(String);

/// Appended to a command queue's name to name its dead-letter queue.
pub const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

impl QueueName {
    /// Name of the queue that receives this queue's dead letters.
    ///
    /// Fails when the suffixed name exceeds the 255 character limit.
    pub fn dead_letter(&self) -> Result<Self, QueueNameError> {
        Self::try_new(format!("{}{DEAD_LETTER_SUFFIX}", self.as_ref()))
    }
}

/// Per-channel delivery handle assigned by the broker.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct DeliveryTag(u64);

/// How many times an envelope has been handed to a consumer, starting at 1.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct DeliveryCount(u32);

impl DeliveryCount {
    /// The count carried by a first delivery attempt.
    pub fn first() -> Self {
        Self::try_new(1).expect("1 is always a valid delivery count")
    }

    /// Count for the next delivery of the same envelope.
    #[must_use]
    pub fn next(self) -> Self {
        let current: u32 = self.into();
        Self::try_new(current.saturating_add(1)).expect("incremented count stays >= 1")
    }

    /// Whether this is the first time the envelope is delivered.
    pub fn is_first_attempt(self) -> bool {
        u32::from(self) == 1
    }

    /// Number of redeliveries that preceded this delivery.
    pub fn redeliveries(self) -> u32 {
        u32::from(self) - 1
    }
}

/// Maximum number of unsettled deliveries a channel may hold.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1024),
    derive(Debug, Clone, Copy, PartialEq, Eq, Display, Into, Serialize, Deserialize)
)]
pub struct PrefetchCount(u16);

impl Default for PrefetchCount {
    fn default() -> Self {
        Self::try_new(1).expect("1 is a valid prefetch count")
    }
}

/// Maximum delivery attempts for a transiently failing command.
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, Display, Into, Serialize, Deserialize)
)]
pub struct MaxAttempts(u32);

impl Default for MaxAttempts {
    fn default() -> Self {
        Self::try_new(3).expect("3 is a valid attempt limit")
    }
}

/// Version of a command's payload schema.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct SchemaVersion(u16);

impl SchemaVersion {
    /// The first schema version of any command.
    pub fn initial() -> Self {
        Self::try_new(1).expect("1 is a valid schema version")
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::initial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn queue_name_accepts_dotted_tokens(s in "[a-z0-9_-]{1,40}(\\.[a-z0-9_-]{1,40}){0,3}") {
            let queue = QueueName::try_new(s.clone());
            prop_assert!(queue.is_ok());
            let queue = queue.unwrap();
            let name: &str = queue.as_ref();
            prop_assert_eq!(name, s.as_str());
        }

        #[test]
        fn delivery_count_next_is_strictly_increasing(n in 1u32..u32::MAX) {
            let count = DeliveryCount::try_new(n).unwrap();
            prop_assert!(count.next() > count);
            prop_assert_eq!(count.next().redeliveries(), n);
        }
    }

    #[test]
    fn command_type_rejects_blank_values() {
        assert!(CommandType::try_new("").is_err());
        assert!(CommandType::try_new("   ").is_err());
        assert!(CommandType::try_new("a".repeat(129)).is_err());
        assert_eq!(
            CommandType::try_new("  AddComponent ").unwrap().as_ref(),
            "AddComponent"
        );
    }

    #[test]
    fn queue_name_rejects_spaces_and_wildcards() {
        assert!(QueueName::try_new("gestionfm1 commands").is_err());
        assert!(QueueName::try_new("gestionfm1.*").is_err());
        assert!(QueueName::try_new("#").is_err());
    }

    #[test]
    fn dead_letter_queue_is_suffixed() {
        let queue = QueueName::try_new("gestionfm1.composent.commands").unwrap();
        assert_eq!(
            queue.dead_letter().unwrap().as_ref(),
            "gestionfm1.composent.commands.dead-letter"
        );
    }

    #[test]
    fn dead_letter_name_fails_when_the_suffix_does_not_fit() {
        let longest = QueueName::try_new("q".repeat(255 - DEAD_LETTER_SUFFIX.len())).unwrap();
        assert_eq!(longest.dead_letter().unwrap().as_ref().len(), 255);

        let too_long = QueueName::try_new("q".repeat(250)).unwrap();
        assert!(too_long.dead_letter().is_err());
    }

    #[test]
    fn generated_correlation_ids_are_unique() {
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
    }

    #[test]
    fn first_delivery_has_no_redeliveries() {
        let first = DeliveryCount::first();
        assert!(first.is_first_attempt());
        assert_eq!(first.redeliveries(), 0);
        assert!(!first.next().is_first_attempt());
        assert!(DeliveryCount::try_new(0).is_err());
    }

    #[test]
    fn limits_reject_out_of_range_values() {
        assert!(PrefetchCount::try_new(0).is_err());
        assert!(PrefetchCount::try_new(1025).is_err());
        assert!(MaxAttempts::try_new(0).is_err());
        assert_eq!(u32::from(MaxAttempts::default()), 3);
        assert_eq!(u16::from(PrefetchCount::default()), 1);
    }
}
