//! Acknowledgment policy.
//!
//! Maps a [`DispatchOutcome`] and the delivery count to what happens to the
//! delivery:
//!
//! | outcome | decision |
//! |---|---|
//! | applied | ack |
//! | rejected, registry miss, malformed, panicked | dead-letter |
//! | transient failure, attempts left | requeue after backoff |
//! | transient failure, attempts exhausted | dead-letter |

use std::fmt;
use std::time::Duration;

use crate::dispatch::DispatchOutcome;
use crate::handler::Outcome;
use crate::retry::RetryStrategy;
use crate::types::{CommandType, DeliveryCount, MaxAttempts};

/// Why a delivery was dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The handler rejected the command.
    Rejected(String),
    /// No handler is registered for the command type.
    RegistryMiss(CommandType),
    /// The message could not be parsed.
    Malformed(String),
    /// The handler panicked.
    Panicked(String),
    /// The handler kept failing transiently.
    RetriesExhausted {
        /// Attempts made, including the last one
        attempts: u32,
        /// Reason reported by the last attempt
        last_error: String,
    },
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::RegistryMiss(command_type) => {
                write!(f, "no handler registered for {command_type}")
            }
            Self::Malformed(detail) => write!(f, "malformed: {detail}"),
            Self::Panicked(message) => write!(f, "handler panicked: {message}"),
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} attempts: {last_error}"),
        }
    }
}

/// What to do with a delivery once it has been dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckDecision {
    /// Acknowledge; the message is removed from the queue.
    Ack,
    /// Return the message to the queue after `delay`.
    Requeue {
        /// Backoff before the message is released
        delay: Duration,
    },
    /// Route the message to the dead-letter queue.
    DeadLetter(DeadLetterReason),
}

impl AckDecision {
    /// Short label used in logs and stats.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Requeue { .. } => "requeue",
            Self::DeadLetter(_) => "dead_letter",
        }
    }
}

/// Decides ack, requeue or dead-letter for each dispatch outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct AckPolicy {
    max_attempts: MaxAttempts,
    requeue_backoff: RetryStrategy,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self::new(MaxAttempts::default(), RetryStrategy::default())
    }
}

impl AckPolicy {
    /// Creates a policy allowing `max_attempts` deliveries of a transiently
    /// failing command, waiting per `requeue_backoff` between attempts.
    pub const fn new(max_attempts: MaxAttempts, requeue_backoff: RetryStrategy) -> Self {
        Self {
            max_attempts,
            requeue_backoff,
        }
    }

    /// The configured attempt limit.
    pub const fn max_attempts(&self) -> MaxAttempts {
        self.max_attempts
    }

    /// Decides what happens to a delivery.
    pub fn decide(&self, outcome: &DispatchOutcome, delivery_count: DeliveryCount) -> AckDecision {
        match outcome {
            DispatchOutcome::Handled(Outcome::Applied) => AckDecision::Ack,
            DispatchOutcome::Handled(Outcome::Rejected(reason)) => {
                AckDecision::DeadLetter(DeadLetterReason::Rejected(reason.clone()))
            }
            DispatchOutcome::Handled(Outcome::TransientFailure(reason)) => {
                let attempts: u32 = delivery_count.into();
                if attempts < u32::from(self.max_attempts) {
                    AckDecision::Requeue {
                        delay: self.requeue_backoff.calculate_delay(attempts),
                    }
                } else {
                    AckDecision::DeadLetter(DeadLetterReason::RetriesExhausted {
                        attempts,
                        last_error: reason.clone(),
                    })
                }
            }
            DispatchOutcome::RegistryMiss(command_type) => {
                AckDecision::DeadLetter(DeadLetterReason::RegistryMiss(command_type.clone()))
            }
            DispatchOutcome::Malformed(detail) => {
                AckDecision::DeadLetter(DeadLetterReason::Malformed(detail.clone()))
            }
            DispatchOutcome::Panicked(message) => {
                AckDecision::DeadLetter(DeadLetterReason::Panicked(message.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(max_attempts: u32) -> AckPolicy {
        AckPolicy::new(
            MaxAttempts::try_new(max_attempts).unwrap(),
            RetryStrategy::immediate(max_attempts),
        )
    }

    fn count(n: u32) -> DeliveryCount {
        DeliveryCount::try_new(n).unwrap()
    }

    fn terminal_outcome() -> impl Strategy<Value = DispatchOutcome> {
        prop_oneof![
            "[a-z ]{0,20}".prop_map(|r| DispatchOutcome::Handled(Outcome::Rejected(r))),
            "[a-z ]{0,20}".prop_map(DispatchOutcome::Malformed),
            "[a-z ]{0,20}".prop_map(DispatchOutcome::Panicked),
            "[A-Z][a-zA-Z]{0,20}".prop_map(|t| {
                DispatchOutcome::RegistryMiss(CommandType::try_new(t).unwrap())
            }),
        ]
    }

    proptest! {
        #[test]
        fn applied_is_always_acked(attempt in 1u32..100, max in 1u32..10) {
            let decision = policy(max).decide(&DispatchOutcome::Handled(Outcome::Applied), count(attempt));
            prop_assert_eq!(decision, AckDecision::Ack);
        }

        #[test]
        fn terminal_outcomes_are_never_requeued(
            outcome in terminal_outcome(),
            attempt in 1u32..100,
            max in 1u32..10,
        ) {
            let decision = policy(max).decide(&outcome, count(attempt));
            prop_assert!(matches!(decision, AckDecision::DeadLetter(_)));
        }

        #[test]
        fn transient_failures_requeue_until_the_attempt_limit(attempt in 1u32..100, max in 1u32..10) {
            let outcome = DispatchOutcome::Handled(Outcome::transient("store offline"));
            let decision = policy(max).decide(&outcome, count(attempt));

            if attempt < max {
                let requeued = matches!(decision, AckDecision::Requeue { .. });
                prop_assert!(requeued, "expected a requeue, got {:?}", decision);
            } else {
                prop_assert_eq!(
                    decision,
                    AckDecision::DeadLetter(DeadLetterReason::RetriesExhausted {
                        attempts: attempt,
                        last_error: "store offline".to_string(),
                    })
                );
            }
        }
    }

    #[test]
    fn default_policy_allows_three_attempts() {
        let policy = AckPolicy::default();
        let outcome = DispatchOutcome::Handled(Outcome::transient("timeout"));

        assert!(matches!(policy.decide(&outcome, count(1)), AckDecision::Requeue { .. }));
        assert!(matches!(policy.decide(&outcome, count(2)), AckDecision::Requeue { .. }));
        assert!(matches!(policy.decide(&outcome, count(3)), AckDecision::DeadLetter(_)));
    }

    #[test]
    fn malformed_messages_are_dead_lettered_on_first_delivery() {
        let decision = AckPolicy::default().decide(
            &DispatchOutcome::Malformed("expected value at line 1".to_string()),
            DeliveryCount::first(),
        );

        assert_eq!(
            decision,
            AckDecision::DeadLetter(DeadLetterReason::Malformed(
                "expected value at line 1".to_string()
            ))
        );
    }

    #[test]
    fn requeue_delay_grows_with_the_delivery_count() {
        let backoff = RetryStrategy {
            use_jitter: false,
            max_attempts: 5,
            ..RetryStrategy::default()
        };
        let policy = AckPolicy::new(MaxAttempts::try_new(5).unwrap(), backoff);
        let outcome = DispatchOutcome::Handled(Outcome::transient("busy"));

        assert_eq!(
            policy.decide(&outcome, count(1)),
            AckDecision::Requeue { delay: Duration::from_millis(100) }
        );
        assert_eq!(
            policy.decide(&outcome, count(2)),
            AckDecision::Requeue { delay: Duration::from_millis(200) }
        );
    }

    #[test]
    fn reasons_render_for_dead_letter_records() {
        let reason = DeadLetterReason::RetriesExhausted {
            attempts: 3,
            last_error: "write store unavailable".to_string(),
        };
        assert_eq!(
            reason.to_string(),
            "gave up after 3 attempts: write store unavailable"
        );
        assert_eq!(AckDecision::DeadLetter(reason).label(), "dead_letter");
    }
}
