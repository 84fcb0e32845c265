//! Delivery counters of a consumer runtime.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::ack::AckDecision;

/// Snapshot of a runtime's counters since it was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Deliveries pulled from the queue
    pub deliveries_received: u64,
    /// Deliveries acknowledged
    pub acked: u64,
    /// Deliveries returned to the queue for retry
    pub requeued: u64,
    /// Deliveries routed to the dead-letter queue
    pub dead_lettered: u64,
    /// Settlements the broker refused
    pub settle_failures: u64,
    /// Sessions established
    pub sessions: u64,
    /// Failed connection attempts
    pub reconnect_attempts: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    deliveries_received: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    settle_failures: AtomicU64,
    sessions: AtomicU64,
    reconnect_attempts: AtomicU64,
}

impl Counters {
    pub(crate) fn delivery_received(&self) {
        self.deliveries_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn settled(&self, decision: &AckDecision) {
        let counter = match decision {
            AckDecision::Ack => &self.acked,
            AckDecision::Requeue { .. } => &self.requeued,
            AckDecision::DeadLetter(_) => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn settle_failed(&self) {
        self.settle_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_established(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_failed(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RuntimeStats {
        RuntimeStats {
            deliveries_received: self.deliveries_received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}
