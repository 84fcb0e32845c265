//! Shutdown signalling between a process and its consumer runtimes.

use tokio::sync::watch;

/// Creates a connected trigger/signal pair.
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownTrigger(sender), ShutdownSignal(receiver))
}

/// Requests shutdown of every runtime holding a matching [`ShutdownSignal`].
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    /// Requests shutdown. Idempotent.
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    /// Another signal observing this trigger.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal(self.0.subscribe())
    }
}

/// Observes a [`ShutdownTrigger`].
///
/// Dropping the trigger without calling [`ShutdownTrigger::trigger`] does not
/// count as a shutdown request.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Whether shutdown was requested.
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is requested.
    pub async fn triggered(&mut self) {
        if self.0.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_wakes_every_signal() {
        let (trigger, mut first) = channel();
        let mut second = trigger.subscribe();

        assert!(!first.is_triggered());
        trigger.trigger();

        first.triggered().await;
        second.triggered().await;
        assert!(second.is_triggered());
    }

    #[tokio::test]
    async fn dropped_trigger_never_fires() {
        let (trigger, mut signal) = channel();
        drop(trigger);

        let waited = tokio::time::timeout(Duration::from_millis(20), signal.triggered()).await;

        assert!(waited.is_err());
        assert!(!signal.is_triggered());
    }
}
