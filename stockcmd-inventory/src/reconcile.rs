//! Read-model reconciliation from the write store's outbox.

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use stockcmd::RecoveryTask;
use tracing::{debug, instrument, warn};

use crate::errors::StoreResult;
use crate::store::{ReadModelStore, Reconciliation, WriteModelStore};

/// Applies pending reconciliations to the read store and marks them done.
///
/// Registered with the consumer runtime as a [`RecoveryTask`] so that
/// reconciliations interrupted by a crash are replayed on every session start.
#[derive(Clone)]
pub struct Reconciler {
    write: Arc<dyn WriteModelStore>,
    read: Arc<dyn ReadModelStore>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler over a write and a read store.
    pub fn new(write: Arc<dyn WriteModelStore>, read: Arc<dyn ReadModelStore>) -> Self {
        Self { write, read }
    }

    /// The write store.
    pub fn write_store(&self) -> &Arc<dyn WriteModelStore> {
        &self.write
    }

    /// The read store.
    pub fn read_store(&self) -> &Arc<dyn ReadModelStore> {
        &self.read
    }

    /// Applies one reconciliation and marks it done.
    #[instrument(skip_all, fields(correlation_id = %reconciliation.correlation_id))]
    pub async fn reconcile(&self, reconciliation: &Reconciliation) -> StoreResult<()> {
        self.read.apply(reconciliation).await?;
        self.write
            .mark_reconciled(&reconciliation.correlation_id)
            .await?;
        debug!(changes = reconciliation.changes.len(), "read model reconciled");
        Ok(())
    }

    /// Replays every pending reconciliation, returning how many succeeded.
    ///
    /// Stops at the first unavailable store; later entries stay pending.
    pub async fn replay_pending(&self) -> StoreResult<usize> {
        let pending = self.write.pending_reconciliations().await?;
        let mut replayed = 0;
        for reconciliation in &pending {
            match self.reconcile(reconciliation).await {
                Ok(()) => replayed += 1,
                Err(failure) if failure.is_transient() => return Err(failure),
                Err(failure) => warn!(
                    correlation_id = %reconciliation.correlation_id,
                    error = %failure,
                    "reconciliation refused by read store"
                ),
            }
        }
        Ok(replayed)
    }
}

#[async_trait]
impl RecoveryTask for Reconciler {
    fn name(&self) -> &str {
        "read-model reconciliation"
    }

    async fn recover(&self) -> Result<usize, Box<dyn StdError + Send + Sync>> {
        Ok(self.replay_pending().await?)
    }
}
