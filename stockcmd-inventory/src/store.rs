//! Write-model and read-model store contracts.
//!
//! The write store is the source of truth. Every applied command is committed
//! as one [`UnitOfWork`]: the entity mutations, a ledger entry keyed by the
//! command's correlation id, and the pending [`Reconciliation`] the read
//! model needs. Because the three are committed atomically, a crash after the
//! commit loses nothing: the pending reconciliation is still in the write
//! store's outbox and is replayed on redelivery or at startup.
//!
//! The read store only ever changes by applying reconciliations, and applying
//! the same reconciliation twice has no observable effect. Reconciliations may
//! arrive out of commit order when one is retried after a later command was
//! reconciled, so a row is only replaced by a higher version of itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stockcmd::{CommandType, CorrelationId};

use crate::domain::{Asset, AssetId, Component, ComponentId, ProcurementOrder};
use crate::errors::StoreResult;
use crate::views::{AssetView, ComponentView, OrderView};

/// One entity change inside a [`UnitOfWork`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Insert an asset at version 1, or overwrite the version just below
    UpsertAsset(Asset),
    /// Insert a new component at version 1
    InsertComponent(Component),
    /// Overwrite the version of a component just below this one
    UpdateComponent(Component),
    /// Insert a new procurement order
    InsertOrder(ProcurementOrder),
}

/// A read-model row to upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "view", content = "row", rename_all = "camelCase")]
pub enum ReadModelChange {
    /// Asset row
    Asset(AssetView),
    /// Component row
    Component(ComponentView),
    /// Order row
    Order(OrderView),
}

/// The read-model updates implied by one applied command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    /// Correlation id of the command; the idempotency key on the read side
    pub correlation_id: CorrelationId,
    /// Rows to upsert, in order
    pub changes: Vec<ReadModelChange>,
}

/// Everything a handler commits for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOfWork {
    /// Correlation id of the command
    pub correlation_id: CorrelationId,
    /// Type of the command
    pub command_type: CommandType,
    /// Entity changes
    pub mutations: Vec<Mutation>,
    /// Read-model updates to apply once committed
    pub reconciliation: Reconciliation,
}

/// A processed command as recorded in the write store's ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Correlation id of the command
    pub correlation_id: CorrelationId,
    /// Type of the command
    pub command_type: CommandType,
    /// Read-model updates recorded with the commit
    pub reconciliation: Reconciliation,
    /// Whether the read store accepted the reconciliation
    pub reconciled: bool,
    /// When the command was committed
    pub applied_at: DateTime<Utc>,
}

/// Result of [`WriteModelStore::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The unit of work was committed.
    Committed,
    /// A command with the same correlation id was committed before; nothing
    /// was written.
    AlreadyApplied(LedgerEntry),
}

/// Source of truth for inventory entities.
#[async_trait]
pub trait WriteModelStore: Send + Sync {
    /// Loads an asset.
    async fn asset(&self, id: AssetId) -> StoreResult<Option<Asset>>;

    /// Loads a component.
    async fn component(&self, id: ComponentId) -> StoreResult<Option<Component>>;

    /// Looks up the ledger entry of a processed command.
    async fn processed(&self, correlation_id: &CorrelationId) -> StoreResult<Option<LedgerEntry>>;

    /// Atomically applies the mutations and records the ledger entry with
    /// its pending reconciliation. Returns
    /// [`CommitOutcome::AlreadyApplied`] without writing anything when the
    /// correlation id is already in the ledger, and
    /// [`StoreError::Stale`](crate::errors::StoreError::Stale) when a
    /// mutated entity is no longer at the version it was loaded at.
    async fn commit(&self, unit: UnitOfWork) -> StoreResult<CommitOutcome>;

    /// Marks the reconciliation of `correlation_id` as done.
    async fn mark_reconciled(&self, correlation_id: &CorrelationId) -> StoreResult<()>;

    /// Reconciliations committed but not yet marked done, oldest first.
    async fn pending_reconciliations(&self) -> StoreResult<Vec<Reconciliation>>;
}

/// Query-side store maintained from reconciliations.
#[async_trait]
pub trait ReadModelStore: Send + Sync {
    /// Upserts the reconciliation's rows. Idempotent per correlation id; a
    /// row older than the stored one is skipped.
    async fn apply(&self, reconciliation: &Reconciliation) -> StoreResult<()>;

    /// Looks up an asset.
    async fn asset(&self, id: AssetId) -> StoreResult<Option<AssetView>>;

    /// Components attached to an asset, ordered by serial number.
    async fn components_by_asset(&self, asset_id: AssetId) -> StoreResult<Vec<ComponentView>>;

    /// Looks up a component.
    async fn component(&self, id: ComponentId) -> StoreResult<Option<ComponentView>>;

    /// Orders raised for an asset's components, oldest first.
    async fn orders_by_asset(&self, asset_id: AssetId) -> StoreResult<Vec<OrderView>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn reconciliations_are_tagged_by_view() {
        let reconciliation = Reconciliation {
            correlation_id: CorrelationId::try_new("c-9").unwrap(),
            changes: vec![ReadModelChange::Asset(AssetView {
                id: AssetId::new(Uuid::nil()),
                site_code: "TUN-042".to_string(),
                type_device: "FM1".to_string(),
                sn_ps: "PS-778".to_string(),
                version: 1,
            })],
        };

        let text = serde_json::to_string(&reconciliation).unwrap();
        let back: Reconciliation = serde_json::from_str(&text).unwrap();

        assert!(text.contains(r#""view":"asset""#));
        assert_eq!(back, reconciliation);
    }
}
