//! In-memory write and read stores for tests and development.
//!
//! Both stores can simulate outages: [`InMemoryWriteStore::fail_next_commits`]
//! and [`InMemoryReadStore::fail_next_applies`] make the next calls fail with
//! [`StoreError::Unavailable`], and `set_unavailable` fails every call until
//! it is reset.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use stockcmd::CorrelationId;

use crate::domain::{
    next_version, Asset, AssetId, Component, ComponentId, OrderId, ProcurementOrder, UNSAVED,
};
use crate::errors::{StoreError, StoreResult};
use crate::store::{
    CommitOutcome, LedgerEntry, Mutation, ReadModelChange, ReadModelStore, Reconciliation,
    UnitOfWork, WriteModelStore,
};
use crate::views::{AssetView, ComponentView, OrderView};

#[derive(Debug, Default)]
struct Faults {
    outage: AtomicBool,
    scheduled: AtomicUsize,
}

impl Faults {
    fn check(&self) -> StoreResult<()> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }

    fn check_scheduled(&self, operation: &str) -> StoreResult<()> {
        self.check()?;
        let consumed = self
            .scheduled
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if consumed {
            Err(StoreError::Unavailable(format!("simulated {operation} failure")))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
struct WriteState {
    assets: HashMap<AssetId, Asset>,
    components: HashMap<ComponentId, Component>,
    orders: HashMap<OrderId, ProcurementOrder>,
    ledger: HashMap<CorrelationId, LedgerEntry>,
    commit_order: Vec<CorrelationId>,
}

fn follows(
    entity: &str,
    id: impl std::fmt::Display,
    stored: u32,
    incoming: u32,
) -> StoreResult<()> {
    if incoming == next_version(stored) {
        Ok(())
    } else {
        Err(StoreError::Stale(format!(
            "{entity} {id} is at version {stored}, cannot write version {incoming}"
        )))
    }
}

impl WriteState {
    fn check(&self, mutation: &Mutation) -> StoreResult<()> {
        match mutation {
            Mutation::UpsertAsset(asset) => {
                let stored = self.assets.get(&asset.id).map_or(UNSAVED, |stored| stored.version);
                follows("asset", asset.id, stored, asset.version)
            }
            Mutation::InsertComponent(component) if self.components.contains_key(&component.id) => {
                Err(StoreError::Conflict(format!(
                    "component {} already exists",
                    component.id
                )))
            }
            Mutation::InsertComponent(component) if !self.assets.contains_key(&component.asset_id) => {
                Err(StoreError::Invalid(format!(
                    "component {} references unknown asset {}",
                    component.id, component.asset_id
                )))
            }
            Mutation::InsertComponent(component) => {
                follows("component", component.id, UNSAVED, component.version)
            }
            Mutation::UpdateComponent(component) => match self.components.get(&component.id) {
                Some(stored) => {
                    follows("component", component.id, stored.version, component.version)
                }
                None => Err(StoreError::Conflict(format!(
                    "component {} does not exist",
                    component.id
                ))),
            },
            Mutation::InsertOrder(order) if self.orders.contains_key(&order.id) => Err(
                StoreError::Conflict(format!("order {} already exists", order.id)),
            ),
            Mutation::InsertOrder(_) => Ok(()),
        }
    }

    fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::UpsertAsset(asset) => {
                self.assets.insert(asset.id, asset);
            }
            Mutation::InsertComponent(component) | Mutation::UpdateComponent(component) => {
                self.components.insert(component.id, component);
            }
            Mutation::InsertOrder(order) => {
                self.orders.insert(order.id, order);
            }
        }
    }
}

/// In-memory write store with a ledger and reconciliation outbox.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWriteStore {
    state: Arc<RwLock<WriteState>>,
    faults: Arc<Faults>,
}

impl InMemoryWriteStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail as unavailable.
    pub fn fail_next_commits(&self, count: usize) {
        self.faults.scheduled.store(count, Ordering::SeqCst);
    }

    /// Fails every operation while `unavailable` is true.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.outage.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored components.
    pub fn component_count(&self) -> usize {
        self.state.read().components.len()
    }

    /// Number of stored procurement orders.
    pub fn order_count(&self) -> usize {
        self.state.read().orders.len()
    }

    /// Number of processed commands.
    pub fn ledger_len(&self) -> usize {
        self.state.read().ledger.len()
    }
}

#[async_trait]
impl WriteModelStore for InMemoryWriteStore {
    async fn asset(&self, id: AssetId) -> StoreResult<Option<Asset>> {
        self.faults.check()?;
        Ok(self.state.read().assets.get(&id).cloned())
    }

    async fn component(&self, id: ComponentId) -> StoreResult<Option<Component>> {
        self.faults.check()?;
        Ok(self.state.read().components.get(&id).cloned())
    }

    async fn processed(&self, correlation_id: &CorrelationId) -> StoreResult<Option<LedgerEntry>> {
        self.faults.check()?;
        Ok(self.state.read().ledger.get(correlation_id).cloned())
    }

    async fn commit(&self, unit: UnitOfWork) -> StoreResult<CommitOutcome> {
        self.faults.check_scheduled("commit")?;
        let mut state = self.state.write();

        if let Some(entry) = state.ledger.get(&unit.correlation_id) {
            return Ok(CommitOutcome::AlreadyApplied(entry.clone()));
        }
        for mutation in &unit.mutations {
            state.check(mutation)?;
        }

        for mutation in unit.mutations {
            state.apply(mutation);
        }
        state.commit_order.push(unit.correlation_id.clone());
        state.ledger.insert(
            unit.correlation_id.clone(),
            LedgerEntry {
                correlation_id: unit.correlation_id,
                command_type: unit.command_type,
                reconciliation: unit.reconciliation,
                reconciled: false,
                applied_at: Utc::now(),
            },
        );
        drop(state);
        Ok(CommitOutcome::Committed)
    }

    async fn mark_reconciled(&self, correlation_id: &CorrelationId) -> StoreResult<()> {
        self.faults.check()?;
        let mut state = self.state.write();
        let entry = state.ledger.get_mut(correlation_id).ok_or_else(|| {
            StoreError::Invalid(format!("no processed command {correlation_id}"))
        })?;
        entry.reconciled = true;
        Ok(())
    }

    async fn pending_reconciliations(&self) -> StoreResult<Vec<Reconciliation>> {
        self.faults.check()?;
        let state = self.state.read();
        Ok(state
            .commit_order
            .iter()
            .filter_map(|correlation_id| state.ledger.get(correlation_id))
            .filter(|entry| !entry.reconciled)
            .map(|entry| entry.reconciliation.clone())
            .collect())
    }
}

fn newer(stored: Option<u32>, incoming: u32) -> bool {
    !matches!(stored, Some(stored) if stored >= incoming)
}

#[derive(Debug, Default)]
struct ReadState {
    assets: HashMap<AssetId, AssetView>,
    components: HashMap<ComponentId, ComponentView>,
    orders: HashMap<OrderId, OrderView>,
    applied: HashSet<CorrelationId>,
}

/// In-memory read store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReadStore {
    state: Arc<RwLock<ReadState>>,
    faults: Arc<Faults>,
}

impl InMemoryReadStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` applies fail as unavailable.
    pub fn fail_next_applies(&self, count: usize) {
        self.faults.scheduled.store(count, Ordering::SeqCst);
    }

    /// Fails every operation while `unavailable` is true.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.outage.store(unavailable, Ordering::SeqCst);
    }

    /// Number of reconciliations applied.
    pub fn applied_count(&self) -> usize {
        self.state.read().applied.len()
    }
}

#[async_trait]
impl ReadModelStore for InMemoryReadStore {
    async fn apply(&self, reconciliation: &Reconciliation) -> StoreResult<()> {
        self.faults.check_scheduled("apply")?;
        let mut state = self.state.write();
        if !state.applied.insert(reconciliation.correlation_id.clone()) {
            return Ok(());
        }

        for change in &reconciliation.changes {
            match change {
                ReadModelChange::Asset(view) => {
                    if newer(state.assets.get(&view.id).map(|row| row.version), view.version) {
                        state.assets.insert(view.id, view.clone());
                    }
                }
                ReadModelChange::Component(view) => {
                    if newer(state.components.get(&view.id).map(|row| row.version), view.version) {
                        state.components.insert(view.id, view.clone());
                    }
                }
                ReadModelChange::Order(view) => {
                    state.orders.entry(view.id).or_insert_with(|| view.clone());
                }
            }
        }
        drop(state);
        Ok(())
    }

    async fn asset(&self, id: AssetId) -> StoreResult<Option<AssetView>> {
        self.faults.check()?;
        Ok(self.state.read().assets.get(&id).cloned())
    }

    async fn components_by_asset(&self, asset_id: AssetId) -> StoreResult<Vec<ComponentView>> {
        self.faults.check()?;
        let mut components: Vec<_> = self
            .state
            .read()
            .components
            .values()
            .filter(|view| view.asset_id == asset_id)
            .cloned()
            .collect();
        components.sort_by(|a, b| a.sn.cmp(&b.sn).then(a.id.cmp(&b.id)));
        Ok(components)
    }

    async fn component(&self, id: ComponentId) -> StoreResult<Option<ComponentView>> {
        self.faults.check()?;
        Ok(self.state.read().components.get(&id).cloned())
    }

    async fn orders_by_asset(&self, asset_id: AssetId) -> StoreResult<Vec<OrderView>> {
        self.faults.check()?;
        let mut orders: Vec<_> = self
            .state
            .read()
            .orders
            .values()
            .filter(|view| view.asset_id == asset_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.date_cmd.cmp(&b.date_cmd).then(a.id.cmp(&b.id)));
        Ok(orders)
    }
}
