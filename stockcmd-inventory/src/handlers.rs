//! Command handlers for the inventory domain.
//!
//! Every handler follows the same steps:
//!
//! 1. If the correlation id is already in the write store's ledger, finish a
//!    possibly interrupted reconciliation and report `Applied` without
//!    touching the write model again.
//! 2. Load the state the command depends on and either reject the command or
//!    plan a [`UnitOfWork`].
//! 3. Commit the unit atomically, then reconcile the read model from it.
//!
//! Store unavailability at any step is a transient failure; the redelivery
//! resumes at step 1. So is a stale write, when another command changed an
//! entity between step 2 and step 3: the redelivery plans again from the
//! newer state.

use std::future::Future;

use async_trait::async_trait;
use stockcmd::{
    Command, CommandHandler, HandlerContext, HandlerRegistry, Outcome, RegistryError,
};
use tracing::{debug, info};

use crate::commands::{AddComponent, RegisterAsset, RequestProcurement};
use crate::domain::{
    next_version, Asset, Component, ComponentId, OrderId, OrderStatus, ProcurementOrder, UNSAVED,
};
use crate::errors::{StoreError, StoreResult};
use crate::reconcile::Reconciler;
use crate::store::{CommitOutcome, Mutation, ReadModelChange, Reconciliation, UnitOfWork};
use crate::views::{AssetView, ComponentView, OrderView};

enum Plan {
    Commit(UnitOfWork),
    Reject(String),
}

impl Plan {
    fn commit(
        context: &HandlerContext,
        mutations: Vec<Mutation>,
        changes: Vec<ReadModelChange>,
    ) -> Self {
        Self::Commit(UnitOfWork {
            correlation_id: context.correlation_id().clone(),
            command_type: context.command_type().clone(),
            mutations,
            reconciliation: Reconciliation {
                correlation_id: context.correlation_id().clone(),
                changes,
            },
        })
    }
}

async fn execute(
    reconciler: &Reconciler,
    context: &HandlerContext,
    plan: impl Future<Output = StoreResult<Plan>> + Send,
) -> Outcome {
    match try_execute(reconciler, context, plan).await {
        Ok(outcome) => outcome,
        Err(failure) => failure.into_outcome(),
    }
}

async fn try_execute(
    reconciler: &Reconciler,
    context: &HandlerContext,
    plan: impl Future<Output = StoreResult<Plan>> + Send,
) -> StoreResult<Outcome> {
    let write = reconciler.write_store();

    if let Some(entry) = write.processed(context.correlation_id()).await? {
        debug!(reconciled = entry.reconciled, "command already applied");
        if !entry.reconciled {
            reconciler.reconcile(&entry.reconciliation).await?;
        }
        return Ok(Outcome::Applied);
    }

    let unit = match plan.await? {
        Plan::Commit(unit) => unit,
        Plan::Reject(reason) => return Ok(Outcome::Rejected(reason)),
    };

    let reconciliation = unit.reconciliation.clone();
    match write.commit(unit).await? {
        CommitOutcome::Committed => reconciler.reconcile(&reconciliation).await?,
        CommitOutcome::AlreadyApplied(entry) => {
            debug!("command committed concurrently by another delivery");
            if !entry.reconciled {
                reconciler.reconcile(&entry.reconciliation).await?;
            }
        }
    }

    info!(command_type = %context.command_type(), "command applied");
    Ok(Outcome::Applied)
}

/// Handles [`AddComponent`].
#[derive(Debug, Clone)]
pub struct AddComponentHandler {
    reconciler: Reconciler,
}

impl AddComponentHandler {
    /// Creates the handler.
    pub const fn new(reconciler: Reconciler) -> Self {
        Self { reconciler }
    }

    async fn plan(&self, command: AddComponent, context: &HandlerContext) -> StoreResult<Plan> {
        if let Err(reason) = command.validate() {
            return Ok(Plan::Reject(reason));
        }
        let write = self.reconciler.write_store();
        if write.asset(command.asset_id).await?.is_none() {
            return Ok(Plan::Reject(format!("unknown asset {}", command.asset_id)));
        }

        let component = Component {
            id: ComponentId::for_command(context.correlation_id()),
            asset_id: command.asset_id,
            product_name: command.product_name.trim().to_string(),
            serial_number: command.sn.trim().to_string(),
            total_available: command.total_available,
            urgent: command.urgent_or_not.into(),
            on_order: command.order_or_not.into(),
            version: next_version(UNSAVED),
        };
        let view = ComponentView::from(&component);

        Ok(Plan::commit(
            context,
            vec![Mutation::InsertComponent(component)],
            vec![ReadModelChange::Component(view)],
        ))
    }
}

#[async_trait]
impl CommandHandler for AddComponentHandler {
    type Command = AddComponent;

    async fn handle(&self, command: AddComponent, context: &HandlerContext) -> Outcome {
        execute(&self.reconciler, context, self.plan(command, context)).await
    }
}

/// Handles [`RequestProcurement`].
#[derive(Debug, Clone)]
pub struct RequestProcurementHandler {
    reconciler: Reconciler,
}

impl RequestProcurementHandler {
    /// Creates the handler.
    pub const fn new(reconciler: Reconciler) -> Self {
        Self { reconciler }
    }

    async fn plan(
        &self,
        command: RequestProcurement,
        context: &HandlerContext,
    ) -> StoreResult<Plan> {
        if let Err(reason) = command.validate() {
            return Ok(Plan::Reject(reason));
        }
        let write = self.reconciler.write_store();
        let Some(mut component) = write.component(command.component_id).await? else {
            return Ok(Plan::Reject(format!(
                "unknown component {}",
                command.component_id
            )));
        };
        if component.asset_id != command.asset_id {
            return Ok(Plan::Reject(format!(
                "component {} belongs to asset {}, not {}",
                component.id, component.asset_id, command.asset_id
            )));
        }

        let order = ProcurementOrder {
            id: OrderId::for_command(context.correlation_id()),
            component_id: component.id,
            asset_id: component.asset_id,
            expert_id: command.expert_id.trim().to_string(),
            reason: command.reason.trim().to_string(),
            status: OrderStatus::Pending,
            requested_at: command.requested_at,
        };
        component.on_order = true;
        component.version = next_version(component.version);
        let changes = vec![
            ReadModelChange::Order(OrderView::from(&order)),
            ReadModelChange::Component(ComponentView::from(&component)),
        ];

        Ok(Plan::commit(
            context,
            vec![
                Mutation::InsertOrder(order),
                Mutation::UpdateComponent(component),
            ],
            changes,
        ))
    }
}

#[async_trait]
impl CommandHandler for RequestProcurementHandler {
    type Command = RequestProcurement;

    async fn handle(&self, command: RequestProcurement, context: &HandlerContext) -> Outcome {
        execute(&self.reconciler, context, self.plan(command, context)).await
    }
}

/// Handles [`RegisterAsset`].
#[derive(Debug, Clone)]
pub struct RegisterAssetHandler {
    reconciler: Reconciler,
}

impl RegisterAssetHandler {
    /// Creates the handler.
    pub const fn new(reconciler: Reconciler) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl CommandHandler for RegisterAssetHandler {
    type Command = RegisterAsset;

    async fn handle(&self, command: RegisterAsset, context: &HandlerContext) -> Outcome {
        let plan = async {
            if let Err(reason) = command.validate() {
                return Ok::<_, StoreError>(Plan::Reject(reason));
            }
            let current = self
                .reconciler
                .write_store()
                .asset(command.asset_id)
                .await?
                .map_or(UNSAVED, |asset| asset.version);
            let asset = Asset {
                id: command.asset_id,
                site_code: command.site_code.trim().to_string(),
                device_type: command.device_type.trim().to_string(),
                ps_serial: command.ps_serial.trim().to_string(),
                version: next_version(current),
            };
            let view = AssetView::from(&asset);
            Ok(Plan::commit(
                context,
                vec![Mutation::UpsertAsset(asset)],
                vec![ReadModelChange::Asset(view)],
            ))
        };
        execute(&self.reconciler, context, plan).await
    }
}

/// A registry with every inventory handler.
pub fn inventory_registry(reconciler: &Reconciler) -> Result<HandlerRegistry, RegistryError> {
    HandlerRegistry::new()
        .register(AddComponentHandler::new(reconciler.clone()))?
        .register(RequestProcurementHandler::new(reconciler.clone()))?
        .register(RegisterAssetHandler::new(reconciler.clone()))
}
