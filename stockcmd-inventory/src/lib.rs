//! Inventory domain for the `stockcmd` pipeline.
//!
//! Defines the commands produced by the FM1 front end and spreadsheet import,
//! the handlers that apply them to the write model, and the reconciliation
//! that keeps the query-side read model in step. Store access goes through
//! [`WriteModelStore`] and [`ReadModelStore`]; [`memory`] provides in-process
//! implementations and `stockcmd-postgres` provides durable ones.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod commands;
pub mod domain;
pub mod errors;
pub mod handlers;
pub mod import;
pub mod memory;
pub mod reconcile;
pub mod store;
pub mod views;

pub use commands::{
    AddComponent, RegisterAsset, RequestProcurement, ASSET_FAMILY, COMPONENT_FAMILY, FAMILIES,
    PROCUREMENT_FAMILY,
};
pub use domain::{
    next_version, Asset, AssetId, Component, ComponentId, OrderId, OrderStatus, ProcurementOrder,
    YesNo, UNSAVED,
};
pub use errors::{StoreError, StoreResult};
pub use handlers::{
    inventory_registry, AddComponentHandler, RegisterAssetHandler, RequestProcurementHandler,
};
pub use import::{CatalogueImport, CatalogueRow, ImportFailure, ImportReport};
pub use memory::{InMemoryReadStore, InMemoryWriteStore};
pub use reconcile::Reconciler;
pub use store::{
    CommitOutcome, LedgerEntry, Mutation, ReadModelChange, ReadModelStore, Reconciliation,
    UnitOfWork, WriteModelStore,
};
pub use views::{AssetView, ComponentStatus, ComponentView, OrderView};
