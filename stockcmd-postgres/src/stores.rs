//! PostgreSQL write and read stores for the inventory domain.
//!
//! The write store commits a unit of work in one transaction: the ledger row
//! (carrying the pending reconciliation as JSONB) is inserted first, so a
//! concurrent delivery of the same command loses on the primary key and sees
//! [`CommitOutcome::AlreadyApplied`]. Entity writes are conditional on the
//! stored version, and read rows are only replaced by higher versions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{query, PgPool, Postgres, Row, Transaction};
use stockcmd::{CommandType, CorrelationId};
use stockcmd_inventory::{
    Asset, AssetId, AssetView, CommitOutcome, Component, ComponentId, ComponentView,
    LedgerEntry, Mutation, OrderView, ReadModelChange, ReadModelStore, Reconciliation,
    StoreError, StoreResult, UnitOfWork, WriteModelStore,
};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::errors::map_store_error;

fn invalid(detail: impl ToString) -> StoreError {
    StoreError::Invalid(detail.to_string())
}

fn to_i32(value: u32, field: &str) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| invalid(format!("{field} {value} is out of range")))
}

fn stale(entity: &str, id: impl std::fmt::Display, version: u32) -> StoreError {
    StoreError::Stale(format!(
        "{entity} {id} changed before version {version} was written"
    ))
}

/// Write model backed by the `inventory_*` tables.
#[derive(Debug, Clone)]
pub struct PostgresWriteStore {
    pool: PgPool,
}

impl PostgresWriteStore {
    /// Uses an existing pool. Run [`crate::migrate`] first.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn ledger_entry(row: &PgRow) -> StoreResult<LedgerEntry> {
        let correlation_id: String = row.try_get("correlation_id").map_err(map_store_error)?;
        let command_type: String = row.try_get("command_type").map_err(map_store_error)?;
        let reconciliation: Json<Reconciliation> =
            row.try_get("reconciliation").map_err(map_store_error)?;
        let applied_at: DateTime<Utc> = row.try_get("applied_at").map_err(map_store_error)?;
        Ok(LedgerEntry {
            correlation_id: CorrelationId::try_new(correlation_id).map_err(invalid)?,
            command_type: CommandType::try_new(command_type).map_err(invalid)?,
            reconciliation: reconciliation.0,
            reconciled: row.try_get("reconciled").map_err(map_store_error)?,
            applied_at,
        })
    }

    async fn apply(tx: &mut Transaction<'_, Postgres>, mutation: &Mutation) -> StoreResult<()> {
        match mutation {
            Mutation::UpsertAsset(asset) if asset.version == 1 => {
                let inserted = query(
                    "INSERT INTO inventory_assets (id, site_code, device_type, ps_serial, version)
                     VALUES ($1, $2, $3, $4, 1)
                     ON CONFLICT (id) DO NOTHING",
                )
                .bind(asset.id.into_inner())
                .bind(&asset.site_code)
                .bind(&asset.device_type)
                .bind(&asset.ps_serial)
                .execute(&mut **tx)
                .await
                .map_err(map_store_error)?;
                if inserted.rows_affected() == 0 {
                    return Err(stale("asset", asset.id, asset.version));
                }
            }
            Mutation::UpsertAsset(asset) => {
                let updated = query(
                    "UPDATE inventory_assets
                     SET site_code = $2, device_type = $3, ps_serial = $4, version = $5
                     WHERE id = $1 AND version = $5 - 1",
                )
                .bind(asset.id.into_inner())
                .bind(&asset.site_code)
                .bind(&asset.device_type)
                .bind(&asset.ps_serial)
                .bind(to_i32(asset.version, "version")?)
                .execute(&mut **tx)
                .await
                .map_err(map_store_error)?;
                if updated.rows_affected() == 0 {
                    return Err(stale("asset", asset.id, asset.version));
                }
            }
            Mutation::InsertComponent(component) => {
                query(
                    "INSERT INTO inventory_components
                         (id, asset_id, product_name, serial_number, total_available, urgent,
                          on_order, version)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(component.id.into_inner())
                .bind(component.asset_id.into_inner())
                .bind(&component.product_name)
                .bind(&component.serial_number)
                .bind(to_i32(component.total_available, "totalAvailable")?)
                .bind(component.urgent)
                .bind(component.on_order)
                .bind(to_i32(component.version, "version")?)
                .execute(&mut **tx)
                .await
                .map_err(map_store_error)?;
            }
            Mutation::UpdateComponent(component) => {
                let stored: Option<i32> =
                    query("SELECT version FROM inventory_components WHERE id = $1 FOR UPDATE")
                        .bind(component.id.into_inner())
                        .fetch_optional(&mut **tx)
                        .await
                        .and_then(|row| row.map(|row| row.try_get("version")).transpose())
                        .map_err(map_store_error)?;
                let Some(stored) = stored else {
                    return Err(StoreError::Conflict(format!(
                        "component {} does not exist",
                        component.id
                    )));
                };
                if i64::from(stored) + 1 != i64::from(component.version) {
                    return Err(stale("component", component.id, component.version));
                }
                query(
                    "UPDATE inventory_components
                     SET product_name = $2, serial_number = $3, total_available = $4,
                         urgent = $5, on_order = $6, version = $7
                     WHERE id = $1",
                )
                .bind(component.id.into_inner())
                .bind(&component.product_name)
                .bind(&component.serial_number)
                .bind(to_i32(component.total_available, "totalAvailable")?)
                .bind(component.urgent)
                .bind(component.on_order)
                .bind(to_i32(component.version, "version")?)
                .execute(&mut **tx)
                .await
                .map_err(map_store_error)?;
            }
            Mutation::InsertOrder(order) => {
                query(
                    "INSERT INTO inventory_orders
                         (id, component_id, asset_id, expert_id, reason, status, requested_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(order.id.into_inner())
                .bind(order.component_id.into_inner())
                .bind(order.asset_id.into_inner())
                .bind(&order.expert_id)
                .bind(&order.reason)
                .bind(order.status.to_string())
                .bind(order.requested_at)
                .execute(&mut **tx)
                .await
                .map_err(map_store_error)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WriteModelStore for PostgresWriteStore {
    async fn asset(&self, id: AssetId) -> StoreResult<Option<Asset>> {
        let row = query(
            "SELECT site_code, device_type, ps_serial, version FROM inventory_assets WHERE id = $1",
        )
        .bind(id.into_inner())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_store_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let version: i32 = row.try_get("version").map_err(map_store_error)?;
        Ok(Some(Asset {
            id,
            site_code: row.try_get("site_code").map_err(map_store_error)?,
            device_type: row.try_get("device_type").map_err(map_store_error)?,
            ps_serial: row.try_get("ps_serial").map_err(map_store_error)?,
            version: u32::try_from(version).map_err(invalid)?,
        }))
    }

    async fn component(&self, id: ComponentId) -> StoreResult<Option<Component>> {
        let row = query(
            "SELECT asset_id, product_name, serial_number, total_available, urgent, on_order,
                    version
             FROM inventory_components WHERE id = $1",
        )
        .bind(id.into_inner())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_store_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let total_available: i32 = row.try_get("total_available").map_err(map_store_error)?;
        let version: i32 = row.try_get("version").map_err(map_store_error)?;
        let asset_id: Uuid = row.try_get("asset_id").map_err(map_store_error)?;
        Ok(Some(Component {
            id,
            asset_id: AssetId::new(asset_id),
            product_name: row.try_get("product_name").map_err(map_store_error)?,
            serial_number: row.try_get("serial_number").map_err(map_store_error)?,
            total_available: u32::try_from(total_available).map_err(invalid)?,
            urgent: row.try_get("urgent").map_err(map_store_error)?,
            on_order: row.try_get("on_order").map_err(map_store_error)?,
            version: u32::try_from(version).map_err(invalid)?,
        }))
    }

    async fn processed(&self, correlation_id: &CorrelationId) -> StoreResult<Option<LedgerEntry>> {
        let row = query(
            "SELECT correlation_id, command_type, reconciliation, reconciled, applied_at
             FROM inventory_ledger WHERE correlation_id = $1",
        )
        .bind(correlation_id.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_store_error)?;

        row.as_ref().map(Self::ledger_entry).transpose()
    }

    #[instrument(name = "postgres.commit", skip_all, fields(correlation_id = %unit.correlation_id))]
    async fn commit(&self, unit: UnitOfWork) -> StoreResult<CommitOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_store_error)?;

        let recorded = query(
            "INSERT INTO inventory_ledger (correlation_id, command_type, reconciliation)
             VALUES ($1, $2, $3)
             ON CONFLICT (correlation_id) DO NOTHING",
        )
        .bind(unit.correlation_id.as_ref())
        .bind(unit.command_type.as_ref())
        .bind(Json(&unit.reconciliation))
        .execute(&mut *tx)
        .await
        .map_err(map_store_error)?;

        if recorded.rows_affected() == 0 {
            drop(tx);
            let entry = self.processed(&unit.correlation_id).await?.ok_or_else(|| {
                StoreError::Unavailable("ledger entry vanished during commit".to_string())
            })?;
            return Ok(CommitOutcome::AlreadyApplied(entry));
        }

        for mutation in &unit.mutations {
            Self::apply(&mut tx, mutation).await?;
        }
        tx.commit().await.map_err(map_store_error)?;
        debug!(mutations = unit.mutations.len(), "unit of work committed");
        Ok(CommitOutcome::Committed)
    }

    async fn mark_reconciled(&self, correlation_id: &CorrelationId) -> StoreResult<()> {
        let updated = query("UPDATE inventory_ledger SET reconciled = TRUE WHERE correlation_id = $1")
            .bind(correlation_id.as_ref())
            .execute(&self.pool)
            .await
            .map_err(map_store_error)?;
        if updated.rows_affected() == 0 {
            return Err(invalid(format!("no processed command {correlation_id}")));
        }
        Ok(())
    }

    async fn pending_reconciliations(&self) -> StoreResult<Vec<Reconciliation>> {
        let rows = query(
            "SELECT reconciliation FROM inventory_ledger WHERE NOT reconciled ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_store_error)?;

        rows.iter()
            .map(|row| {
                row.try_get::<Json<Reconciliation>, _>("reconciliation")
                    .map(|json| json.0)
                    .map_err(map_store_error)
            })
            .collect()
    }
}

/// Read model backed by the `inventory_read_*` tables.
#[derive(Debug, Clone)]
pub struct PostgresReadStore {
    pool: PgPool,
}

impl PostgresReadStore {
    /// Uses an existing pool. Run [`crate::migrate`] first.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert(tx: &mut Transaction<'_, Postgres>, change: &ReadModelChange) -> StoreResult<()> {
        let result = match change {
            ReadModelChange::Asset(view) => {
                query(
                    "INSERT INTO inventory_read_assets (id, version, payload) VALUES ($1, $2, $3)
                     ON CONFLICT (id) DO UPDATE
                     SET version = EXCLUDED.version, payload = EXCLUDED.payload
                     WHERE inventory_read_assets.version < EXCLUDED.version",
                )
                .bind(view.id.into_inner())
                .bind(to_i32(view.version, "version")?)
                .bind(Json(view))
                .execute(&mut **tx)
                .await
            }
            ReadModelChange::Component(view) => {
                query(
                    "INSERT INTO inventory_read_components (id, asset_id, sn, version, payload)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (id) DO UPDATE
                     SET asset_id = EXCLUDED.asset_id, sn = EXCLUDED.sn,
                         version = EXCLUDED.version, payload = EXCLUDED.payload
                     WHERE inventory_read_components.version < EXCLUDED.version",
                )
                .bind(view.id.into_inner())
                .bind(view.asset_id.into_inner())
                .bind(&view.sn)
                .bind(to_i32(view.version, "version")?)
                .bind(Json(view))
                .execute(&mut **tx)
                .await
            }
            ReadModelChange::Order(view) => {
                query(
                    "INSERT INTO inventory_read_orders (id, asset_id, date_cmd, payload)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (id) DO NOTHING",
                )
                .bind(view.id.into_inner())
                .bind(view.asset_id.into_inner())
                .bind(view.date_cmd)
                .bind(Json(view))
                .execute(&mut **tx)
                .await
            }
        };
        result.map(|_| ()).map_err(map_store_error)
    }

    async fn payloads<T: DeserializeOwned + Send + Unpin>(
        &self,
        sql: &'static str,
        key: Uuid,
    ) -> StoreResult<Vec<T>> {
        let rows = query(sql)
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(map_store_error)?;
        rows.iter()
            .map(|row| {
                row.try_get::<Json<T>, _>("payload")
                    .map(|json| json.0)
                    .map_err(map_store_error)
            })
            .collect()
    }
}

#[async_trait]
impl ReadModelStore for PostgresReadStore {
    #[instrument(name = "postgres.reconcile", skip_all, fields(correlation_id = %reconciliation.correlation_id))]
    async fn apply(&self, reconciliation: &Reconciliation) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_store_error)?;

        let first = query(
            "INSERT INTO inventory_read_applied (correlation_id) VALUES ($1)
             ON CONFLICT (correlation_id) DO NOTHING",
        )
        .bind(reconciliation.correlation_id.as_ref())
        .execute(&mut *tx)
        .await
        .map_err(map_store_error)?;
        if first.rows_affected() == 0 {
            debug!("reconciliation already applied");
            return Ok(());
        }

        for change in &reconciliation.changes {
            Self::upsert(&mut tx, change).await?;
        }
        tx.commit().await.map_err(map_store_error)
    }

    async fn asset(&self, id: AssetId) -> StoreResult<Option<AssetView>> {
        Ok(self
            .payloads("SELECT payload FROM inventory_read_assets WHERE id = $1", id.into_inner())
            .await?
            .pop())
    }

    async fn components_by_asset(&self, asset_id: AssetId) -> StoreResult<Vec<ComponentView>> {
        self.payloads(
            "SELECT payload FROM inventory_read_components WHERE asset_id = $1 ORDER BY sn, id",
            asset_id.into_inner(),
        )
        .await
    }

    async fn component(&self, id: ComponentId) -> StoreResult<Option<ComponentView>> {
        Ok(self
            .payloads(
                "SELECT payload FROM inventory_read_components WHERE id = $1",
                id.into_inner(),
            )
            .await?
            .pop())
    }

    async fn orders_by_asset(&self, asset_id: AssetId) -> StoreResult<Vec<OrderView>> {
        self.payloads(
            "SELECT payload FROM inventory_read_orders WHERE asset_id = $1 ORDER BY date_cmd, id",
            asset_id.into_inner(),
        )
        .await
    }
}
