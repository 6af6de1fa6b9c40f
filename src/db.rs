// =============================================================================
// DATABASE MODULE
// =============================================================================
// PostgreSQL implementation of `UnitStore`.
//
// NOTES:
// - Schema is created idempotently at startup (`run_migrations`)
// - Unique and check constraints back up the entity invariants
// - Every mutation is SELECT ... FOR UPDATE, then UPDATE ... WHERE version =
//   the version that was read. Zero rows updated means someone else won.
// =============================================================================

use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgDatabaseError, PgPoolOptions};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row, Transaction};
use strum::IntoEnumIterator;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{UnitError, UnitResult};
use crate::metrics;
use crate::models::{
    InventoryUnit, UnitCondition, UnitEvent, UnitEventKind, UnitFilter, UnitOrder, UnitStatus,
};
use crate::store::{verify_detached_save, UnitMutation, UnitStore};

/// Column list shared by every SELECT and INSERT on `inventory_units`
const UNIT_COLUMNS: &str = "id, item_id, location_id, sku, serial_number, batch_code, barcode, \
    status, condition, quantity, purchase_date, purchase_price, supplier_id, \
    purchase_order_number, sale_price, rental_rate_per_period, rental_period, \
    security_deposit, last_maintenance_date, next_maintenance_date, total_rental_hours, \
    total_rental_count, warranty_expiry, warranty_provider, warranty_terms, \
    is_rental_blocked, rental_block_reason, rental_blocked_at, rental_blocked_by, \
    original_location_id, current_holder_id, notes, version, is_active, \
    created_at, updated_at, created_by, updated_by";

// -----------------------------------------------------------------------------
// DATABASE WRAPPER
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    /// Create the connection pool using the limits from `Config`.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .min_connections(config.db_min_connections)
            .acquire_timeout(Duration::from_secs(config.db_acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(300))
            .connect(&config.database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Create tables, constraints and indexes if they do not exist yet.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        // Units reference their owning item; only the base SKU is read here.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                sku VARCHAR(50) UNIQUE NOT NULL,
                name VARCHAR(255) NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create items table")?;

        sqlx::query(&units_table_ddl())
            .execute(&self.pool)
            .await
            .context("Failed to create inventory_units table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inventory_unit_events (
                id BIGSERIAL PRIMARY KEY,
                unit_id UUID NOT NULL REFERENCES inventory_units(id) ON DELETE CASCADE,
                version INTEGER NOT NULL,
                kind VARCHAR(40) NOT NULL,
                payload JSONB NOT NULL,
                note TEXT,
                actor_id UUID,
                occurred_at TIMESTAMPTZ NOT NULL,
                CONSTRAINT uq_inventory_unit_events_version UNIQUE (unit_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create inventory_unit_events table")?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_inventory_units_item ON inventory_units(item_id)",
            "CREATE INDEX IF NOT EXISTS idx_inventory_units_location ON inventory_units(location_id)",
            "CREATE INDEX IF NOT EXISTS idx_inventory_units_status ON inventory_units(status)",
            "CREATE INDEX IF NOT EXISTS idx_inventory_units_batch_code ON inventory_units(batch_code)",
            "CREATE INDEX IF NOT EXISTS idx_inventory_units_next_maintenance \
             ON inventory_units(next_maintenance_date) WHERE next_maintenance_date IS NOT NULL",
            "CREATE INDEX IF NOT EXISTS idx_inventory_units_warranty \
             ON inventory_units(warranty_expiry) WHERE warranty_expiry IS NOT NULL",
        ];
        for ddl in indexes {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create index: {}", ddl))?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // HEALTH CHECK
    // -------------------------------------------------------------------------
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    // -------------------------------------------------------------------------
    // INTERNAL HELPERS
    // -------------------------------------------------------------------------

    async fn fetch_one_where(
        &self,
        column: &str,
        value: &str,
    ) -> UnitResult<Option<InventoryUnit>> {
        let sql = format!(
            "SELECT {} FROM inventory_units WHERE {} = $1",
            UNIT_COLUMNS, column
        );
        let start = Instant::now();
        let row = sqlx::query_as::<_, UnitRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        metrics::record_db_query("select", start.elapsed().as_secs_f64());
        row.map(InventoryUnit::try_from).transpose()
    }
}

/// Table definition. Enum membership checks are generated from the Rust enums
/// so the two cannot drift apart.
fn units_table_ddl() -> String {
    let statuses = sql_list(UnitStatus::iter().map(|s| s.to_string()));
    let conditions = sql_list(UnitCondition::iter().map(|c| c.to_string()));

    format!(
        r#"
        CREATE TABLE IF NOT EXISTS inventory_units (
            id UUID PRIMARY KEY,
            item_id UUID NOT NULL REFERENCES items(id),
            location_id UUID NOT NULL,

            sku VARCHAR(50) NOT NULL,
            serial_number VARCHAR(100),
            batch_code VARCHAR(100),
            barcode VARCHAR(100),

            status VARCHAR(20) NOT NULL DEFAULT 'AVAILABLE',
            condition VARCHAR(20) NOT NULL DEFAULT 'NEW',
            quantity NUMERIC NOT NULL DEFAULT 1,

            purchase_date TIMESTAMPTZ,
            purchase_price NUMERIC NOT NULL DEFAULT 0,
            supplier_id UUID,
            purchase_order_number VARCHAR(100),

            sale_price NUMERIC,
            rental_rate_per_period NUMERIC,
            rental_period INTEGER NOT NULL DEFAULT 1,
            security_deposit NUMERIC NOT NULL DEFAULT 0,

            last_maintenance_date TIMESTAMPTZ,
            next_maintenance_date TIMESTAMPTZ,
            total_rental_hours NUMERIC NOT NULL DEFAULT 0,
            total_rental_count INTEGER NOT NULL DEFAULT 0,

            warranty_expiry TIMESTAMPTZ,
            warranty_provider VARCHAR(255),
            warranty_terms TEXT,

            is_rental_blocked BOOLEAN NOT NULL DEFAULT FALSE,
            rental_block_reason TEXT,
            rental_blocked_at TIMESTAMPTZ,
            rental_blocked_by UUID,

            original_location_id UUID NOT NULL,
            current_holder_id UUID,
            notes TEXT,

            version INTEGER NOT NULL DEFAULT 1,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            created_by UUID,
            updated_by UUID,

            CONSTRAINT uq_inventory_units_sku UNIQUE (sku),
            CONSTRAINT uq_inventory_units_serial_number UNIQUE (serial_number),
            CONSTRAINT uq_inventory_units_barcode UNIQUE (barcode),

            CONSTRAINT ck_inventory_units_serial_xor_batch CHECK (
                (serial_number IS NOT NULL AND batch_code IS NULL)
                OR (serial_number IS NULL AND batch_code IS NOT NULL)
            ),
            CONSTRAINT ck_inventory_units_serial_quantity CHECK (serial_number IS NULL OR quantity = 1),
            CONSTRAINT ck_inventory_units_quantity CHECK (quantity > 0),
            CONSTRAINT ck_inventory_units_purchase_price CHECK (purchase_price >= 0),
            CONSTRAINT ck_inventory_units_security_deposit CHECK (security_deposit >= 0),
            CONSTRAINT ck_inventory_units_rental_period CHECK (rental_period > 0),
            CONSTRAINT ck_inventory_units_sale_price CHECK (sale_price IS NULL OR sale_price >= 0),
            CONSTRAINT ck_inventory_units_rental_rate CHECK (
                rental_rate_per_period IS NULL OR rental_rate_per_period >= 0
            ),
            CONSTRAINT ck_inventory_units_status CHECK (status IN ({statuses})),
            CONSTRAINT ck_inventory_units_condition CHECK (condition IN ({conditions})),
            CONSTRAINT ck_inventory_units_warranty_dates CHECK (
                purchase_date IS NULL OR warranty_expiry IS NULL OR purchase_date <= warranty_expiry
            ),
            CONSTRAINT ck_inventory_units_maintenance_dates CHECK (
                last_maintenance_date IS NULL OR next_maintenance_date IS NULL
                OR last_maintenance_date <= next_maintenance_date
            )
        )
        "#
    )
}

fn sql_list(values: impl Iterator<Item = String>) -> String {
    values
        .map(|v| format!("'{}'", v))
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// ROW MAPPING
// =============================================================================
// Status and condition are stored as text; parsing them back goes through
// strum so an unknown value is reported instead of silently defaulted.
#[derive(Debug, FromRow)]
struct UnitRow {
    id: Uuid,
    item_id: Uuid,
    location_id: Uuid,
    sku: String,
    serial_number: Option<String>,
    batch_code: Option<String>,
    barcode: Option<String>,
    status: String,
    condition: String,
    quantity: Decimal,
    purchase_date: Option<DateTime<Utc>>,
    purchase_price: Decimal,
    supplier_id: Option<Uuid>,
    purchase_order_number: Option<String>,
    sale_price: Option<Decimal>,
    rental_rate_per_period: Option<Decimal>,
    rental_period: i32,
    security_deposit: Decimal,
    last_maintenance_date: Option<DateTime<Utc>>,
    next_maintenance_date: Option<DateTime<Utc>>,
    total_rental_hours: Decimal,
    total_rental_count: i32,
    warranty_expiry: Option<DateTime<Utc>>,
    warranty_provider: Option<String>,
    warranty_terms: Option<String>,
    is_rental_blocked: bool,
    rental_block_reason: Option<String>,
    rental_blocked_at: Option<DateTime<Utc>>,
    rental_blocked_by: Option<Uuid>,
    original_location_id: Uuid,
    current_holder_id: Option<Uuid>,
    notes: Option<String>,
    version: i32,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    created_by: Option<Uuid>,
    updated_by: Option<Uuid>,
}

impl TryFrom<UnitRow> for InventoryUnit {
    type Error = UnitError;

    fn try_from(row: UnitRow) -> UnitResult<Self> {
        let status = row.status.parse::<UnitStatus>().map_err(|_| {
            UnitError::Internal(format!("Unknown status '{}' on unit {}", row.status, row.id))
        })?;
        let condition = row.condition.parse::<UnitCondition>().map_err(|_| {
            UnitError::Internal(format!(
                "Unknown condition '{}' on unit {}",
                row.condition, row.id
            ))
        })?;

        Ok(InventoryUnit {
            id: row.id,
            item_id: row.item_id,
            location_id: row.location_id,
            sku: row.sku,
            serial_number: row.serial_number,
            batch_code: row.batch_code,
            barcode: row.barcode,
            status,
            condition,
            quantity: row.quantity,
            purchase_date: row.purchase_date,
            purchase_price: row.purchase_price,
            supplier_id: row.supplier_id,
            purchase_order_number: row.purchase_order_number,
            sale_price: row.sale_price,
            rental_rate_per_period: row.rental_rate_per_period,
            rental_period: row.rental_period,
            security_deposit: row.security_deposit,
            last_maintenance_date: row.last_maintenance_date,
            next_maintenance_date: row.next_maintenance_date,
            total_rental_hours: row.total_rental_hours,
            total_rental_count: row.total_rental_count,
            warranty_expiry: row.warranty_expiry,
            warranty_provider: row.warranty_provider,
            warranty_terms: row.warranty_terms,
            is_rental_blocked: row.is_rental_blocked,
            rental_block_reason: row.rental_block_reason,
            rental_blocked_at: row.rental_blocked_at,
            rental_blocked_by: row.rental_blocked_by,
            original_location_id: row.original_location_id,
            current_holder_id: row.current_holder_id,
            notes: row.notes,
            version: row.version,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
            created_by: row.created_by,
            updated_by: row.updated_by,
            pending_events: Vec::new(),
        })
    }
}

// =============================================================================
// ERROR TRANSLATION
// =============================================================================
/// Turn constraint violations into domain errors. Unique violations name the
/// offending field; check violations become validation errors.
fn translate_write_error(err: sqlx::Error) -> UnitError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            let field = unique_field(db_err.constraint());
            let value = db_err
                .try_downcast_ref::<PgDatabaseError>()
                .and_then(|pg| pg.detail())
                .and_then(duplicate_value_from_detail)
                .unwrap_or_default();
            return UnitError::duplicate(field, value);
        }
        if db_err.is_check_violation() {
            return UnitError::validation(format!(
                "Constraint {} violated",
                db_err.constraint().unwrap_or("unknown")
            ));
        }
        if db_err.is_foreign_key_violation() {
            return UnitError::not_found("Referenced item does not exist");
        }
    }
    UnitError::Database(err)
}

/// Unit field guarded by a unique constraint
fn unique_field(constraint: Option<&str>) -> &'static str {
    match constraint {
        Some("uq_inventory_units_sku") => "sku",
        Some("uq_inventory_units_serial_number") => "serial_number",
        Some("uq_inventory_units_barcode") => "barcode",
        Some("inventory_units_pkey") => "id",
        _ => "unknown",
    }
}

/// Extract `value` from `Key (sku)=(value) already exists.`
fn duplicate_value_from_detail(detail: &str) -> Option<String> {
    let start = detail.find(")=(")? + 3;
    let end = detail.rfind(") already exists")?;
    (end >= start).then(|| detail[start..end].to_string())
}

// =============================================================================
// WRITE HELPERS
// =============================================================================

fn push_unit_values(
    builder: &mut QueryBuilder<'_, Postgres>,
    units: &[InventoryUnit],
) {
    builder.push(format!("INSERT INTO inventory_units ({}) ", UNIT_COLUMNS));
    builder.push_values(units.iter(), |mut b, u| {
        b.push_bind(u.id)
            .push_bind(u.item_id)
            .push_bind(u.location_id)
            .push_bind(u.sku.clone())
            .push_bind(u.serial_number.clone())
            .push_bind(u.batch_code.clone())
            .push_bind(u.barcode.clone())
            .push_bind(u.status.to_string())
            .push_bind(u.condition.to_string())
            .push_bind(u.quantity)
            .push_bind(u.purchase_date)
            .push_bind(u.purchase_price)
            .push_bind(u.supplier_id)
            .push_bind(u.purchase_order_number.clone())
            .push_bind(u.sale_price)
            .push_bind(u.rental_rate_per_period)
            .push_bind(u.rental_period)
            .push_bind(u.security_deposit)
            .push_bind(u.last_maintenance_date)
            .push_bind(u.next_maintenance_date)
            .push_bind(u.total_rental_hours)
            .push_bind(u.total_rental_count)
            .push_bind(u.warranty_expiry)
            .push_bind(u.warranty_provider.clone())
            .push_bind(u.warranty_terms.clone())
            .push_bind(u.is_rental_blocked)
            .push_bind(u.rental_block_reason.clone())
            .push_bind(u.rental_blocked_at)
            .push_bind(u.rental_blocked_by)
            .push_bind(u.original_location_id)
            .push_bind(u.current_holder_id)
            .push_bind(u.notes.clone())
            .push_bind(u.version)
            .push_bind(u.is_active)
            .push_bind(u.created_at)
            .push_bind(u.updated_at)
            .push_bind(u.created_by)
            .push_bind(u.updated_by);
    });
}

/// Conditional UPDATE of every mutable column. `original_location_id`,
/// `created_*` and `item_id` are never written after insert.
async fn update_if_version(
    tx: &mut Transaction<'_, Postgres>,
    unit: &InventoryUnit,
    expected_version: i32,
) -> UnitResult<u64> {
    let mut builder = QueryBuilder::<Postgres>::new("UPDATE inventory_units SET ");
    {
        let mut set = builder.separated(", ");
        set.push("location_id = ").push_bind_unseparated(unit.location_id);
        set.push("sku = ").push_bind_unseparated(unit.sku.clone());
        set.push("serial_number = ").push_bind_unseparated(unit.serial_number.clone());
        set.push("batch_code = ").push_bind_unseparated(unit.batch_code.clone());
        set.push("barcode = ").push_bind_unseparated(unit.barcode.clone());
        set.push("status = ").push_bind_unseparated(unit.status.to_string());
        set.push("condition = ").push_bind_unseparated(unit.condition.to_string());
        set.push("quantity = ").push_bind_unseparated(unit.quantity);
        set.push("purchase_price = ").push_bind_unseparated(unit.purchase_price);
        set.push("sale_price = ").push_bind_unseparated(unit.sale_price);
        set.push("rental_rate_per_period = ")
            .push_bind_unseparated(unit.rental_rate_per_period);
        set.push("rental_period = ").push_bind_unseparated(unit.rental_period);
        set.push("security_deposit = ").push_bind_unseparated(unit.security_deposit);
        set.push("last_maintenance_date = ")
            .push_bind_unseparated(unit.last_maintenance_date);
        set.push("next_maintenance_date = ")
            .push_bind_unseparated(unit.next_maintenance_date);
        set.push("total_rental_hours = ").push_bind_unseparated(unit.total_rental_hours);
        set.push("total_rental_count = ").push_bind_unseparated(unit.total_rental_count);
        set.push("warranty_expiry = ").push_bind_unseparated(unit.warranty_expiry);
        set.push("warranty_provider = ").push_bind_unseparated(unit.warranty_provider.clone());
        set.push("warranty_terms = ").push_bind_unseparated(unit.warranty_terms.clone());
        set.push("is_rental_blocked = ").push_bind_unseparated(unit.is_rental_blocked);
        set.push("rental_block_reason = ")
            .push_bind_unseparated(unit.rental_block_reason.clone());
        set.push("rental_blocked_at = ").push_bind_unseparated(unit.rental_blocked_at);
        set.push("rental_blocked_by = ").push_bind_unseparated(unit.rental_blocked_by);
        set.push("current_holder_id = ").push_bind_unseparated(unit.current_holder_id);
        set.push("notes = ").push_bind_unseparated(unit.notes.clone());
        set.push("version = ").push_bind_unseparated(unit.version);
        set.push("is_active = ").push_bind_unseparated(unit.is_active);
        set.push("updated_at = ").push_bind_unseparated(unit.updated_at);
        set.push("updated_by = ").push_bind_unseparated(unit.updated_by);
    }
    builder
        .push(" WHERE id = ")
        .push_bind(unit.id)
        .push(" AND version = ")
        .push_bind(expected_version);

    let start = Instant::now();
    let result = builder
        .build()
        .execute(&mut **tx)
        .await
        .map_err(translate_write_error)?;
    metrics::record_db_query("update", start.elapsed().as_secs_f64());

    Ok(result.rows_affected())
}

async fn insert_events(
    tx: &mut Transaction<'_, Postgres>,
    events: &[UnitEvent],
) -> UnitResult<()> {
    if events.is_empty() {
        return Ok(());
    }

    let mut payloads = Vec::with_capacity(events.len());
    for event in events {
        let payload = serde_json::to_value(&event.kind)
            .map_err(|e| UnitError::Internal(format!("Failed to encode event: {}", e)))?;
        payloads.push(payload);
    }

    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO inventory_unit_events (unit_id, version, kind, payload, note, actor_id, occurred_at) ",
    );
    builder.push_values(events.iter().zip(payloads), |mut b, (event, payload)| {
        b.push_bind(event.unit_id)
            .push_bind(event.version)
            .push_bind(event.kind.name())
            .push_bind(payload)
            .push_bind(event.note.clone())
            .push_bind(event.actor_id)
            .push_bind(event.occurred_at);
    });

    builder
        .build()
        .execute(&mut **tx)
        .await
        .map_err(translate_write_error)?;
    Ok(())
}

async fn lock_unit(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> UnitResult<Option<InventoryUnit>> {
    let sql = format!(
        "SELECT {} FROM inventory_units WHERE id = $1 FOR UPDATE",
        UNIT_COLUMNS
    );
    let start = Instant::now();
    let row = sqlx::query_as::<_, UnitRow>(&sql)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    metrics::record_db_query("select_for_update", start.elapsed().as_secs_f64());
    row.map(InventoryUnit::try_from).transpose()
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &UnitFilter) {
    if let Some(item_id) = filter.item_id {
        builder.push(" AND item_id = ").push_bind(item_id);
    }
    if let Some(location_id) = filter.location_id {
        builder.push(" AND location_id = ").push_bind(location_id);
    }
    if let Some(supplier_id) = filter.supplier_id {
        builder.push(" AND supplier_id = ").push_bind(supplier_id);
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.to_string());
    }
    if let Some(condition) = filter.condition {
        builder.push(" AND condition = ").push_bind(condition.to_string());
    }
    if let Some(conditions) = &filter.conditions {
        let values: Vec<String> = conditions.iter().map(|c| c.to_string()).collect();
        builder.push(" AND condition = ANY(").push_bind(values).push(")");
    }
    if let Some(code) = &filter.batch_code {
        builder.push(" AND batch_code = ").push_bind(code.clone());
    }
    if let Some(active) = filter.is_active {
        builder.push(" AND is_active = ").push_bind(active);
    }
    if let Some(blocked) = filter.is_rental_blocked {
        builder.push(" AND is_rental_blocked = ").push_bind(blocked);
    }
    if let Some(from) = filter.purchased_from {
        builder.push(" AND purchase_date >= ").push_bind(from);
    }
    if let Some(to) = filter.purchased_to {
        builder.push(" AND purchase_date <= ").push_bind(to);
    }
    if let Some(min) = filter.min_price {
        builder.push(" AND purchase_price >= ").push_bind(min);
    }
    if let Some(max) = filter.max_price {
        builder.push(" AND purchase_price <= ").push_bind(max);
    }
    if let Some(t) = filter.maintenance_due_by {
        builder.push(" AND next_maintenance_date <= ").push_bind(t);
    }
    if let Some(t) = filter.maintenance_clear_at {
        builder
            .push(" AND (next_maintenance_date IS NULL OR next_maintenance_date > ")
            .push_bind(t)
            .push(")");
    }
    if let Some(t) = filter.warranty_expires_after {
        builder.push(" AND warranty_expiry > ").push_bind(t);
    }
    if let Some(t) = filter.warranty_expires_by {
        builder.push(" AND warranty_expiry <= ").push_bind(t);
    }

    builder.push(match filter.order_by {
        UnitOrder::Sku => " ORDER BY sku ASC",
        UnitOrder::NextMaintenance => " ORDER BY next_maintenance_date ASC NULLS LAST, sku ASC",
        UnitOrder::WarrantyExpiry => " ORDER BY warranty_expiry ASC NULLS LAST, sku ASC",
        UnitOrder::CreatedAt => " ORDER BY created_at ASC, sku ASC",
    });

    if let Some(limit) = filter.limit {
        builder.push(" LIMIT ").push_bind(limit.max(0));
    }
    if let Some(offset) = filter.offset {
        builder.push(" OFFSET ").push_bind(offset.max(0));
    }
}

// =============================================================================
// STORE IMPLEMENTATION
// =============================================================================
#[async_trait]
impl UnitStore for Database {
    async fn insert(&self, unit: &mut InventoryUnit) -> UnitResult<()> {
        self.insert_batch(std::slice::from_mut(unit)).await
    }

    async fn insert_batch(&self, units: &mut [InventoryUnit]) -> UnitResult<()> {
        if units.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let mut tx = self.pool.begin().await?;

        let mut builder = QueryBuilder::<Postgres>::new("");
        push_unit_values(&mut builder, units);
        builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(translate_write_error)?;

        let events: Vec<UnitEvent> = units
            .iter()
            .flat_map(|u| u.pending_events().iter().cloned())
            .collect();
        insert_events(&mut tx, &events).await?;

        tx.commit().await?;
        metrics::record_db_query("insert", start.elapsed().as_secs_f64());

        for unit in units.iter_mut() {
            unit.take_pending_events();
        }
        Ok(())
    }

    async fn find(&self, id: Uuid) -> UnitResult<Option<InventoryUnit>> {
        let sql = format!("SELECT {} FROM inventory_units WHERE id = $1", UNIT_COLUMNS);
        let start = Instant::now();
        let row = sqlx::query_as::<_, UnitRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        metrics::record_db_query("select", start.elapsed().as_secs_f64());
        row.map(InventoryUnit::try_from).transpose()
    }

    async fn modify(&self, id: Uuid, mutation: UnitMutation<'_>) -> UnitResult<InventoryUnit> {
        let mut tx = self.pool.begin().await?;

        // Row lock held until commit; concurrent modifiers of the same unit
        // queue here.
        let mut unit = lock_unit(&mut tx, id)
            .await?
            .ok_or_else(|| UnitError::not_found(format!("Inventory unit {} not found", id)))?;
        let read_version = unit.version;

        // Dropping `tx` on error rolls back and releases the lock.
        mutation(&mut unit)?;

        if update_if_version(&mut tx, &unit, read_version).await? == 0 {
            return Err(UnitError::version_mismatch(id, read_version));
        }
        insert_events(&mut tx, unit.pending_events()).await?;
        tx.commit().await?;

        unit.take_pending_events();
        Ok(unit)
    }

    async fn save(&self, unit: &mut InventoryUnit, expected_version: i32) -> UnitResult<()> {
        let mut tx = self.pool.begin().await?;

        let stored = lock_unit(&mut tx, unit.id)
            .await?
            .ok_or_else(|| UnitError::not_found(format!("Inventory unit {} not found", unit.id)))?;
        verify_detached_save(&stored, unit, expected_version)?;

        if update_if_version(&mut tx, unit, expected_version).await? == 0 {
            return Err(UnitError::version_mismatch(unit.id, expected_version));
        }
        insert_events(&mut tx, unit.pending_events()).await?;
        tx.commit().await?;

        unit.take_pending_events();
        Ok(())
    }

    async fn search(&self, filter: &UnitFilter) -> UnitResult<Vec<InventoryUnit>> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM inventory_units WHERE 1 = 1",
            UNIT_COLUMNS
        ));
        push_filter(&mut builder, filter);

        let start = Instant::now();
        let rows = builder
            .build_query_as::<UnitRow>()
            .fetch_all(&self.pool)
            .await?;
        metrics::record_db_query("search", start.elapsed().as_secs_f64());

        rows.into_iter().map(InventoryUnit::try_from).collect()
    }

    async fn find_by_sku(&self, sku: &str) -> UnitResult<Option<InventoryUnit>> {
        self.fetch_one_where("sku", sku).await
    }

    async fn find_by_serial_number(&self, serial: &str) -> UnitResult<Option<InventoryUnit>> {
        self.fetch_one_where("serial_number", serial).await
    }

    async fn sku_exists(&self, sku: &str) -> UnitResult<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM inventory_units WHERE sku = $1) AS found")
            .bind(sku)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<bool, _>("found"))
    }

    async fn count_for_item(&self, item_id: Uuid) -> UnitResult<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM inventory_units WHERE item_id = $1")
                .bind(item_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }

    async fn item_base_sku(&self, item_id: Uuid) -> UnitResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT sku FROM items WHERE id = $1")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn history(&self, unit_id: Uuid) -> UnitResult<Vec<UnitEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT unit_id, version, payload, note, actor_id, occurred_at
            FROM inventory_unit_events
            WHERE unit_id = $1
            ORDER BY version ASC
            "#,
        )
        .bind(unit_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let payload: serde_json::Value = row.get("payload");
                let kind: UnitEventKind = serde_json::from_value(payload).map_err(|e| {
                    UnitError::Internal(format!("Corrupt event payload: {}", e))
                })?;
                Ok(UnitEvent {
                    unit_id: row.get("unit_id"),
                    version: row.get("version"),
                    occurred_at: row.get("occurred_at"),
                    actor_id: row.get("actor_id"),
                    kind,
                    note: row.get("note"),
                })
            })
            .collect()
    }

    async fn ping(&self) -> bool {
        self.health_check().await
    }
}
