// =============================================================================
// REPOSITORY MODULE
// =============================================================================
// Coordinates everything around a unit that the entity cannot do alone:
// locking and persisting transitions, SKU and batch code generation, creation
// (single and batch) and the operational queries.
//
// WRITE DISCIPLINE:
// Every mutation goes through `UnitStore::modify`, which locks the unit,
// runs the entity transition and writes back conditionally on the version
// that was read. Nothing is retried here; a version conflict is returned to
// the caller as a retryable error.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{UnitError, UnitResult};
use crate::metrics;
use crate::models::{
    InventoryUnit, NewInventoryUnit, StatusChange, Transition, UnitEvent, UnitFilter, UnitOrder,
};
use crate::store::UnitStore;
use crate::unit::MAX_SKU_LEN;

/// Used when no configuration is supplied
pub const DEFAULT_SKU_MAX_ATTEMPTS: u32 = 5;

/// `BATCH-{YYYYMMDD}-{8 random hex chars}`
pub fn generate_batch_code_at(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "BATCH-{}-{}",
        now.format("%Y%m%d"),
        random[..8].to_uppercase()
    )
}

#[derive(Clone)]
pub struct UnitRepository {
    store: Arc<dyn UnitStore>,
    sku_max_attempts: u32,
}

impl UnitRepository {
    pub fn new(store: Arc<dyn UnitStore>) -> Self {
        Self {
            store,
            sku_max_attempts: DEFAULT_SKU_MAX_ATTEMPTS,
        }
    }

    pub fn from_config(store: Arc<dyn UnitStore>, config: &Config) -> Self {
        Self::new(store).with_sku_max_attempts(config.sku_max_attempts)
    }

    pub fn with_sku_max_attempts(mut self, attempts: u32) -> Self {
        self.sku_max_attempts = attempts.max(1);
        self
    }

    pub async fn health_check(&self) -> bool {
        self.store.ping().await
    }

    // =========================================================================
    // STATUS CHANGES
    // =========================================================================

    /// Move a unit to `change.status`, dispatching to the matching entity
    /// transition, under the unit's lock.
    ///
    /// # Errors
    /// - `NotFound` if the unit does not exist
    /// - `Validation` if a required field is missing or the transition is
    ///   not allowed from the current state
    /// - `Conflict` if the stored version moved underneath us
    pub async fn change_status(
        &self,
        unit_id: Uuid,
        change: StatusChange,
        actor: Option<Uuid>,
    ) -> UnitResult<InventoryUnit> {
        let label = change
            .status
            .map(|s| s.as_ref().to_lowercase())
            .unwrap_or_else(|| "unspecified".to_string());

        let result = self
            .store
            .modify(
                unit_id,
                Box::new(move |unit: &mut InventoryUnit| {
                    let transition = change.resolve(unit)?;
                    debug!(
                        unit_id = %unit.id,
                        from = %unit.status,
                        transition = transition.name(),
                        "Applying status change"
                    );
                    unit.apply(transition, change.notes.as_deref(), actor)
                }),
            )
            .await;

        observe(unit_id, &format!("change_status:{}", label), &result);
        result
    }

    pub async fn transfer_unit(
        &self,
        unit_id: Uuid,
        location_id: Uuid,
        actor: Option<Uuid>,
    ) -> UnitResult<InventoryUnit> {
        self.mutate(unit_id, Transition::TransferToLocation { location_id }, None, actor)
            .await
    }

    pub async fn block_rental(
        &self,
        unit_id: Uuid,
        reason: &str,
        blocked_by: Option<Uuid>,
    ) -> UnitResult<InventoryUnit> {
        let transition = Transition::BlockRental {
            reason: reason.to_string(),
        };
        self.mutate(unit_id, transition, None, blocked_by).await
    }

    pub async fn unblock_rental(
        &self,
        unit_id: Uuid,
        updated_by: Option<Uuid>,
    ) -> UnitResult<InventoryUnit> {
        self.mutate(unit_id, Transition::UnblockRental, None, updated_by)
            .await
    }

    pub async fn schedule_maintenance(
        &self,
        unit_id: Uuid,
        next_date: DateTime<Utc>,
        actor: Option<Uuid>,
    ) -> UnitResult<InventoryUnit> {
        self.mutate(unit_id, Transition::ScheduleMaintenance { next_date }, None, actor)
            .await
    }

    pub async fn retire(
        &self,
        unit_id: Uuid,
        reason: Option<&str>,
        actor: Option<Uuid>,
    ) -> UnitResult<InventoryUnit> {
        let transition = Transition::Retire {
            reason: reason.map(str::to_string),
        };
        self.mutate(unit_id, transition, None, actor).await
    }

    pub async fn add_note(
        &self,
        unit_id: Uuid,
        note: &str,
        actor: Option<Uuid>,
    ) -> UnitResult<InventoryUnit> {
        self.mutate(unit_id, Transition::Annotate, Some(note.to_string()), actor)
            .await
    }

    /// Persist a unit mutated outside the lock through its transitions.
    /// Fails with a retryable conflict if anyone wrote the unit after
    /// `expected_version` was read, and with a validation error if the unit
    /// was edited without a transition or its provenance fields changed.
    pub async fn save(
        &self,
        unit: &mut InventoryUnit,
        expected_version: i32,
    ) -> UnitResult<()> {
        let result = self.store.save(unit, expected_version).await;
        observe(unit.id, "save", &result);
        result
    }

    async fn mutate(
        &self,
        unit_id: Uuid,
        transition: Transition,
        note: Option<String>,
        actor: Option<Uuid>,
    ) -> UnitResult<InventoryUnit> {
        let name = transition.name();
        let result = self
            .store
            .modify(
                unit_id,
                Box::new(move |unit: &mut InventoryUnit| {
                    unit.apply(transition, note.as_deref(), actor)
                }),
            )
            .await;

        observe(unit_id, name, &result);
        result
    }

    // =========================================================================
    // CREATION
    // =========================================================================

    /// Create one unit, generating its SKU when `auto_generate_sku` is set.
    ///
    /// A generated SKU that loses an insert race is replaced by the next
    /// candidate, up to the configured attempt limit.
    pub async fn create_with_sku(
        &self,
        input: NewInventoryUnit,
        actor: Option<Uuid>,
    ) -> UnitResult<InventoryUnit> {
        if !input.auto_generate_sku {
            let sku = explicit_sku(&input)?;
            let mut unit = InventoryUnit::new(input, sku, actor)?;
            self.insert_logged(&mut unit).await?;
            return Ok(unit);
        }

        let mut taken = HashSet::new();
        let mut last_error = None;
        for _ in 0..self.sku_max_attempts {
            let sku = self
                .next_sku(input.item_id, input.sku_suffix.as_deref(), &taken)
                .await?;
            let mut unit = InventoryUnit::new(input.clone(), sku.clone(), actor)?;

            match self.insert_logged(&mut unit).await {
                Ok(()) => return Ok(unit),
                Err(err) if err.conflicting_field() == Some("sku") => {
                    metrics::record_sku_collision();
                    taken.insert(sku);
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| UnitError::duplicate("sku", "(generated)")))
    }

    /// Create several units in one unit of work.
    ///
    /// Any failure (invalid input, duplicate SKU or serial, within the batch
    /// or against existing units) aborts the whole batch; nothing is stored.
    pub async fn create_batch(
        &self,
        inputs: Vec<NewInventoryUnit>,
        actor: Option<Uuid>,
    ) -> UnitResult<Vec<InventoryUnit>> {
        if inputs.is_empty() {
            return Err(UnitError::validation("Batch must contain at least one unit"));
        }

        let mut taken_by_item: HashMap<Uuid, HashSet<String>> = HashMap::new();
        let mut skus_in_batch = HashSet::new();
        let mut units = Vec::with_capacity(inputs.len());

        for (index, input) in inputs.into_iter().enumerate() {
            let sku = if input.auto_generate_sku {
                let taken = taken_by_item.entry(input.item_id).or_default();
                let sku = self
                    .next_sku(input.item_id, input.sku_suffix.as_deref(), taken)
                    .await?;
                taken.insert(sku.clone());
                sku
            } else {
                explicit_sku(&input)?
            };

            if !skus_in_batch.insert(sku.clone()) {
                return Err(UnitError::duplicate("sku", sku));
            }

            let unit = InventoryUnit::new(input, sku, actor).map_err(|err| match err {
                UnitError::Validation(msg) => {
                    UnitError::Validation(format!("Batch entry {}: {}", index, msg))
                }
                other => other,
            })?;
            units.push(unit);
        }

        let count = units.len();
        match self.store.insert_batch(&mut units).await {
            Ok(()) => {
                metrics::record_units_created("batch", count);
                info!(count, "Inventory unit batch created");
                Ok(units)
            }
            Err(err) => {
                if let UnitError::Conflict(_) = &err {
                    metrics::record_conflict(err.kind());
                }
                warn!(count, error = %err, "Inventory unit batch rejected");
                Err(err)
            }
        }
    }

    async fn insert_logged(&self, unit: &mut InventoryUnit) -> UnitResult<()> {
        match self.store.insert(unit).await {
            Ok(()) => {
                metrics::record_units_created("single", 1);
                info!(unit_id = %unit.id, sku = %unit.sku, "Inventory unit created");
                Ok(())
            }
            Err(err) => {
                if let UnitError::Conflict(_) = &err {
                    metrics::record_conflict(err.kind());
                }
                warn!(sku = %unit.sku, error = %err, "Inventory unit insert rejected");
                Err(err)
            }
        }
    }

    // =========================================================================
    // IDENTIFIER GENERATION
    // =========================================================================

    /// Next free SKU for an item: `{base}-{suffix}` or `{base}-{0001}`.
    pub async fn generate_sku(&self, item_id: Uuid, suffix: Option<&str>) -> UnitResult<String> {
        self.next_sku(item_id, suffix, &HashSet::new()).await
    }

    /// Candidates skip anything in `taken` (SKUs already handed out in the
    /// current operation) and anything already stored. The number of
    /// candidates tried is bounded; running out is a hard conflict.
    async fn next_sku(
        &self,
        item_id: Uuid,
        suffix: Option<&str>,
        taken: &HashSet<String>,
    ) -> UnitResult<String> {
        let base = self
            .store
            .item_base_sku(item_id)
            .await?
            .ok_or_else(|| UnitError::not_found(format!("Item {} not found", item_id)))?;
        let suffix = suffix.map(str::trim).filter(|s| !s.is_empty());

        let existing = self.store.count_for_item(item_id).await?;
        let first_seq = existing + 1 + taken.len() as i64;

        let mut last = String::new();
        for attempt in 0..self.sku_max_attempts as i64 {
            let candidate = match suffix {
                Some(s) if attempt == 0 && taken.is_empty() => format!("{}-{}", base, s),
                Some(s) => format!("{}-{}-{}", base, s, taken.len() as i64 + attempt + 1),
                None => format!("{}-{:04}", base, first_seq + attempt),
            };

            if candidate.chars().count() > MAX_SKU_LEN {
                return Err(UnitError::validation(format!(
                    "Generated SKU '{}' exceeds {} characters",
                    candidate, MAX_SKU_LEN
                )));
            }

            if taken.contains(&candidate) || self.store.sku_exists(&candidate).await? {
                debug!(sku = %candidate, "Generated SKU already in use");
                metrics::record_sku_collision();
                last = candidate;
                continue;
            }
            return Ok(candidate);
        }

        warn!(%item_id, attempts = self.sku_max_attempts, "Could not allocate a unique SKU");
        metrics::record_conflict("duplicate");
        Err(UnitError::duplicate("sku", last))
    }

    /// Batch codes are grouping labels, not unique keys.
    pub fn generate_batch_code(&self, item_id: Uuid) -> String {
        let code = generate_batch_code_at(Utc::now());
        debug!(%item_id, batch_code = %code, "Generated batch code");
        code
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub async fn get(&self, unit_id: Uuid) -> UnitResult<InventoryUnit> {
        self.store
            .find(unit_id)
            .await?
            .ok_or_else(|| UnitError::not_found(format!("Inventory unit {} not found", unit_id)))
    }

    pub async fn find_by_sku(&self, sku: &str) -> UnitResult<Option<InventoryUnit>> {
        self.store.find_by_sku(sku).await
    }

    pub async fn find_by_serial_number(&self, serial: &str) -> UnitResult<Option<InventoryUnit>> {
        self.store.find_by_serial_number(serial).await
    }

    pub async fn find_by_batch_code(&self, batch_code: &str) -> UnitResult<Vec<InventoryUnit>> {
        let filter = UnitFilter {
            batch_code: Some(batch_code.to_string()),
            ..Default::default()
        };
        self.store.search(&filter).await
    }

    /// Active units whose next maintenance falls within `within_days`
    /// (overdue included), soonest first.
    pub async fn maintenance_due(&self, within_days: i64) -> UnitResult<Vec<InventoryUnit>> {
        let filter = UnitFilter {
            is_active: Some(true),
            maintenance_due_by: Some(Utc::now() + Duration::days(within_days)),
            order_by: UnitOrder::NextMaintenance,
            ..Default::default()
        };
        self.store.search(&filter).await
    }

    /// Active units whose warranty is still valid but ends within
    /// `within_days`, soonest first.
    pub async fn warranty_expiring(&self, within_days: i64) -> UnitResult<Vec<InventoryUnit>> {
        let now = Utc::now();
        let filter = UnitFilter {
            is_active: Some(true),
            warranty_expires_after: Some(now),
            warranty_expires_by: Some(now + Duration::days(within_days)),
            order_by: UnitOrder::WarrantyExpiry,
            ..Default::default()
        };
        self.store.search(&filter).await
    }

    /// Up to `quantity` units of an item that can be rented right now.
    pub async fn available_for_rental(
        &self,
        item_id: Uuid,
        location_id: Option<Uuid>,
        quantity: i64,
    ) -> UnitResult<Vec<InventoryUnit>> {
        if quantity <= 0 {
            return Err(UnitError::validation("Requested quantity must be positive"));
        }

        let filter = UnitFilter::rentable(item_id, location_id, quantity, Utc::now());
        self.store.search(&filter).await
    }

    pub async fn list(&self, filter: &UnitFilter) -> UnitResult<Vec<InventoryUnit>> {
        self.store.search(filter).await
    }

    pub async fn history(&self, unit_id: Uuid) -> UnitResult<Vec<UnitEvent>> {
        self.store.history(unit_id).await
    }
}

fn explicit_sku(input: &NewInventoryUnit) -> UnitResult<String> {
    input
        .sku
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| UnitError::validation("SKU is required unless auto_generate_sku is set"))
}

/// Log and count the outcome of a mutation.
fn observe<T>(unit_id: Uuid, operation: &str, result: &UnitResult<T>) {
    match result {
        Ok(_) => {
            metrics::record_transition(operation, "success");
            info!(%unit_id, operation, "Inventory unit updated");
        }
        Err(err @ UnitError::Validation(_)) | Err(err @ UnitError::NotFound(_)) => {
            metrics::record_transition(operation, "rejected");
            warn!(%unit_id, operation, error = %err, "Inventory unit change rejected");
        }
        Err(err @ UnitError::Conflict(_)) => {
            metrics::record_transition(operation, "conflict");
            metrics::record_conflict(err.kind());
            warn!(
                %unit_id,
                operation,
                retryable = err.is_retryable(),
                error = %err,
                "Inventory unit change conflicted"
            );
        }
        Err(err) => {
            metrics::record_transition(operation, "error");
            error!(%unit_id, operation, error = %err, "Inventory unit change failed");
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConflictKind;
    use crate::models::{UnitCondition, UnitEventKind, UnitStatus};
    use crate::store::InMemoryUnitStore;
    use rust_decimal_macros::dec;

    struct Fixture {
        repo: UnitRepository,
        item_id: Uuid,
        location_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryUnitStore::new());
        let item_id = Uuid::new_v4();
        store.register_item(item_id, "DRILL").await;
        Fixture {
            repo: UnitRepository::new(store),
            item_id,
            location_id: Uuid::new_v4(),
        }
    }

    impl Fixture {
        fn serialized(&self, sku: &str, serial: &str) -> NewInventoryUnit {
            NewInventoryUnit::new(self.item_id, self.location_id)
                .with_sku(sku)
                .with_serial_number(serial)
        }

        async fn create(&self, sku: &str, serial: &str) -> InventoryUnit {
            self.repo
                .create_with_sku(self.serialized(sku, serial), None)
                .await
                .unwrap()
        }
    }

    // -------------------------------------------------------------------------
    // CREATION
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn creates_serialized_unit() {
        let f = fixture().await;
        let unit = f.create("SKU-0001", "SN123").await;

        assert_eq!(unit.status, UnitStatus::Available);
        assert_eq!(unit.condition, UnitCondition::New);
        assert_eq!(unit.version, 1);
        assert_eq!(f.repo.get(unit.id).await.unwrap(), unit);
    }

    #[tokio::test]
    async fn serialized_quantity_must_be_one() {
        let f = fixture().await;
        let mut input = f.serialized("SKU-0001", "SN123");
        input.quantity = dec!(2);

        let err = f.repo.create_with_sku(input, None).await.unwrap_err();
        assert!(matches!(err, UnitError::Validation(_)));
        assert!(err.to_string().contains("Serialized items must have quantity of 1"));
        assert!(f.repo.find_by_sku("SKU-0001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_sku_and_serial_are_conflicts() {
        let f = fixture().await;
        f.create("SKU-0001", "SN123").await;

        let err = f
            .repo
            .create_with_sku(f.serialized("SKU-0001", "SN999"), None)
            .await
            .unwrap_err();
        assert_eq!(err.conflicting_field(), Some("sku"));

        let err = f
            .repo
            .create_with_sku(f.serialized("SKU-0002", "SN123"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UnitError::Conflict(ConflictKind::Duplicate { ref field, .. }) if field == "serial_number"
        ));
    }

    #[tokio::test]
    async fn duplicate_barcode_on_create_is_conflict() {
        let f = fixture().await;
        let mut first = f.serialized("SKU-1", "SN-1");
        first.barcode = Some("4006381333931".to_string());
        f.repo.create_with_sku(first, None).await.unwrap();

        let mut second = f.serialized("SKU-2", "SN-2");
        second.barcode = Some("4006381333931".to_string());
        let err = f.repo.create_with_sku(second, None).await.unwrap_err();
        assert_eq!(err.conflicting_field(), Some("barcode"));
        assert!(f.repo.find_by_sku("SKU-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn detached_edit_without_transition_is_not_saved() {
        let f = fixture().await;
        let unit = f.create("SKU-1", "SN-1").await;

        let mut edited = f.repo.get(unit.id).await.unwrap();
        edited.quantity = rust_decimal::Decimal::ZERO;
        let err = f.repo.save(&mut edited, 1).await.unwrap_err();
        assert!(matches!(err, UnitError::Validation(_)));
        assert_eq!(f.repo.get(unit.id).await.unwrap(), unit);
    }

    #[tokio::test]
    async fn missing_sku_without_auto_generation_is_rejected() {
        let f = fixture().await;
        let input = NewInventoryUnit::new(f.item_id, f.location_id).with_serial_number("SN1");
        let err = f.repo.create_with_sku(input, None).await.unwrap_err();
        assert!(matches!(err, UnitError::Validation(_)));
    }

    #[tokio::test]
    async fn generated_skus_follow_item_sequence() {
        let f = fixture().await;
        let first = NewInventoryUnit::new(f.item_id, f.location_id)
            .with_generated_sku()
            .with_serial_number("SN1");
        let second = NewInventoryUnit::new(f.item_id, f.location_id)
            .with_generated_sku()
            .with_serial_number("SN2");

        assert_eq!(f.repo.create_with_sku(first, None).await.unwrap().sku, "DRILL-0001");
        assert_eq!(f.repo.create_with_sku(second, None).await.unwrap().sku, "DRILL-0002");
    }

    #[tokio::test]
    async fn generated_sku_skips_taken_candidates() {
        let f = fixture().await;
        f.create("DRILL-0002", "SN-A").await;

        // One unit exists, so the first candidate is DRILL-0002, which is taken.
        assert_eq!(f.repo.generate_sku(f.item_id, None).await.unwrap(), "DRILL-0003");
        assert_eq!(
            f.repo.generate_sku(f.item_id, Some("RED")).await.unwrap(),
            "DRILL-RED"
        );
    }

    #[tokio::test]
    async fn sku_generation_gives_up_after_bounded_attempts() {
        let f = fixture().await;
        let repo = f.repo.clone().with_sku_max_attempts(1);
        f.create("DRILL-0002", "SN-A").await;

        let err = repo.generate_sku(f.item_id, None).await.unwrap_err();
        assert_eq!(err.conflicting_field(), Some("sku"));
    }

    #[tokio::test]
    async fn sku_generation_for_unknown_item_is_not_found() {
        let f = fixture().await;
        let err = f.repo.generate_sku(Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, UnitError::NotFound(_)));
    }

    #[tokio::test]
    async fn batch_with_generated_skus_gets_distinct_codes() {
        let f = fixture().await;
        let code = f.repo.generate_batch_code(f.item_id);
        let inputs = (0..3)
            .map(|_| {
                NewInventoryUnit::new(f.item_id, f.location_id)
                    .with_generated_sku()
                    .with_batch_code(code.clone(), dec!(25))
            })
            .collect();

        let units = f.repo.create_batch(inputs, None).await.unwrap();
        let skus: Vec<_> = units.iter().map(|u| u.sku.as_str()).collect();
        assert_eq!(skus, vec!["DRILL-0001", "DRILL-0002", "DRILL-0003"]);
        assert_eq!(f.repo.find_by_batch_code(&code).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn batch_collision_aborts_everything() {
        let f = fixture().await;
        f.create("SKU-9", "SN-EXISTING").await;

        let inputs = vec![
            f.serialized("SKU-1", "SN-1"),
            f.serialized("SKU-2", "SN-EXISTING"),
        ];
        let err = f.repo.create_batch(inputs, None).await.unwrap_err();
        assert_eq!(err.conflicting_field(), Some("serial_number"));
        assert!(f.repo.find_by_sku("SKU-1").await.unwrap().is_none());

        let inputs = vec![f.serialized("SKU-3", "SN-3"), f.serialized("SKU-3", "SN-4")];
        let err = f.repo.create_batch(inputs, None).await.unwrap_err();
        assert_eq!(err.conflicting_field(), Some("sku"));
        assert!(f.repo.find_by_sku("SKU-3").await.unwrap().is_none());
    }

    #[test]
    fn batch_code_format() {
        let now = "2026-10-16T08:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let code = generate_batch_code_at(now);
        assert!(code.starts_with("BATCH-20261016-"));
        let random = &code["BATCH-20261016-".len()..];
        assert_eq!(random.len(), 8);
        assert!(random.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    // -------------------------------------------------------------------------
    // STATUS CHANGES
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn rent_requires_customer() {
        let f = fixture().await;
        let unit = f.create("SKU-1", "SN-1").await;

        let err = f
            .repo
            .change_status(unit.id, StatusChange::to(UnitStatus::Rented), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("customer_id"));
        assert_eq!(f.repo.get(unit.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn change_status_on_missing_unit_is_not_found() {
        let f = fixture().await;
        let err = f
            .repo
            .change_status(Uuid::new_v4(), StatusChange::to(UnitStatus::Maintenance), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UnitError::NotFound(_)));
    }

    #[tokio::test]
    async fn rental_round_trip_through_change_status() {
        let f = fixture().await;
        let unit = f.create("SKU-1", "SN-1").await;
        let customer = Uuid::new_v4();
        let clerk = Some(Uuid::new_v4());

        let rented = f
            .repo
            .change_status(
                unit.id,
                StatusChange::to(UnitStatus::Rented)
                    .customer(customer)
                    .notes("weekend hire"),
                clerk,
            )
            .await
            .unwrap();
        assert_eq!(rented.current_holder_id, Some(customer));
        assert_eq!(rented.version, 2);
        assert_eq!(rented.updated_by, clerk);
        assert!(rented.notes.as_deref().unwrap().contains("weekend hire"));

        let returned = f
            .repo
            .change_status(
                unit.id,
                StatusChange::to(UnitStatus::Available)
                    .condition(UnitCondition::Good)
                    .rental_hours(dec!(48)),
                clerk,
            )
            .await
            .unwrap();
        assert_eq!(returned.status, UnitStatus::Available);
        assert_eq!(returned.current_holder_id, None);
        assert_eq!(returned.total_rental_count, 1);
        assert_eq!(returned.total_rental_hours, dec!(48));
        assert_eq!(returned.version, 3);

        let history = f.repo.history(unit.id).await.unwrap();
        let kinds: Vec<_> = history.iter().map(|e| e.kind.name()).collect();
        assert_eq!(kinds, vec!["created", "rented_out", "returned"]);
        assert_eq!(history[1].note.as_deref(), Some("weekend hire"));
        assert_eq!(history[1].actor_id, clerk);
    }

    #[tokio::test]
    async fn repair_cycle_through_change_status() {
        let f = fixture().await;
        let unit = f.create("SKU-1", "SN-1").await;

        let damaged = f
            .repo
            .change_status(
                unit.id,
                StatusChange::to(UnitStatus::Damaged).condition(UnitCondition::Poor),
                None,
            )
            .await
            .unwrap();
        assert_eq!(damaged.condition, UnitCondition::Poor);

        f.repo
            .change_status(unit.id, StatusChange::to(UnitStatus::UnderRepair), None)
            .await
            .unwrap();

        let repaired = f
            .repo
            .change_status(
                unit.id,
                StatusChange::to(UnitStatus::Available).condition(UnitCondition::Excellent),
                None,
            )
            .await
            .unwrap();
        assert_eq!(repaired.status, UnitStatus::Available);
        assert_eq!(repaired.condition, UnitCondition::Excellent);
        assert_eq!(repaired.version, 4);
    }

    #[tokio::test]
    async fn concurrent_rentals_have_exactly_one_winner() {
        let f = fixture().await;
        let unit = f.create("SKU-1", "SN-1").await;
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());

        let (a, b) = tokio::join!(
            f.repo
                .change_status(unit.id, StatusChange::to(UnitStatus::Rented).customer(x), None),
            f.repo
                .change_status(unit.id, StatusChange::to(UnitStatus::Rented).customer(y), None),
        );

        let (winner, loser) = match (&a, &b) {
            (Ok(_), Err(err)) => (x, err),
            (Err(err), Ok(_)) => (y, err),
            other => panic!("expected exactly one success, got {:?}", other),
        };
        assert!(loser.to_string().contains("cannot be rented"));

        let stored = f.repo.get(unit.id).await.unwrap();
        assert_eq!(stored.current_holder_id, Some(winner));
        assert_eq!(stored.total_rental_count, 1);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn stale_detached_save_is_retryable_conflict() {
        let f = fixture().await;
        let unit = f.create("SKU-1", "SN-1").await;

        let mut stale = f.repo.get(unit.id).await.unwrap();
        let read_version = stale.version;
        f.repo
            .block_rental(unit.id, "audit", None)
            .await
            .unwrap();

        stale.schedule_maintenance(Utc::now() + Duration::days(7), None).unwrap();
        let err = f.repo.save(&mut stale, read_version).await.unwrap_err();
        assert!(err.is_retryable());

        // Re-read and retry wins, and the block survives.
        let mut fresh = f.repo.get(unit.id).await.unwrap();
        let read_version = fresh.version;
        fresh.schedule_maintenance(Utc::now() + Duration::days(7), None).unwrap();
        f.repo.save(&mut fresh, read_version).await.unwrap();

        let stored = f.repo.get(unit.id).await.unwrap();
        assert!(stored.is_rental_blocked);
        assert!(stored.next_maintenance_date.is_some());
        assert_eq!(stored.version, 3);
    }

    #[tokio::test]
    async fn double_retire_is_rejected() {
        let f = fixture().await;
        let unit = f.create("SKU-1", "SN-1").await;

        let retired = f.repo.retire(unit.id, Some("worn out"), None).await.unwrap();
        assert!(!retired.is_active);

        let err = f.repo.retire(unit.id, None, None).await.unwrap_err();
        assert!(matches!(err, UnitError::Validation(_)));
        assert_eq!(f.repo.get(unit.id).await.unwrap().version, retired.version);
    }

    #[tokio::test]
    async fn wrappers_apply_entity_rules() {
        let f = fixture().await;
        let unit = f.create("SKU-1", "SN-1").await;
        let new_location = Uuid::new_v4();

        let moved = f.repo.transfer_unit(unit.id, new_location, None).await.unwrap();
        assert_eq!(moved.location_id, new_location);
        assert_eq!(moved.original_location_id, f.location_id);

        let err = f
            .repo
            .schedule_maintenance(unit.id, Utc::now() - Duration::days(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UnitError::Validation(_)));

        f.repo.block_rental(unit.id, "recall", None).await.unwrap();
        let unblocked = f.repo.unblock_rental(unit.id, None).await.unwrap();
        assert!(!unblocked.is_rental_blocked);

        let noted = f.repo.add_note(unit.id, "label replaced", None).await.unwrap();
        assert_eq!(noted.version, 5);

        let history = f.repo.history(unit.id).await.unwrap();
        assert_eq!(
            history.last().map(|e| e.kind.clone()),
            Some(UnitEventKind::Noted)
        );
    }

    // -------------------------------------------------------------------------
    // QUERIES
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn available_for_rental_filters_and_caps() {
        let f = fixture().await;
        let ok_a = f.create("SKU-A", "SN-A").await;
        let ok_b = f.create("SKU-B", "SN-B").await;
        f.create("SKU-C", "SN-C").await;

        let blocked = f.create("SKU-D", "SN-D").await;
        f.repo.block_rental(blocked.id, "hold", None).await.unwrap();

        let mut overdue = f.serialized("SKU-E", "SN-E");
        overdue.next_maintenance_date = Some(Utc::now() - Duration::days(1));
        f.repo.create_with_sku(overdue, None).await.unwrap();

        let mut worn = f.serialized("SKU-F", "SN-F");
        worn.condition = UnitCondition::Fair;
        f.repo.create_with_sku(worn, None).await.unwrap();

        let all = f.repo.available_for_rental(f.item_id, None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|u| u.can_be_rented()));

        let two = f
            .repo
            .available_for_rental(f.item_id, Some(f.location_id), 2)
            .await
            .unwrap();
        let ids: Vec<_> = two.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![ok_a.id, ok_b.id]);

        assert!(f.repo.available_for_rental(f.item_id, None, 0).await.is_err());
    }

    #[tokio::test]
    async fn maintenance_and_warranty_windows() {
        let f = fixture().await;
        let now = Utc::now();

        let mut soon = f.serialized("SKU-1", "SN-1");
        soon.next_maintenance_date = Some(now + Duration::days(3));
        soon.warranty_expiry = Some(now + Duration::days(20));
        let soon = f.repo.create_with_sku(soon, None).await.unwrap();

        let mut later = f.serialized("SKU-2", "SN-2");
        later.next_maintenance_date = Some(now + Duration::days(60));
        later.warranty_expiry = Some(now - Duration::days(1));
        f.repo.create_with_sku(later, None).await.unwrap();

        let due = f.repo.maintenance_due(7).await.unwrap();
        assert_eq!(due.iter().map(|u| u.id).collect::<Vec<_>>(), vec![soon.id]);

        let expiring = f.repo.warranty_expiring(30).await.unwrap();
        assert_eq!(expiring.iter().map(|u| u.id).collect::<Vec<_>>(), vec![soon.id]);
    }

    #[tokio::test]
    async fn list_combines_filters() {
        let f = fixture().await;
        let mut cheap = f.serialized("SKU-1", "SN-1");
        cheap.purchase_price = dec!(100);
        f.repo.create_with_sku(cheap, None).await.unwrap();

        let mut pricey = f.serialized("SKU-2", "SN-2");
        pricey.purchase_price = dec!(900);
        let pricey = f.repo.create_with_sku(pricey, None).await.unwrap();
        f.repo
            .change_status(pricey.id, StatusChange::to(UnitStatus::Maintenance), None)
            .await
            .unwrap();

        let filter = UnitFilter {
            item_id: Some(f.item_id),
            min_price: Some(dec!(500)),
            status: Some(UnitStatus::Maintenance),
            ..Default::default()
        };
        let found = f.repo.list(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sku, "SKU-2");

        assert!(f.repo.find_by_serial_number("SN-1").await.unwrap().is_some());
        assert!(f.repo.find_by_serial_number("SN-404").await.unwrap().is_none());
    }
}
