// =============================================================================
// STORE MODULE
// =============================================================================
// The persistence seam between the repository and a concrete backend.
//
// Two implementations:
// - `db::Database`      : PostgreSQL through SQLx (production)
// - `InMemoryUnitStore` : mutex-guarded maps (tests, embedding)
//
// Both follow the same write discipline: a mutation locks the unit, applies
// the entity transition, and writes back only if the version is still the one
// that was read. A version mismatch surfaces as a retryable conflict.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{UnitError, UnitResult};
use crate::models::{InventoryUnit, UnitEvent, UnitFilter};

/// Entity mutation run while the unit is locked.
pub type UnitMutation<'a> =
    Box<dyn FnOnce(&mut InventoryUnit) -> UnitResult<()> + Send + 'a>;

// =============================================================================
// STORE TRAIT
// =============================================================================
#[async_trait]
pub trait UnitStore: Send + Sync {
    /// Insert a new unit. Duplicate sku / serial_number / barcode is a conflict.
    async fn insert(&self, unit: &mut InventoryUnit) -> UnitResult<()>;

    /// Insert all units or none.
    async fn insert_batch(&self, units: &mut [InventoryUnit]) -> UnitResult<()>;

    async fn find(&self, id: Uuid) -> UnitResult<Option<InventoryUnit>>;

    /// Lock the unit, run `mutation` on it and persist the result with a
    /// version check. Returns the unit as persisted.
    async fn modify(&self, id: Uuid, mutation: UnitMutation<'_>) -> UnitResult<InventoryUnit>;

    /// Persist a unit that was loaded and mutated without a lock. Succeeds
    /// only when the stored version still equals `expected_version`.
    async fn save(&self, unit: &mut InventoryUnit, expected_version: i32) -> UnitResult<()>;

    async fn search(&self, filter: &UnitFilter) -> UnitResult<Vec<InventoryUnit>>;

    async fn find_by_sku(&self, sku: &str) -> UnitResult<Option<InventoryUnit>>;

    async fn find_by_serial_number(&self, serial: &str) -> UnitResult<Option<InventoryUnit>>;

    async fn sku_exists(&self, sku: &str) -> UnitResult<bool>;

    async fn count_for_item(&self, item_id: Uuid) -> UnitResult<i64>;

    /// Base SKU of the owning item, `None` if the item is unknown.
    async fn item_base_sku(&self, item_id: Uuid) -> UnitResult<Option<String>>;

    /// History of a unit, oldest first.
    async fn history(&self, unit_id: Uuid) -> UnitResult<Vec<UnitEvent>>;

    /// Backend reachability for readiness probes.
    async fn ping(&self) -> bool;
}

// =============================================================================
// DETACHED SAVE CHECK
// =============================================================================
/// Gate for `UnitStore::save`, run against the stored row while it is locked.
///
/// The stored version must still be `expected_version`. The incoming unit
/// must have advanced through transitions only: one pending event per
/// version step. Identity and provenance fields must match the stored row,
/// and the unit must pass `validate()`.
pub fn verify_detached_save(
    stored: &InventoryUnit,
    unit: &InventoryUnit,
    expected_version: i32,
) -> UnitResult<()> {
    if stored.version != expected_version {
        return Err(UnitError::version_mismatch(unit.id, expected_version));
    }

    let steps = i64::from(unit.version) - i64::from(expected_version);
    if steps < 1 || unit.pending_events().len() as i64 != steps {
        return Err(UnitError::validation(format!(
            "Unit {} must be changed through its transitions before saving",
            unit.id
        )));
    }

    let immutable = [
        ("item_id", stored.item_id == unit.item_id),
        (
            "original_location_id",
            stored.original_location_id == unit.original_location_id,
        ),
        ("created_at", stored.created_at == unit.created_at),
        ("created_by", stored.created_by == unit.created_by),
    ];
    if let Some((field, _)) = immutable.iter().find(|(_, same)| !same) {
        return Err(UnitError::validation(format!("{} cannot be changed", field)));
    }

    unit.validate()
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================
#[derive(Default)]
struct MemoryState {
    units: HashMap<Uuid, InventoryUnit>,
    items: HashMap<Uuid, String>,
    events: Vec<UnitEvent>,
}

impl MemoryState {
    /// Same uniqueness rules as the database constraints.
    fn check_unique(&self, unit: &InventoryUnit) -> UnitResult<()> {
        for other in self.units.values().filter(|u| u.id != unit.id) {
            if other.sku == unit.sku {
                return Err(UnitError::duplicate("sku", &unit.sku));
            }
            if let (Some(a), Some(b)) = (&unit.serial_number, &other.serial_number) {
                if a == b {
                    return Err(UnitError::duplicate("serial_number", a));
                }
            }
            if let (Some(a), Some(b)) = (&unit.barcode, &other.barcode) {
                if a == b {
                    return Err(UnitError::duplicate("barcode", a));
                }
            }
        }
        Ok(())
    }

    fn store(&mut self, unit: &mut InventoryUnit) {
        self.events.extend(unit.take_pending_events());
        self.units.insert(unit.id, unit.clone());
    }
}

/// Store backed by process memory. A single mutex serialises writers, which
/// plays the role of the row lock.
#[derive(Default)]
pub struct InMemoryUnitStore {
    state: Mutex<MemoryState>,
}

impl InMemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an item known so SKUs can be generated for it.
    pub async fn register_item(&self, item_id: Uuid, base_sku: impl Into<String>) {
        self.state.lock().await.items.insert(item_id, base_sku.into());
    }
}

#[async_trait]
impl UnitStore for InMemoryUnitStore {
    async fn insert(&self, unit: &mut InventoryUnit) -> UnitResult<()> {
        let mut state = self.state.lock().await;
        if state.units.contains_key(&unit.id) {
            return Err(UnitError::duplicate("id", unit.id.to_string()));
        }
        state.check_unique(unit)?;
        state.store(unit);
        Ok(())
    }

    async fn insert_batch(&self, units: &mut [InventoryUnit]) -> UnitResult<()> {
        let mut state = self.state.lock().await;

        // Validate everything against the store and against each other
        // before touching anything.
        let mut staged = MemoryState::default();
        for unit in units.iter() {
            if state.units.contains_key(&unit.id) {
                return Err(UnitError::duplicate("id", unit.id.to_string()));
            }
            state.check_unique(unit)?;
            staged.check_unique(unit)?;
            staged.units.insert(unit.id, unit.clone());
        }

        for unit in units.iter_mut() {
            state.store(unit);
        }
        Ok(())
    }

    async fn find(&self, id: Uuid) -> UnitResult<Option<InventoryUnit>> {
        Ok(self.state.lock().await.units.get(&id).cloned())
    }

    async fn modify(&self, id: Uuid, mutation: UnitMutation<'_>) -> UnitResult<InventoryUnit> {
        let mut state = self.state.lock().await;
        let mut unit = state
            .units
            .get(&id)
            .cloned()
            .ok_or_else(|| UnitError::not_found(format!("Inventory unit {} not found", id)))?;

        mutation(&mut unit)?;
        state.check_unique(&unit)?;
        state.store(&mut unit);
        Ok(unit)
    }

    async fn save(&self, unit: &mut InventoryUnit, expected_version: i32) -> UnitResult<()> {
        let mut state = self.state.lock().await;
        let current = state
            .units
            .get(&unit.id)
            .ok_or_else(|| UnitError::not_found(format!("Inventory unit {} not found", unit.id)))?;

        verify_detached_save(current, unit, expected_version)?;
        state.check_unique(unit)?;
        state.store(unit);
        Ok(())
    }

    async fn search(&self, filter: &UnitFilter) -> UnitResult<Vec<InventoryUnit>> {
        let state = self.state.lock().await;
        let matched = state
            .units
            .values()
            .filter(|u| filter.matches(u))
            .cloned()
            .collect();
        Ok(filter.apply_window(matched))
    }

    async fn find_by_sku(&self, sku: &str) -> UnitResult<Option<InventoryUnit>> {
        let state = self.state.lock().await;
        Ok(state.units.values().find(|u| u.sku == sku).cloned())
    }

    async fn find_by_serial_number(&self, serial: &str) -> UnitResult<Option<InventoryUnit>> {
        let state = self.state.lock().await;
        Ok(state
            .units
            .values()
            .find(|u| u.serial_number.as_deref() == Some(serial))
            .cloned())
    }

    async fn sku_exists(&self, sku: &str) -> UnitResult<bool> {
        Ok(self.find_by_sku(sku).await?.is_some())
    }

    async fn count_for_item(&self, item_id: Uuid) -> UnitResult<i64> {
        let state = self.state.lock().await;
        Ok(state.units.values().filter(|u| u.item_id == item_id).count() as i64)
    }

    async fn item_base_sku(&self, item_id: Uuid) -> UnitResult<Option<String>> {
        Ok(self.state.lock().await.items.get(&item_id).cloned())
    }

    async fn history(&self, unit_id: Uuid) -> UnitResult<Vec<UnitEvent>> {
        let state = self.state.lock().await;
        let mut events: Vec<_> = state
            .events
            .iter()
            .filter(|e| e.unit_id == unit_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewInventoryUnit;
    use rust_decimal::Decimal;

    fn unit(sku: &str, serial: &str) -> InventoryUnit {
        let input = NewInventoryUnit::new(Uuid::new_v4(), Uuid::new_v4()).with_serial_number(serial);
        InventoryUnit::new(input, sku.to_string(), None).unwrap()
    }

    #[tokio::test]
    async fn insert_moves_pending_events_into_history() {
        let store = InMemoryUnitStore::new();
        let mut u = unit("SKU-1", "SN-1");
        store.insert(&mut u).await.unwrap();

        assert!(u.pending_events().is_empty());
        let history = store.history(u.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind.name(), "created");
    }

    #[tokio::test]
    async fn failed_batch_inserts_nothing() {
        let store = InMemoryUnitStore::new();
        let mut batch = vec![unit("SKU-1", "SN-1"), unit("SKU-2", "SN-2"), unit("SKU-1", "SN-3")];

        let err = store.insert_batch(&mut batch).await.unwrap_err();
        assert_eq!(err.conflicting_field(), Some("sku"));
        assert!(store.search(&UnitFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_save_is_a_version_conflict() {
        let store = InMemoryUnitStore::new();
        let mut u = unit("SKU-1", "SN-1");
        store.insert(&mut u).await.unwrap();

        let mut stale = store.find(u.id).await.unwrap().unwrap();
        store
            .modify(u.id, Box::new(|x: &mut InventoryUnit| x.add_note("first writer", None)))
            .await
            .unwrap();

        stale.add_note("second writer", None).unwrap();
        let err = store.save(&mut stale, 1).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn second_detached_writer_loses() {
        let store = InMemoryUnitStore::new();
        let mut u = unit("SKU-1", "SN-1");
        store.insert(&mut u).await.unwrap();

        let mut a = store.find(u.id).await.unwrap().unwrap();
        let mut b = store.find(u.id).await.unwrap().unwrap();
        a.block_rental("audit", None).unwrap();
        b.add_note("relabelled", None).unwrap();

        store.save(&mut a, 1).await.unwrap();
        let err = store.save(&mut b, 1).await.unwrap_err();
        assert!(err.is_retryable());

        let stored = store.find(u.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert!(stored.is_rental_blocked);
        assert_eq!(store.history(u.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn save_without_transition_is_rejected() {
        let store = InMemoryUnitStore::new();
        let mut u = unit("SKU-1", "SN-1");
        store.insert(&mut u).await.unwrap();

        let mut edited = store.find(u.id).await.unwrap().unwrap();
        edited.barcode = Some("B".to_string());
        let err = store.save(&mut edited, 1).await.unwrap_err();
        assert!(matches!(err, UnitError::Validation(_)));

        let stored = store.find(u.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.barcode, None);
    }

    #[tokio::test]
    async fn save_rejects_invalid_or_rewritten_units() {
        let store = InMemoryUnitStore::new();
        let mut u = unit("SKU-1", "SN-1");
        store.insert(&mut u).await.unwrap();

        let mut zero = store.find(u.id).await.unwrap().unwrap();
        zero.add_note("recount", None).unwrap();
        zero.quantity = Decimal::ZERO;
        let err = store.save(&mut zero, 1).await.unwrap_err();
        assert!(err.to_string().contains("Quantity must be positive"));

        let mut moved = store.find(u.id).await.unwrap().unwrap();
        moved.add_note("rehomed", None).unwrap();
        moved.original_location_id = Uuid::new_v4();
        let err = store.save(&mut moved, 1).await.unwrap_err();
        assert!(err.to_string().contains("original_location_id"));

        let mut reparented = store.find(u.id).await.unwrap().unwrap();
        reparented.add_note("wrong item", None).unwrap();
        reparented.item_id = Uuid::new_v4();
        let err = store.save(&mut reparented, 1).await.unwrap_err();
        assert!(err.to_string().contains("item_id"));

        let stored = store.find(u.id).await.unwrap().unwrap();
        assert_eq!(stored, u);
    }

    #[test]
    fn detached_save_accepts_several_transitions() {
        let mut stored = unit("SKU-1", "SN-1");
        stored.take_pending_events();
        let mut working = stored.clone();

        working.block_rental("audit", None).unwrap();
        working.unblock_rental(None).unwrap();
        verify_detached_save(&stored, &working, 1).unwrap();

        stored.version = 2;
        let err = verify_detached_save(&stored, &working, 1).unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn duplicate_barcode_is_conflict() {
        let store = InMemoryUnitStore::new();
        let mut first = unit("SKU-1", "SN-1");
        first.barcode = Some("0123456789".to_string());
        store.insert(&mut first).await.unwrap();

        let mut second = unit("SKU-2", "SN-2");
        second.barcode = Some("0123456789".to_string());
        let err = store.insert(&mut second).await.unwrap_err();
        assert_eq!(err.conflicting_field(), Some("barcode"));
    }
}
