// =============================================================================
// MODELS MODULE
// =============================================================================
// Data structures for inventory units: the persisted unit itself, the inputs
// that create and mutate it, the structured history, and the query filter.
//
// The behaviour (state machine, predicates, validation) lives in `unit.rs`.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::error::{UnitError, UnitResult};

// =============================================================================
// ENUMS
// =============================================================================
// Status and condition are closed sets. Both travel as SCREAMING_SNAKE_CASE
// strings in JSON and in the database (`AVAILABLE`, `UNDER_REPAIR`, ...).

/// Lifecycle state of a single unit. RETIRED is terminal.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    Available,
    Rented,
    Sold,
    Maintenance,
    Damaged,
    UnderRepair,
    BeyondRepair,
    Retired,
    Reserved,
}

/// Physical condition, best to worst.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitCondition {
    New,
    Excellent,
    Good,
    Fair,
    Poor,
    Damaged,
}

/// Conditions a unit may be rented out in.
pub const RENTAL_ACCEPTABLE_CONDITIONS: [UnitCondition; 3] = [
    UnitCondition::New,
    UnitCondition::Excellent,
    UnitCondition::Good,
];

impl UnitCondition {
    pub fn is_rental_acceptable(&self) -> bool {
        RENTAL_ACCEPTABLE_CONDITIONS.contains(self)
    }
}

// =============================================================================
// INVENTORY UNIT
// =============================================================================
// One trackable physical item (serialized) or one lot of fungible stock
// (batch). Fields are public for reading; mutation goes through the named
// transitions in `unit.rs`, which re-validate everything before committing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryUnit {
    pub id: Uuid,
    pub item_id: Uuid,
    pub location_id: Uuid,

    /// Unique stock keeping unit, at most 50 characters
    pub sku: String,
    pub serial_number: Option<String>,
    pub batch_code: Option<String>,
    pub barcode: Option<String>,

    pub status: UnitStatus,
    pub condition: UnitCondition,

    /// Always 1 for serialized units
    pub quantity: Decimal,

    // ----- Purchase -----
    pub purchase_date: Option<DateTime<Utc>>,
    pub purchase_price: Decimal,
    pub supplier_id: Option<Uuid>,
    pub purchase_order_number: Option<String>,

    // ----- Pricing overrides -----
    pub sale_price: Option<Decimal>,
    pub rental_rate_per_period: Option<Decimal>,
    /// Rental period length in days
    pub rental_period: i32,
    pub security_deposit: Decimal,

    // ----- Maintenance & usage -----
    pub last_maintenance_date: Option<DateTime<Utc>>,
    pub next_maintenance_date: Option<DateTime<Utc>>,
    pub total_rental_hours: Decimal,
    pub total_rental_count: i32,

    // ----- Warranty -----
    pub warranty_expiry: Option<DateTime<Utc>>,
    pub warranty_provider: Option<String>,
    pub warranty_terms: Option<String>,

    // ----- Rental block -----
    pub is_rental_blocked: bool,
    pub rental_block_reason: Option<String>,
    pub rental_blocked_at: Option<DateTime<Utc>>,
    pub rental_blocked_by: Option<Uuid>,

    // ----- Location tracking -----
    /// Set from `location_id` at creation, never changed afterwards
    pub original_location_id: Uuid,
    /// Customer holding the unit; only set while RENTED
    pub current_holder_id: Option<Uuid>,

    /// Free-text notes kept for display; the structured trail is `UnitEvent`
    pub notes: Option<String>,

    /// Optimistic concurrency counter, starts at 1
    pub version: i32,
    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<Uuid>,
    pub updated_by: Option<Uuid>,

    /// History entries produced since the unit was loaded, drained by the
    /// store when it persists the unit.
    #[serde(skip)]
    pub(crate) pending_events: Vec<UnitEvent>,
}

// =============================================================================
// CREATION INPUT
// =============================================================================
/// Request to create one unit.
///
/// # Example JSON
/// ```json
/// {
///   "item_id": "0b6c...",
///   "location_id": "5f1e...",
///   "sku": "SKU-0001",
///   "serial_number": "SN123"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInventoryUnit {
    pub item_id: Uuid,
    pub location_id: Uuid,

    /// Explicit SKU; required unless `auto_generate_sku` is set
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub auto_generate_sku: bool,
    /// Replaces the sequence number in a generated SKU
    #[serde(default)]
    pub sku_suffix: Option<String>,

    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub batch_code: Option<String>,
    #[serde(default)]
    pub barcode: Option<String>,

    #[serde(default = "default_condition")]
    pub condition: UnitCondition,
    #[serde(default = "default_quantity")]
    pub quantity: Decimal,

    #[serde(default)]
    pub purchase_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub purchase_price: Decimal,
    #[serde(default)]
    pub supplier_id: Option<Uuid>,
    #[serde(default)]
    pub purchase_order_number: Option<String>,

    #[serde(default)]
    pub sale_price: Option<Decimal>,
    #[serde(default)]
    pub rental_rate_per_period: Option<Decimal>,
    #[serde(default = "default_rental_period")]
    pub rental_period: i32,
    #[serde(default)]
    pub security_deposit: Decimal,

    #[serde(default)]
    pub next_maintenance_date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub warranty_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub warranty_provider: Option<String>,
    #[serde(default)]
    pub warranty_terms: Option<String>,

    #[serde(default)]
    pub notes: Option<String>,
}

fn default_condition() -> UnitCondition {
    UnitCondition::New
}

fn default_quantity() -> Decimal {
    Decimal::ONE
}

fn default_rental_period() -> i32 {
    1
}

impl NewInventoryUnit {
    /// Minimal input with every optional field at its default.
    pub fn new(item_id: Uuid, location_id: Uuid) -> Self {
        Self {
            item_id,
            location_id,
            sku: None,
            auto_generate_sku: false,
            sku_suffix: None,
            serial_number: None,
            batch_code: None,
            barcode: None,
            condition: default_condition(),
            quantity: default_quantity(),
            purchase_date: None,
            purchase_price: Decimal::ZERO,
            supplier_id: None,
            purchase_order_number: None,
            sale_price: None,
            rental_rate_per_period: None,
            rental_period: default_rental_period(),
            security_deposit: Decimal::ZERO,
            next_maintenance_date: None,
            warranty_expiry: None,
            warranty_provider: None,
            warranty_terms: None,
            notes: None,
        }
    }

    pub fn with_sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }

    pub fn with_generated_sku(mut self) -> Self {
        self.auto_generate_sku = true;
        self
    }

    pub fn with_serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    pub fn with_batch_code(mut self, code: impl Into<String>, quantity: Decimal) -> Self {
        self.batch_code = Some(code.into());
        self.quantity = quantity;
        self
    }
}

// =============================================================================
// STATUS CHANGE REQUEST
// =============================================================================
/// Input to `UnitRepository::change_status`. Which optional fields matter
/// depends on the target status: RENTED needs `customer_id`; AVAILABLE reads
/// `condition` and `rental_hours` when the unit comes back from a rental.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: Option<UnitStatus>,
    #[serde(default)]
    pub customer_id: Option<Uuid>,
    #[serde(default)]
    pub condition: Option<UnitCondition>,
    #[serde(default)]
    pub rental_hours: Option<Decimal>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl StatusChange {
    pub fn to(status: UnitStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn customer(mut self, customer_id: Uuid) -> Self {
        self.customer_id = Some(customer_id);
        self
    }

    pub fn condition(mut self, condition: UnitCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn rental_hours(mut self, hours: Decimal) -> Self {
        self.rental_hours = Some(hours);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Pick the entity transition for this request given the unit's current
    /// state. Fails when a field the target status needs is missing.
    pub fn resolve(&self, unit: &InventoryUnit) -> UnitResult<Transition> {
        let target = self
            .status
            .ok_or_else(|| UnitError::validation("target status is required"))?;

        let transition = match target {
            UnitStatus::Rented => {
                let customer_id = self.customer_id.ok_or_else(|| {
                    UnitError::validation("customer_id is required to rent out a unit")
                })?;
                Transition::RentOut { customer_id }
            }
            UnitStatus::Available => match unit.status {
                UnitStatus::Rented => Transition::ReturnFromRent {
                    condition: self.condition,
                    rental_hours: self.rental_hours.unwrap_or(Decimal::ZERO),
                },
                UnitStatus::UnderRepair => Transition::CompleteRepair {
                    condition: self.condition.unwrap_or(unit.condition),
                },
                _ => Transition::SetStatus {
                    status: UnitStatus::Available,
                },
            },
            UnitStatus::UnderRepair => Transition::SendForRepair,
            UnitStatus::Damaged => Transition::MarkDamaged {
                severity: self.condition.unwrap_or(UnitCondition::Damaged),
            },
            UnitStatus::Retired => Transition::Retire {
                reason: self.reason.clone(),
            },
            UnitStatus::Maintenance
            | UnitStatus::Reserved
            | UnitStatus::Sold
            | UnitStatus::BeyondRepair => Transition::SetStatus { status: target },
        };

        Ok(transition)
    }
}

// =============================================================================
// TRANSITIONS
// =============================================================================
/// Every way a unit can be mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    RentOut {
        customer_id: Uuid,
    },
    ReturnFromRent {
        condition: Option<UnitCondition>,
        rental_hours: Decimal,
    },
    MarkDamaged {
        severity: UnitCondition,
    },
    SendForRepair,
    CompleteRepair {
        condition: UnitCondition,
    },
    Retire {
        reason: Option<String>,
    },
    BlockRental {
        reason: String,
    },
    UnblockRental,
    ScheduleMaintenance {
        next_date: DateTime<Utc>,
    },
    TransferToLocation {
        location_id: Uuid,
    },
    SetStatus {
        status: UnitStatus,
    },
    /// Free-text note with no other effect
    Annotate,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::RentOut { .. } => "rent_out",
            Transition::ReturnFromRent { .. } => "return_from_rent",
            Transition::MarkDamaged { .. } => "mark_damaged",
            Transition::SendForRepair => "send_for_repair",
            Transition::CompleteRepair { .. } => "complete_repair",
            Transition::Retire { .. } => "retire",
            Transition::BlockRental { .. } => "block_rental",
            Transition::UnblockRental => "unblock_rental",
            Transition::ScheduleMaintenance { .. } => "schedule_maintenance",
            Transition::TransferToLocation { .. } => "transfer_location",
            Transition::SetStatus { .. } => "set_status",
            Transition::Annotate => "annotate",
        }
    }
}

// =============================================================================
// HISTORY
// =============================================================================
/// One append-only history entry. `version` is the unit version the change
/// produced, so (unit_id, version) identifies an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitEvent {
    pub unit_id: Uuid,
    pub version: i32,
    pub occurred_at: DateTime<Utc>,
    pub actor_id: Option<Uuid>,
    pub kind: UnitEventKind,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitEventKind {
    Created {
        sku: String,
    },
    RentedOut {
        customer_id: Uuid,
    },
    Returned {
        customer_id: Option<Uuid>,
        condition: UnitCondition,
        rental_hours: Decimal,
    },
    MarkedDamaged {
        severity: UnitCondition,
    },
    SentForRepair,
    RepairCompleted {
        condition: UnitCondition,
    },
    Retired {
        reason: Option<String>,
    },
    RentalBlocked {
        reason: String,
    },
    RentalUnblocked,
    MaintenanceScheduled {
        next_date: DateTime<Utc>,
    },
    Transferred {
        from_location_id: Uuid,
        to_location_id: Uuid,
    },
    StatusChanged {
        from: UnitStatus,
        to: UnitStatus,
    },
    Noted,
}

impl UnitEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            UnitEventKind::Created { .. } => "created",
            UnitEventKind::RentedOut { .. } => "rented_out",
            UnitEventKind::Returned { .. } => "returned",
            UnitEventKind::MarkedDamaged { .. } => "marked_damaged",
            UnitEventKind::SentForRepair => "sent_for_repair",
            UnitEventKind::RepairCompleted { .. } => "repair_completed",
            UnitEventKind::Retired { .. } => "retired",
            UnitEventKind::RentalBlocked { .. } => "rental_blocked",
            UnitEventKind::RentalUnblocked => "rental_unblocked",
            UnitEventKind::MaintenanceScheduled { .. } => "maintenance_scheduled",
            UnitEventKind::Transferred { .. } => "transferred",
            UnitEventKind::StatusChanged { .. } => "status_changed",
            UnitEventKind::Noted => "noted",
        }
    }
}

// =============================================================================
// QUERY FILTER
// =============================================================================
/// Sort order for filtered listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOrder {
    #[default]
    Sku,
    NextMaintenance,
    WarrantyExpiry,
    CreatedAt,
}

/// Criteria for listing units. Every `None` field is ignored; the rest are
/// combined with AND.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitFilter {
    pub item_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
    pub supplier_id: Option<Uuid>,
    pub status: Option<UnitStatus>,
    pub condition: Option<UnitCondition>,
    /// Any of these conditions
    pub conditions: Option<Vec<UnitCondition>>,
    pub batch_code: Option<String>,
    pub is_active: Option<bool>,
    pub is_rental_blocked: Option<bool>,

    /// Purchase date range, inclusive
    pub purchased_from: Option<DateTime<Utc>>,
    pub purchased_to: Option<DateTime<Utc>>,

    /// Purchase price range, inclusive
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,

    /// `next_maintenance_date <= t`
    pub maintenance_due_by: Option<DateTime<Utc>>,
    /// `next_maintenance_date IS NULL OR next_maintenance_date > t`
    pub maintenance_clear_at: Option<DateTime<Utc>>,

    /// `warranty_expiry > t`
    pub warranty_expires_after: Option<DateTime<Utc>>,
    /// `warranty_expiry <= t`
    pub warranty_expires_by: Option<DateTime<Utc>>,

    #[serde(default)]
    pub order_by: UnitOrder,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl UnitFilter {
    /// Up to `quantity` units of an item that can be rented at `now`.
    pub fn rentable(
        item_id: Uuid,
        location_id: Option<Uuid>,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id: Some(item_id),
            location_id,
            status: Some(UnitStatus::Available),
            is_active: Some(true),
            is_rental_blocked: Some(false),
            conditions: Some(RENTAL_ACCEPTABLE_CONDITIONS.to_vec()),
            maintenance_clear_at: Some(now),
            limit: Some(quantity),
            ..Default::default()
        }
    }

    /// In-process evaluation of the filter; mirrors the SQL built in `db.rs`.
    pub fn matches(&self, unit: &InventoryUnit) -> bool {
        fn eq<T: PartialEq>(want: &Option<T>, have: &T) -> bool {
            want.as_ref().map_or(true, |w| w == have)
        }

        eq(&self.item_id, &unit.item_id)
            && eq(&self.location_id, &unit.location_id)
            && self
                .supplier_id
                .map_or(true, |s| unit.supplier_id == Some(s))
            && eq(&self.status, &unit.status)
            && eq(&self.condition, &unit.condition)
            && self
                .conditions
                .as_ref()
                .map_or(true, |set| set.contains(&unit.condition))
            && self
                .batch_code
                .as_ref()
                .map_or(true, |code| unit.batch_code.as_ref() == Some(code))
            && eq(&self.is_active, &unit.is_active)
            && eq(&self.is_rental_blocked, &unit.is_rental_blocked)
            && self
                .purchased_from
                .map_or(true, |t| unit.purchase_date.map_or(false, |d| d >= t))
            && self
                .purchased_to
                .map_or(true, |t| unit.purchase_date.map_or(false, |d| d <= t))
            && self.min_price.map_or(true, |p| unit.purchase_price >= p)
            && self.max_price.map_or(true, |p| unit.purchase_price <= p)
            && self
                .maintenance_due_by
                .map_or(true, |t| unit.next_maintenance_date.map_or(false, |d| d <= t))
            && self
                .maintenance_clear_at
                .map_or(true, |t| unit.next_maintenance_date.map_or(true, |d| d > t))
            && self
                .warranty_expires_after
                .map_or(true, |t| unit.warranty_expiry.map_or(false, |d| d > t))
            && self
                .warranty_expires_by
                .map_or(true, |t| unit.warranty_expiry.map_or(false, |d| d <= t))
    }

    /// Sort, then apply offset/limit. Used by the in-memory store.
    pub fn apply_window(&self, mut units: Vec<InventoryUnit>) -> Vec<InventoryUnit> {
        match self.order_by {
            UnitOrder::Sku => units.sort_by(|a, b| a.sku.cmp(&b.sku)),
            UnitOrder::NextMaintenance => units.sort_by(|a, b| {
                a.next_maintenance_date
                    .cmp(&b.next_maintenance_date)
                    .then_with(|| a.sku.cmp(&b.sku))
            }),
            UnitOrder::WarrantyExpiry => units.sort_by(|a, b| {
                a.warranty_expiry
                    .cmp(&b.warranty_expiry)
                    .then_with(|| a.sku.cmp(&b.sku))
            }),
            UnitOrder::CreatedAt => units.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.sku.cmp(&b.sku))
            }),
        }

        let offset = self.offset.unwrap_or(0).max(0) as usize;
        let iter = units.into_iter().skip(offset);
        match self.limit {
            Some(limit) => iter.take(limit.max(0) as usize).collect(),
            None => iter.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn status_strings_round_trip_through_strum_and_serde() {
        for status in UnitStatus::iter() {
            let text = status.to_string();
            assert_eq!(UnitStatus::from_str(&text).unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", text));
        }
        assert_eq!(UnitStatus::UnderRepair.as_ref(), "UNDER_REPAIR");
        assert!(UnitStatus::from_str("LOST").is_err());
    }

    #[test]
    fn only_top_three_conditions_are_rentable() {
        let rentable: Vec<_> = UnitCondition::iter()
            .filter(|c| c.is_rental_acceptable())
            .collect();
        assert_eq!(
            rentable,
            vec![
                UnitCondition::New,
                UnitCondition::Excellent,
                UnitCondition::Good
            ]
        );
    }

    #[test]
    fn new_unit_input_defaults_from_json() {
        let input: NewInventoryUnit = serde_json::from_value(serde_json::json!({
            "item_id": Uuid::new_v4(),
            "location_id": Uuid::new_v4(),
            "serial_number": "SN1"
        }))
        .unwrap();

        assert_eq!(input.condition, UnitCondition::New);
        assert_eq!(input.quantity, Decimal::ONE);
        assert_eq!(input.rental_period, 1);
        assert!(!input.auto_generate_sku);
    }

    #[test]
    fn event_kind_serializes_with_tag() {
        let kind = UnitEventKind::RentedOut {
            customer_id: Uuid::nil(),
        };
        let value = serde_json::to_value(&kind).unwrap();
        assert_eq!(value["kind"], "rented_out");
        assert_eq!(kind.name(), "rented_out");
    }
}
