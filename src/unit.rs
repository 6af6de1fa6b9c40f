// =============================================================================
// UNIT MODULE - Inventory unit state machine
// =============================================================================
// Business rules for one inventory unit: construction, the named transitions,
// the derived predicates and the invariant check.
//
// STATES:
//   AVAILABLE (initial) -> RENTED -> AVAILABLE
//   AVAILABLE | DAMAGED -> UNDER_REPAIR -> AVAILABLE
//   any (except RETIRED) -> DAMAGED
//   any (except RETIRED) -> RETIRED (terminal)
//
// Every transition runs through `apply_at`, which mutates a draft copy and
// only swaps it in once the precondition held, the version was bumped and the
// whole invariant set passed. A failed call leaves the unit untouched.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{UnitError, UnitResult};
use crate::models::{
    InventoryUnit, NewInventoryUnit, Transition, UnitCondition, UnitEvent, UnitEventKind,
    UnitStatus,
};

/// Column width of `inventory_units.sku`
pub const MAX_SKU_LEN: usize = 50;

/// Trim and turn empty strings into `None`
fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().map_or(false, |v| !v.trim().is_empty())
}

impl InventoryUnit {
    // =========================================================================
    // CONSTRUCTION
    // =========================================================================
    /// Build a new unit from creation input and the SKU chosen for it.
    ///
    /// The unit starts AVAILABLE at version 1 with `original_location_id`
    /// pinned to the creation location. Fails with a validation error when
    /// any invariant does not hold.
    pub fn new(input: NewInventoryUnit, sku: String, actor: Option<Uuid>) -> UnitResult<Self> {
        Self::new_at(input, sku, actor, Utc::now())
    }

    pub fn new_at(
        input: NewInventoryUnit,
        sku: String,
        actor: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> UnitResult<Self> {
        let mut unit = Self {
            id: Uuid::new_v4(),
            item_id: input.item_id,
            location_id: input.location_id,
            sku: sku.trim().to_string(),
            serial_number: clean(input.serial_number),
            batch_code: clean(input.batch_code),
            barcode: clean(input.barcode),
            status: UnitStatus::Available,
            condition: input.condition,
            quantity: input.quantity,
            purchase_date: input.purchase_date,
            purchase_price: input.purchase_price,
            supplier_id: input.supplier_id,
            purchase_order_number: clean(input.purchase_order_number),
            sale_price: input.sale_price,
            rental_rate_per_period: input.rental_rate_per_period,
            rental_period: input.rental_period,
            security_deposit: input.security_deposit,
            last_maintenance_date: None,
            next_maintenance_date: input.next_maintenance_date,
            total_rental_hours: Decimal::ZERO,
            total_rental_count: 0,
            warranty_expiry: input.warranty_expiry,
            warranty_provider: clean(input.warranty_provider),
            warranty_terms: clean(input.warranty_terms),
            is_rental_blocked: false,
            rental_block_reason: None,
            rental_blocked_at: None,
            rental_blocked_by: None,
            original_location_id: input.location_id,
            current_holder_id: None,
            notes: clean(input.notes),
            version: 1,
            is_active: true,
            created_at: now,
            updated_at: now,
            created_by: actor,
            updated_by: actor,
            pending_events: Vec::new(),
        };

        unit.validate()?;

        let created = UnitEvent {
            unit_id: unit.id,
            version: unit.version,
            occurred_at: now,
            actor_id: actor,
            kind: UnitEventKind::Created {
                sku: unit.sku.clone(),
            },
            note: None,
        };
        unit.pending_events.push(created);

        Ok(unit)
    }

    // =========================================================================
    // INVARIANTS
    // =========================================================================
    /// Check every structural invariant of a unit.
    pub fn validate(&self) -> UnitResult<()> {
        if self.sku.trim().is_empty() {
            return Err(UnitError::validation("SKU is required"));
        }
        if self.sku.chars().count() > MAX_SKU_LEN {
            return Err(UnitError::validation(format!(
                "SKU must be at most {} characters",
                MAX_SKU_LEN
            )));
        }

        match (present(&self.serial_number), present(&self.batch_code)) {
            (true, true) => {
                return Err(UnitError::validation(
                    "Unit cannot have both serial_number and batch_code",
                ))
            }
            (false, false) => {
                return Err(UnitError::validation(
                    "Unit must have either serial_number or batch_code",
                ))
            }
            _ => {}
        }

        if self.quantity <= Decimal::ZERO {
            return Err(UnitError::validation("Quantity must be positive"));
        }
        if present(&self.serial_number) && self.quantity != Decimal::ONE {
            return Err(UnitError::validation(
                "Serialized items must have quantity of 1",
            ));
        }

        if self.purchase_price < Decimal::ZERO {
            return Err(UnitError::validation("Purchase price cannot be negative"));
        }
        if self.security_deposit < Decimal::ZERO {
            return Err(UnitError::validation("Security deposit cannot be negative"));
        }
        if self.rental_period <= 0 {
            return Err(UnitError::validation("Rental period must be positive"));
        }
        if self.sale_price.map_or(false, |p| p < Decimal::ZERO) {
            return Err(UnitError::validation("Sale price cannot be negative"));
        }
        if self.rental_rate_per_period.map_or(false, |r| r < Decimal::ZERO) {
            return Err(UnitError::validation("Rental rate cannot be negative"));
        }
        if self.total_rental_hours < Decimal::ZERO || self.total_rental_count < 0 {
            return Err(UnitError::validation("Rental totals cannot be negative"));
        }

        if let (Some(purchased), Some(expiry)) = (self.purchase_date, self.warranty_expiry) {
            if purchased > expiry {
                return Err(UnitError::validation(
                    "Purchase date cannot be after warranty expiry",
                ));
            }
        }
        if let (Some(last), Some(next)) = (self.last_maintenance_date, self.next_maintenance_date)
        {
            if last > next {
                return Err(UnitError::validation(
                    "Last maintenance date cannot be after next maintenance date",
                ));
            }
        }

        if self.current_holder_id.is_some() && self.status != UnitStatus::Rented {
            return Err(UnitError::validation(
                "Only rented units can have a current holder",
            ));
        }
        if self.version < 1 {
            return Err(UnitError::validation("Version must be at least 1"));
        }

        Ok(())
    }

    // =========================================================================
    // DERIVED PREDICATES
    // =========================================================================

    pub fn is_serialized(&self) -> bool {
        present(&self.serial_number)
    }

    /// AVAILABLE, active and not blocked
    pub fn is_available(&self) -> bool {
        self.status == UnitStatus::Available && self.is_active && !self.is_rental_blocked
    }

    pub fn is_rented(&self) -> bool {
        self.status == UnitStatus::Rented
    }

    pub fn is_damaged(&self) -> bool {
        matches!(self.status, UnitStatus::Damaged | UnitStatus::BeyondRepair)
    }

    pub fn is_retired(&self) -> bool {
        self.status == UnitStatus::Retired
    }

    pub fn can_be_rented(&self) -> bool {
        self.can_be_rented_at(Utc::now())
    }

    pub fn can_be_rented_at(&self, now: DateTime<Utc>) -> bool {
        self.rental_blockers_at(now).is_empty()
    }

    /// Reasons the unit cannot be rented right now; empty when it can.
    pub fn rental_blockers_at(&self, now: DateTime<Utc>) -> Vec<&'static str> {
        let mut reasons = Vec::new();
        if self.status != UnitStatus::Available {
            reasons.push("status is not AVAILABLE");
        }
        if !self.is_active {
            reasons.push("unit is inactive");
        }
        if self.is_rental_blocked {
            reasons.push("rental is blocked");
        }
        if !self.condition.is_rental_acceptable() {
            reasons.push("condition is not rentable");
        }
        if self.is_maintenance_due_at(now) {
            reasons.push("maintenance is due");
        }
        reasons
    }

    pub fn is_maintenance_due(&self) -> bool {
        self.is_maintenance_due_at(Utc::now())
    }

    pub fn is_maintenance_due_at(&self, now: DateTime<Utc>) -> bool {
        self.next_maintenance_date.map_or(false, |next| next <= now)
    }

    /// Maintenance falls due within the next `days` days (or is overdue).
    pub fn is_maintenance_due_within(&self, days: i64, now: DateTime<Utc>) -> bool {
        self.is_maintenance_due_at(now + Duration::days(days))
    }

    pub fn is_warranty_valid(&self) -> bool {
        self.is_warranty_valid_at(Utc::now())
    }

    pub fn is_warranty_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.warranty_expiry.map_or(false, |expiry| expiry > now)
    }

    /// Warranty still valid but ending within the next `days` days.
    pub fn is_warranty_expiring_within(&self, days: i64, now: DateTime<Utc>) -> bool {
        self.is_warranty_valid_at(now)
            && self
                .warranty_expiry
                .map_or(false, |expiry| expiry <= now + Duration::days(days))
    }

    // =========================================================================
    // NAMED TRANSITIONS
    // =========================================================================
    // Thin wrappers over `apply`; each is the only sanctioned way to reach the
    // corresponding state.

    pub fn rent_out(&mut self, customer_id: Uuid, actor: Option<Uuid>) -> UnitResult<()> {
        self.apply(Transition::RentOut { customer_id }, None, actor)
    }

    pub fn return_from_rent(
        &mut self,
        condition: Option<UnitCondition>,
        rental_hours: Decimal,
        actor: Option<Uuid>,
    ) -> UnitResult<()> {
        self.apply(
            Transition::ReturnFromRent {
                condition,
                rental_hours,
            },
            None,
            actor,
        )
    }

    pub fn mark_as_damaged(
        &mut self,
        severity: UnitCondition,
        notes: Option<&str>,
        actor: Option<Uuid>,
    ) -> UnitResult<()> {
        self.apply(Transition::MarkDamaged { severity }, notes, actor)
    }

    pub fn send_for_repair(&mut self, actor: Option<Uuid>) -> UnitResult<()> {
        self.apply(Transition::SendForRepair, None, actor)
    }

    pub fn complete_repair(
        &mut self,
        condition: UnitCondition,
        actor: Option<Uuid>,
    ) -> UnitResult<()> {
        self.apply(Transition::CompleteRepair { condition }, None, actor)
    }

    pub fn retire(&mut self, reason: Option<&str>, actor: Option<Uuid>) -> UnitResult<()> {
        self.apply(
            Transition::Retire {
                reason: reason.map(str::to_string),
            },
            None,
            actor,
        )
    }

    pub fn block_rental(&mut self, reason: &str, blocked_by: Option<Uuid>) -> UnitResult<()> {
        self.apply(
            Transition::BlockRental {
                reason: reason.to_string(),
            },
            None,
            blocked_by,
        )
    }

    pub fn unblock_rental(&mut self, updated_by: Option<Uuid>) -> UnitResult<()> {
        self.apply(Transition::UnblockRental, None, updated_by)
    }

    pub fn schedule_maintenance(
        &mut self,
        next_date: DateTime<Utc>,
        actor: Option<Uuid>,
    ) -> UnitResult<()> {
        self.apply(Transition::ScheduleMaintenance { next_date }, None, actor)
    }

    pub fn transfer_to_location(
        &mut self,
        location_id: Uuid,
        actor: Option<Uuid>,
    ) -> UnitResult<()> {
        self.apply(Transition::TransferToLocation { location_id }, None, actor)
    }

    /// Plain status assignment for states without a dedicated transition
    /// (MAINTENANCE, RESERVED, SOLD, BEYOND_REPAIR, or back to AVAILABLE).
    pub fn set_status(&mut self, status: UnitStatus, actor: Option<Uuid>) -> UnitResult<()> {
        self.apply(Transition::SetStatus { status }, None, actor)
    }

    pub fn add_note(&mut self, note: &str, actor: Option<Uuid>) -> UnitResult<()> {
        self.apply(Transition::Annotate, Some(note), actor)
    }

    // =========================================================================
    // TRANSITION PIPELINE
    // =========================================================================

    pub fn apply(
        &mut self,
        transition: Transition,
        note: Option<&str>,
        actor: Option<Uuid>,
    ) -> UnitResult<()> {
        self.apply_at(transition, note, actor, Utc::now())
    }

    /// Run one transition atomically: precondition, effect, optional note,
    /// version bump, audit stamp, full validation, history entry.
    pub fn apply_at(
        &mut self,
        transition: Transition,
        note: Option<&str>,
        actor: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> UnitResult<()> {
        let note = note.map(str::trim).filter(|n| !n.is_empty());
        if transition == Transition::Annotate && note.is_none() {
            return Err(UnitError::validation("Note text is required"));
        }

        let mut draft = self.clone();
        let kind = draft.step(&transition, actor, now)?;

        if let Some(text) = note {
            draft.append_note(text, now);
        }

        draft.version += 1;
        draft.updated_at = now;
        draft.updated_by = actor;
        draft.validate()?;

        draft.pending_events.push(UnitEvent {
            unit_id: draft.id,
            version: draft.version,
            occurred_at: now,
            actor_id: actor,
            kind,
            note: note.map(str::to_string),
        });

        *self = draft;
        Ok(())
    }

    /// Precondition and effect of a single transition, applied to a draft.
    fn step(
        &mut self,
        transition: &Transition,
        actor: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> UnitResult<UnitEventKind> {
        if self.is_retired() {
            match transition {
                Transition::Retire { .. } => {
                    return Err(UnitError::validation("Unit is already retired"))
                }
                Transition::Annotate
                | Transition::BlockRental { .. }
                | Transition::UnblockRental => {}
                _ => {
                    return Err(UnitError::validation(
                        "Retired units cannot change state",
                    ))
                }
            }
        }

        let kind = match transition {
            Transition::RentOut { customer_id } => {
                let blockers = self.rental_blockers_at(now);
                if !blockers.is_empty() {
                    return Err(UnitError::validation(format!(
                        "Unit cannot be rented in current state: {}",
                        blockers.join(", ")
                    )));
                }
                self.total_rental_count = self
                    .total_rental_count
                    .checked_add(1)
                    .ok_or_else(|| UnitError::validation("Rental count overflow"))?;
                self.status = UnitStatus::Rented;
                self.current_holder_id = Some(*customer_id);
                UnitEventKind::RentedOut {
                    customer_id: *customer_id,
                }
            }

            Transition::ReturnFromRent {
                condition,
                rental_hours,
            } => {
                if self.status != UnitStatus::Rented {
                    return Err(UnitError::validation("Unit is not currently rented"));
                }
                if *rental_hours < Decimal::ZERO {
                    return Err(UnitError::validation("Rental hours cannot be negative"));
                }
                let customer_id = self.current_holder_id.take();
                self.status = UnitStatus::Available;
                if let Some(condition) = condition {
                    self.condition = *condition;
                }
                self.total_rental_hours += *rental_hours;
                UnitEventKind::Returned {
                    customer_id,
                    condition: self.condition,
                    rental_hours: *rental_hours,
                }
            }

            Transition::MarkDamaged { severity } => {
                self.status = UnitStatus::Damaged;
                self.condition = *severity;
                self.current_holder_id = None;
                UnitEventKind::MarkedDamaged {
                    severity: *severity,
                }
            }

            Transition::SendForRepair => {
                if !matches!(self.status, UnitStatus::Damaged | UnitStatus::Available) {
                    return Err(UnitError::validation(
                        "Only damaged or available units can be sent for repair",
                    ));
                }
                self.status = UnitStatus::UnderRepair;
                self.last_maintenance_date = Some(now);
                // The repair covers any maintenance that had fallen due.
                if self.next_maintenance_date.map_or(false, |next| next < now) {
                    self.next_maintenance_date = None;
                }
                UnitEventKind::SentForRepair
            }

            Transition::CompleteRepair { condition } => {
                if self.status != UnitStatus::UnderRepair {
                    return Err(UnitError::validation("Unit is not under repair"));
                }
                self.status = UnitStatus::Available;
                self.condition = *condition;
                UnitEventKind::RepairCompleted {
                    condition: *condition,
                }
            }

            Transition::Retire { reason } => {
                self.status = UnitStatus::Retired;
                self.is_active = false;
                self.current_holder_id = None;
                let line = match reason.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
                    Some(reason) => format!("Retired: {}", reason),
                    None => "Retired".to_string(),
                };
                self.append_note(&line, now);
                UnitEventKind::Retired {
                    reason: reason.clone(),
                }
            }

            Transition::BlockRental { reason } => {
                let reason = reason.trim();
                if reason.is_empty() {
                    return Err(UnitError::validation("Block reason is required"));
                }
                self.is_rental_blocked = true;
                self.rental_block_reason = Some(reason.to_string());
                self.rental_blocked_at = Some(now);
                self.rental_blocked_by = actor;
                UnitEventKind::RentalBlocked {
                    reason: reason.to_string(),
                }
            }

            Transition::UnblockRental => {
                self.is_rental_blocked = false;
                self.rental_block_reason = None;
                self.rental_blocked_at = None;
                self.rental_blocked_by = None;
                UnitEventKind::RentalUnblocked
            }

            Transition::ScheduleMaintenance { next_date } => {
                if *next_date <= now {
                    return Err(UnitError::validation(
                        "Maintenance date must be in the future",
                    ));
                }
                self.next_maintenance_date = Some(*next_date);
                UnitEventKind::MaintenanceScheduled {
                    next_date: *next_date,
                }
            }

            Transition::TransferToLocation { location_id } => {
                if self.status != UnitStatus::Available {
                    return Err(UnitError::validation(
                        "Only available units can be transferred",
                    ));
                }
                if self.location_id == *location_id {
                    return Err(UnitError::validation("Unit is already at this location"));
                }
                let from = self.location_id;
                self.location_id = *location_id;
                UnitEventKind::Transferred {
                    from_location_id: from,
                    to_location_id: *location_id,
                }
            }

            Transition::SetStatus { status } => {
                if matches!(
                    status,
                    UnitStatus::Rented
                        | UnitStatus::UnderRepair
                        | UnitStatus::Damaged
                        | UnitStatus::Retired
                ) {
                    return Err(UnitError::validation(format!(
                        "Status {} requires its dedicated transition",
                        status
                    )));
                }
                if self.status == UnitStatus::Rented {
                    return Err(UnitError::validation(
                        "Rented units must be returned before changing status",
                    ));
                }
                if self.status == *status {
                    return Err(UnitError::validation(format!(
                        "Unit is already {}",
                        status
                    )));
                }
                let from = self.status;
                self.status = *status;
                UnitEventKind::StatusChanged { from, to: *status }
            }

            Transition::Annotate => UnitEventKind::Noted,
        };

        Ok(kind)
    }

    fn append_note(&mut self, text: &str, now: DateTime<Utc>) {
        let line = format!("[{}] {}", now.format("%Y-%m-%d %H:%M UTC"), text);
        self.notes = Some(match self.notes.take() {
            Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, line),
            _ => line,
        });
    }

    // =========================================================================
    // HISTORY
    // =========================================================================

    /// History entries not yet persisted.
    pub fn pending_events(&self) -> &[UnitEvent] {
        &self.pending_events
    }

    pub fn take_pending_events(&mut self) -> Vec<UnitEvent> {
        std::mem::take(&mut self.pending_events)
    }
}
