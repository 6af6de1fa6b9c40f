// =============================================================================
// UNIT LIFECYCLE SERVICE - Library Root
// =============================================================================
// Lifecycle and concurrency core for individually tracked rental inventory.
//
// LAYOUT:
// - models     : statuses, conditions, the unit record, inputs and filters
// - unit       : the state machine and invariants of a single unit
// - store      : persistence seam plus the in-memory store
// - db         : PostgreSQL store (row locks + version compare-and-swap)
// - repository : locked transitions, creation, SKU generation, queries
// - handlers   : health / readiness / metrics endpoints for the binary
// =============================================================================

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod repository;
pub mod store;
pub mod unit;

pub use error::{ConflictKind, UnitError, UnitResult};
pub use models::{
    InventoryUnit, NewInventoryUnit, StatusChange, Transition, UnitCondition, UnitEvent,
    UnitEventKind, UnitFilter, UnitOrder, UnitStatus,
};
pub use repository::UnitRepository;
pub use store::{InMemoryUnitStore, UnitStore};

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
/// Shared by the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub units: UnitRepository,

    /// Renders the Prometheus exposition for `/metrics`
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}
