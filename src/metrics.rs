// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the unit lifecycle core.
//
// Recording is a no-op until `setup_metrics` installs the global recorder, so
// library users and tests can call the helpers freely.
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// METRIC NAMES
// =============================================================================

/// Transition attempts
/// Labels: transition (rent_out, retire, ...), outcome (success/rejected/conflict/error)
pub const UNIT_TRANSITIONS_TOTAL: &str = "inventory_unit_transitions_total";

/// Conflicts surfaced to callers
/// Labels: kind (duplicate/version_mismatch)
pub const UNIT_CONFLICTS_TOTAL: &str = "inventory_unit_conflicts_total";

/// Units created
/// Labels: mode (single/batch)
pub const UNITS_CREATED_TOTAL: &str = "inventory_units_created_total";

/// SKU generation retries after a collision
pub const SKU_COLLISIONS_TOTAL: &str = "inventory_unit_sku_collisions_total";

/// Database query duration histogram
/// Labels: operation (select/select_for_update/insert/update/search)
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Install the Prometheus recorder and return the handle used by `/metrics`.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    // 1ms .. 10s, suitable for single-row queries up to slow batch inserts
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    describe_counter!(
        UNIT_TRANSITIONS_TOTAL,
        "Inventory unit transition attempts by outcome"
    );
    describe_counter!(
        UNIT_CONFLICTS_TOTAL,
        "Uniqueness and version conflicts returned to callers"
    );
    describe_counter!(UNITS_CREATED_TOTAL, "Inventory units created");
    describe_counter!(
        SKU_COLLISIONS_TOTAL,
        "Generated SKUs discarded because they already existed"
    );
    describe_histogram!(
        DB_QUERY_DURATION_SECONDS,
        "Database query latency in seconds"
    );

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Record a transition attempt and, for conflicts, the conflict kind.
pub fn record_transition(transition: &str, outcome: &str) {
    counter!(
        UNIT_TRANSITIONS_TOTAL,
        "transition" => transition.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_conflict(kind: &str) {
    counter!(UNIT_CONFLICTS_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn record_units_created(mode: &str, count: usize) {
    counter!(UNITS_CREATED_TOTAL, "mode" => mode.to_string()).increment(count as u64);
}

pub fn record_sku_collision() {
    counter!(SKU_COLLISIONS_TOTAL).increment(1);
}

/// Record database query duration
pub fn record_db_query(operation: &str, duration_secs: f64) {
    histogram!(
        DB_QUERY_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}
