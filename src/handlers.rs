// =============================================================================
// HANDLERS MODULE
// =============================================================================
// Operational HTTP endpoints for the lifecycle service: liveness, readiness
// and the Prometheus scrape target. Unit operations are exposed as a library
// API (`UnitRepository`), not over HTTP.
// =============================================================================

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::AppState;

// =============================================================================
// RESPONSE TYPES
// =============================================================================
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessChecks {
    pub database: bool,
}

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness probe
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe. 503 until the unit store answers.
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.units.health_check().await;

    if !db_healthy {
        tracing::warn!("Readiness check failed: unit store unreachable");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(ReadinessResponse {
        status: "ready".to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
        },
    }))
}

// =============================================================================
// METRICS ENDPOINT
// =============================================================================
/// Prometheus text exposition
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::UnitRepository;
    use crate::store::InMemoryUnitStore;
    use metrics_exporter_prometheus::PrometheusBuilder;

    fn state() -> Arc<AppState> {
        let recorder = PrometheusBuilder::new().build_recorder();
        Arc::new(AppState {
            units: UnitRepository::new(Arc::new(InMemoryUnitStore::new())),
            metrics_handle: recorder.handle(),
        })
    }

    #[tokio::test]
    async fn health_reports_package() {
        let Json(body) = health_check().await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.service, "unit-lifecycle-service");
    }

    #[tokio::test]
    async fn ready_when_store_answers() {
        let Json(body) = readiness_check(State(state())).await.unwrap();
        assert_eq!(body.status, "ready");
        assert!(body.checks.database);
    }
}
