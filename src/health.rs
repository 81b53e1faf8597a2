//! Health routes (spec §6.5/§10.5): liveness, readiness, detailed status.
//! Grounded directly on the teacher's `health.rs`; the "actors" check has
//! no counterpart here and is replaced with a Redis pub/sub reachability
//! check and a replica-lag reading.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::time::SystemTime;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: u64,
    version: String,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    database: CheckStatus,
    pubsub: CheckStatus,
    replica_lag_secs: Option<f64>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    database: bool,
    pubsub: bool,
}

pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let db_ready = state.store.health_check().await;
    let pubsub_ready = state.pubsub.is_reachable().await;
    let ready = db_ready && pubsub_ready;

    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(ReadinessResponse { ready, checks: ReadinessChecks { database: db_ready, pubsub: pubsub_ready } }))
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_healthy = state.store.health_check().await;
    let pubsub_healthy = state.pubsub.is_reachable().await;
    let replica_lag_secs = state.store.replica_lag_secs().await;

    let lag_ok = replica_lag_secs.map(|lag| lag <= state.config.replica_lag_threshold.as_secs_f64()).unwrap_or(true);
    let overall_healthy = db_healthy && pubsub_healthy && lag_ok;

    let timestamp = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);

    let status = if overall_healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(HealthResponse {
            status: if overall_healthy { "healthy".to_string() } else { "unhealthy".to_string() },
            timestamp,
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: HealthChecks {
                database: if db_healthy { CheckStatus::Healthy } else { CheckStatus::Unhealthy },
                pubsub: if pubsub_healthy { CheckStatus::Healthy } else { CheckStatus::Unhealthy },
                replica_lag_secs,
            },
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn liveness_always_reports_ok() {
        let (status, body) = liveness().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }
}
