//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database: &'static str,
    pub rate_limiter: &'static str,
    pub websocket_connections: usize,
}

async fn database_healthy(state: &AppState) -> bool {
    sqlx::query("SELECT 1").execute(&state.pool).await.is_ok()
}

/// Health check endpoint. Redis is optional (the limiter fails open), so only
/// the database decides the status code.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_ok = database_healthy(&state).await;
    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if db_ok { "healthy" } else { "unhealthy" },
            version: env!("CARGO_PKG_VERSION"),
            database: if db_ok { "healthy" } else { "unhealthy" },
            rate_limiter: if state.rate_limiter.is_enabled() {
                "redis"
            } else {
                "disabled"
            },
            websocket_connections: state.ws_state.connection_count().await,
        }),
    )
}

/// Liveness check, 200 while the server is running
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness check, 200 once the database answers
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if database_healthy(&state).await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
