//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::{AppState, GatewayStore};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub payment_circuit: &'static str,
    pub read_circuit: &'static str,
}

/// GET /health — liveness plus the state of both circuit breakers.
pub async fn check<S: GatewayStore>(State(state): State<Arc<AppState<S>>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        payment_circuit: state.orchestrator.breaker().state().await.as_str(),
        read_circuit: state.read_breaker.state().await.as_str(),
    })
}
