//! Lookup of requests that outlived their synchronous wait.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::CorrelationId;
use store::PendingCorrelation;

use crate::error::ApiError;
use crate::{AppState, GatewayStore};

/// GET /correlations/{id}
#[tracing::instrument(skip(state))]
pub async fn get<S: GatewayStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<PendingCorrelation>, ApiError> {
    let correlation_id: CorrelationId = id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid correlation ID: {id}")))?;

    state
        .correlations
        .find(correlation_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Correlation {id} not found")))
}
