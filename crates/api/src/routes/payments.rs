//! Payment read endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::PaymentId;
use domain::Payment;

use crate::error::ApiError;
use crate::routes::guarded;
use crate::{AppState, GatewayStore};

/// GET /payments/{id}
#[tracing::instrument(skip(state))]
pub async fn get<S: GatewayStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<i64>,
) -> Result<Json<Payment>, ApiError> {
    let payments = state.payments.clone();

    guarded(&state.read_breaker, "Payment service", || async move {
        payments.get_payment(PaymentId::new(id)).await
    })
    .await?
    .map(Json)
    .ok_or_else(|| ApiError::NotFound(format!("Payment {id} not found")))
}
