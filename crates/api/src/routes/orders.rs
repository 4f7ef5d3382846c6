//! Order creation and order/saga read endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{CorrelationId, Money, OrderId, SagaId};
use domain::{Order, SagaEvent, SagaState};
use messaging::OrderCreatedEvent;
use serde::{Deserialize, Serialize};
use store::OrderRepository;

use crate::error::ApiError;
use crate::routes::guarded;
use crate::{AppState, GatewayStore};

// -- Request types --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub customer_id: String,
    pub product_id: String,
    pub quantity: u32,
    pub amount: Money,
}

// -- Response types --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<OrderId>,
    pub saga_id: SagaId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaView {
    pub saga: SagaState,
    pub events: Vec<SagaEvent>,
}

// -- Handlers --

/// POST /orders — publish `OrderCreated` and wait briefly for the order service.
///
/// Answers 201 once the order is persisted, or 202 with the correlation ID
/// if the reply does not arrive in time.
#[tracing::instrument(skip(state, req), fields(customer_id = %req.customer_id))]
pub async fn create<S: GatewayStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
    let saga_id = SagaId::new();
    let correlation_id = CorrelationId::new();

    let reply = state.correlations.register(correlation_id, saga_id).await?;

    let event = OrderCreatedEvent::new(
        saga_id,
        req.customer_id,
        req.product_id,
        req.quantity,
        req.amount,
    )
    .with_correlation(correlation_id);

    if let Err(e) = state.publisher.publish(&event).await {
        state.correlations.forget(correlation_id).await;
        tracing::error!(error = %e, "Failed to publish OrderCreated");
        return Err(ApiError::Unavailable("Order service unavailable".to_string()));
    }

    let started = Instant::now();
    let outcome = tokio::time::timeout(state.config.response_timeout, reply).await;
    metrics::histogram!("order_response_wait_seconds").record(started.elapsed().as_secs_f64());

    match outcome {
        Ok(Ok(response)) => {
            tracing::info!(order_id = %response.order_id, %saga_id, "Order accepted");
            Ok((
                StatusCode::CREATED,
                Json(CreateOrderResponse {
                    order_id: Some(response.order_id),
                    saga_id,
                    correlation_id: None,
                    status: response.status,
                }),
            ))
        }
        _ => {
            state.correlations.forget(correlation_id).await;
            metrics::counter!("order_response_timeouts_total").increment(1);
            tracing::warn!(%correlation_id, %saga_id, "No order response in time");
            Ok((
                StatusCode::ACCEPTED,
                Json(CreateOrderResponse {
                    order_id: None,
                    saga_id,
                    correlation_id: Some(correlation_id),
                    status: "PENDING".to_string(),
                }),
            ))
        }
    }
}

/// GET /orders/{id}
#[tracing::instrument(skip(state))]
pub async fn get<S: GatewayStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<i64>,
) -> Result<Json<Order>, ApiError> {
    let order_id = OrderId::new(id);
    let store = state.orchestrator.store().clone();

    guarded(&state.read_breaker, "Order service", || async move {
        store.find_order(order_id).await
    })
    .await?
    .map(Json)
    .ok_or_else(|| ApiError::NotFound(format!("Order {id} not found")))
}

/// GET /orders/{id}/saga — saga state and its audit trail.
#[tracing::instrument(skip(state))]
pub async fn saga<S: GatewayStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<i64>,
) -> Result<Json<SagaView>, ApiError> {
    let saga = state
        .orchestrator
        .get_saga_state(OrderId::new(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No saga for order {id}")))?;
    let events = state.orchestrator.saga_events(saga.saga_id).await?;

    Ok(Json(SagaView { saga, events }))
}
