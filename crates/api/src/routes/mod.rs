//! HTTP route handlers.

pub mod correlations;
pub mod health;
pub mod metrics;
pub mod orders;
pub mod payments;

use std::fmt::Display;
use std::future::Future;

use saga::CircuitBreaker;

use crate::error::ApiError;

/// Runs a read through the gateway's read breaker. Any failure, including an
/// open breaker, becomes a 503 naming `service`.
pub(crate) async fn guarded<T, E, F, Fut>(
    breaker: &CircuitBreaker,
    service: &str,
    f: F,
) -> Result<T, ApiError>
where
    E: Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    breaker.call(f).await.map_err(|e| {
        tracing::warn!(error = %e, service, "guarded read failed");
        ApiError::Unavailable(format!("{service} unavailable"))
    })
}
