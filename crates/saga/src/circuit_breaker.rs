//! Circuit breaker guarding synchronous calls to other services.
//!
//! Tracks call outcomes in a count-based sliding window:
//! - Closed: calls pass through; the breaker opens once the window holds at
//!   least `minimum_calls` outcomes and the failure rate reaches the threshold
//! - Open: calls fail immediately until `open_duration` has elapsed
//! - Half-Open: up to `half_open_max_calls` trial calls are admitted; all
//!   succeeding closes the breaker, any failure re-opens it

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure percentage (0-100) at which the breaker opens.
    pub failure_rate_threshold: f64,
    /// Outcomes needed in the window before the rate is evaluated.
    pub minimum_calls: usize,
    /// Number of most recent outcomes kept.
    pub window_size: usize,
    /// How long the breaker stays open before admitting trial calls.
    pub open_duration: Duration,
    /// Trial calls admitted while half-open.
    pub half_open_max_calls: u32,
    /// Calls running longer than this count as failures.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            minimum_calls: 5,
            window_size: 10,
            open_duration: Duration::from_secs(30),
            half_open_max_calls: 3,
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Why a guarded call did not produce a value.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The breaker is open; the dependency was not invoked.
    #[error("Circuit '{0}' is open")]
    Open(String),

    /// The call exceeded the call timeout.
    #[error("Call through circuit '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    /// The dependency itself failed.
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// `true` for a failed call.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_admitted: u32,
    half_open_successes: u32,
}

/// Count-window circuit breaker. Share it behind an `Arc`.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                half_open_admitted: 0,
                half_open_successes: 0,
            }),
        };
        metrics::gauge!("circuit_breaker_state", "name" => breaker.name.clone())
            .set(CircuitState::Closed.gauge_value());
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An open breaker whose cooldown elapsed still reports
    /// `Open` until the next call moves it to half-open.
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Runs `f` through the breaker.
    ///
    /// `Err` from `f` and timeouts count as failures. Wrap business outcomes
    /// that should not trip the breaker inside the `Ok` value.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.acquire::<E>().await?;

        match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(Ok(value)) => {
                self.record(false).await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record(true).await;
                Err(CircuitError::Inner(e))
            }
            Err(_) => {
                self.record(true).await;
                tracing::warn!(circuit = %self.name, timeout = ?self.config.call_timeout, "Guarded call timed out");
                Err(CircuitError::Timeout {
                    name: self.name.clone(),
                    after: self.config.call_timeout,
                })
            }
        }
    }

    async fn acquire<E>(&self) -> Result<(), CircuitError<E>> {
        let mut inner = self.inner.lock().await;

        if inner.state == CircuitState::Open {
            let cooled = inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.open_duration);
            if !cooled {
                metrics::counter!("circuit_breaker_rejections_total", "name" => self.name.clone())
                    .increment(1);
                return Err(CircuitError::Open(self.name.clone()));
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_admitted >= self.config.half_open_max_calls {
                return Err(CircuitError::Open(self.name.clone()));
            }
            inner.half_open_admitted += 1;
        }

        Ok(())
    }

    async fn record(&self, failed: bool) {
        let mut inner = self.inner.lock().await;

        match inner.state {
            CircuitState::Closed => {
                inner.window.push_back(failed);
                while inner.window.len() > self.config.window_size {
                    inner.window.pop_front();
                }

                if inner.window.len() >= self.config.minimum_calls {
                    let failures = inner.window.iter().filter(|f| **f).count();
                    let rate = failures as f64 * 100.0 / inner.window.len() as f64;
                    if rate >= self.config.failure_rate_threshold {
                        self.transition(&mut inner, CircuitState::Open);
                    }
                }
            }
            CircuitState::HalfOpen => {
                if failed {
                    self.transition(&mut inner, CircuitState::Open);
                } else {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_max_calls {
                        self.transition(&mut inner, CircuitState::Closed);
                    }
                }
            }
            // Outcome of a call admitted before the breaker tripped.
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerState, next: CircuitState) {
        let previous = inner.state;
        inner.state = next;
        inner.half_open_admitted = 0;
        inner.half_open_successes = 0;

        match next {
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
            CircuitState::Closed => {
                inner.window.clear();
                inner.opened_at = None;
            }
            CircuitState::HalfOpen => {}
        }

        metrics::gauge!("circuit_breaker_state", "name" => self.name.clone())
            .set(next.gauge_value());
        tracing::info!(circuit = %self.name, from = %previous, to = %next, "Circuit breaker state changed");
    }
}
