use std::time::Duration;

use common::Money;

/// Payment processing rules.
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// Amounts below this are declined without touching the store.
    pub min_amount: Money,
    /// An amount that makes every save attempt fail, for exercising retries.
    pub fault_sentinel: Option<Money>,
    /// Save attempts before giving up on a transient failure.
    pub max_attempts: u32,
    /// Attempt `n` waits `retry_backoff * n` before the next one.
    pub retry_backoff: Duration,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            min_amount: Money::from_cents(1_000),
            fault_sentinel: Some(Money::from_cents(99_999)),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}
