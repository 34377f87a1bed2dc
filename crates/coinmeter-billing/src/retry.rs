//! Bounded retries and per-call timeouts for store access
//!
//! Only transient failures ([`StoreError::Contention`], [`StoreError::Timeout`])
//! are retried. Everything else surfaces on the first attempt.

use std::future::Future;
use std::time::Duration;

use coinmeter_common::{BillingConfig, CoinmeterError, Result, StoreError};
use tokio::time::{sleep, timeout};
use tracing::warn;

/// Retry behaviour for store calls
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Fixed sleep between attempts
    pub delay: Duration,
    /// Upper bound on a single store call
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BillingConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &BillingConfig) -> Self {
        Self {
            max_attempts: config.store_retry_attempts.max(1),
            delay: config.store_retry_delay(),
            call_timeout: config.store_call_timeout(),
        }
    }

    /// Single attempt, no sleeping
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Bound a store call by `limit`
pub async fn with_timeout<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, StoreError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(CoinmeterError::from),
        Err(_) => Err(StoreError::Timeout(format!(
            "{} exceeded {}ms",
            operation,
            limit.as_millis()
        ))
        .into()),
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "Transient store failure, retrying"
                );
                attempt += 1;
                sleep(policy.delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// One store call with the policy's timeout, retried while transient
pub async fn store_call<T, F, Fut>(policy: &RetryPolicy, operation: &'static str, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, StoreError>>,
{
    let limit = policy.call_timeout;
    retry_transient(policy, operation, || with_timeout(limit, operation, op())).await
}
