//! Billing configuration
//!
//! One immutable value holds every billing constant. Components receive it at
//! construction and never consult globals.

use chrono::Duration;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;

use crate::error::{CoinmeterError, Result};

/// Billing engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Coins charged per minute of connection
    pub cost_per_minute: u64,
    /// Minutes of buffer a client must hold before a connection is admitted
    pub minimum_start_minutes: u64,
    /// Sessions billed more recently than this are skipped by the tick
    pub min_billing_interval_secs: i64,
    /// Hard cap on metering session age (6 hours)
    pub stale_session_cap_secs: i64,
    /// How long a pairing may stay non-active before its metering session is orphaned
    pub orphan_grace_secs: i64,
    /// Longest duration accepted from timestamps or fallback heuristics
    pub max_plausible_duration_secs: u64,
    /// Minimum reconciled duration for time earnings
    pub qualifying_duration_secs: u64,
    /// Last-resort duration when nothing else is usable
    pub fallback_duration_secs: u64,
    /// Model earnings per qualifying minute
    pub time_rate_per_minute: Decimal,
    /// Fraction of gift value credited to the model (rest goes to the platform)
    pub model_gift_share: Decimal,
    /// Low-balance notification threshold in minutes of remaining balance
    pub low_balance_minutes: u64,
    /// Auto-expiry for notifications
    pub notification_ttl_secs: i64,
    /// Timeout applied to each ledger/registry store call
    pub store_call_timeout_ms: u64,
    /// Attempts for transient store failures (including the first)
    pub store_retry_attempts: u32,
    /// Sleep between retry attempts
    pub store_retry_delay_ms: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            cost_per_minute: 10,
            minimum_start_minutes: 3,
            min_billing_interval_secs: 25,
            stale_session_cap_secs: 6 * 60 * 60,
            orphan_grace_secs: 10 * 60,
            max_plausible_duration_secs: 3600,
            qualifying_duration_secs: 60,
            fallback_duration_secs: 60,
            time_rate_per_minute: dec!(0.50),
            model_gift_share: dec!(0.60),
            low_balance_minutes: 1,
            notification_ttl_secs: 5 * 60,
            store_call_timeout_ms: 5_000,
            store_retry_attempts: 5,
            store_retry_delay_ms: 100,
        }
    }
}

impl BillingConfig {
    /// Reject configurations the engine cannot bill with
    pub fn validate(&self) -> Result<()> {
        if self.cost_per_minute == 0 {
            return Err(CoinmeterError::Config("cost_per_minute must be positive".into()));
        }
        if self.min_billing_interval_secs <= 0 {
            return Err(CoinmeterError::Config(
                "min_billing_interval_secs must be positive".into(),
            ));
        }
        if self.stale_session_cap_secs <= self.min_billing_interval_secs {
            return Err(CoinmeterError::Config(
                "stale_session_cap_secs must exceed the billing interval".into(),
            ));
        }
        if self.model_gift_share < Decimal::ZERO || self.model_gift_share > Decimal::ONE {
            return Err(CoinmeterError::Config(format!(
                "model_gift_share must be within [0, 1], got {}",
                self.model_gift_share
            )));
        }
        if self.time_rate_per_minute < Decimal::ZERO {
            return Err(CoinmeterError::Config("time_rate_per_minute cannot be negative".into()));
        }
        if self.fallback_duration_secs == 0
            || self.fallback_duration_secs > self.max_plausible_duration_secs
        {
            return Err(CoinmeterError::Config(
                "fallback_duration_secs must be within (0, max_plausible_duration_secs]".into(),
            ));
        }
        if self.store_retry_attempts == 0 {
            return Err(CoinmeterError::Config("store_retry_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Coins required to admit a new connection
    pub fn minimum_start_balance(&self) -> u64 {
        self.cost_per_minute.saturating_mul(self.minimum_start_minutes)
    }

    /// Whole minutes a balance pays for
    pub fn minutes_available(&self, coins: u64) -> u64 {
        coins / self.cost_per_minute
    }

    /// Coins owed for `elapsed_secs` of connection, rounded up
    pub fn coins_for_elapsed(&self, elapsed_secs: i64) -> u64 {
        if elapsed_secs <= 0 {
            return 0;
        }
        // minutes * cost, with a single division so whole-coin results stay exact
        let coins = (Decimal::from(elapsed_secs) * Decimal::from(self.cost_per_minute)
            / Decimal::from(crate::SECONDS_PER_MINUTE))
        .ceil();
        coins.to_u64().unwrap_or(u64::MAX)
    }

    /// Whether a remaining balance is at or below the low-balance threshold
    pub fn is_low_balance(&self, remaining_coins: u64) -> bool {
        Decimal::from(remaining_coins) / Decimal::from(self.cost_per_minute)
            <= Decimal::from(self.low_balance_minutes)
    }

    pub fn min_billing_interval(&self) -> Duration {
        Duration::seconds(self.min_billing_interval_secs)
    }

    pub fn stale_session_cap(&self) -> Duration {
        Duration::seconds(self.stale_session_cap_secs)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::seconds(self.orphan_grace_secs)
    }

    pub fn notification_ttl(&self) -> Duration {
        Duration::seconds(self.notification_ttl_secs)
    }

    pub fn store_call_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.store_call_timeout_ms)
    }

    pub fn store_retry_delay(&self) -> StdDuration {
        StdDuration::from_millis(self.store_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(BillingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_billing_arithmetic_rounds_up() {
        let config = BillingConfig::default();
        // 40s at 10 coins/min = 6.67 coins
        assert_eq!(config.coins_for_elapsed(40), 7);
        assert_eq!(config.coins_for_elapsed(60), 10);
        assert_eq!(config.coins_for_elapsed(61), 11);
        assert_eq!(config.coins_for_elapsed(0), 0);
    }

    #[test]
    fn test_minimum_balance_gate() {
        let config = BillingConfig::default();
        assert_eq!(config.minimum_start_balance(), 30);
        assert_eq!(config.minutes_available(30), 3);
        assert_eq!(config.minutes_available(29), 2);
    }

    #[test]
    fn test_low_balance_threshold() {
        let config = BillingConfig::default();
        assert!(config.is_low_balance(10));
        assert!(config.is_low_balance(0));
        assert!(!config.is_low_balance(11));
    }

    #[test]
    fn test_rejects_invalid_share() {
        let config = BillingConfig {
            model_gift_share: dec!(1.5),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CoinmeterError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_cost() {
        let config = BillingConfig {
            cost_per_minute: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
