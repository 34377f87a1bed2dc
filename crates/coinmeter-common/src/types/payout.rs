//! Weekly payout batches
//!
//! Unsettled earnings are aggregated per model into one batch per settlement
//! week. A pending batch only grows; once paid it is closed for good.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::UserId;

/// Payout batch errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PayoutError {
    #[error("Payout batch {0} is already paid")]
    AlreadyPaid(Uuid),

    #[error("Payout batch not found: {0}")]
    NotFound(Uuid),

    #[error("Payout amount must be positive")]
    InvalidAmount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Paid,
}

/// Monday-to-Sunday settlement bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SettlementWeek {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SettlementWeek {
    /// The week containing `date`
    pub fn containing(date: NaiveDate) -> Self {
        let start = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
        Self {
            start,
            end: start + Duration::days(6),
        }
    }

    /// The week containing `at` (UTC)
    pub fn at(at: DateTime<Utc>) -> Self {
        Self::containing(at.date_naive())
    }
}

/// Aggregated weekly payment for one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutBatch {
    pub id: Uuid,
    pub model_user_id: UserId,
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub gross_amount: Decimal,
    pub total_sessions: u64,
    pub status: PayoutStatus,
    pub payment_method: Option<String>,
    pub payment_reference: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    /// Bumped on every change; writes compare against the version they read
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PayoutBatch {
    /// Open an empty pending batch for a model and week
    pub fn open(model_user_id: UserId, week: SettlementWeek, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            model_user_id,
            week_start: week.start,
            week_end: week.end,
            gross_amount: Decimal::ZERO,
            total_sessions: 0,
            status: PayoutStatus::Pending,
            payment_method: None,
            payment_reference: None,
            paid_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.status == PayoutStatus::Pending
    }

    /// Append settled earnings to a pending batch
    pub fn extend(
        &mut self,
        amount: Decimal,
        sessions: u64,
        now: DateTime<Utc>,
    ) -> Result<(), PayoutError> {
        if !self.is_pending() {
            return Err(PayoutError::AlreadyPaid(self.id));
        }
        if amount < Decimal::ZERO {
            return Err(PayoutError::InvalidAmount);
        }
        self.gross_amount += amount;
        self.total_sessions += sessions;
        self.version += 1;
        self.updated_at = now;
        Ok(())
    }

    /// Close the batch as paid
    pub fn mark_paid(
        &mut self,
        method: impl Into<String>,
        reference: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), PayoutError> {
        if !self.is_pending() {
            return Err(PayoutError::AlreadyPaid(self.id));
        }
        self.status = PayoutStatus::Paid;
        self.payment_method = Some(method.into());
        self.payment_reference = Some(reference.into());
        self.paid_at = Some(now);
        self.version += 1;
        self.updated_at = now;
        Ok(())
    }
}

/// Payout settings for one model, owned by account settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutAccount {
    pub model_user_id: UserId,
    /// Payout method has been verified
    pub verified: bool,
    /// Unsettled earnings must reach this before a batch is written
    pub minimum_payout: Decimal,
    pub payout_method: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_week_is_monday_to_sunday() {
        // 2026-10-21 is a Wednesday
        let week = SettlementWeek::containing(NaiveDate::from_ymd_opt(2026, 10, 21).unwrap());
        assert_eq!(week.start, NaiveDate::from_ymd_opt(2026, 10, 19).unwrap());
        assert_eq!(week.end, NaiveDate::from_ymd_opt(2026, 10, 25).unwrap());

        let monday = SettlementWeek::containing(week.start);
        let sunday = SettlementWeek::containing(week.end);
        assert_eq!(monday, week);
        assert_eq!(sunday, week);
    }

    #[test]
    fn test_extend_then_pay() {
        let now = Utc::now();
        let mut batch = PayoutBatch::open(Uuid::new_v4(), SettlementWeek::at(now), now);

        batch.extend(dec!(12.50), 3, now).unwrap();
        batch.extend(dec!(2.50), 1, now).unwrap();
        assert_eq!(batch.gross_amount, dec!(15.00));
        assert_eq!(batch.total_sessions, 4);
        assert_eq!(batch.version, 2);

        batch.mark_paid("bank_transfer", "tx-001", now).unwrap();
        assert_eq!(batch.status, PayoutStatus::Paid);
        assert_eq!(batch.version, 3);
        assert_eq!(
            batch.extend(dec!(1), 1, now),
            Err(PayoutError::AlreadyPaid(batch.id))
        );
    }
}
