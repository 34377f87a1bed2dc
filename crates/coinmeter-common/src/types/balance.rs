//! Coin balance - dual purchased/gift coin accounting
//!
//! Each user holds two sub-balances:
//! - purchased coins, bought with real money
//! - gift coins, received from other users
//!
//! Debits drain gift coins first and purchased coins second. A debit that
//! cannot be covered in full is rejected without touching either field, so
//! both sub-balances stay non-negative.
//!
//! Every mutation is mirrored by exactly one [`LedgerEntry`]; replaying a
//! user's entries reproduces the balance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use super::UserId;

/// Ledger operation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u64, available: u64 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Balance overflow")]
    Overflow,

    #[error("Version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },
}

/// Coin sub-balance type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinType {
    Purchased,
    Gift,
}

impl fmt::Display for CoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinType::Purchased => write!(f, "purchased"),
            CoinType::Gift => write!(f, "gift"),
        }
    }
}

/// Origin of a ledger mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerSource {
    Purchase,
    GiftReceived,
    VideoSession,
    Refund,
    AdminAdjustment,
}

impl fmt::Display for LedgerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LedgerSource::Purchase => "purchase",
            LedgerSource::GiftReceived => "gift_received",
            LedgerSource::VideoSession => "video_session",
            LedgerSource::Refund => "refund",
            LedgerSource::AdminAdjustment => "admin_adjustment",
        };
        f.write_str(s)
    }
}

/// Signed change applied to each sub-balance by one mutation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinDelta {
    pub purchased: i64,
    pub gift: i64,
}

impl CoinDelta {
    /// Net change across both sub-balances
    #[inline]
    pub fn total(&self) -> i64 {
        self.purchased + self.gift
    }
}

/// Per-user dual coin balance
///
/// Created lazily on first reference and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    /// Owner
    pub user_id: UserId,

    /// Coins bought with real money
    pub purchased_coins: u64,

    /// Coins received as gifts
    pub gift_coins: u64,

    /// Lifetime purchased coins credited
    pub total_purchased_lifetime: u64,

    /// Lifetime coins debited
    pub total_consumed_lifetime: u64,

    pub last_purchase_at: Option<DateTime<Utc>>,

    pub last_consumption_at: Option<DateTime<Utc>>,

    /// Version for optimistic concurrency
    pub version: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Balance {
    /// Create an empty balance
    pub fn new(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            purchased_coins: 0,
            gift_coins: 0,
            total_purchased_lifetime: 0,
            total_consumed_lifetime: 0,
            last_purchase_at: None,
            last_consumption_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Total spendable coins (purchased + gift)
    #[inline]
    pub fn total(&self) -> u64 {
        self.purchased_coins.saturating_add(self.gift_coins)
    }

    /// Whether the balance covers `coins`
    #[inline]
    pub fn covers(&self, coins: u64) -> bool {
        self.total() >= coins
    }

    /// Credit coins to one sub-balance
    pub fn credit(
        &mut self,
        coins: u64,
        coin_type: CoinType,
        now: DateTime<Utc>,
    ) -> Result<CoinDelta, LedgerError> {
        if coins == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let signed = i64::try_from(coins).map_err(|_| LedgerError::Overflow)?;

        let delta = match coin_type {
            CoinType::Purchased => {
                self.purchased_coins = self
                    .purchased_coins
                    .checked_add(coins)
                    .ok_or(LedgerError::Overflow)?;
                self.total_purchased_lifetime =
                    self.total_purchased_lifetime.saturating_add(coins);
                self.last_purchase_at = Some(now);
                CoinDelta {
                    purchased: signed,
                    gift: 0,
                }
            }
            CoinType::Gift => {
                self.gift_coins = self
                    .gift_coins
                    .checked_add(coins)
                    .ok_or(LedgerError::Overflow)?;
                CoinDelta {
                    purchased: 0,
                    gift: signed,
                }
            }
        };

        self.touch(now);
        Ok(delta)
    }

    /// Debit coins, gift coins first
    ///
    /// All-or-nothing: an uncovered debit leaves the balance untouched.
    pub fn debit(&mut self, coins: u64, now: DateTime<Utc>) -> Result<CoinDelta, LedgerError> {
        if coins == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if !self.covers(coins) {
            return Err(LedgerError::InsufficientBalance {
                required: coins,
                available: self.total(),
            });
        }

        let from_gift = coins.min(self.gift_coins);
        let from_purchased = coins - from_gift;

        self.gift_coins -= from_gift;
        self.purchased_coins -= from_purchased;
        self.total_consumed_lifetime = self.total_consumed_lifetime.saturating_add(coins);
        self.last_consumption_at = Some(now);
        self.touch(now);

        Ok(CoinDelta {
            purchased: -(from_purchased as i64),
            gift: -(from_gift as i64),
        })
    }

    /// Check the version for optimistic concurrency
    pub fn check_version(&self, expected: u64) -> Result<(), LedgerError> {
        if self.version != expected {
            return Err(LedgerError::VersionConflict {
                expected,
                found: self.version,
            });
        }
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Balance(purchased={}, gift={}, total={})",
            self.purchased_coins,
            self.gift_coins,
            self.total()
        )
    }
}

/// Immutable audit record of one balance mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,

    pub user_id: UserId,

    /// Sub-balance the mutation targeted; `gift` for any debit that drew gift coins
    pub coin_type: CoinType,

    /// Signed net amount (credits positive, debits negative)
    pub amount: i64,

    /// Signed change to purchased coins
    pub purchased_delta: i64,

    /// Signed change to gift coins
    pub gift_delta: i64,

    pub source: LedgerSource,

    /// Total balance after the mutation
    pub balance_after: u64,

    pub purchased_after: u64,

    pub gift_after: u64,

    /// Related metering session or gift, if any
    pub reference_id: Option<Uuid>,

    pub note: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Record a mutation against the post-mutation balance
    pub fn record(
        balance: &Balance,
        delta: CoinDelta,
        source: LedgerSource,
        reference_id: Option<Uuid>,
        note: Option<String>,
    ) -> Self {
        let coin_type = if delta.gift != 0 {
            CoinType::Gift
        } else {
            CoinType::Purchased
        };

        Self {
            id: Uuid::now_v7(),
            user_id: balance.user_id,
            coin_type,
            amount: delta.total(),
            purchased_delta: delta.purchased,
            gift_delta: delta.gift,
            source,
            balance_after: balance.total(),
            purchased_after: balance.purchased_coins,
            gift_after: balance.gift_coins,
            reference_id,
            note,
            created_at: balance.updated_at,
        }
    }

    #[inline]
    pub fn is_debit(&self) -> bool {
        self.amount < 0
    }
}

/// Sub-balances reconstructed from a ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayedBalance {
    pub purchased_coins: i64,
    pub gift_coins: i64,
    pub total_credited: u64,
    pub total_debited: u64,
}

impl ReplayedBalance {
    /// Whether the replay agrees with a stored balance
    pub fn matches(&self, balance: &Balance) -> bool {
        self.purchased_coins == balance.purchased_coins as i64
            && self.gift_coins == balance.gift_coins as i64
    }
}

/// Replay ledger entries from an empty balance
pub fn replay<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> ReplayedBalance {
    entries
        .into_iter()
        .fold(ReplayedBalance::default(), |mut acc, entry| {
            acc.purchased_coins += entry.purchased_delta;
            acc.gift_coins += entry.gift_delta;
            if entry.amount >= 0 {
                acc.total_credited += entry.amount as u64;
            } else {
                acc.total_debited += entry.amount.unsigned_abs();
            }
            acc
        })
}
