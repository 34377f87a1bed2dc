//! Model earnings records

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::UserId;

/// What produced an earnings record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarningsSource {
    VideoSession,
    DirectGift,
    ChatGift,
}

impl EarningsSource {
    /// Classify a gift-only record by its room name
    pub fn for_gift_room(room_name: &str) -> Self {
        if room_name.starts_with("chat") {
            EarningsSource::ChatGift
        } else {
            EarningsSource::DirectGift
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EarningsSource::VideoSession => "video_session",
            EarningsSource::DirectGift => "direct_gift",
            EarningsSource::ChatGift => "chat_gift",
        }
    }
}

impl fmt::Display for EarningsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable earnings for one settled session or gift
///
/// Only `payout_batch_id` changes after creation, when the record is settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningsRecord {
    pub id: Uuid,

    /// Metering session (or standalone gift) this record settles; unique
    pub session_id: Uuid,

    pub model_user_id: UserId,

    pub client_user_id: UserId,

    pub room_name: String,

    pub duration_seconds: u64,

    /// Duration met the minimum for time earnings
    pub qualifying: bool,

    pub time_earnings: Decimal,

    /// Model share of gifts attributed to the session
    pub gift_earnings: Decimal,

    /// Model gross (time + gift)
    pub total_earnings: Decimal,

    /// Platform share of gifts
    pub platform_share: Decimal,

    /// Raw gift coins attributed to the session
    pub gift_coins: u64,

    pub source_type: EarningsSource,

    /// Gifts counted in this record; a gift is counted by at most one record
    #[serde(default)]
    pub gift_ids: Vec<Uuid>,

    /// `None` until settled into a payout batch
    pub payout_batch_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
}

impl EarningsRecord {
    #[inline]
    pub fn is_settled(&self) -> bool {
        self.payout_batch_id.is_some()
    }
}
