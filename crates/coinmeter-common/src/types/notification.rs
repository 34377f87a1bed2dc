//! Notification events handed to the notification collaborator

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::session::EndReason;
use super::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    LowBalance {
        session_id: Uuid,
        remaining_coins: u64,
        minutes_left: u64,
    },
    SessionEnded {
        session_id: Uuid,
        reason: EndReason,
    },
}

/// User-facing event with an urgency level and an expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub urgency: Urgency,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Notification {
    pub fn low_balance(
        user_id: UserId,
        session_id: Uuid,
        remaining_coins: u64,
        minutes_left: u64,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            kind: NotificationKind::LowBalance {
                session_id,
                remaining_coins,
                minutes_left,
            },
            urgency: Urgency::High,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn session_ended(
        user_id: UserId,
        session_id: Uuid,
        reason: EndReason,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let urgency = match reason {
            EndReason::InsufficientBalance => Urgency::High,
            EndReason::Disconnected => Urgency::Low,
            _ => Urgency::Normal,
        };
        Self {
            id: Uuid::now_v7(),
            user_id,
            kind: NotificationKind::SessionEnded { session_id, reason },
            urgency,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
