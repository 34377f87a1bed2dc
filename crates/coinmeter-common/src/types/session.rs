//! Metering and pairing sessions
//!
//! A [`PairingSession`] is the signaling-level link between a client and a
//! model. A [`MeteringSession`] is the billed, client-side view of that
//! connection and is only billable while its pairing is active.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::UserId;

/// Which side of a pairing a participant is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    /// Billed party
    Client,
    /// Earning party
    Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeteringStatus {
    Active,
    Ended,
}

/// Why a metering session was terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The pairing disappeared or stopped being active
    ChatSessionNotFound,
    /// The client could not pay for the elapsed interval
    InsufficientBalance,
    /// Older than the staleness cap
    SessionTimeout,
    /// The pairing never became active within the grace period
    OrphanedSession,
    /// Ended by the transport layer (hang-up, disconnect)
    Disconnected,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::ChatSessionNotFound => "chat_session_not_found",
            EndReason::InsufficientBalance => "insufficient_balance",
            EndReason::SessionTimeout => "session_timeout",
            EndReason::OrphanedSession => "orphaned_session",
            EndReason::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a session's authoritative duration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationSource {
    Manual,
    Timestamps,
    Fallback,
}

/// Billing state of one client's paid connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteringSession {
    pub id: Uuid,

    /// Owning user
    pub user_id: UserId,

    pub role: ParticipantRole,

    pub room_name: String,

    /// Model on the other side, cached from the pairing
    pub model_user_id: Option<UserId>,

    pub started_at: DateTime<Utc>,

    /// Last successful debit; `None` until the first one
    pub last_consumption_at: Option<DateTime<Utc>>,

    /// Coins debited over the session
    pub total_consumed: u64,

    /// Number of successful debits
    pub consumption_count: u32,

    pub status: MeteringStatus,

    pub end_reason: Option<EndReason>,

    pub ended_at: Option<DateTime<Utc>>,

    /// Authoritative duration; never recomputed once set
    pub actual_duration_seconds: Option<u64>,

    pub duration_source: Option<DurationSource>,
}

impl MeteringSession {
    /// Open a new metering session for a client
    pub fn start(user_id: UserId, room_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            role: ParticipantRole::Client,
            room_name: room_name.into(),
            model_user_id: None,
            started_at: now,
            last_consumption_at: None,
            total_consumed: 0,
            consumption_count: 0,
            status: MeteringStatus::Active,
            end_reason: None,
            ended_at: None,
            actual_duration_seconds: None,
            duration_source: None,
        }
    }

    pub fn with_model(mut self, model_user_id: UserId) -> Self {
        self.model_user_id = Some(model_user_id);
        self
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == MeteringStatus::Active
    }

    /// Start of the current unbilled interval
    #[inline]
    pub fn billing_anchor(&self) -> DateTime<Utc> {
        self.last_consumption_at.unwrap_or(self.started_at)
    }

    /// Whole seconds since the last debit (or the start)
    pub fn elapsed_unbilled(&self, now: DateTime<Utc>) -> i64 {
        (now - self.billing_anchor()).num_seconds()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.started_at
    }

    /// Whether the session has outlived the staleness cap
    pub fn is_stale(&self, now: DateTime<Utc>, cap: Duration) -> bool {
        self.age(now) > cap
    }

    /// Apply a successful debit
    pub fn record_consumption(&mut self, coins: u64, now: DateTime<Utc>) {
        self.last_consumption_at = Some(now);
        self.total_consumed = self.total_consumed.saturating_add(coins);
        self.consumption_count = self.consumption_count.saturating_add(1);
    }

    /// Transition to ended; returns false when already ended
    pub fn end(&mut self, reason: EndReason, now: DateTime<Utc>) -> bool {
        if !self.is_active() {
            return false;
        }
        self.status = MeteringStatus::Ended;
        self.end_reason = Some(reason);
        self.ended_at = Some(now);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    Waiting,
    Active,
    Ended,
}

/// Two-party signaling session between a client and a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingSession {
    pub id: Uuid,
    pub room_name: String,
    pub client_user_id: UserId,
    pub model_user_id: UserId,
    pub status: PairingStatus,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl PairingSession {
    /// Create a pairing in the waiting state
    pub fn waiting(
        room_name: impl Into<String>,
        client_user_id: UserId,
        model_user_id: UserId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            room_name: room_name.into(),
            client_user_id,
            model_user_id,
            status: PairingStatus::Waiting,
            created_at: now,
            activated_at: None,
            ended_at: None,
        }
    }

    /// Create a pairing that is already active
    pub fn active(
        room_name: impl Into<String>,
        client_user_id: UserId,
        model_user_id: UserId,
        now: DateTime<Utc>,
    ) -> Self {
        let mut pairing = Self::waiting(room_name, client_user_id, model_user_id, now);
        pairing.activate(now);
        pairing
    }

    pub fn activate(&mut self, now: DateTime<Utc>) {
        if self.status == PairingStatus::Waiting {
            self.status = PairingStatus::Active;
            self.activated_at = Some(now);
        }
    }

    pub fn end(&mut self, now: DateTime<Utc>) {
        if self.status != PairingStatus::Ended {
            self.status = PairingStatus::Ended;
            self.ended_at = Some(now);
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == PairingStatus::Active
    }

    /// Whether the user is either party
    pub fn involves(&self, user_id: UserId) -> bool {
        self.client_user_id == user_id || self.model_user_id == user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_uses_start_until_first_debit() {
        let start = Utc::now();
        let mut session = MeteringSession::start(Uuid::new_v4(), "room-1", start);

        assert_eq!(session.elapsed_unbilled(start + Duration::seconds(40)), 40);

        session.record_consumption(7, start + Duration::seconds(40));
        assert_eq!(session.elapsed_unbilled(start + Duration::seconds(70)), 30);
        assert_eq!(session.total_consumed, 7);
        assert_eq!(session.consumption_count, 1);
    }

    #[test]
    fn test_end_is_idempotent() {
        let now = Utc::now();
        let mut session = MeteringSession::start(Uuid::new_v4(), "room-1", now);

        assert!(session.end(EndReason::InsufficientBalance, now));
        assert!(!session.end(EndReason::SessionTimeout, now + Duration::seconds(5)));
        assert_eq!(session.end_reason, Some(EndReason::InsufficientBalance));
        assert_eq!(session.ended_at, Some(now));
    }

    #[test]
    fn test_staleness() {
        let start = Utc::now();
        let session = MeteringSession::start(Uuid::new_v4(), "room-1", start);
        let cap = Duration::hours(6);
        assert!(!session.is_stale(start + Duration::hours(6), cap));
        assert!(session.is_stale(start + Duration::hours(6) + Duration::seconds(1), cap));
    }

    #[test]
    fn test_pairing_lifecycle() {
        let now = Utc::now();
        let client = Uuid::new_v4();
        let model = Uuid::new_v4();
        let mut pairing = PairingSession::waiting("room-1", client, model, now);

        assert!(!pairing.is_active());
        pairing.activate(now);
        assert!(pairing.is_active());
        assert!(pairing.involves(client) && pairing.involves(model));
        assert!(!pairing.involves(Uuid::new_v4()));

        pairing.end(now);
        pairing.activate(now);
        assert_eq!(pairing.status, PairingStatus::Ended);
    }

    #[test]
    fn test_end_reason_labels() {
        assert_eq!(EndReason::ChatSessionNotFound.to_string(), "chat_session_not_found");
        assert_eq!(
            serde_json::to_string(&EndReason::OrphanedSession).unwrap(),
            "\"orphaned_session\""
        );
    }
}
