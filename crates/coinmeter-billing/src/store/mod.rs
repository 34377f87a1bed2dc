//! Repository interfaces
//!
//! The engine never touches storage directly. Each concern has a repository
//! trait returning plain data; multi-row writes that must succeed or fail
//! together are single trait methods so a backend can run them in one
//! transaction.
//!
//! - [`BalanceRepository`]: balances and the append-only ledger
//! - [`SessionRepository`]: metering and pairing sessions
//! - [`EarningsRepository`]: per-session earnings records
//! - [`PayoutRepository`]: weekly payout batches

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use coinmeter_common::{
    Balance, DurationSource, EarningsRecord, EndReason, LedgerEntry, MeteringSession,
    PairingSession, PayoutBatch, StoreError, UserId,
};

/// Session-side effects of a debit, applied in the same unit of work
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionCharge {
    pub session_id: Uuid,
    pub coins: u64,
    pub charged_at: DateTime<Utc>,
    /// Billing anchor observed when the charge was computed.
    /// The write is rejected if the session was billed since.
    pub expected_anchor: DateTime<Utc>,
}

#[async_trait]
pub trait BalanceRepository: Send + Sync {
    /// Load a balance; `None` if the user has never been referenced
    async fn load_balance(&self, user_id: UserId) -> Result<Option<Balance>, StoreError>;

    /// Persist a mutated balance and its ledger entry atomically
    ///
    /// Fails with [`StoreError::Contention`] if the stored version is not
    /// `expected_version`. With a `charge`, the metering session is updated in
    /// the same unit of work and the whole write fails with
    /// [`StoreError::Conflict`] if the session is no longer active or was
    /// billed since `expected_anchor`.
    async fn commit_mutation(
        &self,
        balance: &Balance,
        expected_version: u64,
        entry: &LedgerEntry,
        charge: Option<&SessionCharge>,
    ) -> Result<(), StoreError>;

    /// All ledger entries for a user, oldest first
    async fn ledger_entries(&self, user_id: UserId) -> Result<Vec<LedgerEntry>, StoreError>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert_metering(&self, session: &MeteringSession) -> Result<(), StoreError>;

    async fn get_metering(&self, id: Uuid) -> Result<Option<MeteringSession>, StoreError>;

    /// Every metering session with `status = active`
    async fn active_metering(&self) -> Result<Vec<MeteringSession>, StoreError>;

    /// Sessions that ended at or after `since`
    async fn ended_metering_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<MeteringSession>, StoreError>;

    /// End an active session
    ///
    /// Returns the ended session, or `None` when it was already ended.
    async fn end_metering(
        &self,
        id: Uuid,
        reason: EndReason,
        at: DateTime<Utc>,
    ) -> Result<Option<MeteringSession>, StoreError>;

    /// Cache the model side of the pairing on the session
    async fn set_model(&self, id: Uuid, model_user_id: UserId) -> Result<(), StoreError>;

    /// Write `actual_duration_seconds` unless one is already stored
    ///
    /// Returns the authoritative value after the call.
    async fn set_duration_if_absent(
        &self,
        id: Uuid,
        seconds: u64,
        source: DurationSource,
    ) -> Result<u64, StoreError>;

    /// Manual override; replaces any computed duration
    async fn set_manual_duration(&self, id: Uuid, seconds: u64) -> Result<(), StoreError>;

    async fn upsert_pairing(&self, pairing: &PairingSession) -> Result<(), StoreError>;

    /// Active pairing for a room in which `user_id` takes part
    async fn find_active_pairing(
        &self,
        room_name: &str,
        user_id: UserId,
    ) -> Result<Option<PairingSession>, StoreError>;

    /// Most recently created pairing for a room, any status
    async fn latest_pairing(&self, room_name: &str) -> Result<Option<PairingSession>, StoreError>;
}

#[async_trait]
pub trait EarningsRepository: Send + Sync {
    /// Insert unless a record for the same session exists; returns whether it was inserted
    ///
    /// Claims every id in `record.gift_ids` in the same write. Fails with
    /// [`StoreError::Contention`] if another record already claimed one of them.
    async fn insert_earnings(&self, record: &EarningsRecord) -> Result<bool, StoreError>;

    /// The subset of `gift_ids` already counted by some record
    async fn claimed_gifts(&self, gift_ids: &[Uuid]) -> Result<Vec<Uuid>, StoreError>;

    async fn earnings_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<EarningsRecord>, StoreError>;

    /// Records with no payout batch
    async fn unsettled_for_model(
        &self,
        model_user_id: UserId,
    ) -> Result<Vec<EarningsRecord>, StoreError>;

    async fn earnings_for_model(
        &self,
        model_user_id: UserId,
    ) -> Result<Vec<EarningsRecord>, StoreError>;

    /// Ids of records carrying `batch_id`, read straight from the store
    async fn record_ids_in_batch(&self, batch_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    /// Single-record write bypassing any batching or caching layer
    ///
    /// Only assigns when the record is unsettled; returns whether it now
    /// carries `batch_id`.
    async fn assign_batch_direct(&self, record_id: Uuid, batch_id: Uuid)
        -> Result<bool, StoreError>;
}

#[async_trait]
pub trait PayoutRepository: Send + Sync {
    async fn batch_for_week(
        &self,
        model_user_id: UserId,
        week_start: NaiveDate,
    ) -> Result<Option<PayoutBatch>, StoreError>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<PayoutBatch>, StoreError>;

    async fn batches_for_model(&self, model_user_id: UserId)
        -> Result<Vec<PayoutBatch>, StoreError>;

    /// Replace a stored batch if it is still at `expected_version`
    ///
    /// Fails with [`StoreError::Contention`] when the stored batch changed
    /// since it was read.
    async fn update_batch(&self, batch: &PayoutBatch, expected_version: u64)
        -> Result<(), StoreError>;

    /// Save the batch and assign it to every unsettled record in `record_ids`
    /// as one unit of work; returns how many records were assigned
    ///
    /// `expected_version` is the version of the stored batch the caller
    /// extended, or 0 for a new batch. The write fails with
    /// [`StoreError::Contention`] if the stored batch moved past that version
    /// or another batch already exists for the same model and week, and with
    /// [`StoreError::Conflict`] if the stored batch is no longer pending.
    async fn commit_settlement(
        &self,
        batch: &PayoutBatch,
        expected_version: u64,
        record_ids: &[Uuid],
    ) -> Result<usize, StoreError>;
}
