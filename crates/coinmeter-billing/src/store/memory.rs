//! In-memory repository implementation
//!
//! Uses DashMap for concurrent row access. Writes that touch more than one
//! row run under a single store-wide lock so they are observed all-or-nothing.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use coinmeter_common::{
    Balance, DurationSource, EarningsRecord, EndReason, LedgerEntry, MeteringSession,
    PairingSession, PayoutBatch, StoreError, UserId,
};

use super::{
    BalanceRepository, EarningsRepository, PayoutRepository, SessionCharge, SessionRepository,
};

/// In-memory storage for every repository
#[derive(Default)]
pub struct MemoryStore {
    balances: DashMap<UserId, Balance>,
    ledger: DashMap<UserId, Vec<LedgerEntry>>,
    metering: DashMap<Uuid, MeteringSession>,
    pairings: DashMap<Uuid, PairingSession>,
    earnings: DashMap<Uuid, EarningsRecord>,
    earnings_by_session: DashMap<Uuid, Uuid>,
    /// Gift id to the record that counted it
    gift_claims: DashMap<Uuid, Uuid>,
    batches: DashMap<Uuid, PayoutBatch>,
    /// Held for every multi-row write
    unit_of_work: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot counts for diagnostics
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            balances: self.balances.len(),
            ledger_entries: self.ledger.iter().map(|e| e.value().len()).sum(),
            active_sessions: self.metering.iter().filter(|s| s.is_active()).count(),
            ended_sessions: self.metering.iter().filter(|s| !s.is_active()).count(),
            earnings_records: self.earnings.len(),
            unsettled_records: self.earnings.iter().filter(|r| !r.is_settled()).count(),
            payout_batches: self.batches.len(),
        }
    }

    /// Version and pending flag of a stored batch
    fn stored_batch_version(&self, id: Uuid) -> Option<(u64, bool)> {
        self.batches.get(&id).map(|b| (b.version, b.is_pending()))
    }

    fn sorted_sessions(mut sessions: Vec<MeteringSession>) -> Vec<MeteringSession> {
        sessions.sort_by_key(|s| (s.started_at, s.id));
        sessions
    }

    fn sorted_records(mut records: Vec<EarningsRecord>) -> Vec<EarningsRecord> {
        records.sort_by_key(|r| (r.created_at, r.id));
        records
    }
}

/// Row counts held by a [`MemoryStore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub balances: usize,
    pub ledger_entries: usize,
    pub active_sessions: usize,
    pub ended_sessions: usize,
    pub earnings_records: usize,
    pub unsettled_records: usize,
    pub payout_batches: usize,
}

#[async_trait]
impl BalanceRepository for MemoryStore {
    async fn load_balance(&self, user_id: UserId) -> Result<Option<Balance>, StoreError> {
        Ok(self.balances.get(&user_id).map(|b| b.clone()))
    }

    async fn commit_mutation(
        &self,
        balance: &Balance,
        expected_version: u64,
        entry: &LedgerEntry,
        charge: Option<&SessionCharge>,
    ) -> Result<(), StoreError> {
        let _guard = self.unit_of_work.lock();

        let stored_version = self
            .balances
            .get(&balance.user_id)
            .map(|b| b.version)
            .unwrap_or(0);
        if stored_version != expected_version {
            return Err(StoreError::Contention(format!(
                "balance {} version moved from {} to {}",
                balance.user_id, expected_version, stored_version
            )));
        }

        if let Some(charge) = charge {
            let mut session = self
                .metering
                .get_mut(&charge.session_id)
                .ok_or_else(|| StoreError::NotFound(format!("metering session {}", charge.session_id)))?;
            if !session.is_active() {
                return Err(StoreError::Conflict(format!(
                    "metering session {} is no longer active",
                    charge.session_id
                )));
            }
            if session.billing_anchor() != charge.expected_anchor {
                return Err(StoreError::Conflict(format!(
                    "metering session {} was billed concurrently",
                    charge.session_id
                )));
            }
            session.record_consumption(charge.coins, charge.charged_at);
        }

        self.balances.insert(balance.user_id, balance.clone());
        self.ledger
            .entry(balance.user_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn ledger_entries(&self, user_id: UserId) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .ledger
            .get(&user_id)
            .map(|entries| entries.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn insert_metering(&self, session: &MeteringSession) -> Result<(), StoreError> {
        if self.metering.contains_key(&session.id) {
            return Err(StoreError::Conflict(format!(
                "metering session {} already exists",
                session.id
            )));
        }
        self.metering.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_metering(&self, id: Uuid) -> Result<Option<MeteringSession>, StoreError> {
        Ok(self.metering.get(&id).map(|s| s.clone()))
    }

    async fn active_metering(&self) -> Result<Vec<MeteringSession>, StoreError> {
        let sessions = self
            .metering
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.clone())
            .collect();
        Ok(Self::sorted_sessions(sessions))
    }

    async fn ended_metering_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<MeteringSession>, StoreError> {
        let sessions = self
            .metering
            .iter()
            .filter(|s| matches!(s.ended_at, Some(ended) if ended >= since))
            .map(|s| s.clone())
            .collect();
        Ok(Self::sorted_sessions(sessions))
    }

    async fn end_metering(
        &self,
        id: Uuid,
        reason: EndReason,
        at: DateTime<Utc>,
    ) -> Result<Option<MeteringSession>, StoreError> {
        let _guard = self.unit_of_work.lock();
        let mut session = self
            .metering
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("metering session {}", id)))?;

        if session.end(reason, at) {
            Ok(Some(session.clone()))
        } else {
            Ok(None)
        }
    }

    async fn set_model(&self, id: Uuid, model_user_id: UserId) -> Result<(), StoreError> {
        let mut session = self
            .metering
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("metering session {}", id)))?;
        session.model_user_id = Some(model_user_id);
        Ok(())
    }

    async fn set_duration_if_absent(
        &self,
        id: Uuid,
        seconds: u64,
        source: DurationSource,
    ) -> Result<u64, StoreError> {
        let mut session = self
            .metering
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("metering session {}", id)))?;

        match session.actual_duration_seconds {
            Some(existing) => Ok(existing),
            None => {
                session.actual_duration_seconds = Some(seconds);
                session.duration_source = Some(source);
                Ok(seconds)
            }
        }
    }

    async fn set_manual_duration(&self, id: Uuid, seconds: u64) -> Result<(), StoreError> {
        let mut session = self
            .metering
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("metering session {}", id)))?;
        session.actual_duration_seconds = Some(seconds);
        session.duration_source = Some(DurationSource::Manual);
        Ok(())
    }

    async fn upsert_pairing(&self, pairing: &PairingSession) -> Result<(), StoreError> {
        self.pairings.insert(pairing.id, pairing.clone());
        Ok(())
    }

    async fn find_active_pairing(
        &self,
        room_name: &str,
        user_id: UserId,
    ) -> Result<Option<PairingSession>, StoreError> {
        Ok(self
            .pairings
            .iter()
            .filter(|p| p.room_name == room_name && p.is_active() && p.involves(user_id))
            .max_by_key(|p| p.created_at)
            .map(|p| p.clone()))
    }

    async fn latest_pairing(&self, room_name: &str) -> Result<Option<PairingSession>, StoreError> {
        Ok(self
            .pairings
            .iter()
            .filter(|p| p.room_name == room_name)
            .max_by_key(|p| p.created_at)
            .map(|p| p.clone()))
    }
}

#[async_trait]
impl EarningsRepository for MemoryStore {
    async fn insert_earnings(&self, record: &EarningsRecord) -> Result<bool, StoreError> {
        let _guard = self.unit_of_work.lock();
        if self.earnings_by_session.contains_key(&record.session_id) {
            return Ok(false);
        }
        if let Some(gift_id) = record.gift_ids.iter().find(|id| self.gift_claims.contains_key(id)) {
            return Err(StoreError::Contention(format!(
                "gift {} already counted by another record",
                gift_id
            )));
        }
        for gift_id in &record.gift_ids {
            self.gift_claims.insert(*gift_id, record.id);
        }
        self.earnings_by_session.insert(record.session_id, record.id);
        self.earnings.insert(record.id, record.clone());
        Ok(true)
    }

    async fn claimed_gifts(&self, gift_ids: &[Uuid]) -> Result<Vec<Uuid>, StoreError> {
        Ok(gift_ids
            .iter()
            .copied()
            .filter(|id| self.gift_claims.contains_key(id))
            .collect())
    }

    async fn earnings_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<EarningsRecord>, StoreError> {
        let record_id = match self.earnings_by_session.get(&session_id) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.earnings.get(&record_id).map(|r| r.clone()))
    }

    async fn unsettled_for_model(
        &self,
        model_user_id: UserId,
    ) -> Result<Vec<EarningsRecord>, StoreError> {
        let records = self
            .earnings
            .iter()
            .filter(|r| r.model_user_id == model_user_id && !r.is_settled())
            .map(|r| r.clone())
            .collect();
        Ok(Self::sorted_records(records))
    }

    async fn earnings_for_model(
        &self,
        model_user_id: UserId,
    ) -> Result<Vec<EarningsRecord>, StoreError> {
        let records = self
            .earnings
            .iter()
            .filter(|r| r.model_user_id == model_user_id)
            .map(|r| r.clone())
            .collect();
        Ok(Self::sorted_records(records))
    }

    async fn record_ids_in_batch(&self, batch_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .earnings
            .iter()
            .filter(|r| r.payout_batch_id == Some(batch_id))
            .map(|r| r.id)
            .collect())
    }

    async fn assign_batch_direct(
        &self,
        record_id: Uuid,
        batch_id: Uuid,
    ) -> Result<bool, StoreError> {
        let mut record = self
            .earnings
            .get_mut(&record_id)
            .ok_or_else(|| StoreError::NotFound(format!("earnings record {}", record_id)))?;
        match record.payout_batch_id {
            None => {
                record.payout_batch_id = Some(batch_id);
                Ok(true)
            }
            Some(existing) => Ok(existing == batch_id),
        }
    }
}

#[async_trait]
impl PayoutRepository for MemoryStore {
    async fn batch_for_week(
        &self,
        model_user_id: UserId,
        week_start: NaiveDate,
    ) -> Result<Option<PayoutBatch>, StoreError> {
        Ok(self
            .batches
            .iter()
            .find(|b| b.model_user_id == model_user_id && b.week_start == week_start)
            .map(|b| b.clone()))
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<PayoutBatch>, StoreError> {
        Ok(self.batches.get(&id).map(|b| b.clone()))
    }

    async fn batches_for_model(
        &self,
        model_user_id: UserId,
    ) -> Result<Vec<PayoutBatch>, StoreError> {
        let mut batches: Vec<PayoutBatch> = self
            .batches
            .iter()
            .filter(|b| b.model_user_id == model_user_id)
            .map(|b| b.clone())
            .collect();
        batches.sort_by_key(|b| b.week_start);
        Ok(batches)
    }

    async fn update_batch(
        &self,
        batch: &PayoutBatch,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let _guard = self.unit_of_work.lock();
        match self.stored_batch_version(batch.id) {
            None => Err(StoreError::NotFound(format!("payout batch {}", batch.id))),
            Some((version, _)) if version != expected_version => Err(StoreError::Contention(
                format!("payout batch {} at version {}, expected {}", batch.id, version, expected_version),
            )),
            Some(_) => {
                self.batches.insert(batch.id, batch.clone());
                Ok(())
            }
        }
    }

    async fn commit_settlement(
        &self,
        batch: &PayoutBatch,
        expected_version: u64,
        record_ids: &[Uuid],
    ) -> Result<usize, StoreError> {
        let _guard = self.unit_of_work.lock();

        match self.stored_batch_version(batch.id) {
            Some((version, _)) if version != expected_version => {
                return Err(StoreError::Contention(format!(
                    "payout batch {} at version {}, expected {}",
                    batch.id, version, expected_version
                )));
            }
            Some((_, false)) => {
                return Err(StoreError::Conflict(format!(
                    "payout batch {} is already paid",
                    batch.id
                )));
            }
            Some(_) => {}
            None => {
                let duplicate = self.batches.iter().any(|b| {
                    b.model_user_id == batch.model_user_id && b.week_start == batch.week_start
                });
                if duplicate {
                    return Err(StoreError::Contention(format!(
                        "payout batch for model {} week {} created concurrently",
                        batch.model_user_id, batch.week_start
                    )));
                }
            }
        }

        let mut assigned = 0;
        for id in record_ids {
            if let Some(mut record) = self.earnings.get_mut(id) {
                if record.payout_batch_id.is_none() {
                    record.payout_batch_id = Some(batch.id);
                    assigned += 1;
                }
            }
        }
        self.batches.insert(batch.id, batch.clone());
        Ok(assigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use coinmeter_common::{CoinType, LedgerSource, SettlementWeek};
    use rust_decimal_macros::dec;

    fn credited_balance(user: UserId, coins: u64) -> (Balance, LedgerEntry) {
        let now = Utc::now();
        let mut balance = Balance::new(user, now);
        let delta = balance.credit(coins, CoinType::Purchased, now).unwrap();
        let entry = LedgerEntry::record(&balance, delta, LedgerSource::Purchase, None, None);
        (balance, entry)
    }

    #[tokio::test]
    async fn test_commit_rejects_stale_version() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();

        let (balance, entry) = credited_balance(user, 50);
        store.commit_mutation(&balance, 0, &entry, None).await.unwrap();

        let (again, entry) = credited_balance(user, 50);
        let result = store.commit_mutation(&again, 0, &entry, None).await;
        assert!(matches!(result, Err(StoreError::Contention(_))));
        assert_eq!(store.ledger_entries(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_settlement_rejects_moved_batch() {
        let store = MemoryStore::new();
        let model = Uuid::new_v4();
        let now = Utc::now();
        let mut batch = PayoutBatch::open(model, SettlementWeek::at(now), now);
        batch.extend(dec!(10.00), 1, now).unwrap();
        store.commit_settlement(&batch, 0, &[]).await.unwrap();

        // Paid by one writer...
        let mut paid = batch.clone();
        paid.mark_paid("bank_transfer", "tx-1", now).unwrap();
        store.update_batch(&paid, batch.version).await.unwrap();

        // ...while another extends the version it read before that
        let mut extended = batch.clone();
        extended.extend(dec!(5.00), 1, now).unwrap();
        let result = store.commit_settlement(&extended, batch.version, &[]).await;
        assert!(matches!(result, Err(StoreError::Contention(_))));

        let stale_pay = store.update_batch(&paid, batch.version).await;
        assert!(matches!(stale_pay, Err(StoreError::Contention(_))));

        let stored = store.get_batch(batch.id).await.unwrap().unwrap();
        assert!(!stored.is_pending());
        assert_eq!(stored.gross_amount, dec!(10.00));
    }

    #[tokio::test]
    async fn test_settlement_rejects_second_batch_for_week() {
        let store = MemoryStore::new();
        let model = Uuid::new_v4();
        let now = Utc::now();
        let week = SettlementWeek::at(now);

        let mut first = PayoutBatch::open(model, week, now);
        first.extend(dec!(4.00), 1, now).unwrap();
        store.commit_settlement(&first, 0, &[]).await.unwrap();

        let mut second = PayoutBatch::open(model, week, now);
        second.extend(dec!(4.00), 1, now).unwrap();
        let result = store.commit_settlement(&second, 0, &[]).await;

        assert!(matches!(result, Err(StoreError::Contention(_))));
        assert_eq!(store.batches_for_model(model).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gift_counted_by_one_record() {
        let store = MemoryStore::new();
        let gift_id = Uuid::new_v4();
        let record = |session_id: Uuid| EarningsRecord {
            id: Uuid::now_v7(),
            session_id,
            model_user_id: Uuid::nil(),
            client_user_id: Uuid::nil(),
            room_name: "room-1".into(),
            duration_seconds: 0,
            qualifying: false,
            time_earnings: dec!(0),
            gift_earnings: dec!(6.00),
            total_earnings: dec!(6.00),
            platform_share: dec!(4.00),
            gift_coins: 10,
            source_type: coinmeter_common::EarningsSource::DirectGift,
            gift_ids: vec![gift_id],
            payout_batch_id: None,
            created_at: Utc::now(),
        };

        assert!(store.insert_earnings(&record(Uuid::new_v4())).await.unwrap());
        let second = store.insert_earnings(&record(Uuid::new_v4())).await;

        assert!(matches!(second, Err(StoreError::Contention(_))));
        assert_eq!(store.claimed_gifts(&[gift_id, Uuid::new_v4()]).await.unwrap(), vec![gift_id]);
        assert_eq!(store.stats().earnings_records, 1);
    }

    #[tokio::test]
    async fn test_charge_rejected_when_already_billed() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let start = Utc::now();
        let session = MeteringSession::start(user, "room-1", start);
        store.insert_metering(&session).await.unwrap();

        let (balance, entry) = credited_balance(user, 50);
        let charge = SessionCharge {
            session_id: session.id,
            coins: 7,
            charged_at: start + Duration::seconds(40),
            expected_anchor: start + Duration::seconds(1),
        };
        let result = store.commit_mutation(&balance, 0, &entry, Some(&charge)).await;

        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert!(store.load_balance(user).await.unwrap().is_none());
        let stored = store.get_metering(session.id).await.unwrap().unwrap();
        assert_eq!(stored.total_consumed, 0);
    }

    #[tokio::test]
    async fn test_duration_first_write_wins() {
        let store = MemoryStore::new();
        let session = MeteringSession::start(Uuid::new_v4(), "room-1", Utc::now());
        store.insert_metering(&session).await.unwrap();

        store.set_manual_duration(session.id, 120).await.unwrap();
        let stored = store
            .set_duration_if_absent(session.id, 300, DurationSource::Timestamps)
            .await
            .unwrap();

        assert_eq!(stored, 120);
        let session = store.get_metering(session.id).await.unwrap().unwrap();
        assert_eq!(session.duration_source, Some(DurationSource::Manual));
    }

    #[tokio::test]
    async fn test_end_metering_is_idempotent() {
        let store = MemoryStore::new();
        let session = MeteringSession::start(Uuid::new_v4(), "room-1", Utc::now());
        store.insert_metering(&session).await.unwrap();

        let first = store
            .end_metering(session.id, EndReason::Disconnected, Utc::now())
            .await
            .unwrap();
        let second = store
            .end_metering(session.id, EndReason::SessionTimeout, Utc::now())
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.stats().ended_sessions, 1);
    }
}
