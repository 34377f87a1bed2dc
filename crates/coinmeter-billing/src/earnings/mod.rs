//! Earnings Processor
//!
//! Turns an ended metering session into exactly one immutable
//! [`EarningsRecord`]. The session id is the idempotency key: processing the
//! same session again is a no-op.
//!
//! Duration is reconciled in priority order: a stored (manual) value, then the
//! session timestamps, then a fallback heuristic. Whatever is computed is
//! persisted only if no value appeared in the meantime.
//!
//! Each gift is counted by at most one record. A session only picks up gifts
//! no other record has claimed, and a standalone gift already claimed by a
//! session is not recorded again.

pub mod duration;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use coinmeter_common::{
    BillingConfig, DurationSource, EarningsRecord, EarningsSource, GiftTransaction,
    MeteringSession, Result, UserId,
};

use crate::collaborators::GiftSource;
use crate::metrics::BillingMetrics;
use crate::registry::SessionRegistry;
use crate::retry::{retry_transient, store_call, with_timeout, RetryPolicy};
use crate::store::EarningsRepository;

/// Result of handing a session to the processor
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Recorded(EarningsRecord),
    /// A record for this session already exists
    AlreadyProcessed,
    /// No model could be attributed to the session
    Unattributed,
    /// The session has not ended yet
    StillActive,
}

/// Earnings split for one session or gift
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarningsSplit {
    pub qualifying: bool,
    pub time_earnings: Decimal,
    pub gift_earnings: Decimal,
    pub total_earnings: Decimal,
    pub platform_share: Decimal,
}

/// Compute the model/platform split for a reconciled duration and gift total
pub fn split_earnings(config: &BillingConfig, duration_secs: u64, gift_coins: u64) -> EarningsSplit {
    let qualifying = duration_secs >= config.qualifying_duration_secs;

    let time_earnings = if qualifying {
        let minutes = Decimal::from(duration_secs) / Decimal::from(coinmeter_common::SECONDS_PER_MINUTE);
        (minutes * config.time_rate_per_minute).round_dp(2)
    } else {
        Decimal::ZERO
    };

    let gift_gross = Decimal::from(gift_coins);
    let gift_earnings = (gift_gross * config.model_gift_share).round_dp(2);

    EarningsSplit {
        qualifying,
        time_earnings,
        gift_earnings,
        total_earnings: time_earnings + gift_earnings,
        platform_share: gift_gross - gift_earnings,
    }
}

/// Counts from a recovery sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub examined: usize,
    pub recorded: usize,
    pub unattributed: usize,
    /// Sessions already found unattributed by an earlier sweep
    pub skipped: usize,
    pub errors: usize,
}

pub struct EarningsProcessor {
    config: Arc<BillingConfig>,
    registry: Arc<SessionRegistry>,
    earnings: Arc<dyn EarningsRepository>,
    gifts: Arc<dyn GiftSource>,
    retry: RetryPolicy,
    metrics: Option<Arc<BillingMetrics>>,
    /// Sessions with no attributable model, keyed to when they ended
    unattributed: DashMap<Uuid, DateTime<Utc>>,
}

impl EarningsProcessor {
    pub fn new(
        config: Arc<BillingConfig>,
        registry: Arc<SessionRegistry>,
        earnings: Arc<dyn EarningsRepository>,
        gifts: Arc<dyn GiftSource>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            config,
            registry,
            earnings,
            gifts,
            retry,
            metrics: None,
            unattributed: DashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BillingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Process an ended session by id
    pub async fn process(&self, session_id: Uuid) -> Result<ProcessOutcome> {
        self.process_at(session_id, Utc::now()).await
    }

    #[instrument(skip(self))]
    pub async fn process_at(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<ProcessOutcome> {
        let session = self.registry.get(session_id).await?;
        if session.is_active() {
            return Ok(ProcessOutcome::StillActive);
        }
        if self.existing_record(session_id).await?.is_some() {
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        let Some(model_user_id) = self.attribute_model(&session).await? else {
            warn!(
                session_id = %session_id,
                room_name = %session.room_name,
                "No model attributable to session, skipping earnings"
            );
            self.unattributed
                .insert(session_id, session.ended_at.unwrap_or(now));
            return Ok(ProcessOutcome::Unattributed);
        };
        self.unattributed.remove(&session_id);

        let duration_secs = self.reconcile_duration(session_id, now).await?;

        // A gift claimed by a concurrent write fails the insert; start over
        // from a fresh gift read
        retry_transient(&self.retry, "record_session", || {
            self.record_session(&session, model_user_id, duration_secs, now)
        })
        .await
    }

    async fn record_session(
        &self,
        session: &MeteringSession,
        model_user_id: UserId,
        duration_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        let window_end = session.ended_at.unwrap_or(now);
        let gifts = self
            .gifts
            .gifts_between(
                model_user_id,
                session.user_id,
                &session.room_name,
                session.started_at,
                window_end,
            )
            .await?;
        let gifts = self.unclaimed(gifts).await?;
        let gift_coins: u64 = gifts.iter().map(|g| g.amount).sum();

        let split = split_earnings(&self.config, duration_secs, gift_coins);
        let source_type = if split.time_earnings.is_zero() && gift_coins > 0 {
            EarningsSource::for_gift_room(&session.room_name)
        } else {
            EarningsSource::VideoSession
        };

        let mut record = build_record(
            session.id,
            model_user_id,
            session.user_id,
            &session.room_name,
            duration_secs,
            gift_coins,
            split,
            source_type,
            now,
        );
        record.gift_ids = gifts.iter().map(|g| g.id).collect();
        self.insert(record).await
    }

    /// Drop gifts some other record already counted
    async fn unclaimed(&self, gifts: Vec<GiftTransaction>) -> Result<Vec<GiftTransaction>> {
        if gifts.is_empty() {
            return Ok(gifts);
        }
        let earnings = &self.earnings;
        let ids: Vec<Uuid> = gifts.iter().map(|g| g.id).collect();
        let ids_ref = ids.as_slice();
        let claimed = store_call(&self.retry, "claimed_gifts", move || {
            earnings.claimed_gifts(ids_ref)
        })
        .await?;
        Ok(gifts.into_iter().filter(|g| !claimed.contains(&g.id)).collect())
    }

    /// Write a gift-only record for a gift outside any metering session
    #[instrument(skip(self, gift), fields(gift_id = %gift.id))]
    pub async fn record_gift(&self, gift: &GiftTransaction) -> Result<ProcessOutcome> {
        gift.validate()?;
        retry_transient(&self.retry, "record_gift", || self.record_gift_once(gift)).await
    }

    async fn record_gift_once(&self, gift: &GiftTransaction) -> Result<ProcessOutcome> {
        if self.existing_record(gift.id).await?.is_some() {
            return Ok(ProcessOutcome::AlreadyProcessed);
        }
        if self.unclaimed(vec![gift.clone()]).await?.is_empty() {
            info!(gift_id = %gift.id, "Gift already counted by a session record");
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        let split = split_earnings(&self.config, 0, gift.amount);
        let mut record = build_record(
            gift.id,
            gift.receiver_user_id,
            gift.sender_user_id,
            &gift.room_name,
            0,
            gift.amount,
            split,
            EarningsSource::for_gift_room(&gift.room_name),
            gift.sent_at,
        );
        record.gift_ids = vec![gift.id];
        self.insert(record).await
    }

    /// Process ended sessions that never got an earnings record
    ///
    /// Sessions found unattributed are remembered and not examined again by
    /// later sweeps; [`EarningsProcessor::process`] still handles them on
    /// request.
    pub async fn recover_ended(
        &self,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        self.unattributed.retain(|_, ended_at| *ended_at >= since);

        for session in self.registry.ended_since(since).await? {
            if self.unattributed.contains_key(&session.id) {
                report.skipped += 1;
                continue;
            }
            report.examined += 1;
            match self.existing_record(session.id).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    report.errors += 1;
                    error!(session_id = %session.id, error = %err, "Earnings lookup failed during recovery");
                    continue;
                }
            }

            match self.process_at(session.id, now).await {
                Ok(ProcessOutcome::Recorded(_)) => report.recorded += 1,
                Ok(ProcessOutcome::Unattributed) => report.unattributed += 1,
                Ok(_) => {}
                Err(err) => {
                    report.errors += 1;
                    error!(session_id = %session.id, error = %err, "Earnings recovery failed");
                }
            }
        }

        if report.recorded > 0 || report.errors > 0 {
            info!(
                examined = report.examined,
                recorded = report.recorded,
                errors = report.errors,
                "Earnings recovery sweep finished"
            );
        }
        Ok(report)
    }

    /// Recovery window ending at `now`
    pub fn recovery_window(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(self.config.stale_session_cap_secs)
    }

    /// Authoritative duration for a session, persisting it if newly computed
    pub async fn reconcile_duration(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        // Re-read so a manual value written after termination is honoured
        let session = self.registry.get(session_id).await?;
        if let Some(seconds) = session.actual_duration_seconds {
            return Ok(seconds);
        }

        let (seconds, source) =
            match duration::from_timestamps(&session, self.config.max_plausible_duration_secs) {
                Ok(seconds) => (seconds, DurationSource::Timestamps),
                Err(err) => {
                    let seconds = duration::fallback(&session, &self.config, now);
                    warn!(
                        session_id = %session_id,
                        error = %err,
                        fallback_secs = seconds,
                        "Session timestamps unusable, using fallback duration"
                    );
                    (seconds, DurationSource::Fallback)
                }
            };

        self.registry
            .persist_duration(session_id, seconds, source)
            .await
    }

    async fn attribute_model(&self, session: &MeteringSession) -> Result<Option<UserId>> {
        if let Some(model) = session.model_user_id {
            return Ok(Some(model));
        }
        let pairing = self.registry.latest_pairing(&session.room_name).await?;
        Ok(pairing
            .filter(|p| p.client_user_id == session.user_id)
            .map(|p| p.model_user_id))
    }

    async fn existing_record(&self, session_id: Uuid) -> Result<Option<EarningsRecord>> {
        let earnings = &self.earnings;
        store_call(&self.retry, "earnings_for_session", move || {
            earnings.earnings_for_session(session_id)
        })
        .await
    }

    /// Single attempt; callers retry from fresh reads on contention
    async fn insert(&self, record: EarningsRecord) -> Result<ProcessOutcome> {
        let inserted = with_timeout(
            self.retry.call_timeout,
            "insert_earnings",
            self.earnings.insert_earnings(&record),
        )
        .await?;

        if !inserted {
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        if let Some(metrics) = &self.metrics {
            metrics.earnings_recorded(record.source_type.as_str());
        }
        info!(
            session_id = %record.session_id,
            model_user_id = %record.model_user_id,
            duration_secs = record.duration_seconds,
            qualifying = record.qualifying,
            total_earnings = %record.total_earnings,
            source = %record.source_type,
            "Earnings recorded"
        );
        Ok(ProcessOutcome::Recorded(record))
    }
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    session_id: Uuid,
    model_user_id: UserId,
    client_user_id: UserId,
    room_name: &str,
    duration_seconds: u64,
    gift_coins: u64,
    split: EarningsSplit,
    source_type: EarningsSource,
    now: DateTime<Utc>,
) -> EarningsRecord {
    EarningsRecord {
        id: Uuid::now_v7(),
        session_id,
        model_user_id,
        client_user_id,
        room_name: room_name.to_string(),
        duration_seconds,
        qualifying: split.qualifying,
        time_earnings: split.time_earnings,
        gift_earnings: split.gift_earnings,
        total_earnings: split.total_earnings,
        platform_share: split.platform_share,
        gift_coins,
        source_type,
        gift_ids: Vec::new(),
        payout_batch_id: None,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryGiftSource;
    use crate::store::MemoryStore;
    use coinmeter_common::{EndReason, GiftDetails, PairingSession};
    use rust_decimal_macros::dec;

    struct Fixture {
        processor: EarningsProcessor,
        store: Arc<MemoryStore>,
        registry: Arc<SessionRegistry>,
        gifts: Arc<InMemoryGiftSource>,
        client: UserId,
        model: UserId,
    }

    async fn fixture(room: &str) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(BillingConfig::default());
        let registry = Arc::new(SessionRegistry::new(store.clone(), config.clone()));
        let gifts = Arc::new(InMemoryGiftSource::new());
        let processor =
            EarningsProcessor::new(config, registry.clone(), store.clone(), gifts.clone());

        let client = Uuid::new_v4();
        let model = Uuid::new_v4();
        registry
            .upsert_pairing(&PairingSession::active(room, client, model, Utc::now() - Duration::hours(1)))
            .await
            .unwrap();

        Fixture {
            processor,
            store,
            registry,
            gifts,
            client,
            model,
        }
    }

    async fn ended_session(f: &Fixture, room: &str, seconds: i64) -> MeteringSession {
        let start = Utc::now() - Duration::minutes(30);
        let session = f.registry.start_metering_at(f.client, room, start).await.unwrap();
        f.registry
            .end_metering_at(session.id, EndReason::Disconnected, start + Duration::seconds(seconds))
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_qualification_boundary() {
        let config = BillingConfig::default();

        let short = split_earnings(&config, 59, 0);
        assert!(!short.qualifying);
        assert_eq!(short.time_earnings, Decimal::ZERO);

        let exact = split_earnings(&config, 60, 0);
        assert!(exact.qualifying);
        assert_eq!(exact.time_earnings, dec!(0.50));
    }

    #[test]
    fn test_gift_commission_split() {
        let config = BillingConfig::default();
        let split = split_earnings(&config, 90, 25);

        assert_eq!(split.time_earnings, dec!(0.75));
        assert_eq!(split.gift_earnings, dec!(15.00));
        assert_eq!(split.platform_share, dec!(10.00));
        assert_eq!(split.total_earnings, dec!(15.75));
    }

    #[tokio::test]
    async fn test_second_invocation_is_noop() {
        let f = fixture("room-1").await;
        let session = ended_session(&f, "room-1", 300).await;

        let first = f.processor.process(session.id).await.unwrap();
        let second = f.processor.process(session.id).await.unwrap();

        match first {
            ProcessOutcome::Recorded(record) => {
                assert_eq!(record.duration_seconds, 300);
                assert_eq!(record.model_user_id, f.model);
                assert_eq!(record.time_earnings, dec!(2.50));
                assert_eq!(record.source_type, EarningsSource::VideoSession);
                assert!(record.payout_batch_id.is_none());
            }
            other => panic!("expected a record, got {:?}", other),
        }
        assert_eq!(second, ProcessOutcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn test_manual_duration_is_never_overwritten() {
        let f = fixture("room-1").await;
        let session = ended_session(&f, "room-1", 300).await;
        f.registry.set_manual_duration(session.id, 120).await.unwrap();

        let first = f.processor.reconcile_duration(session.id, Utc::now()).await.unwrap();
        let second = f.processor.reconcile_duration(session.id, Utc::now()).await.unwrap();

        assert_eq!(first, 120);
        assert_eq!(second, 120);
        let stored = f.registry.get(session.id).await.unwrap();
        assert_eq!(stored.actual_duration_seconds, Some(120));
        assert_eq!(stored.duration_source, Some(DurationSource::Manual));
    }

    #[tokio::test]
    async fn test_implausible_timestamps_use_fallback() {
        let f = fixture("room-1").await;
        let start = Utc::now() - Duration::hours(3);
        let session = f.registry.start_metering_at(f.client, "room-1", start).await.unwrap();
        f.registry
            .end_metering_at(session.id, EndReason::SessionTimeout, start + Duration::hours(2))
            .await
            .unwrap();

        let seconds = f.processor.reconcile_duration(session.id, Utc::now()).await.unwrap();

        assert_eq!(seconds, 60);
        let stored = f.registry.get(session.id).await.unwrap();
        assert_eq!(stored.duration_source, Some(DurationSource::Fallback));
    }

    #[tokio::test]
    async fn test_gift_only_session_classified_by_room() {
        let f = fixture("chat-42").await;
        let session = ended_session(&f, "chat-42", 30).await;
        let gift = GiftTransaction::new(
            f.client,
            f.model,
            "chat-42",
            10,
            GiftDetails::default(),
            session.started_at + Duration::seconds(10),
        )
        .unwrap();
        f.gifts.push(gift).unwrap();

        let outcome = f.processor.process(session.id).await.unwrap();

        let ProcessOutcome::Recorded(record) = outcome else {
            panic!("expected a record");
        };
        assert!(!record.qualifying);
        assert_eq!(record.source_type, EarningsSource::ChatGift);
        assert_eq!(record.gift_coins, 10);
        assert_eq!(record.gift_earnings, dec!(6.00));
        assert_eq!(record.platform_share, dec!(4.00));
    }

    #[tokio::test]
    async fn test_active_session_is_not_processed() {
        let f = fixture("room-1").await;
        let session = f.registry.start_metering(f.client, "room-1").await.unwrap();
        let outcome = f.processor.process(session.id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::StillActive);
    }

    #[tokio::test]
    async fn test_unattributed_session_is_skipped() {
        let f = fixture("room-1").await;
        let session = ended_session(&f, "room-unpaired", 120).await;
        let outcome = f.processor.process(session.id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Unattributed);
    }

    #[tokio::test]
    async fn test_standalone_gift_record() {
        let f = fixture("room-1").await;
        let gift = GiftTransaction::new(
            f.client,
            f.model,
            "dm-room",
            5,
            GiftDetails::default(),
            Utc::now(),
        )
        .unwrap();

        let first = f.processor.record_gift(&gift).await.unwrap();
        let second = f.processor.record_gift(&gift).await.unwrap();

        let ProcessOutcome::Recorded(record) = first else {
            panic!("expected a record");
        };
        assert_eq!(record.session_id, gift.id);
        assert_eq!(record.source_type, EarningsSource::DirectGift);
        assert_eq!(record.total_earnings, dec!(3.00));
        assert_eq!(second, ProcessOutcome::AlreadyProcessed);
    }

    fn gift_during(f: &Fixture, session: &MeteringSession, coins: u64) -> GiftTransaction {
        GiftTransaction::new(
            f.client,
            f.model,
            &session.room_name,
            coins,
            GiftDetails::default(),
            session.started_at + Duration::seconds(10),
        )
        .unwrap()
    }

    async fn gift_earnings_total(f: &Fixture) -> Decimal {
        f.store
            .earnings_for_model(f.model)
            .await
            .unwrap()
            .iter()
            .map(|r| r.gift_earnings)
            .sum()
    }

    #[tokio::test]
    async fn test_gift_in_session_not_recorded_again_standalone() {
        let f = fixture("room-1").await;
        let session = ended_session(&f, "room-1", 300).await;
        let gift = gift_during(&f, &session, 10);
        f.gifts.push(gift.clone()).unwrap();

        let ProcessOutcome::Recorded(record) = f.processor.process(session.id).await.unwrap() else {
            panic!("expected a record");
        };
        assert_eq!(record.gift_ids, vec![gift.id]);

        let standalone = f.processor.record_gift(&gift).await.unwrap();

        assert_eq!(standalone, ProcessOutcome::AlreadyProcessed);
        assert_eq!(gift_earnings_total(&f).await, dec!(6.00));
    }

    #[tokio::test]
    async fn test_standalone_gift_excluded_from_later_session() {
        let f = fixture("room-1").await;
        let session = ended_session(&f, "room-1", 300).await;
        let gift = gift_during(&f, &session, 10);
        f.gifts.push(gift.clone()).unwrap();

        let standalone = f.processor.record_gift(&gift).await.unwrap();
        assert!(matches!(standalone, ProcessOutcome::Recorded(_)));

        let ProcessOutcome::Recorded(record) = f.processor.process(session.id).await.unwrap() else {
            panic!("expected a record");
        };

        assert_eq!(record.gift_coins, 0);
        assert!(record.gift_ids.is_empty());
        assert_eq!(record.time_earnings, dec!(2.50));
        assert_eq!(gift_earnings_total(&f).await, dec!(6.00));
    }

    #[tokio::test]
    async fn test_recovery_skips_known_unattributed_sessions() {
        let f = fixture("room-1").await;
        ended_session(&f, "room-unpaired", 120).await;
        let now = Utc::now();
        let since = f.processor.recovery_window(now);

        let first = f.processor.recover_ended(since, now).await.unwrap();
        assert_eq!((first.examined, first.unattributed), (1, 1));

        let second = f.processor.recover_ended(since, now).await.unwrap();
        assert_eq!(second.examined, 0);
        assert_eq!(second.unattributed, 0);
        assert_eq!(second.skipped, 1);

        // Once the session ages out of the window the marker is dropped
        let later = now + Duration::days(30);
        let expired = f
            .processor
            .recover_ended(f.processor.recovery_window(later), later)
            .await
            .unwrap();
        assert_eq!(expired, RecoveryReport::default());
        assert!(f.processor.unattributed.is_empty());
    }

    #[tokio::test]
    async fn test_recovery_records_missing_earnings() {
        let f = fixture("room-1").await;
        let session = ended_session(&f, "room-1", 200).await;
        let now = Utc::now();

        let report = f
            .processor
            .recover_ended(f.processor.recovery_window(now), now)
            .await
            .unwrap();
        assert_eq!(report.recorded, 1);

        let again = f
            .processor
            .recover_ended(f.processor.recovery_window(now), now)
            .await
            .unwrap();
        assert_eq!(again.recorded, 0);
        assert!(matches!(
            f.processor.process(session.id).await.unwrap(),
            ProcessOutcome::AlreadyProcessed
        ));
    }
}
