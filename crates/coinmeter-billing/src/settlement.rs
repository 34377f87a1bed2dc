//! Weekly Settlement Engine
//!
//! Aggregates each verified model's unsettled earnings into the payout batch
//! for the current settlement week. Settlement is two-phase:
//!
//! 1. Commit the batch and assign it to every fetched record as one unit of work.
//! 2. Verify by re-reading which records carry the batch id; missing records
//!    are repaired through the direct single-record write path.
//!
//! Only records with no batch are ever touched, so re-running is safe.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use coinmeter_common::{
    CoinmeterError, PayoutAccount, PayoutBatch, PayoutError, Result, SettlementWeek,
};

use crate::collaborators::PayoutAccounts;
use crate::metrics::BillingMetrics;
use crate::retry::{retry_transient, store_call, with_timeout, RetryPolicy};
use crate::store::{EarningsRepository, PayoutRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchAction {
    Created,
    Extended,
}

impl BatchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchAction::Created => "created",
            BatchAction::Extended => "extended",
        }
    }
}

/// Settlement result for one model
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSettlement {
    NothingToSettle,
    BelowThreshold { total: Decimal, minimum: Decimal },
    /// This week's batch is already paid; earnings wait for next week
    WeekClosed { batch_id: Uuid },
    Settled {
        batch: PayoutBatch,
        action: BatchAction,
        records: usize,
        amount: Decimal,
    },
    /// Dry-run: what would have been written
    WouldSettle {
        action: BatchAction,
        records: usize,
        amount: Decimal,
    },
}

/// Counts from one settlement run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReport {
    pub models_considered: usize,
    pub below_threshold: usize,
    pub batches_created: usize,
    pub batches_extended: usize,
    pub records_settled: usize,
    pub weeks_closed: usize,
    pub errors: usize,
}

pub struct SettlementEngine {
    earnings: Arc<dyn EarningsRepository>,
    payouts: Arc<dyn PayoutRepository>,
    accounts: Arc<dyn PayoutAccounts>,
    retry: RetryPolicy,
    metrics: Option<Arc<BillingMetrics>>,
    dry_run: bool,
}

impl SettlementEngine {
    pub fn new(
        earnings: Arc<dyn EarningsRepository>,
        payouts: Arc<dyn PayoutRepository>,
        accounts: Arc<dyn PayoutAccounts>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            earnings,
            payouts,
            accounts,
            retry,
            metrics: None,
            dry_run: false,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BillingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn run(&self) -> Result<SettlementReport> {
        self.run_at(Utc::now()).await
    }

    /// Settle every verified model; one model's failure never blocks another
    #[instrument(skip(self), fields(dry_run = self.dry_run))]
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SettlementReport> {
        let mut report = SettlementReport::default();
        let accounts = self.accounts.payout_accounts().await?;

        for account in accounts.iter().filter(|a| a.verified) {
            report.models_considered += 1;
            match self.settle_model(account, now).await {
                Ok(ModelSettlement::NothingToSettle) => {}
                Ok(ModelSettlement::BelowThreshold { .. }) => report.below_threshold += 1,
                Ok(ModelSettlement::WeekClosed { .. }) => report.weeks_closed += 1,
                Ok(ModelSettlement::Settled { action, records, .. })
                | Ok(ModelSettlement::WouldSettle { action, records, .. }) => {
                    match action {
                        BatchAction::Created => report.batches_created += 1,
                        BatchAction::Extended => report.batches_extended += 1,
                    }
                    report.records_settled += records;
                }
                Err(err) => {
                    report.errors += 1;
                    error!(
                        model_user_id = %account.model_user_id,
                        kind = err.kind(),
                        error = %err,
                        "Settlement failed for model"
                    );
                }
            }
        }

        info!(
            models = report.models_considered,
            created = report.batches_created,
            extended = report.batches_extended,
            records = report.records_settled,
            below_threshold = report.below_threshold,
            errors = report.errors,
            "Settlement run completed"
        );
        Ok(report)
    }

    /// Settle one model's unsettled earnings into this week's batch
    ///
    /// A batch that changed between read and commit (extended by another run
    /// or marked paid) makes the commit fail with contention; the whole
    /// read-extend-commit cycle is then retried from fresh reads.
    pub async fn settle_model(
        &self,
        account: &PayoutAccount,
        now: DateTime<Utc>,
    ) -> Result<ModelSettlement> {
        retry_transient(&self.retry, "settle_model", || self.settle_once(account, now)).await
    }

    async fn settle_once(
        &self,
        account: &PayoutAccount,
        now: DateTime<Utc>,
    ) -> Result<ModelSettlement> {
        let model_user_id = account.model_user_id;
        let earnings = &self.earnings;
        let payouts = &self.payouts;

        let records = store_call(&self.retry, "unsettled_for_model", move || {
            earnings.unsettled_for_model(model_user_id)
        })
        .await?;
        if records.is_empty() {
            return Ok(ModelSettlement::NothingToSettle);
        }

        let total: Decimal = records.iter().map(|r| r.total_earnings).sum();
        if total < account.minimum_payout {
            info!(
                model_user_id = %model_user_id,
                total = %total,
                minimum = %account.minimum_payout,
                "Unsettled earnings below payout minimum"
            );
            return Ok(ModelSettlement::BelowThreshold {
                total,
                minimum: account.minimum_payout,
            });
        }

        let week = SettlementWeek::at(now);
        let existing = store_call(&self.retry, "batch_for_week", move || {
            payouts.batch_for_week(model_user_id, week.start)
        })
        .await?;

        let (mut batch, action) = match existing {
            Some(batch) if batch.is_pending() => (batch, BatchAction::Extended),
            Some(batch) => {
                info!(
                    model_user_id = %model_user_id,
                    batch_id = %batch.id,
                    "Week already paid, deferring earnings"
                );
                return Ok(ModelSettlement::WeekClosed { batch_id: batch.id });
            }
            None => (PayoutBatch::open(model_user_id, week, now), BatchAction::Created),
        };
        let expected_version = match action {
            BatchAction::Created => 0,
            BatchAction::Extended => batch.version,
        };
        batch.extend(total, records.len() as u64, now)?;

        if self.dry_run {
            info!(
                model_user_id = %model_user_id,
                action = action.as_str(),
                records = records.len(),
                amount = %total,
                "Dry run: would settle"
            );
            return Ok(ModelSettlement::WouldSettle {
                action,
                records: records.len(),
                amount: total,
            });
        }

        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        // Not retried here: contention needs fresh reads, see settle_model
        let assigned = with_timeout(
            self.retry.call_timeout,
            "commit_settlement",
            payouts.commit_settlement(&batch, expected_version, &ids),
        )
        .await?;

        self.verify_assignment(batch.id, &ids, assigned).await?;

        if let Some(metrics) = &self.metrics {
            metrics.batch_written(action.as_str());
        }
        info!(
            model_user_id = %model_user_id,
            batch_id = %batch.id,
            action = action.as_str(),
            records = ids.len(),
            amount = %total,
            gross = %batch.gross_amount,
            "Payout batch written"
        );

        Ok(ModelSettlement::Settled {
            batch,
            action,
            records: ids.len(),
            amount: total,
        })
    }

    /// Check every id carries the batch; repair stragglers with direct writes
    async fn verify_assignment(&self, batch_id: Uuid, ids: &[Uuid], assigned: usize) -> Result<()> {
        let missing = self.missing_from_batch(batch_id, ids).await?;
        if missing.is_empty() {
            return Ok(());
        }

        warn!(
            batch_id = %batch_id,
            expected = ids.len(),
            assigned,
            missing = missing.len(),
            "Settlement verification found unassigned records, repairing"
        );

        let earnings = &self.earnings;
        for record_id in missing {
            let result = store_call(&self.retry, "assign_batch_direct", move || {
                earnings.assign_batch_direct(record_id, batch_id)
            })
            .await;
            match result {
                Ok(true) => {}
                Ok(false) => {
                    warn!(record_id = %record_id, batch_id = %batch_id, "Record settled into another batch")
                }
                Err(err) => {
                    warn!(record_id = %record_id, error = %err, "Direct batch assignment failed")
                }
            }
        }

        let still_missing = self.missing_from_batch(batch_id, ids).await?;
        if still_missing.is_empty() {
            info!(batch_id = %batch_id, "Settlement repaired by direct writes");
            return Ok(());
        }

        let found = ids.len() - still_missing.len();
        error!(
            batch_id = %batch_id,
            expected = ids.len(),
            found,
            "Settlement verification mismatch persists"
        );
        Err(CoinmeterError::SettlementVerification {
            batch_id,
            expected: ids.len(),
            found,
        })
    }

    async fn missing_from_batch(&self, batch_id: Uuid, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let earnings = &self.earnings;
        let present: HashSet<Uuid> = store_call(&self.retry, "record_ids_in_batch", move || {
            earnings.record_ids_in_batch(batch_id)
        })
        .await?
        .into_iter()
        .collect();
        Ok(ids.iter().copied().filter(|id| !present.contains(id)).collect())
    }

    /// Close a pending batch as paid
    #[instrument(skip(self, method, reference))]
    pub async fn mark_paid(
        &self,
        batch_id: Uuid,
        method: &str,
        reference: &str,
    ) -> Result<PayoutBatch> {
        let batch = retry_transient(&self.retry, "mark_paid", || {
            self.mark_paid_once(batch_id, method, reference)
        })
        .await?;

        info!(
            batch_id = %batch_id,
            model_user_id = %batch.model_user_id,
            gross = %batch.gross_amount,
            "Payout batch marked paid"
        );
        Ok(batch)
    }

    async fn mark_paid_once(
        &self,
        batch_id: Uuid,
        method: &str,
        reference: &str,
    ) -> Result<PayoutBatch> {
        let payouts = &self.payouts;
        let mut batch = store_call(&self.retry, "get_batch", move || payouts.get_batch(batch_id))
            .await?
            .ok_or(PayoutError::NotFound(batch_id))?;

        let expected_version = batch.version;
        batch.mark_paid(method, reference, Utc::now())?;
        with_timeout(
            self.retry.call_timeout,
            "update_batch",
            payouts.update_batch(&batch, expected_version),
        )
        .await?;
        Ok(batch)
    }

    /// All batches for a model, oldest week first
    pub async fn batches_for_model(&self, model_user_id: Uuid) -> Result<Vec<PayoutBatch>> {
        let payouts = &self.payouts;
        store_call(&self.retry, "batches_for_model", move || {
            payouts.batches_for_model(model_user_id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryPayoutAccounts;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use coinmeter_common::{EarningsRecord, EarningsSource, PayoutStatus, StoreError, UserId};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn record(model: UserId, total: Decimal) -> EarningsRecord {
        EarningsRecord {
            id: Uuid::now_v7(),
            session_id: Uuid::new_v4(),
            model_user_id: model,
            client_user_id: Uuid::new_v4(),
            room_name: "room-1".into(),
            duration_seconds: 120,
            qualifying: true,
            time_earnings: total,
            gift_earnings: Decimal::ZERO,
            total_earnings: total,
            platform_share: Decimal::ZERO,
            gift_coins: 0,
            source_type: EarningsSource::VideoSession,
            gift_ids: Vec::new(),
            payout_batch_id: None,
            created_at: Utc::now(),
        }
    }

    fn account(model: UserId, minimum: Decimal) -> PayoutAccount {
        PayoutAccount {
            model_user_id: model,
            verified: true,
            minimum_payout: minimum,
            payout_method: Some("bank_transfer".into()),
        }
    }

    fn engine(store: Arc<MemoryStore>, accounts: Arc<InMemoryPayoutAccounts>) -> SettlementEngine {
        SettlementEngine::new(store.clone(), store, accounts, RetryPolicy::default())
    }

    #[tokio::test]
    async fn test_below_threshold_creates_nothing() {
        let store = Arc::new(MemoryStore::new());
        let accounts = Arc::new(InMemoryPayoutAccounts::new());
        let model = Uuid::new_v4();
        accounts.upsert(account(model, dec!(20.00)));
        store.insert_earnings(&record(model, dec!(12.50))).await.unwrap();

        let report = engine(store.clone(), accounts).run().await.unwrap();

        assert_eq!(report.below_threshold, 1);
        assert_eq!(report.batches_created, 0);
        assert!(store.batches_for_model(model).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settles_and_extends_within_week() {
        let store = Arc::new(MemoryStore::new());
        let accounts = Arc::new(InMemoryPayoutAccounts::new());
        let model = Uuid::new_v4();
        accounts.upsert(account(model, dec!(5.00)));
        let engine = engine(store.clone(), accounts);
        let now = Utc::now();

        store.insert_earnings(&record(model, dec!(6.00))).await.unwrap();
        store.insert_earnings(&record(model, dec!(4.00))).await.unwrap();
        let first = engine.run_at(now).await.unwrap();
        assert_eq!(first.batches_created, 1);
        assert_eq!(first.records_settled, 2);

        store.insert_earnings(&record(model, dec!(7.25))).await.unwrap();
        let second = engine.run_at(now).await.unwrap();
        assert_eq!(second.batches_extended, 1);

        let batches = store.batches_for_model(model).await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].gross_amount, dec!(17.25));
        assert_eq!(batches[0].total_sessions, 3);
        assert!(store.unsettled_for_model(model).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let accounts = Arc::new(InMemoryPayoutAccounts::new());
        let model = Uuid::new_v4();
        accounts.upsert(account(model, dec!(1.00)));
        let engine = engine(store.clone(), accounts);
        store.insert_earnings(&record(model, dec!(3.00))).await.unwrap();

        engine.run().await.unwrap();
        let before = store.earnings_for_model(model).await.unwrap();
        let batches_before = store.batches_for_model(model).await.unwrap();

        let report = engine.run().await.unwrap();

        assert_eq!(report.batches_created + report.batches_extended, 0);
        assert_eq!(store.earnings_for_model(model).await.unwrap(), before);
        assert_eq!(store.batches_for_model(model).await.unwrap(), batches_before);
    }

    #[tokio::test]
    async fn test_unverified_models_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let accounts = Arc::new(InMemoryPayoutAccounts::new());
        let model = Uuid::new_v4();
        accounts.upsert(PayoutAccount {
            verified: false,
            ..account(model, dec!(0))
        });
        store.insert_earnings(&record(model, dec!(50.00))).await.unwrap();

        let report = engine(store.clone(), accounts).run().await.unwrap();

        assert_eq!(report.models_considered, 0);
        assert_eq!(store.unsettled_for_model(model).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_paid_week_is_closed() {
        let store = Arc::new(MemoryStore::new());
        let accounts = Arc::new(InMemoryPayoutAccounts::new());
        let model = Uuid::new_v4();
        accounts.upsert(account(model, dec!(1.00)));
        let engine = engine(store.clone(), accounts);
        let now = Utc::now();

        store.insert_earnings(&record(model, dec!(3.00))).await.unwrap();
        engine.run_at(now).await.unwrap();
        let batch = store.batches_for_model(model).await.unwrap().remove(0);
        let paid = engine.mark_paid(batch.id, "bank_transfer", "tx-9").await.unwrap();
        assert_eq!(paid.status, PayoutStatus::Paid);

        store.insert_earnings(&record(model, dec!(2.00))).await.unwrap();
        let report = engine.run_at(now).await.unwrap();

        assert_eq!(report.weeks_closed, 1);
        assert_eq!(store.unsettled_for_model(model).await.unwrap().len(), 1);
        let stored = store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(stored.gross_amount, dec!(3.00));

        let again = engine.mark_paid(batch.id, "bank_transfer", "tx-10").await;
        assert!(matches!(
            again,
            Err(CoinmeterError::Payout(PayoutError::AlreadyPaid(_)))
        ));
    }

    /// Pays the week's batch right after the engine reads it, once
    struct PaidAfterRead {
        inner: Arc<MemoryStore>,
        paid: AtomicBool,
    }

    #[async_trait]
    impl PayoutRepository for PaidAfterRead {
        async fn batch_for_week(
            &self,
            model_user_id: UserId,
            week_start: NaiveDate,
        ) -> std::result::Result<Option<PayoutBatch>, StoreError> {
            let read = self.inner.batch_for_week(model_user_id, week_start).await?;
            if let Some(batch) = &read {
                if batch.is_pending() && !self.paid.swap(true, Ordering::SeqCst) {
                    let mut paid = batch.clone();
                    paid.mark_paid("bank_transfer", "tx-concurrent", Utc::now()).unwrap();
                    self.inner.update_batch(&paid, batch.version).await?;
                }
            }
            Ok(read)
        }

        async fn get_batch(&self, id: Uuid) -> std::result::Result<Option<PayoutBatch>, StoreError> {
            self.inner.get_batch(id).await
        }

        async fn batches_for_model(
            &self,
            model_user_id: UserId,
        ) -> std::result::Result<Vec<PayoutBatch>, StoreError> {
            self.inner.batches_for_model(model_user_id).await
        }

        async fn update_batch(
            &self,
            batch: &PayoutBatch,
            expected_version: u64,
        ) -> std::result::Result<(), StoreError> {
            self.inner.update_batch(batch, expected_version).await
        }

        async fn commit_settlement(
            &self,
            batch: &PayoutBatch,
            expected_version: u64,
            record_ids: &[Uuid],
        ) -> std::result::Result<usize, StoreError> {
            self.inner.commit_settlement(batch, expected_version, record_ids).await
        }
    }

    #[tokio::test]
    async fn test_batch_paid_mid_settlement_stays_paid() {
        let store = Arc::new(MemoryStore::new());
        let accounts = Arc::new(InMemoryPayoutAccounts::new());
        let model = Uuid::new_v4();
        accounts.upsert(account(model, dec!(1.00)));
        let now = Utc::now();

        store.insert_earnings(&record(model, dec!(3.00))).await.unwrap();
        engine(store.clone(), accounts.clone()).run_at(now).await.unwrap();
        let batch = store.batches_for_model(model).await.unwrap().remove(0);

        let late = record(model, dec!(2.00));
        store.insert_earnings(&late).await.unwrap();
        let payouts = Arc::new(PaidAfterRead {
            inner: store.clone(),
            paid: AtomicBool::new(false),
        });
        let retry = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
            call_timeout: Duration::from_secs(1),
        };
        let racing = SettlementEngine::new(store.clone(), payouts, accounts, retry);

        let report = racing.run_at(now).await.unwrap();

        assert_eq!(report.weeks_closed, 1);
        assert_eq!(report.batches_extended, 0);
        assert_eq!(report.errors, 0);
        let stored = store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Paid);
        assert_eq!(stored.gross_amount, dec!(3.00));
        assert_eq!(stored.total_sessions, 1);
        let unsettled = store.unsettled_for_model(model).await.unwrap();
        assert_eq!(unsettled.len(), 1);
        assert_eq!(unsettled[0].id, late.id);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let accounts = Arc::new(InMemoryPayoutAccounts::new());
        let model = Uuid::new_v4();
        accounts.upsert(account(model, dec!(1.00)));
        store.insert_earnings(&record(model, dec!(3.00))).await.unwrap();

        let report = engine(store.clone(), accounts)
            .dry_run(true)
            .run()
            .await
            .unwrap();

        assert_eq!(report.batches_created, 1);
        assert!(store.batches_for_model(model).await.unwrap().is_empty());
        assert_eq!(store.unsettled_for_model(model).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_paid_unknown_batch() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store, Arc::new(InMemoryPayoutAccounts::new()));
        let result = engine.mark_paid(Uuid::new_v4(), "bank_transfer", "tx").await;
        assert!(matches!(
            result,
            Err(CoinmeterError::Payout(PayoutError::NotFound(_)))
        ));
    }
}
