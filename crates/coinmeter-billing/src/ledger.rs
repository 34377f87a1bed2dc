//! Coin Ledger
//!
//! Authoritative dual-balance store with an append-only audit log. Every
//! mutation for a user runs under that user's lock and is committed together
//! with exactly one [`LedgerEntry`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use coinmeter_common::{
    replay, Balance, BillingConfig, CoinDelta, CoinType, CoinmeterError, LedgerEntry, LedgerError,
    LedgerSource, MeteringSession, ReplayedBalance, Result, UserId,
};

use crate::retry::{retry_transient, with_timeout, RetryPolicy};
use crate::store::{BalanceRepository, SessionCharge};

/// Outcome of the admission gate for a new connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCheck {
    pub allowed: bool,
    pub total_balance: u64,
    /// Coins missing to reach the minimum; zero when allowed
    pub deficit: u64,
    pub minutes_available: u64,
}

/// Coin Ledger over a [`BalanceRepository`]
pub struct CoinLedger {
    store: Arc<dyn BalanceRepository>,
    config: Arc<BillingConfig>,
    retry: RetryPolicy,
    /// Per-user mutation locks, dropped once nobody holds them
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl CoinLedger {
    pub fn new(store: Arc<dyn BalanceRepository>, config: Arc<BillingConfig>) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            store,
            config,
            retry,
            locks: DashMap::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Current balance; a zero balance for users never seen before
    pub async fn balance(&self, user_id: UserId) -> Result<Balance> {
        let stored = with_timeout(
            self.retry.call_timeout,
            "load_balance",
            self.store.load_balance(user_id),
        )
        .await?;
        Ok(stored.unwrap_or_else(|| Balance::new(user_id, Utc::now())))
    }

    /// Whole minutes the user's balance pays for
    pub async fn minutes_available(&self, user_id: UserId) -> Result<u64> {
        let balance = self.balance(user_id).await?;
        Ok(self.config.minutes_available(balance.total()))
    }

    /// Read-only admission gate
    pub async fn can_start(&self, user_id: UserId, minimum_coins: u64) -> Result<StartCheck> {
        let total = self.balance(user_id).await?.total();
        Ok(StartCheck {
            allowed: total >= minimum_coins,
            total_balance: total,
            deficit: minimum_coins.saturating_sub(total),
            minutes_available: self.config.minutes_available(total),
        })
    }

    /// Admission gate at the configured minimum (`cost_per_minute * minimum_start_minutes`)
    pub async fn can_start_default(&self, user_id: UserId) -> Result<StartCheck> {
        self.can_start(user_id, self.config.minimum_start_balance())
            .await
    }

    pub async fn has_sufficient(&self, user_id: UserId, coins: u64) -> Result<bool> {
        Ok(self.balance(user_id).await?.covers(coins))
    }

    /// Credit coins to one sub-balance
    #[instrument(skip(self, note))]
    pub async fn credit(
        &self,
        user_id: UserId,
        coins: u64,
        coin_type: CoinType,
        source: LedgerSource,
        note: Option<String>,
    ) -> Result<Balance> {
        let now = Utc::now();
        let balance = self
            .mutate(user_id, "credit", source, None, note, None, |balance| {
                balance.credit(coins, coin_type, now)
            })
            .await?;

        info!(
            user_id = %user_id,
            coins,
            coin_type = %coin_type,
            source = %source,
            balance = balance.total(),
            "Coins credited"
        );
        Ok(balance)
    }

    /// Debit coins, gift first; returns the post-debit balance
    #[instrument(skip(self))]
    pub async fn debit(
        &self,
        user_id: UserId,
        coins: u64,
        source: LedgerSource,
        reference_id: Option<Uuid>,
    ) -> Result<Balance> {
        let now = Utc::now();
        let balance = self
            .mutate(user_id, "debit", source, reference_id, None, None, |balance| {
                balance.debit(coins, now)
            })
            .await?;

        info!(
            user_id = %user_id,
            coins,
            source = %source,
            remaining = balance.total(),
            "Coins debited"
        );
        Ok(balance)
    }

    /// Debit for an elapsed metering interval
    ///
    /// The session's consumption fields move in the same unit of work as the
    /// balance. The write is refused if the session ended or was billed after
    /// `session` was read.
    pub async fn debit_for_session(
        &self,
        session: &MeteringSession,
        coins: u64,
        now: DateTime<Utc>,
    ) -> Result<Balance> {
        let charge = SessionCharge {
            session_id: session.id,
            coins,
            charged_at: now,
            expected_anchor: session.billing_anchor(),
        };
        let balance = self
            .mutate(
                session.user_id,
                "debit_for_session",
                LedgerSource::VideoSession,
                Some(session.id),
                None,
                Some(charge),
                |balance| balance.debit(coins, now),
            )
            .await?;

        info!(
            session_id = %session.id,
            user_id = %session.user_id,
            coins,
            remaining = balance.total(),
            "Session interval billed"
        );
        Ok(balance)
    }

    /// All ledger entries for a user, oldest first
    pub async fn entries(&self, user_id: UserId) -> Result<Vec<LedgerEntry>> {
        with_timeout(
            self.retry.call_timeout,
            "ledger_entries",
            self.store.ledger_entries(user_id),
        )
        .await
    }

    /// Rebuild the sub-balances from the ledger
    pub async fn replay(&self, user_id: UserId) -> Result<ReplayedBalance> {
        let entries = self.entries(user_id).await?;
        Ok(replay(&entries))
    }

    /// Whether the ledger replay agrees with the stored balance
    pub async fn verify(&self, user_id: UserId) -> Result<bool> {
        let balance = self.balance(user_id).await?;
        let replayed = self.replay(user_id).await?;
        Ok(replayed.matches(&balance))
    }

    #[allow(clippy::too_many_arguments)]
    async fn mutate<F>(
        &self,
        user_id: UserId,
        operation: &'static str,
        source: LedgerSource,
        reference_id: Option<Uuid>,
        note: Option<String>,
        charge: Option<SessionCharge>,
        apply: F,
    ) -> Result<Balance>
    where
        F: Fn(&mut Balance) -> std::result::Result<CoinDelta, LedgerError>,
    {
        let lock = self.user_lock(user_id);
        let guard = lock.lock().await;

        let apply = &apply;
        let note = &note;
        let charge = charge.as_ref();
        let store = &self.store;
        let call_timeout = self.retry.call_timeout;

        let result = retry_transient(&self.retry, operation, || async move {
            let stored =
                with_timeout(call_timeout, "load_balance", store.load_balance(user_id)).await?;
            let mut balance = stored.unwrap_or_else(|| Balance::new(user_id, Utc::now()));
            let expected_version = balance.version;

            let delta = apply(&mut balance)?;
            let entry = LedgerEntry::record(&balance, delta, source, reference_id, note.clone());

            with_timeout(
                call_timeout,
                "commit_mutation",
                store.commit_mutation(&balance, expected_version, &entry, charge),
            )
            .await?;
            Ok::<_, CoinmeterError>(balance)
        })
        .await;

        drop(guard);
        drop(lock);
        self.release_lock(user_id);

        if let Err(err) = &result {
            debug!(user_id = %user_id, operation, error = %err, "Ledger mutation rejected");
        }
        result
    }

    fn user_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_lock(&self, user_id: UserId) {
        self.locks
            .remove_if(&user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
