//! # Coinmeter Billing
//!
//! Metered coin billing and earnings settlement for pay-per-minute video.
//!
//! ## Components
//!
//! - [`CoinLedger`]: dual purchased/gift balances with an append-only ledger
//! - [`SessionRegistry`]: pairing and metering sessions
//! - [`BillingTick`]: per-cycle debit and termination of metering sessions
//! - [`EarningsProcessor`]: duration reconciliation and per-session earnings
//! - [`SettlementEngine`]: weekly payout batches
//!
//! ## Billing Formula
//!
//! ```text
//! coins = ceil(elapsed_secs / 60 * cost_per_minute)
//! ```
//!
//! Sessions billed less than 25 seconds ago are skipped.
//!
//! ## Deployment
//!
//! Balance mutations are serialized per user inside one process. Running
//! more than one tick process against the same store relies on the store's
//! versioned commits to reject concurrent debits.

pub mod collaborators;
pub mod earnings;
pub mod ledger;
pub mod metrics;
pub mod notify;
pub mod registry;
pub mod retry;
pub mod settlement;
pub mod store;
pub mod tick;

use std::sync::Arc;
use std::time::Duration;

pub use collaborators::{GiftSource, InMemoryGiftSource, InMemoryPayoutAccounts, PayoutAccounts};
pub use earnings::{split_earnings, EarningsProcessor, EarningsSplit, ProcessOutcome, RecoveryReport};
pub use ledger::{CoinLedger, StartCheck};
pub use metrics::BillingMetrics;
pub use notify::{ChannelNotifier, NoopNotifier, Notifier};
pub use registry::SessionRegistry;
pub use retry::RetryPolicy;
pub use settlement::{BatchAction, ModelSettlement, SettlementEngine, SettlementReport};
pub use store::{
    BalanceRepository, EarningsRepository, MemoryStore, PayoutRepository, SessionCharge,
    SessionRepository,
};
pub use tick::{BillingTick, BillingWorker, CycleSummary, SessionOutcome, SweepReport, TickReport};

use coinmeter_common::{BillingConfig, Result};

/// Backing repositories
#[derive(Clone)]
pub struct Stores {
    pub balances: Arc<dyn BalanceRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub earnings: Arc<dyn EarningsRepository>,
    pub payouts: Arc<dyn PayoutRepository>,
}

impl Stores {
    /// Every repository backed by one in-memory store
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            balances: store.clone(),
            sessions: store.clone(),
            earnings: store.clone(),
            payouts: store,
        }
    }
}

/// External collaborators
#[derive(Clone)]
pub struct Collaborators {
    pub gifts: Arc<dyn GiftSource>,
    pub accounts: Arc<dyn PayoutAccounts>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Clone, Default)]
pub struct EngineOptions {
    pub dry_run: bool,
    pub metrics: Option<Arc<BillingMetrics>>,
}

/// Fully wired billing engine
pub struct Coinmeter {
    pub config: Arc<BillingConfig>,
    pub ledger: Arc<CoinLedger>,
    pub registry: Arc<SessionRegistry>,
    pub earnings: Arc<EarningsProcessor>,
    pub tick: Arc<BillingTick>,
    pub settlement: Arc<SettlementEngine>,
}

impl Coinmeter {
    pub fn new(
        config: BillingConfig,
        stores: Stores,
        collaborators: Collaborators,
        options: EngineOptions,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let retry = RetryPolicy::from_config(&config);

        let ledger = Arc::new(CoinLedger::new(stores.balances, config.clone()));
        let registry = Arc::new(SessionRegistry::new(stores.sessions, config.clone()));

        let mut earnings = EarningsProcessor::new(
            config.clone(),
            registry.clone(),
            stores.earnings.clone(),
            collaborators.gifts,
        );
        if let Some(metrics) = &options.metrics {
            earnings = earnings.with_metrics(metrics.clone());
        }
        let earnings = Arc::new(earnings);

        let mut tick = BillingTick::new(
            config.clone(),
            ledger.clone(),
            registry.clone(),
            earnings.clone(),
            collaborators.notifier,
        )
        .dry_run(options.dry_run);
        let mut settlement =
            SettlementEngine::new(stores.earnings, stores.payouts, collaborators.accounts, retry)
                .dry_run(options.dry_run);

        if let Some(metrics) = options.metrics {
            tick = tick.with_metrics(metrics.clone());
            settlement = settlement.with_metrics(metrics);
        }

        Ok(Self {
            config,
            ledger,
            registry,
            earnings,
            tick: Arc::new(tick),
            settlement: Arc::new(settlement),
        })
    }

    /// Looping worker over this engine's tick and earnings processor
    pub fn worker(&self, interval: Duration) -> Result<BillingWorker> {
        BillingWorker::new(self.tick.clone(), self.earnings.clone(), interval)
    }
}
