//! Billing Tick
//!
//! One cycle scans every billable metering session, debits the elapsed
//! interval, and ends sessions that can no longer be billed. Each session is
//! processed in isolation: a failure is logged and counted, and the cycle
//! moves on to the next session.
//!
//! The same cycle runs from a one-shot invocation or from [`BillingWorker`].

pub mod worker;

pub use worker::{BillingWorker, CycleSummary};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use coinmeter_common::{
    BillingConfig, CoinmeterError, EndReason, LedgerError, MeteringSession, Notification, Result,
};

use crate::earnings::EarningsProcessor;
use crate::ledger::CoinLedger;
use crate::metrics::BillingMetrics;
use crate::notify::Notifier;
use crate::registry::SessionRegistry;

/// What a cycle did with one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Billed too recently, or ended by someone else mid-cycle
    Skipped,
    Billed { coins: u64, remaining: u64 },
    Ended { reason: EndReason, handed_off: bool },
    /// Dry-run: would have debited
    WouldBill { coins: u64 },
    /// Dry-run: would have ended
    WouldEnd { reason: EndReason },
}

/// Counts from one tick cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub examined: usize,
    pub skipped: usize,
    pub billed: usize,
    pub ended: usize,
    /// Ended by the staleness cap
    pub expired: usize,
    pub errors: usize,
    pub coins_debited: u64,
    /// Ended sessions whose earnings hand-off failed; picked up by recovery
    pub handoff_failures: usize,
}

impl TickReport {
    fn absorb(&mut self, outcome: SessionOutcome) {
        match outcome {
            SessionOutcome::Skipped => self.skipped += 1,
            SessionOutcome::Billed { coins, .. } | SessionOutcome::WouldBill { coins } => {
                self.billed += 1;
                self.coins_debited += coins;
            }
            SessionOutcome::Ended { handed_off, .. } => {
                self.ended += 1;
                if !handed_off {
                    self.handoff_failures += 1;
                }
            }
            SessionOutcome::WouldEnd { .. } => self.ended += 1,
        }
    }
}

/// Counts from one orphan sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub found: usize,
    pub ended: usize,
    pub errors: usize,
    pub handoff_failures: usize,
}

pub struct BillingTick {
    config: Arc<BillingConfig>,
    ledger: Arc<CoinLedger>,
    registry: Arc<SessionRegistry>,
    earnings: Arc<EarningsProcessor>,
    notifier: Arc<dyn Notifier>,
    metrics: Option<Arc<BillingMetrics>>,
    dry_run: bool,
}

impl BillingTick {
    pub fn new(
        config: Arc<BillingConfig>,
        ledger: Arc<CoinLedger>,
        registry: Arc<SessionRegistry>,
        earnings: Arc<EarningsProcessor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            ledger,
            registry,
            earnings,
            notifier,
            metrics: None,
            dry_run: false,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BillingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Compute and log decisions without mutating anything
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub async fn run_cycle(&self) -> Result<TickReport> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle as of `now`
    ///
    /// Only failures to list sessions abort the cycle.
    #[instrument(skip(self), fields(dry_run = self.dry_run))]
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let timer = self
            .metrics
            .as_ref()
            .map(|m| m.tick_duration_seconds.start_timer());
        let mut report = TickReport::default();

        for session in self.registry.stale_sessions(now).await? {
            match self.terminate(&session, EndReason::SessionTimeout, now).await {
                Ok(outcome) => {
                    if matches!(
                        outcome,
                        SessionOutcome::Ended { .. } | SessionOutcome::WouldEnd { .. }
                    ) {
                        report.expired += 1;
                    }
                    if let SessionOutcome::Ended { handed_off: false, .. } = outcome {
                        report.handoff_failures += 1;
                    }
                }
                Err(err) => self.record_failure(&session, &err, &mut report),
            }
        }

        for session in self.registry.billable_sessions(now).await? {
            report.examined += 1;
            match self.process_session(&session, now).await {
                Ok(outcome) => report.absorb(outcome),
                Err(err) => self.record_failure(&session, &err, &mut report),
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.tick_cycles_total.inc();
        }
        drop(timer);

        info!(
            examined = report.examined,
            billed = report.billed,
            ended = report.ended,
            expired = report.expired,
            skipped = report.skipped,
            errors = report.errors,
            coins_debited = report.coins_debited,
            "Billing tick completed"
        );
        Ok(report)
    }

    /// Bill or end one session
    pub async fn process_session(
        &self,
        session: &MeteringSession,
        now: DateTime<Utc>,
    ) -> Result<SessionOutcome> {
        let elapsed = session.elapsed_unbilled(now);
        if elapsed < self.config.min_billing_interval_secs {
            debug!(session_id = %session.id, elapsed, "Billed recently, skipping");
            return Ok(SessionOutcome::Skipped);
        }

        let pairing = self
            .registry
            .find_active_pairing(&session.room_name, session.user_id)
            .await?;
        let Some(pairing) = pairing else {
            let missing = CoinmeterError::PairingNotFound {
                room_name: session.room_name.clone(),
                user_id: session.user_id,
            };
            info!(session_id = %session.id, reason = %missing, "Ending unpaired session");
            return self
                .terminate(session, EndReason::ChatSessionNotFound, now)
                .await;
        };

        if session.model_user_id.is_none()
            && pairing.client_user_id == session.user_id
            && !self.dry_run
        {
            self.registry
                .remember_model(session.id, pairing.model_user_id)
                .await?;
        }

        let coins = self.config.coins_for_elapsed(elapsed);
        if !self.ledger.has_sufficient(session.user_id, coins).await? {
            return self
                .terminate(session, EndReason::InsufficientBalance, now)
                .await;
        }

        if self.dry_run {
            info!(session_id = %session.id, user_id = %session.user_id, coins, "Dry run: would bill");
            return Ok(SessionOutcome::WouldBill { coins });
        }

        let balance = match self.ledger.debit_for_session(session, coins, now).await {
            Ok(balance) => balance,
            Err(CoinmeterError::Ledger(LedgerError::InsufficientBalance { .. })) => {
                // Balance moved between the check and the debit
                return self
                    .terminate(session, EndReason::InsufficientBalance, now)
                    .await;
            }
            Err(err) => return Err(err),
        };

        let remaining = balance.total();
        if let Some(metrics) = &self.metrics {
            metrics.sessions_billed_total.inc();
            metrics.coins_debited_total.inc_by(coins);
        }

        if self.config.is_low_balance(remaining) {
            self.notify(Notification::low_balance(
                session.user_id,
                session.id,
                remaining,
                self.config.minutes_available(remaining),
                now,
                self.config.notification_ttl(),
            ));
        }

        Ok(SessionOutcome::Billed { coins, remaining })
    }

    /// End sessions whose pairing never became active within the grace period
    pub async fn sweep_orphaned(&self) -> Result<SweepReport> {
        self.sweep_orphaned_at(Utc::now()).await
    }

    #[instrument(skip(self), fields(dry_run = self.dry_run))]
    pub async fn sweep_orphaned_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for session in self.registry.orphaned_sessions(now).await? {
            report.found += 1;
            match self.terminate(&session, EndReason::OrphanedSession, now).await {
                Ok(SessionOutcome::Ended { handed_off, .. }) => {
                    report.ended += 1;
                    if !handed_off {
                        report.handoff_failures += 1;
                    }
                }
                Ok(SessionOutcome::WouldEnd { .. }) => report.ended += 1,
                Ok(_) => {}
                Err(err) => {
                    report.errors += 1;
                    error!(
                        session_id = %session.id,
                        user_id = %session.user_id,
                        error = %err,
                        "Orphan sweep failed for session"
                    );
                }
            }
        }

        if report.found > 0 {
            info!(found = report.found, ended = report.ended, "Orphan sweep completed");
        }
        Ok(report)
    }

    async fn terminate(
        &self,
        session: &MeteringSession,
        reason: EndReason,
        now: DateTime<Utc>,
    ) -> Result<SessionOutcome> {
        if self.dry_run {
            info!(session_id = %session.id, reason = %reason, "Dry run: would end session");
            return Ok(SessionOutcome::WouldEnd { reason });
        }

        let Some(ended) = self.registry.end_metering_at(session.id, reason, now).await? else {
            // Ended concurrently; whoever ended it owns the hand-off
            return Ok(SessionOutcome::Skipped);
        };

        if let Some(metrics) = &self.metrics {
            metrics.session_ended(reason.as_str());
        }
        self.notify(Notification::session_ended(
            ended.user_id,
            ended.id,
            reason,
            now,
            self.config.notification_ttl(),
        ));

        let handed_off = match self.earnings.process_at(ended.id, now).await {
            Ok(_) => true,
            Err(err) => {
                error!(
                    session_id = %ended.id,
                    error = %err,
                    "Earnings hand-off failed; recovery sweep will retry"
                );
                false
            }
        };

        Ok(SessionOutcome::Ended { reason, handed_off })
    }

    fn notify(&self, notification: Notification) {
        let user_id = notification.user_id;
        if let Err(err) = self.notifier.publish(notification) {
            warn!(user_id = %user_id, error = %err, "Notification not delivered");
        }
    }

    fn record_failure(&self, session: &MeteringSession, err: &CoinmeterError, report: &mut TickReport) {
        report.errors += 1;
        if let Some(metrics) = &self.metrics {
            metrics.session_errors_total.inc();
        }
        error!(
            session_id = %session.id,
            user_id = %session.user_id,
            room_name = %session.room_name,
            kind = err.kind(),
            error = %err,
            "Session billing failed"
        );
    }
}
