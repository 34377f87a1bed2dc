//! Self-looping billing worker
//!
//! Each cycle runs the billing tick, the orphan sweep, and the earnings
//! recovery sweep. Cancellation is only observed between cycles, so a cycle
//! that has started always runs to completion.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use coinmeter_common::{CoinmeterError, Result};

use super::{BillingTick, SweepReport, TickReport};
use crate::earnings::{EarningsProcessor, RecoveryReport};

/// Everything one worker cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub tick: TickReport,
    pub orphans: SweepReport,
    pub recovery: RecoveryReport,
}

pub struct BillingWorker {
    tick: Arc<BillingTick>,
    earnings: Arc<EarningsProcessor>,
    interval: Duration,
}

impl BillingWorker {
    /// Fails on a zero `interval`, which the loop timer cannot use
    pub fn new(
        tick: Arc<BillingTick>,
        earnings: Arc<EarningsProcessor>,
        interval: Duration,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(CoinmeterError::Validation("worker interval must be positive".into()));
        }
        Ok(Self {
            tick,
            earnings,
            interval,
        })
    }

    /// One full cycle as of `now`
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CycleSummary> {
        let tick = self.tick.run_cycle_at(now).await?;
        let orphans = self.tick.sweep_orphaned_at(now).await?;
        let recovery = if self.tick.is_dry_run() {
            RecoveryReport::default()
        } else {
            self.earnings
                .recover_ended(self.earnings.recovery_window(now), now)
                .await?
        };

        Ok(CycleSummary {
            tick,
            orphans,
            recovery,
        })
    }

    /// Loop until `shutdown` is cancelled; returns the number of cycles run
    pub async fn run(&self, shutdown: CancellationToken) -> u64 {
        info!(interval_ms = self.interval.as_millis() as u64, "Starting billing worker");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(cycles, "Billing worker shutting down");
                    return cycles;
                }
                _ = ticker.tick() => {}
            }

            // A failed cycle is retried fresh on the next tick
            if let Err(err) = self.run_once(Utc::now()).await {
                error!(error = %err, kind = err.kind(), "Billing cycle aborted");
            }
            cycles += 1;
        }
    }
}
