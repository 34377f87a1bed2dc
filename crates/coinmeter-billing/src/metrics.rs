//! Prometheus metrics for billing and settlement

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

/// Prometheus metrics for the billing engine
pub struct BillingMetrics {
    pub tick_cycles_total: IntCounter,
    pub sessions_billed_total: IntCounter,
    pub sessions_ended_total: IntCounterVec,
    pub coins_debited_total: IntCounter,
    pub session_errors_total: IntCounter,
    pub tick_duration_seconds: Histogram,
    pub settlement_batches_total: IntCounterVec,
    pub earnings_records_total: IntCounterVec,
}

impl BillingMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            tick_cycles_total: IntCounter::new(
                "coinmeter_tick_cycles_total",
                "Billing tick cycles completed",
            )?,
            sessions_billed_total: IntCounter::new(
                "coinmeter_sessions_billed_total",
                "Metering intervals successfully debited",
            )?,
            sessions_ended_total: IntCounterVec::new(
                Opts::new(
                    "coinmeter_sessions_ended_total",
                    "Metering sessions ended by the engine",
                ),
                &["reason"],
            )?,
            coins_debited_total: IntCounter::new(
                "coinmeter_coins_debited_total",
                "Coins debited for metered time",
            )?,
            session_errors_total: IntCounter::new(
                "coinmeter_session_errors_total",
                "Per-session processing failures",
            )?,
            tick_duration_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "coinmeter_tick_duration_seconds",
                    "Billing tick cycle duration",
                )
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            )?,
            settlement_batches_total: IntCounterVec::new(
                Opts::new(
                    "coinmeter_settlement_batches_total",
                    "Payout batches written by settlement",
                ),
                &["action"],
            )?,
            earnings_records_total: IntCounterVec::new(
                Opts::new(
                    "coinmeter_earnings_records_total",
                    "Earnings records created",
                ),
                &["source"],
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.tick_cycles_total.clone()))?;
        registry.register(Box::new(self.sessions_billed_total.clone()))?;
        registry.register(Box::new(self.sessions_ended_total.clone()))?;
        registry.register(Box::new(self.coins_debited_total.clone()))?;
        registry.register(Box::new(self.session_errors_total.clone()))?;
        registry.register(Box::new(self.tick_duration_seconds.clone()))?;
        registry.register(Box::new(self.settlement_batches_total.clone()))?;
        registry.register(Box::new(self.earnings_records_total.clone()))?;
        Ok(())
    }

    pub fn session_ended(&self, reason: &str) {
        self.sessions_ended_total.with_label_values(&[reason]).inc();
    }

    pub fn batch_written(&self, action: &str) {
        self.settlement_batches_total
            .with_label_values(&[action])
            .inc();
    }

    pub fn earnings_recorded(&self, source: &str) {
        self.earnings_records_total.with_label_values(&[source]).inc();
    }
}
