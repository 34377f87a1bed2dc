//! Coinmeter Worker Binary
//!
//! Runs the billing tick, the orphan sweep, and weekly settlement against an
//! in-memory store seeded from a fixture. `tick`, `settle`, and `sweep` run
//! once for an external scheduler; `loop` keeps billing until SIGTERM/Ctrl+C.

mod config;
mod fixture;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use coinmeter_billing::{
    BillingMetrics, ChannelNotifier, Coinmeter, Collaborators, EngineOptions, InMemoryGiftSource,
    InMemoryPayoutAccounts, MemoryStore, Stores,
};
use coinmeter_common::{Notification, VERSION};

use crate::config::WorkerSettings;
use crate::fixture::Fixture;

#[derive(Parser, Debug)]
#[command(author, version, about = "Coinmeter billing worker", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'f', long, env = "COINMETER_CONFIG", default_value = "coinmeter.toml")]
    config: PathBuf,

    /// JSON fixture seeding the in-memory store
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    /// Log decisions without mutating balances, sessions, or batches
    #[arg(long, global = true)]
    dry_run: bool,

    /// Debug logging for coinmeter crates
    #[arg(long, global = true)]
    debug: bool,

    /// Seconds between cycles in loop mode
    #[arg(long, global = true)]
    interval_secs: Option<u64>,

    /// Print Prometheus metrics on exit
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// One billing cycle: tick, orphan sweep, earnings recovery
    Tick,
    /// Billing cycles until a shutdown signal
    Loop,
    /// Weekly settlement for every verified model
    Settle,
    /// Orphan sweep only
    Sweep,
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("info,coinmeter_common=debug,coinmeter_billing=debug,coinmeter_worker=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

/// Wait for SIGTERM or Ctrl+C
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, finishing current cycle"),
        _ = terminate => info!("Received SIGTERM, finishing current cycle"),
    }
}

/// Log notifications until every sender is gone
async fn drain_notifications(mut rx: mpsc::Receiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        if notification.is_expired(Utc::now()) {
            warn!(notification_id = %notification.id, "Dropping expired notification");
            continue;
        }
        info!(
            notification_id = %notification.id,
            user_id = %notification.user_id,
            urgency = ?notification.urgency,
            kind = ?notification.kind,
            "Notification dispatched"
        );
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    info!("Starting Coinmeter worker v{}", VERSION);

    let mut settings = WorkerSettings::load(&args.config)?;
    settings.dry_run |= args.dry_run;
    if let Some(secs) = args.interval_secs {
        settings.interval_secs = secs;
    }
    if args.fixture.is_some() {
        settings.fixture = args.fixture.clone();
    }
    settings.validate()?;
    tracing::debug!(?settings, "Loaded configuration");

    let registry = Registry::new();
    let metrics = Arc::new(BillingMetrics::new()?);
    metrics.register(&registry)?;

    let store = Arc::new(MemoryStore::new());
    let gifts = Arc::new(InMemoryGiftSource::new());
    let accounts = Arc::new(InMemoryPayoutAccounts::new());
    let (notifier, notifications) = ChannelNotifier::new(settings.notification_buffer);
    let drain = tokio::spawn(drain_notifications(notifications));

    let engine = Coinmeter::new(
        settings.billing.clone(),
        Stores::in_memory(store.clone()),
        Collaborators {
            gifts: gifts.clone(),
            accounts: accounts.clone(),
            notifier: Arc::new(notifier),
        },
        EngineOptions {
            dry_run: settings.dry_run,
            metrics: Some(metrics),
        },
    )?;

    match &settings.fixture {
        Some(path) => Fixture::from_path(path)?.apply(&engine, &gifts, &accounts).await?,
        None => warn!("No fixture given, starting from an empty store"),
    }

    if settings.dry_run {
        info!("Dry run: nothing will be written");
    }

    let interval = Duration::from_secs(settings.interval_secs);
    match args.command {
        Command::Tick => {
            let summary = engine.worker(interval)?.run_once(Utc::now()).await?;
            print_json(&summary)?;
        }
        Command::Loop => {
            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                trigger.cancel();
            });

            let cycles = engine.worker(interval)?.run(shutdown).await;
            info!(cycles, "Billing loop stopped");
        }
        Command::Settle => {
            let report = engine.settlement.run().await?;
            print_json(&report)?;
        }
        Command::Sweep => {
            let report = engine.tick.sweep_orphaned().await?;
            print_json(&report)?;
        }
    }

    let stats = store.stats();
    info!(
        balances = stats.balances,
        ledger_entries = stats.ledger_entries,
        active_sessions = stats.active_sessions,
        ended_sessions = stats.ended_sessions,
        earnings_records = stats.earnings_records,
        unsettled_records = stats.unsettled_records,
        payout_batches = stats.payout_batches,
        "Store state at exit"
    );

    if args.print_metrics {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        println!("{}", String::from_utf8(buffer)?);
    }

    // Closing the engine drops the last notifier so the drain task finishes
    drop(engine);
    if let Err(err) = drain.await {
        warn!(error = %err, "Notification drain task failed");
    }

    info!("Coinmeter worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "coinmeter-worker",
            "loop",
            "--dry-run",
            "--interval-secs",
            "15",
        ])
        .unwrap();

        assert!(matches!(args.command, Command::Loop));
        assert!(args.dry_run);
        assert_eq!(args.interval_secs, Some(15));
        assert!(!args.debug);
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Args::try_parse_from(["coinmeter-worker"]).is_err());
    }

    #[test]
    fn test_cli_args_are_well_formed() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
