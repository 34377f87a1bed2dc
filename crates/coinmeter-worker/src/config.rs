//! Worker configuration
//!
//! Settings come from an optional TOML file, then `COINMETER_*` environment
//! variables (a `.env` file is loaded first). Nested billing constants use a
//! double underscore, e.g. `COINMETER_BILLING__COST_PER_MINUTE=12`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};

use coinmeter_common::BillingConfig;

/// Worker process settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Billing constants handed to every engine component
    pub billing: BillingConfig,
    /// Sleep between cycles in `loop` mode
    pub interval_secs: u64,
    /// Compute and log decisions without mutating anything
    pub dry_run: bool,
    /// Capacity of the notification channel
    pub notification_buffer: usize,
    /// JSON file used to seed the in-memory store
    pub fixture: Option<PathBuf>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            billing: BillingConfig::default(),
            interval_secs: 30,
            dry_run: false,
            notification_buffer: 1024,
            fixture: None,
        }
    }
}

impl WorkerSettings {
    /// Load from `path` (if it exists) and the environment
    pub fn load(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let builder = Config::builder().add_source(File::from(path).required(false));
        Self::build(builder)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let settings: Self = builder
            .add_source(
                Environment::with_prefix("COINMETER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read worker configuration")?
            .try_deserialize()
            .context("invalid worker configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.billing.validate()?;
        if self.interval_secs == 0 {
            anyhow::bail!("interval_secs must be positive");
        }
        if self.notification_buffer == 0 {
            anyhow::bail!("notification_buffer must be positive");
        }
        Ok(())
    }
}
