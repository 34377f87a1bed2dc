//! # Coinmeter Common
//!
//! Shared types, errors, and configuration for the Coinmeter billing engine.
//!
//! ## Core Types
//!
//! - [`Balance`]: dual purchased/gift coin balance for one user
//! - [`LedgerEntry`]: append-only audit record of a single balance mutation
//! - [`MeteringSession`]/[`PairingSession`]: billed connection and its client/model pairing
//! - [`EarningsRecord`]: immutable per-session model earnings
//! - [`PayoutBatch`]: weekly aggregated payout for one model
//! - [`GiftTransaction`]: gift event received from the messaging subsystem
//! - [`Notification`]: low-balance and session-ended events for the notification collaborator
//!
//! ## Configuration
//!
//! [`BillingConfig`] is the single immutable set of billing constants. Every
//! component takes it at construction; nothing reads ambient constants.

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use config::BillingConfig;
pub use error::{CoinmeterError, DurationError, Result, StoreError};
pub use types::{
    balance::{replay, Balance, CoinDelta, CoinType, LedgerEntry, LedgerError, LedgerSource, ReplayedBalance},
    earnings::{EarningsRecord, EarningsSource},
    gift::{GiftDetails, GiftTransaction},
    notification::{Notification, NotificationKind, Urgency},
    payout::{PayoutAccount, PayoutBatch, PayoutError, PayoutStatus, SettlementWeek},
    session::{
        DurationSource, EndReason, MeteringSession, MeteringStatus, PairingSession, PairingStatus,
        ParticipantRole,
    },
    UserId,
};

/// Coinmeter version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Seconds per billed minute
pub const SECONDS_PER_MINUTE: i64 = 60;
