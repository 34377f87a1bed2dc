//! Error types for Coinmeter
//!
//! Provides a unified error type and the domain-specific variants the billing
//! engine distinguishes between: transient store failures are retried, business
//! outcomes (insufficient balance, missing pairing) terminate sessions, and
//! internal inconsistencies are surfaced to operators.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using CoinmeterError
pub type Result<T> = std::result::Result<T, CoinmeterError>;

/// Unified error type for Coinmeter operations
#[derive(Debug, Error)]
pub enum CoinmeterError {
    // Coin ledger errors
    #[error("Ledger error: {0}")]
    Ledger(#[from] crate::types::balance::LedgerError),

    // Backing store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // Duration reconciliation errors
    #[error("Duration error: {0}")]
    Duration(#[from] DurationError),

    // Payout errors
    #[error("Payout error: {0}")]
    Payout(#[from] crate::types::payout::PayoutError),

    #[error("No active pairing for room {room_name} and user {user_id}")]
    PairingNotFound { room_name: String, user_id: Uuid },

    #[error("Metering session not found: {0}")]
    SessionNotFound(Uuid),

    #[error(
        "Settlement verification mismatch for batch {batch_id}: expected {expected} records, found {found}"
    )]
    SettlementVerification {
        batch_id: Uuid,
        expected: usize,
        found: usize,
    },

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoinmeterError {
    /// Whether retrying the failed operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, CoinmeterError::Store(e) if e.is_transient())
    }

    /// Short label for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            CoinmeterError::Ledger(_) => "ledger",
            CoinmeterError::Store(StoreError::Contention(_)) => "store_contention",
            CoinmeterError::Store(StoreError::Timeout(_)) => "store_timeout",
            CoinmeterError::Store(_) => "store",
            CoinmeterError::Duration(_) => "duration",
            CoinmeterError::Payout(_) => "payout",
            CoinmeterError::PairingNotFound { .. } => "pairing_not_found",
            CoinmeterError::SessionNotFound(_) => "session_not_found",
            CoinmeterError::SettlementVerification { .. } => "settlement_verification",
            CoinmeterError::Notification(_) => "notification",
            CoinmeterError::Validation(_) => "validation",
            CoinmeterError::Config(_) => "config",
            CoinmeterError::Serialization(_) => "serialization",
            CoinmeterError::Internal(_) => "internal",
        }
    }
}

/// Backing store errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// Lock or row contention; safe to retry
    #[error("Store contention: {0}")]
    Contention(String),

    /// A store call exceeded its per-call timeout; safe to retry
    #[error("Store call timed out: {0}")]
    Timeout(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Contention and timeouts are retried; everything else is surfaced
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Contention(_) | StoreError::Timeout(_))
    }
}

/// Duration reconciliation errors
///
/// These never fail a settlement; they route the Earnings Processor to the
/// next duration source.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DurationError {
    #[error("Implausible session duration: {seconds}s exceeds {max}s")]
    Implausible { seconds: i64, max: u64 },

    #[error("Non-positive session duration: {seconds}s")]
    NonPositive { seconds: i64 },

    #[error("Session has no end timestamp")]
    MissingEnd,
}

impl From<serde_json::Error> for CoinmeterError {
    fn from(err: serde_json::Error) -> Self {
        CoinmeterError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for CoinmeterError {
    fn from(err: anyhow::Error) -> Self {
        CoinmeterError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoinmeterError::PairingNotFound {
            room_name: "room-42".to_string(),
            user_id: Uuid::nil(),
        };
        assert!(err.to_string().contains("room-42"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(CoinmeterError::Store(StoreError::Contention("row lock".into())).is_transient());
        assert!(CoinmeterError::Store(StoreError::Timeout("debit".into())).is_transient());
        assert!(!CoinmeterError::Store(StoreError::NotFound("x".into())).is_transient());
        assert!(!CoinmeterError::Validation("bad".into()).is_transient());
    }

    #[test]
    fn test_verification_mismatch_display() {
        let err = CoinmeterError::SettlementVerification {
            batch_id: Uuid::nil(),
            expected: 5,
            found: 3,
        };
        assert!(err.to_string().contains("expected 5"));
        assert_eq!(err.kind(), "settlement_verification");
    }
}
