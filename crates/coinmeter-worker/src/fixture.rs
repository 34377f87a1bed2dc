//! Seed data for the in-memory store
//!
//! The worker has no database of its own; a JSON fixture describes the
//! pairings, running sessions, balances, gifts, and payout accounts to start
//! from.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use coinmeter_billing::{Coinmeter, InMemoryGiftSource, InMemoryPayoutAccounts};
use coinmeter_common::{CoinType, GiftTransaction, LedgerSource, PairingSession, PayoutAccount, UserId};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Fixture {
    pub credits: Vec<CreditSeed>,
    pub pairings: Vec<PairingSession>,
    pub sessions: Vec<SessionSeed>,
    pub gifts: Vec<GiftTransaction>,
    pub accounts: Vec<PayoutAccount>,
}

#[derive(Debug, Deserialize)]
pub struct CreditSeed {
    pub user_id: UserId,
    pub coins: u64,
    #[serde(default = "purchased")]
    pub coin_type: CoinType,
}

fn purchased() -> CoinType {
    CoinType::Purchased
}

/// A metering session already running when the worker starts
#[derive(Debug, Deserialize)]
pub struct SessionSeed {
    pub user_id: UserId,
    pub room_name: String,
    pub started_at: Option<DateTime<Utc>>,
}

impl Fixture {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fixture {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid fixture {}", path.display()))
    }

    /// Write the fixture into a freshly built engine
    pub async fn apply(
        &self,
        engine: &Coinmeter,
        gifts: &InMemoryGiftSource,
        accounts: &InMemoryPayoutAccounts,
    ) -> Result<()> {
        // Pairings first so metering sessions pick up their model
        for pairing in &self.pairings {
            engine.registry.upsert_pairing(pairing).await?;
        }
        for seed in &self.sessions {
            let started_at = seed.started_at.unwrap_or_else(Utc::now);
            engine
                .registry
                .start_metering_at(seed.user_id, &seed.room_name, started_at)
                .await?;
        }
        for credit in &self.credits {
            let source = match credit.coin_type {
                CoinType::Purchased => LedgerSource::Purchase,
                CoinType::Gift => LedgerSource::GiftReceived,
            };
            engine
                .ledger
                .credit(credit.user_id, credit.coins, credit.coin_type, source, Some("fixture".into()))
                .await?;
        }
        for gift in &self.gifts {
            gifts.push(gift.clone())?;
        }
        for account in &self.accounts {
            accounts.upsert(account.clone());
        }

        info!(
            pairings = self.pairings.len(),
            sessions = self.sessions.len(),
            credits = self.credits.len(),
            gifts = self.gifts.len(),
            accounts = self.accounts.len(),
            "Fixture applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coinmeter_billing::{Collaborators, EngineOptions, MemoryStore, NoopNotifier, Stores};
    use coinmeter_common::BillingConfig;
    use std::sync::Arc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_apply_seeds_engine() {
        let client = Uuid::new_v4();
        let model = Uuid::new_v4();
        let raw = serde_json::json!({
            "credits": [
                { "user_id": client, "coins": 80 },
                { "user_id": client, "coins": 5, "coin_type": "gift" }
            ],
            "pairings": [serde_json::to_value(PairingSession::active(
                "room-1", client, model, Utc::now()
            )).unwrap()],
            "sessions": [{ "user_id": client, "room_name": "room-1" }]
        });
        let fixture: Fixture = serde_json::from_value(raw).unwrap();

        let gifts = Arc::new(InMemoryGiftSource::new());
        let accounts = Arc::new(InMemoryPayoutAccounts::new());
        let store = Arc::new(MemoryStore::new());
        let engine = Coinmeter::new(
            BillingConfig::default(),
            Stores::in_memory(store.clone()),
            Collaborators {
                gifts: gifts.clone(),
                accounts: accounts.clone(),
                notifier: Arc::new(NoopNotifier),
            },
            EngineOptions::default(),
        )
        .unwrap();

        fixture.apply(&engine, &gifts, &accounts).await.unwrap();

        let balance = engine.ledger.balance(client).await.unwrap();
        assert_eq!((balance.purchased_coins, balance.gift_coins), (80, 5));
        let stats = store.stats();
        assert_eq!(stats.active_sessions, 1);
    }

    #[test]
    fn test_rejects_unknown_sections() {
        let parsed: std::result::Result<Fixture, _> =
            serde_json::from_str(r#"{ "balances": [] }"#);
        assert!(parsed.is_err());
    }
}
