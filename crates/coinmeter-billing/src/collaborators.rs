//! External collaborators consumed by the engine
//!
//! - [`GiftSource`]: gift transactions from the messaging subsystem
//! - [`PayoutAccounts`]: payout verification and thresholds from account settings

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use coinmeter_common::{GiftTransaction, PayoutAccount, Result, UserId};

#[async_trait]
pub trait GiftSource: Send + Sync {
    /// Gifts from `sender` to `receiver` in `room_name` sent within `[from, to]`
    async fn gifts_between(
        &self,
        receiver: UserId,
        sender: UserId,
        room_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<GiftTransaction>>;
}

#[async_trait]
pub trait PayoutAccounts: Send + Sync {
    /// Every model with payout settings
    async fn payout_accounts(&self) -> Result<Vec<PayoutAccount>>;
}

/// Gift log held in memory
#[derive(Default)]
pub struct InMemoryGiftSource {
    gifts: RwLock<Vec<GiftTransaction>>,
}

impl InMemoryGiftSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a validated gift
    pub fn push(&self, gift: GiftTransaction) -> Result<()> {
        gift.validate()?;
        self.gifts.write().push(gift);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.gifts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.gifts.read().is_empty()
    }
}

#[async_trait]
impl GiftSource for InMemoryGiftSource {
    async fn gifts_between(
        &self,
        receiver: UserId,
        sender: UserId,
        room_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<GiftTransaction>> {
        Ok(self
            .gifts
            .read()
            .iter()
            .filter(|g| {
                g.receiver_user_id == receiver
                    && g.sender_user_id == sender
                    && g.room_name == room_name
                    && g.sent_at >= from
                    && g.sent_at <= to
            })
            .cloned()
            .collect())
    }
}

/// Payout settings keyed by model
#[derive(Default)]
pub struct InMemoryPayoutAccounts {
    accounts: DashMap<UserId, PayoutAccount>,
}

impl InMemoryPayoutAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, account: PayoutAccount) {
        self.accounts.insert(account.model_user_id, account);
    }
}

#[async_trait]
impl PayoutAccounts for InMemoryPayoutAccounts {
    async fn payout_accounts(&self) -> Result<Vec<PayoutAccount>> {
        let mut accounts: Vec<PayoutAccount> =
            self.accounts.iter().map(|a| a.value().clone()).collect();
        accounts.sort_by_key(|a| a.model_user_id);
        Ok(accounts)
    }
}
