//! Gift transactions received from the messaging subsystem
//!
//! Gift metadata arrives as loosely structured JSON. It is parsed into
//! [`GiftDetails`] and validated where the transaction is built, so the rest of
//! the engine only sees well-formed values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UserId;
use crate::error::{CoinmeterError, Result};

/// Optional descriptive fields attached to a gift
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GiftDetails {
    #[serde(default)]
    pub gift_id: Option<String>,
    #[serde(default)]
    pub gift_name: Option<String>,
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub message: Option<String>,
}

impl GiftDetails {
    /// Parse and validate a details payload
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let details: GiftDetails = serde_json::from_value(value)?;
        details.validate()?;
        Ok(details)
    }

    pub fn validate(&self) -> Result<()> {
        if self.quantity == Some(0) {
            return Err(CoinmeterError::Validation("gift quantity must be positive".into()));
        }
        if matches!(&self.gift_id, Some(id) if id.trim().is_empty()) {
            return Err(CoinmeterError::Validation("gift_id cannot be blank".into()));
        }
        Ok(())
    }
}

/// One gift sent from a client to a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiftTransaction {
    pub id: Uuid,
    pub sender_user_id: UserId,
    pub receiver_user_id: UserId,
    pub room_name: String,
    /// Gift value in coins
    pub amount: u64,
    pub details: GiftDetails,
    pub sent_at: DateTime<Utc>,
}

impl GiftTransaction {
    /// Build a validated gift transaction
    pub fn new(
        sender_user_id: UserId,
        receiver_user_id: UserId,
        room_name: impl Into<String>,
        amount: u64,
        details: GiftDetails,
        sent_at: DateTime<Utc>,
    ) -> Result<Self> {
        let gift = Self {
            id: Uuid::now_v7(),
            sender_user_id,
            receiver_user_id,
            room_name: room_name.into(),
            amount,
            details,
            sent_at,
        };
        gift.validate()?;
        Ok(gift)
    }

    pub fn validate(&self) -> Result<()> {
        if self.amount == 0 {
            return Err(CoinmeterError::Validation("gift amount must be positive".into()));
        }
        if self.sender_user_id == self.receiver_user_id {
            return Err(CoinmeterError::Validation("gift sender and receiver must differ".into()));
        }
        if self.room_name.trim().is_empty() {
            return Err(CoinmeterError::Validation("gift room_name is required".into()));
        }
        self.details.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_details_from_json() {
        let details = GiftDetails::from_json(json!({
            "gift_id": "rose",
            "quantity": 3
        }))
        .unwrap();
        assert_eq!(details.gift_id.as_deref(), Some("rose"));
        assert_eq!(details.quantity, Some(3));
        assert!(details.message.is_none());
    }

    #[test]
    fn test_details_rejects_unknown_fields() {
        let result = GiftDetails::from_json(json!({ "gift_id": "rose", "bonus": true }));
        assert!(matches!(result, Err(CoinmeterError::Serialization(_))));
    }

    #[test]
    fn test_details_rejects_zero_quantity() {
        let result = GiftDetails::from_json(json!({ "quantity": 0 }));
        assert!(matches!(result, Err(CoinmeterError::Validation(_))));
    }

    #[test]
    fn test_gift_validation() {
        let user = Uuid::new_v4();
        let result = GiftTransaction::new(user, user, "room", 10, GiftDetails::default(), Utc::now());
        assert!(result.is_err());

        let result = GiftTransaction::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "room",
            0,
            GiftDetails::default(),
            Utc::now(),
        );
        assert!(result.is_err());
    }
}
