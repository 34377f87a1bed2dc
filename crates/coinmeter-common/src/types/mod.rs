//! Core domain types for Coinmeter

pub mod balance;
pub mod earnings;
pub mod gift;
pub mod notification;
pub mod payout;
pub mod session;

/// User identifier shared by clients and models
pub type UserId = uuid::Uuid;
