use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

pub type UserId = i64;
pub type WalletId = i64;
pub type WithdrawalId = i64;
pub type DerivationIndex = u32;

/// A chat user and their custodial balance (in local currency).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub card_number: Option<String>,
    pub balance: Decimal,
    pub is_admin: bool,
    pub wallet_id: Option<WalletId>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: UserId, is_admin: bool) -> Self {
        Self {
            id,
            card_number: None,
            balance: Decimal::ZERO,
            is_admin,
            wallet_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Deposit address owned by exactly one user. Never regenerated once assigned.
#[derive(Clone, PartialEq, Eq)]
pub struct SystemWallet {
    pub id: WalletId,
    pub address: String,
    /// WIF-encoded private key
    pub private_key: String,
    pub derivation_index: DerivationIndex,
}

// keep key material out of logs
impl fmt::Debug for SystemWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemWallet")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("derivation_index", &self.derivation_index)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct NewWallet {
    pub address: String,
    pub private_key: String,
    pub derivation_index: DerivationIndex,
}

/// An on-chain transaction observed paying a user's deposit address.
/// `txid` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositTransaction {
    pub txid: String,
    pub user_id: UserId,
    pub address: String,
    pub amount_btc: Decimal,
    pub confirmed: bool,
    pub credited: bool,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Canceled,
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Withdrawal {
    pub id: WithdrawalId,
    pub user_id: UserId,
    pub amount: Decimal,
    /// Payout destination at the time the request was made
    pub card_number: Option<String>,
    pub status: WithdrawalStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewWithdrawal {
    pub user_id: UserId,
    pub amount: Decimal,
    pub card_number: Option<String>,
}
