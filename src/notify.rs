//! Outbound events handed to the chat transport.
//!
//! The desk never assumes an event reached its recipient: delivery failures
//! are logged and otherwise ignored, since every event describes state that
//! is already committed.

use std::fmt;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::{DeskError, ErrorKind};
use crate::models::{UserId, Withdrawal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    User(UserId),
    /// Resolved to the administrator chat by the transport.
    Admin,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    AddressAllocated {
        address: String,
    },
    DepositCredited {
        amount_btc: Decimal,
        credited: Decimal,
        balance: Decimal,
    },
    DepositReceived {
        user_id: UserId,
        address: String,
        txid: String,
        amount_btc: Decimal,
        card_number: Option<String>,
    },
    WithdrawalCreated {
        withdrawal: Withdrawal,
        payout: Decimal,
    },
    WithdrawalUpdated {
        withdrawal: Withdrawal,
        added: Decimal,
        payout: Decimal,
    },
    WithdrawalSettled {
        withdrawal: Withdrawal,
    },
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },
    ConsistencyAlert {
        message: String,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::AddressAllocated { address } => {
                write!(f, "Your deposit address: {address}")
            }
            Event::DepositCredited {
                amount_btc,
                credited,
                balance,
            } => write!(
                f,
                "Deposit of {amount_btc} BTC credited: +{credited}, balance {balance}"
            ),
            Event::DepositReceived {
                user_id,
                address,
                txid,
                amount_btc,
                card_number,
            } => write!(
                f,
                "Deposit {txid}: {amount_btc} BTC to {address} from user {user_id} (card {})",
                card_or_dash(card_number)
            ),
            Event::WithdrawalCreated { withdrawal, payout } => write!(
                f,
                "Withdrawal #{} by user {} to card {}: pay out {payout} (requested {})",
                withdrawal.id,
                withdrawal.user_id,
                card_or_dash(&withdrawal.card_number),
                withdrawal.amount
            ),
            Event::WithdrawalUpdated {
                withdrawal,
                added,
                payout,
            } => write!(
                f,
                "Withdrawal #{} by user {} to card {} increased by {added}: pay out {payout} (requested {})",
                withdrawal.id,
                withdrawal.user_id,
                card_or_dash(&withdrawal.card_number),
                withdrawal.amount
            ),
            Event::WithdrawalSettled { withdrawal } => write!(
                f,
                "Withdrawal #{} of {} settled",
                withdrawal.id, withdrawal.amount
            ),
            Event::InsufficientFunds {
                requested,
                available,
            } => write!(
                f,
                "Insufficient funds: requested {requested}, available {available}"
            ),
            Event::ConsistencyAlert { message } => write!(f, "CONSISTENCY ALERT: {message}"),
        }
    }
}

fn card_or_dash(card: &Option<String>) -> &str {
    card.as_deref().unwrap_or("-")
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: Recipient, event: &Event) -> anyhow::Result<()>;
}

/// Sends `event`, logging instead of failing when delivery does not succeed.
pub async fn deliver(notifier: &dyn Notifier, recipient: Recipient, event: Event) {
    if let Err(err) = notifier.notify(recipient, &event).await {
        tracing::warn!(?recipient, error = %err, "notification not delivered");
    }
}

/// Forwards `err` to the administrator if it is a consistency violation.
pub async fn alert_on_violation(notifier: &dyn Notifier, err: &DeskError) {
    if err.kind() == ErrorKind::ConsistencyViolation {
        let event = Event::ConsistencyAlert {
            message: err.to_string(),
        };
        deliver(notifier, Recipient::Admin, event).await;
    }
}

/// Writes every event to the log. Used when no chat transport is attached.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, recipient: Recipient, event: &Event) -> anyhow::Result<()> {
        match recipient {
            Recipient::User(user_id) => tracing::info!(user_id, "{event}"),
            Recipient::Admin => tracing::info!(admin = true, "{event}"),
        }
        Ok(())
    }
}
