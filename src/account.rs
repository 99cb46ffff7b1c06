use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEventKind {
    Credited,
    Debited,
}

#[derive(Debug)]
pub struct LedgerEvent {
    amount: Decimal,
    kind: LedgerEventKind,
}

impl LedgerEvent {
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn kind(&self) -> LedgerEventKind {
        self.kind
    }
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Amount must be positive, got {amount}")]
    NonPositiveAmount { amount: Decimal },
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },
    #[error("Amount {amount} on top of {current} is out of range")]
    OutOfRange { current: Decimal, amount: Decimal },
}

/// Balance of a single user. Changes only through events produced by
/// [`Account::handle_credit`] and [`Account::handle_debit`].
#[derive(Debug, Default)]
pub struct Account {
    balance: Decimal,
}

impl Account {
    pub fn new(balance: Decimal) -> Self {
        Self { balance }
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn apply(&mut self, event: &LedgerEvent) {
        match event.kind {
            LedgerEventKind::Credited => {
                self.balance = self.balance.saturating_add(event.amount);
            }
            LedgerEventKind::Debited => {
                self.balance = self.balance.saturating_sub(event.amount);
            }
        }
    }

    pub fn handle_credit(&self, amount: Decimal) -> Result<LedgerEvent, AccountError> {
        ensure_positive(amount)?;
        checked_total(self.balance, amount)?;
        Ok(LedgerEvent {
            amount,
            kind: LedgerEventKind::Credited,
        })
    }

    pub fn handle_debit(&self, amount: Decimal) -> Result<LedgerEvent, AccountError> {
        ensure_positive(amount)?;
        if self.balance >= amount {
            Ok(LedgerEvent {
                amount,
                kind: LedgerEventKind::Debited,
            })
        } else {
            Err(AccountError::InsufficientFunds {
                requested: amount,
                available: self.balance,
            })
        }
    }
}

/// `current + amount`, or [`AccountError::OutOfRange`] when the sum does not fit a [`Decimal`].
pub fn checked_total(current: Decimal, amount: Decimal) -> Result<Decimal, AccountError> {
    current
        .checked_add(amount)
        .ok_or(AccountError::OutOfRange { current, amount })
}

fn ensure_positive(amount: Decimal) -> Result<(), AccountError> {
    if amount > Decimal::ZERO {
        Ok(())
    } else {
        Err(AccountError::NonPositiveAmount { amount })
    }
}
