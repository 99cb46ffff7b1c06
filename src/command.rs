use std::str::FromStr;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::WithdrawalId;

/// Maximum number of fractional digits accepted for local-currency amounts.
pub const AMOUNT_SCALE: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeskCommand {
    Start,
    Balance,
    DepositAddress,
    SetCard,
    CheckDeposits,
    Withdraw,
    ConfirmWithdrawal,
    CancelWithdrawal,
    PendingWithdrawals { page: usize },
    SettleWithdrawal { id: WithdrawalId },
    RevealKey { address: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command `{0}`")]
    UnknownCommand(String),
    #[error("Command `{command}` requires {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("Invalid {argument} `{value}`")]
    InvalidArgument {
        argument: &'static str,
        value: String,
    },
    #[error("`{0}` is not a valid amount")]
    MalformedAmount(String),
    #[error("Amount must be positive")]
    NonPositiveAmount,
    #[error("Amount can have at most 2 fractional digits")]
    TooPrecise,
    #[error("Card number must contain 12 to 19 digits")]
    InvalidCardNumber,
}

impl DeskCommand {
    /// Returns `None` when the text is not a command (free text input).
    pub fn parse(text: &str) -> Option<Result<Self, CommandError>> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }
        let mut parts = text.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let argument = parts.next();

        let parsed = match name {
            "/start" => Ok(Self::Start),
            "/balance" => Ok(Self::Balance),
            "/address" => Ok(Self::DepositAddress),
            "/card" => Ok(Self::SetCard),
            "/check" => Ok(Self::CheckDeposits),
            "/withdraw" => Ok(Self::Withdraw),
            "/confirm" => Ok(Self::ConfirmWithdrawal),
            "/cancel" => Ok(Self::CancelWithdrawal),
            "/pending" => Self::parse_page(argument),
            "/settle" => Self::parse_settle(argument),
            "/key" => match argument {
                Some(address) => Ok(Self::RevealKey {
                    address: address.to_string(),
                }),
                None => Err(CommandError::MissingArgument {
                    command: "/key",
                    argument: "an address",
                }),
            },
            other => Err(CommandError::UnknownCommand(other.to_string())),
        };
        Some(parsed)
    }

    fn parse_page(argument: Option<&str>) -> Result<Self, CommandError> {
        let Some(value) = argument else {
            return Ok(Self::PendingWithdrawals { page: 0 });
        };
        // pages are 1-based for humans
        match value.parse::<usize>() {
            Ok(page) if page > 0 => Ok(Self::PendingWithdrawals { page: page - 1 }),
            _ => Err(CommandError::InvalidArgument {
                argument: "page",
                value: value.to_string(),
            }),
        }
    }

    fn parse_settle(argument: Option<&str>) -> Result<Self, CommandError> {
        let Some(value) = argument else {
            return Err(CommandError::MissingArgument {
                command: "/settle",
                argument: "a withdrawal id",
            });
        };
        value
            .parse::<WithdrawalId>()
            .map(|id| Self::SettleWithdrawal { id })
            .map_err(|_| CommandError::InvalidArgument {
                argument: "withdrawal id",
                value: value.to_string(),
            })
    }
}

/// Parses a user-typed local-currency amount. Both `,` and `.` are accepted as
/// the decimal separator.
pub fn parse_amount(text: &str) -> Result<Decimal, CommandError> {
    let normalized = text.trim().replace(',', ".");
    let amount = Decimal::from_str(&normalized)
        .map_err(|_| CommandError::MalformedAmount(text.trim().to_string()))?;
    if amount <= Decimal::ZERO {
        return Err(CommandError::NonPositiveAmount);
    }
    let amount = amount.normalize();
    if amount.scale() > AMOUNT_SCALE {
        return Err(CommandError::TooPrecise);
    }
    Ok(amount)
}

/// Strips spaces and dashes and checks the remaining digits.
pub fn parse_card_number(text: &str) -> Result<String, CommandError> {
    let digits: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    if (12..=19).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(digits)
    } else {
        Err(CommandError::InvalidCardNumber)
    }
}
