use thiserror::Error;

use crate::account::AccountError;
use crate::command::CommandError;
use crate::models::{WithdrawalId, WithdrawalStatus};
use crate::store::StoreError;
use crate::upstream::UpstreamError;
use crate::wallet::DerivationError;

/// Log target for violations that need an operator to reconcile state by hand.
pub const CONSISTENCY_TARGET: &str = "deposit_desk::consistency";

/// How the caller is expected to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected input, never retried.
    Validation,
    /// Unknown user, wallet or withdrawal. The scheduler skips the user for this cycle.
    NotFound,
    /// Business rule rejection, always surfaced to the user.
    InsufficientFunds,
    AlreadyProcessed,
    Forbidden,
    /// Transient, retried on the next scheduler tick.
    UpstreamUnavailable,
    /// Fatal. Logged at the highest severity and surfaced to the administrator.
    ConsistencyViolation,
    /// Storage or key-derivation failure. Nothing was changed, the request can be repeated.
    Internal,
}

#[derive(Debug, Error)]
pub enum DeskError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Derivation(#[from] DerivationError),
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("Withdrawal #{id} is already {status}")]
    AlreadyProcessed {
        id: WithdrawalId,
        status: WithdrawalStatus,
    },
    #[error("{0}")]
    Precondition(String),
    #[error("Only the administrator can {action}")]
    Forbidden { action: &'static str },
    #[error("Consistency violation: {0}")]
    Consistency(String),
}

impl DeskError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        DeskError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Builds a [`DeskError::Consistency`] and reports it on [`CONSISTENCY_TARGET`].
    pub fn consistency(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(target: CONSISTENCY_TARGET, %message, "consistency violation");
        DeskError::Consistency(message)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DeskError::Command(_) | DeskError::Precondition(_) => ErrorKind::Validation,
            DeskError::Account(
                AccountError::NonPositiveAmount { .. } | AccountError::OutOfRange { .. },
            ) => ErrorKind::Validation,
            DeskError::Account(AccountError::InsufficientFunds { .. }) => {
                ErrorKind::InsufficientFunds
            }
            DeskError::NotFound { .. } => ErrorKind::NotFound,
            DeskError::Store(StoreError::Missing { .. }) => ErrorKind::NotFound,
            DeskError::Store(_) | DeskError::Derivation(_) => ErrorKind::Internal,
            DeskError::Upstream(_) => ErrorKind::UpstreamUnavailable,
            DeskError::AlreadyProcessed { .. } => ErrorKind::AlreadyProcessed,
            DeskError::Forbidden { .. } => ErrorKind::Forbidden,
            DeskError::Consistency(_) => ErrorKind::ConsistencyViolation,
        }
    }
}
