//! Withdrawal requests, from the user's first request to administrator settlement.
//!
//! A user has at most one pending withdrawal. Further requests while one is
//! pending add to its amount, and the total never exceeds the user's balance.
//! Nothing is debited until the administrator settles the request after
//! paying it out by hand.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::account::{AccountError, checked_total};
use crate::conversation::ConversationState;
use crate::error::DeskError;
use crate::ledger;
use crate::models::{NewWithdrawal, UserId, Withdrawal, WithdrawalId, WithdrawalStatus};
use crate::notify::{Event, Notifier, Recipient, alert_on_violation, deliver};
use crate::store::Store;
use crate::watcher::LOCAL_SCALE;

pub const DEFAULT_PAGE_SIZE: usize = 5;

/// Operator margin withheld from payouts. Only affects the amount shown to
/// the administrator, users are always debited the full requested amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commission(Decimal);

impl Commission {
    pub fn new(rate: Decimal) -> Result<Self, DeskError> {
        if rate < Decimal::ZERO || rate >= Decimal::ONE {
            return Err(DeskError::Precondition(format!(
                "commission must be in [0, 1), got {rate}"
            )));
        }
        Ok(Self(rate))
    }

    pub fn rate(&self) -> Decimal {
        self.0
    }

    /// Amount the administrator actually pays out for `amount`.
    pub fn payout(&self, amount: Decimal) -> Decimal {
        (amount * (Decimal::ONE - self.0)).round_dp_with_strategy(LOCAL_SCALE, RoundingStrategy::ToZero)
    }
}

impl Default for Commission {
    fn default() -> Self {
        // 6%
        Self(Decimal::new(6, 2))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Created(Withdrawal),
    Amended { withdrawal: Withdrawal, added: Decimal },
}

impl RequestOutcome {
    pub fn withdrawal(&self) -> &Withdrawal {
        match self {
            RequestOutcome::Created(withdrawal) => withdrawal,
            RequestOutcome::Amended { withdrawal, .. } => withdrawal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingItem {
    pub withdrawal: Withdrawal,
    pub payout: Decimal,
}

/// One page of the pending withdrawals, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPage {
    /// Zero-based
    pub page: usize,
    pub pages: usize,
    pub total: usize,
    pub items: Vec<PendingItem>,
}

/// Balance and the part of it already claimed by a pending withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub balance: Decimal,
    pub pending: Decimal,
}

impl Availability {
    pub fn available(&self) -> Decimal {
        self.balance - self.pending
    }
}

pub struct WithdrawalWorkflow {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    conversation: Arc<ConversationState>,
    commission: Commission,
    page_size: usize,
}

impl WithdrawalWorkflow {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        conversation: Arc<ConversationState>,
        commission: Commission,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            notifier,
            conversation,
            commission,
            page_size: page_size.max(1),
        }
    }

    pub fn availability(&self, user_id: UserId) -> Result<Availability, DeskError> {
        let uow = self.store.begin()?;
        let user = uow
            .get_user(user_id)?
            .ok_or_else(|| DeskError::not_found("user", user_id))?;
        let pending = uow
            .pending_withdrawal_for(user_id)?
            .map_or(Decimal::ZERO, |w| w.amount);
        Ok(Availability {
            balance: user.balance,
            pending,
        })
    }

    /// Checks that the user has something left to withdraw and a payout card on file.
    pub async fn begin(&self, user_id: UserId) -> Result<Availability, DeskError> {
        let availability = self.availability(user_id)?;
        if availability.available() <= Decimal::ZERO {
            let err = AccountError::InsufficientFunds {
                requested: Decimal::ZERO,
                available: availability.available(),
            };
            return Err(self.reject(user_id, err.into()).await);
        }
        let has_card = {
            let uow = self.store.begin()?;
            uow.get_user(user_id)?.and_then(|user| user.card_number).is_some()
        };
        if !has_card {
            return Err(DeskError::Precondition(
                "Set a payout card with /card first".to_string(),
            ));
        }
        Ok(availability)
    }

    /// Stages `amount` for confirmation if it fits in the balance not yet
    /// claimed by a pending withdrawal.
    pub async fn stage(&self, user_id: UserId, amount: Decimal) -> Result<Availability, DeskError> {
        if amount <= Decimal::ZERO {
            return Err(AccountError::NonPositiveAmount { amount }.into());
        }
        let availability = self.availability(user_id)?;
        if amount > availability.available() {
            let err = AccountError::InsufficientFunds {
                requested: amount,
                available: availability.available(),
            };
            return Err(self.reject(user_id, err.into()).await);
        }
        self.conversation.stage_amount(user_id, amount);
        Ok(availability)
    }

    /// Submits the staged amount.
    pub async fn confirm(&self, user_id: UserId) -> Result<RequestOutcome, DeskError> {
        let amount = self
            .conversation
            .take_staged_amount(user_id)
            .ok_or_else(|| DeskError::Precondition("No withdrawal to confirm".to_string()))?;
        self.request_or_amend(user_id, amount).await
    }

    /// Drops the staged amount. A recorded pending withdrawal is left as is.
    pub fn cancel(&self, user_id: UserId) -> bool {
        let staged = self.conversation.take_staged_amount(user_id).is_some();
        self.conversation.reset(user_id);
        staged
    }

    /// Creates a pending withdrawal of `amount`, or adds `amount` to the
    /// pending one. Rejected without changes when the resulting total exceeds
    /// the balance.
    pub async fn request_or_amend(
        &self,
        user_id: UserId,
        amount: Decimal,
    ) -> Result<RequestOutcome, DeskError> {
        let outcome = match self.apply_request(user_id, amount) {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.reject(user_id, err).await),
        };

        let withdrawal = outcome.withdrawal().clone();
        let payout = self.commission.payout(withdrawal.amount);
        let event = match &outcome {
            RequestOutcome::Created(_) => Event::WithdrawalCreated { withdrawal, payout },
            RequestOutcome::Amended { added, .. } => Event::WithdrawalUpdated {
                withdrawal,
                added: *added,
                payout,
            },
        };
        deliver(self.notifier.as_ref(), Recipient::User(user_id), event.clone()).await;
        deliver(self.notifier.as_ref(), Recipient::Admin, event).await;
        Ok(outcome)
    }

    fn apply_request(&self, user_id: UserId, amount: Decimal) -> Result<RequestOutcome, DeskError> {
        if amount <= Decimal::ZERO {
            return Err(AccountError::NonPositiveAmount { amount }.into());
        }
        let mut uow = self.store.begin()?;
        let user = uow
            .get_user(user_id)?
            .ok_or_else(|| DeskError::not_found("user", user_id))?;

        let outcome = match uow.pending_withdrawal_for(user_id)? {
            None => {
                if amount > user.balance {
                    return Err(AccountError::InsufficientFunds {
                        requested: amount,
                        available: user.balance,
                    }
                    .into());
                }
                let withdrawal = uow.create_withdrawal(NewWithdrawal {
                    user_id,
                    amount,
                    card_number: user.card_number.clone(),
                })?;
                tracing::info!(user_id, id = withdrawal.id, %amount, "withdrawal requested");
                RequestOutcome::Created(withdrawal)
            }
            Some(mut withdrawal) => {
                let candidate = checked_total(withdrawal.amount, amount).map_err(|_| {
                    AccountError::InsufficientFunds {
                        requested: amount,
                        available: user.balance - withdrawal.amount,
                    }
                })?;
                if candidate > user.balance {
                    return Err(AccountError::InsufficientFunds {
                        requested: amount,
                        available: user.balance - withdrawal.amount,
                    }
                    .into());
                }
                withdrawal.amount = candidate;
                uow.update_withdrawal(&withdrawal)?;
                tracing::info!(user_id, id = withdrawal.id, added = %amount, total = %candidate, "withdrawal amended");
                RequestOutcome::Amended {
                    withdrawal,
                    added: amount,
                }
            }
        };
        uow.commit()?;
        Ok(outcome)
    }

    pub fn pending_page(&self, page: usize) -> Result<PendingPage, DeskError> {
        let pending = {
            let uow = self.store.begin()?;
            uow.pending_withdrawals()?
        };
        let total = pending.len();
        let pages = total.div_ceil(self.page_size).max(1);
        // past the end wraps to the first page
        let page = if page < pages { page } else { 0 };
        let items = pending
            .into_iter()
            .skip(page * self.page_size)
            .take(self.page_size)
            .map(|withdrawal| PendingItem {
                payout: self.commission.payout(withdrawal.amount),
                withdrawal,
            })
            .collect();
        Ok(PendingPage {
            page,
            pages,
            total,
            items,
        })
    }

    /// Debits the user and completes the withdrawal, both or neither.
    pub async fn admin_settle(&self, id: WithdrawalId) -> Result<Withdrawal, DeskError> {
        match self.settle(id) {
            Ok(withdrawal) => {
                let event = Event::WithdrawalSettled {
                    withdrawal: withdrawal.clone(),
                };
                deliver(self.notifier.as_ref(), Recipient::User(withdrawal.user_id), event).await;
                Ok(withdrawal)
            }
            Err(err) => {
                alert_on_violation(self.notifier.as_ref(), &err).await;
                Err(err)
            }
        }
    }

    fn settle(&self, id: WithdrawalId) -> Result<Withdrawal, DeskError> {
        let mut uow = self.store.begin()?;
        let mut withdrawal = uow
            .get_withdrawal(id)?
            .ok_or_else(|| DeskError::not_found("withdrawal", id))?;
        if withdrawal.status != WithdrawalStatus::Pending {
            return Err(DeskError::AlreadyProcessed {
                id,
                status: withdrawal.status,
            });
        }

        let user_id = withdrawal.user_id;
        let user = uow.get_user(user_id)?.ok_or_else(|| {
            DeskError::consistency(format!("withdrawal #{id} belongs to missing user {user_id}"))
        })?;
        if user.balance < withdrawal.amount {
            return Err(DeskError::consistency(format!(
                "withdrawal #{id} of {} exceeds balance {} of user {user_id}",
                withdrawal.amount, user.balance
            )));
        }

        let balance = ledger::debit(&mut *uow, user_id, withdrawal.amount)?;
        withdrawal.status = WithdrawalStatus::Completed;
        withdrawal.settled_at = Some(Utc::now());
        if let Err(err) = uow.update_withdrawal(&withdrawal) {
            // dropping the unit of work rolls the debit back
            return Err(DeskError::consistency(format!(
                "withdrawal #{id} debited but not completed, debit rolled back: {err}"
            )));
        }
        uow.commit()?;

        tracing::info!(id, user_id, amount = %withdrawal.amount, %balance, "withdrawal settled");
        Ok(withdrawal)
    }

    async fn reject(&self, user_id: UserId, err: DeskError) -> DeskError {
        if let DeskError::Account(AccountError::InsufficientFunds {
            requested,
            available,
        }) = &err
        {
            let event = Event::InsufficientFunds {
                requested: *requested,
                available: *available,
            };
            deliver(self.notifier.as_ref(), Recipient::User(user_id), event).await;
        }
        err
    }
}
