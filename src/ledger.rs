//! Credits and debits of user balances.
//!
//! Both operations are read-current / compute-new / write-new sequences, so
//! callers must run them inside a [`UnitOfWork`](crate::store::UnitOfWork),
//! which keeps concurrent credits and debits of the same user serialized.

use rust_decimal::Decimal;

use crate::account::Account;
use crate::error::DeskError;
use crate::models::{User, UserId};
use crate::store::UserStore;

/// Adds `amount` to the user's balance and returns the new balance.
pub fn credit<S>(store: &mut S, user_id: UserId, amount: Decimal) -> Result<Decimal, DeskError>
where
    S: UserStore + ?Sized,
{
    let mut user = load(store, user_id)?;
    let mut account = Account::new(user.balance);
    let event = account.handle_credit(amount)?;
    account.apply(&event);
    user.balance = account.balance();
    store.update_user(&user)?;
    Ok(user.balance)
}

/// Subtracts `amount` from the user's balance and returns the new balance.
/// Fails without touching the balance when `amount` exceeds it.
pub fn debit<S>(store: &mut S, user_id: UserId, amount: Decimal) -> Result<Decimal, DeskError>
where
    S: UserStore + ?Sized,
{
    let mut user = load(store, user_id)?;
    let mut account = Account::new(user.balance);
    let event = account.handle_debit(amount)?;
    account.apply(&event);
    user.balance = account.balance();
    store.update_user(&user)?;
    Ok(user.balance)
}

fn load<S>(store: &S, user_id: UserId) -> Result<User, DeskError>
where
    S: UserStore + ?Sized,
{
    store
        .get_user(user_id)?
        .ok_or_else(|| DeskError::not_found("user", user_id))
}
