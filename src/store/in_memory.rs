use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::models::{
    DepositTransaction, DerivationIndex, NewWallet, NewWithdrawal, SystemWallet, User, UserId,
    WalletId, Withdrawal, WithdrawalId, WithdrawalStatus,
};

use super::{
    DepositStore, Store, StoreError, UnitOfWork, UserStore, WalletStore, WithdrawalStore,
};

#[derive(Debug, Default, Clone)]
struct Tables {
    users: BTreeMap<UserId, User>,
    wallets: BTreeMap<WalletId, SystemWallet>,
    transactions: HashMap<String, DepositTransaction>,
    withdrawals: BTreeMap<WithdrawalId, Withdrawal>,
    last_wallet_id: WalletId,
    last_withdrawal_id: WithdrawalId,
}

/// Process-local store. A unit of work holds the store lock for its whole
/// lifetime and operates on a private copy of the tables, which replaces the
/// shared tables on commit.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for InMemoryStore {
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError> {
        let guard = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        let staged = guard.clone();
        Ok(Box::new(InMemoryUnitOfWork { guard, staged }))
    }
}

struct InMemoryUnitOfWork<'a> {
    guard: MutexGuard<'a, Tables>,
    staged: Tables,
}

impl UnitOfWork for InMemoryUnitOfWork<'_> {
    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryUnitOfWork { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}

impl UserStore for InMemoryUnitOfWork<'_> {
    fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.staged.users.get(&id).cloned())
    }

    fn create_user(&mut self, user: User) -> Result<(), StoreError> {
        if self.staged.users.contains_key(&user.id) {
            return Err(StoreError::Duplicate {
                entity: "user",
                id: user.id.to_string(),
            });
        }
        self.staged.users.insert(user.id, user);
        Ok(())
    }

    fn update_user(&mut self, user: &User) -> Result<(), StoreError> {
        if let Some(wallet_id) = user.wallet_id {
            if !self.staged.wallets.contains_key(&wallet_id) {
                return Err(missing("wallet", wallet_id));
            }
        }
        match self.staged.users.get_mut(&user.id) {
            Some(stored) => {
                *stored = user.clone();
                Ok(())
            }
            None => Err(missing("user", user.id)),
        }
    }

    fn users_with_wallets(&self) -> Result<Vec<User>, StoreError> {
        Ok(self
            .staged
            .users
            .values()
            .filter(|user| user.wallet_id.is_some())
            .cloned()
            .collect())
    }
}

impl WalletStore for InMemoryUnitOfWork<'_> {
    fn get_wallet(&self, id: WalletId) -> Result<Option<SystemWallet>, StoreError> {
        Ok(self.staged.wallets.get(&id).cloned())
    }

    fn wallet_by_address(&self, address: &str) -> Result<Option<SystemWallet>, StoreError> {
        Ok(self
            .staged
            .wallets
            .values()
            .find(|wallet| wallet.address == address)
            .cloned())
    }

    fn next_derivation_index(&self) -> Result<DerivationIndex, StoreError> {
        match self
            .staged
            .wallets
            .values()
            .map(|wallet| wallet.derivation_index)
            .max()
        {
            Some(highest) => highest.checked_add(1).ok_or(StoreError::IndicesExhausted),
            None => Ok(0),
        }
    }

    fn create_wallet(&mut self, wallet: NewWallet) -> Result<SystemWallet, StoreError> {
        let clash = self.staged.wallets.values().any(|existing| {
            existing.address == wallet.address
                || existing.derivation_index == wallet.derivation_index
        });
        if clash {
            return Err(StoreError::Duplicate {
                entity: "wallet",
                id: wallet.address,
            });
        }
        self.staged.last_wallet_id += 1;
        let stored = SystemWallet {
            id: self.staged.last_wallet_id,
            address: wallet.address,
            private_key: wallet.private_key,
            derivation_index: wallet.derivation_index,
        };
        self.staged.wallets.insert(stored.id, stored.clone());
        Ok(stored)
    }
}

impl DepositStore for InMemoryUnitOfWork<'_> {
    fn get_transaction(&self, txid: &str) -> Result<Option<DepositTransaction>, StoreError> {
        Ok(self.staged.transactions.get(txid).cloned())
    }

    fn insert_transaction(&mut self, tx: DepositTransaction) -> Result<(), StoreError> {
        if self.staged.transactions.contains_key(&tx.txid) {
            return Err(StoreError::Duplicate {
                entity: "transaction",
                id: tx.txid,
            });
        }
        self.staged.transactions.insert(tx.txid.clone(), tx);
        Ok(())
    }

    fn update_transaction(&mut self, tx: &DepositTransaction) -> Result<(), StoreError> {
        match self.staged.transactions.get_mut(&tx.txid) {
            Some(stored) => {
                *stored = tx.clone();
                Ok(())
            }
            None => Err(missing("transaction", &tx.txid)),
        }
    }
}

impl WithdrawalStore for InMemoryUnitOfWork<'_> {
    fn get_withdrawal(&self, id: WithdrawalId) -> Result<Option<Withdrawal>, StoreError> {
        Ok(self.staged.withdrawals.get(&id).cloned())
    }

    fn pending_withdrawal_for(&self, user_id: UserId) -> Result<Option<Withdrawal>, StoreError> {
        Ok(self
            .staged
            .withdrawals
            .values()
            .find(|w| w.user_id == user_id && w.status == WithdrawalStatus::Pending)
            .cloned())
    }

    fn pending_withdrawals(&self) -> Result<Vec<Withdrawal>, StoreError> {
        let mut pending: Vec<Withdrawal> = self
            .staged
            .withdrawals
            .values()
            .filter(|w| w.status == WithdrawalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|w| (w.created_at, w.id));
        Ok(pending)
    }

    fn create_withdrawal(&mut self, withdrawal: NewWithdrawal) -> Result<Withdrawal, StoreError> {
        if !self.staged.users.contains_key(&withdrawal.user_id) {
            return Err(missing("user", withdrawal.user_id));
        }
        if self.pending_withdrawal_for(withdrawal.user_id)?.is_some() {
            return Err(StoreError::PendingWithdrawalExists {
                user_id: withdrawal.user_id,
            });
        }
        self.staged.last_withdrawal_id += 1;
        let stored = Withdrawal {
            id: self.staged.last_withdrawal_id,
            user_id: withdrawal.user_id,
            amount: withdrawal.amount,
            card_number: withdrawal.card_number,
            status: WithdrawalStatus::Pending,
            created_at: Utc::now(),
            settled_at: None,
        };
        self.staged.withdrawals.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn update_withdrawal(&mut self, withdrawal: &Withdrawal) -> Result<(), StoreError> {
        let other_pending = self.staged.withdrawals.values().any(|w| {
            w.id != withdrawal.id
                && w.user_id == withdrawal.user_id
                && w.status == WithdrawalStatus::Pending
        });
        if other_pending && withdrawal.status == WithdrawalStatus::Pending {
            return Err(StoreError::PendingWithdrawalExists {
                user_id: withdrawal.user_id,
            });
        }
        match self.staged.withdrawals.get_mut(&withdrawal.id) {
            Some(stored) => {
                *stored = withdrawal.clone();
                Ok(())
            }
            None => Err(missing("withdrawal", withdrawal.id)),
        }
    }
}

fn missing(entity: &'static str, id: impl ToString) -> StoreError {
    StoreError::Missing {
        entity,
        id: id.to_string(),
    }
}
