use thiserror::Error;

use crate::models::{
    DepositTransaction, DerivationIndex, NewWallet, NewWithdrawal, SystemWallet, User, UserId,
    WalletId, Withdrawal, WithdrawalId,
};

pub mod in_memory;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage lock is poisoned")]
    Poisoned,
    #[error("{entity} `{id}` does not exist")]
    Missing { entity: &'static str, id: String },
    #[error("{entity} `{id}` already exists")]
    Duplicate { entity: &'static str, id: String },
    #[error("User {user_id} already has a pending withdrawal")]
    PendingWithdrawalExists { user_id: UserId },
    #[error("Derivation index space is exhausted")]
    IndicesExhausted,
}

pub trait UserStore {
    fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError>;
    fn create_user(&mut self, user: User) -> Result<(), StoreError>;
    fn update_user(&mut self, user: &User) -> Result<(), StoreError>;
    fn users_with_wallets(&self) -> Result<Vec<User>, StoreError>;
}

pub trait WalletStore {
    fn get_wallet(&self, id: WalletId) -> Result<Option<SystemWallet>, StoreError>;
    fn wallet_by_address(&self, address: &str) -> Result<Option<SystemWallet>, StoreError>;
    /// Index to use for the next wallet: one past the highest index ever persisted.
    fn next_derivation_index(&self) -> Result<DerivationIndex, StoreError>;
    fn create_wallet(&mut self, wallet: NewWallet) -> Result<SystemWallet, StoreError>;
}

pub trait DepositStore {
    fn get_transaction(&self, txid: &str) -> Result<Option<DepositTransaction>, StoreError>;
    /// Fails with [`StoreError::Duplicate`] when the txid is already recorded.
    fn insert_transaction(&mut self, tx: DepositTransaction) -> Result<(), StoreError>;
    fn update_transaction(&mut self, tx: &DepositTransaction) -> Result<(), StoreError>;
}

pub trait WithdrawalStore {
    fn get_withdrawal(&self, id: WithdrawalId) -> Result<Option<Withdrawal>, StoreError>;
    fn pending_withdrawal_for(&self, user_id: UserId) -> Result<Option<Withdrawal>, StoreError>;
    /// Pending withdrawals, oldest first.
    fn pending_withdrawals(&self) -> Result<Vec<Withdrawal>, StoreError>;
    /// Fails with [`StoreError::PendingWithdrawalExists`] if the user already has one.
    fn create_withdrawal(&mut self, withdrawal: NewWithdrawal) -> Result<Withdrawal, StoreError>;
    fn update_withdrawal(&mut self, withdrawal: &Withdrawal) -> Result<(), StoreError>;
}

/// A transactional view over every entity store.
///
/// Changes become visible only after [`UnitOfWork::commit`]. Dropping the unit
/// of work without committing rolls everything back, so every early return
/// (including `?`) is a rollback.
pub trait UnitOfWork: UserStore + WalletStore + DepositStore + WithdrawalStore {
    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>) {}
}

/// Entry point of the persistence collaborator.
///
/// Units of work are exclusive: while one is open, no other unit of work
/// observes or changes the same data. Implementations backed by a database
/// use serializable transactions or row locks for the same effect.
/// A unit of work must never be held across an `.await`.
pub trait Store: Send + Sync {
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError>;
}
