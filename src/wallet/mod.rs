//! Per-user deposit addresses.

use std::sync::Arc;

use crate::error::DeskError;
use crate::models::{NewWallet, SystemWallet, UserId};
use crate::notify::{Event, Notifier, Recipient, alert_on_violation, deliver};
use crate::store::Store;

mod derivation;

pub use derivation::{DerivationError, DerivedKey, KeyDeriver};

pub struct AddressAllocator {
    store: Arc<dyn Store>,
    deriver: Arc<KeyDeriver>,
    notifier: Arc<dyn Notifier>,
}

impl AddressAllocator {
    pub fn new(store: Arc<dyn Store>, deriver: Arc<KeyDeriver>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            deriver,
            notifier,
        }
    }

    /// Returns the user's deposit wallet, deriving one at the next free index
    /// if the user has none yet. Repeated calls return the same wallet.
    pub async fn allocate(&self, user_id: UserId) -> Result<SystemWallet, DeskError> {
        let (wallet, created) = match self.assign(user_id) {
            Ok(assigned) => assigned,
            Err(err) => {
                alert_on_violation(self.notifier.as_ref(), &err).await;
                return Err(err);
            }
        };
        if created {
            let event = Event::AddressAllocated {
                address: wallet.address.clone(),
            };
            deliver(self.notifier.as_ref(), Recipient::User(user_id), event).await;
        }
        Ok(wallet)
    }

    // Wallet creation and the user's reference to it commit together.
    fn assign(&self, user_id: UserId) -> Result<(SystemWallet, bool), DeskError> {
        let mut uow = self.store.begin()?;
        let mut user = uow
            .get_user(user_id)?
            .ok_or_else(|| DeskError::not_found("user", user_id))?;

        if let Some(wallet_id) = user.wallet_id {
            let wallet = uow.get_wallet(wallet_id)?.ok_or_else(|| {
                DeskError::consistency(format!(
                    "user {user_id} references missing wallet {wallet_id}"
                ))
            })?;
            return Ok((wallet, false));
        }

        let index = uow.next_derivation_index()?;
        let derived = self.deriver.derive(index)?;
        let wallet = uow.create_wallet(NewWallet {
            address: derived.address,
            private_key: derived.private_key,
            derivation_index: derived.index,
        })?;
        user.wallet_id = Some(wallet.id);
        uow.update_user(&user)?;
        uow.commit()?;

        tracing::info!(user_id, address = %wallet.address, index, "allocated deposit address");
        Ok((wallet, true))
    }

    /// WIF private key of the wallet owning `address`, recomputed from its
    /// stored derivation index and checked against the stored key.
    pub fn reveal_key(&self, address: &str) -> Result<String, DeskError> {
        let wallet = {
            let uow = self.store.begin()?;
            uow.wallet_by_address(address)?
        }
        .ok_or_else(|| DeskError::not_found("wallet", address))?;

        let derived = self.deriver.derive(wallet.derivation_index)?;
        if derived.address != wallet.address || derived.private_key != wallet.private_key {
            return Err(DeskError::consistency(format!(
                "wallet {} at index {} does not match its derived key",
                wallet.address, wallet.derivation_index
            )));
        }
        tracing::warn!(address, "private key revealed");
        Ok(derived.private_key)
    }
}
