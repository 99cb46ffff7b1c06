use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{self, ChildNumber, Xpriv};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, Network, NetworkKind, PrivateKey};
use thiserror::Error;

use crate::models::DerivationIndex;

#[derive(Debug, Error)]
pub enum DerivationError {
    #[error("Invalid master key: {0}")]
    InvalidMasterKey(#[source] bip32::Error),
    #[error("Master key belongs to {key:?} network kind, desk is configured for {network}")]
    NetworkMismatch { key: NetworkKind, network: Network },
    #[error("Cannot derive child key {index}: {source}")]
    Child {
        index: DerivationIndex,
        #[source]
        source: bip32::Error,
    },
}

/// Key material of one derived child.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKey {
    pub index: DerivationIndex,
    pub address: String,
    /// WIF, compressed
    pub private_key: String,
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("index", &self.index)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Derives deposit keys as non-hardened children `m/<index>` of a master
/// extended private key. The same index always yields the same key, so a
/// wallet's private key can be recomputed from its stored index alone.
pub struct KeyDeriver {
    master: Xpriv,
    network: Network,
    secp: Secp256k1<All>,
}

impl KeyDeriver {
    pub fn new(master: Xpriv, network: Network) -> Result<Self, DerivationError> {
        let expected = NetworkKind::from(network);
        if master.network != expected {
            return Err(DerivationError::NetworkMismatch {
                key: master.network,
                network,
            });
        }
        Ok(Self {
            master,
            network,
            secp: Secp256k1::new(),
        })
    }

    /// Parses a base58 `xprv` / `tprv` string.
    pub fn from_master_key(master: &str, network: Network) -> Result<Self, DerivationError> {
        let master = Xpriv::from_str(master.trim()).map_err(DerivationError::InvalidMasterKey)?;
        Self::new(master, network)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn derive(&self, index: DerivationIndex) -> Result<DerivedKey, DerivationError> {
        let child_error = |source| DerivationError::Child { index, source };
        let child = ChildNumber::from_normal_idx(index).map_err(child_error)?;
        let xpriv = self
            .master
            .derive_priv(&self.secp, &[child])
            .map_err(child_error)?;

        let private_key = PrivateKey::new(xpriv.private_key, self.network);
        let public_key = private_key.public_key(&self.secp);
        let address = Address::p2pkh(public_key.pubkey_hash(), self.network);

        Ok(DerivedKey {
            index,
            address: address.to_string(),
            private_key: private_key.to_wif(),
        })
    }
}

impl fmt::Debug for KeyDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDeriver")
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}
