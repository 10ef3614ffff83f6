// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Persistence of the account records a key generation leaves behind.

use crate::{
    errors::{InternalError, Result},
    protocol::{Address, PeerInfo},
};
use k256::{ProjectivePoint, Scalar};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, sync::RwLock};
use tracing::{error, info};

/// Storage for each node's share of a group key.
pub trait Keystore: Send + Sync {
    /// Persists a finished key generation and returns the address the
    /// record is filed under.
    fn create_account_record(
        &self,
        public_key: &ProjectivePoint,
        private_share: &Scalar,
        peers: &[PeerInfo],
        passphrase: &str,
    ) -> Result<Address>;

    /// Loads this node's share of `address` together with the seeds every
    /// storeman was assigned during key generation.
    fn load_private_share(&self, address: &Address, passphrase: &str)
        -> Result<(Scalar, Vec<PeerInfo>)>;
}

struct StoredAccount {
    passphrase_digest: [u8; 32],
    public_key: ProjectivePoint,
    private_share: Scalar,
    peers: Vec<PeerInfo>,
}

/// A [`Keystore`] which keeps records in memory, guarded by a passphrase.
#[derive(Default)]
pub struct MemoryKeystore {
    accounts: RwLock<HashMap<Address, StoredAccount>>,
}

fn digest(passphrase: &str) -> [u8; 32] {
    Sha256::digest(passphrase.as_bytes()).into()
}

impl MemoryKeystore {
    /// The group public key filed under `address`, if any.
    pub fn public_key(&self, address: &Address) -> Option<ProjectivePoint> {
        self.accounts
            .read()
            .ok()
            .and_then(|accounts| accounts.get(address).map(|a| a.public_key))
    }

    /// Addresses with a stored record.
    pub fn addresses(&self) -> Vec<Address> {
        self.accounts
            .read()
            .map(|accounts| accounts.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl Keystore for MemoryKeystore {
    fn create_account_record(
        &self,
        public_key: &ProjectivePoint,
        private_share: &Scalar,
        peers: &[PeerInfo],
        passphrase: &str,
    ) -> Result<Address> {
        let address = Address::from_public_key(public_key);
        let mut accounts = self
            .accounts
            .write()
            .map_err(|_| InternalError::Keystore("keystore lock poisoned".into()))?;
        if accounts.contains_key(&address) {
            error!("Account {} already exists", address);
            return Err(InternalError::Keystore("account already exists".into()));
        }
        let _ = accounts.insert(
            address,
            StoredAccount {
                passphrase_digest: digest(passphrase),
                public_key: *public_key,
                private_share: *private_share,
                peers: peers.to_vec(),
            },
        );
        info!("Created account record {}", address);
        Ok(address)
    }

    fn load_private_share(
        &self,
        address: &Address,
        passphrase: &str,
    ) -> Result<(Scalar, Vec<PeerInfo>)> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| InternalError::Keystore("keystore lock poisoned".into()))?;
        let account = accounts.get(address).ok_or(InternalError::UnknownAccount)?;
        if account.passphrase_digest != digest(passphrase) {
            return Err(InternalError::Keystore("wrong passphrase".into()));
        }
        Ok((account.private_share, account.peers.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{math::random_nonzero_scalar, protocol::PeerId};
    use rand::rngs::OsRng;

    #[test]
    fn records_are_passphrase_protected() -> Result<()> {
        let mut rng = OsRng;
        let keystore = MemoryKeystore::default();
        let share = random_nonzero_scalar(&mut rng);
        let public_key = ProjectivePoint::GENERATOR * random_nonzero_scalar(&mut rng);
        let peers = vec![PeerInfo {
            peer_id: PeerId::random(&mut rng),
            seed: 5,
        }];

        let address = keystore.create_account_record(&public_key, &share, &peers, "pw")?;
        assert_eq!(address, Address::from_public_key(&public_key));
        assert_eq!(keystore.public_key(&address), Some(public_key));
        assert_eq!(keystore.load_private_share(&address, "pw")?, (share, peers.clone()));
        assert!(keystore.load_private_share(&address, "other").is_err());
        assert_eq!(
            keystore.load_private_share(&Address([0u8; 20]), "pw"),
            Err(InternalError::UnknownAccount)
        );
        assert!(keystore
            .create_account_record(&public_key, &share, &peers, "pw")
            .is_err());
        Ok(())
    }
}
