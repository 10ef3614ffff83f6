// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Transaction approval consulted before a storeman co-signs.
//!
//! A responder only joins a signing run for transactions it has approved
//! itself. Approvals are kept in an [`ApprovalStore`], which is handed to the
//! [`ApprovalValidator`] when it is built.

use crate::{
    errors::{InternalError, Result},
    protocol::{Address, PeerId},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, sync::RwLock};
use tracing::{debug, warn};

/// What a signing run is asked to sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    /// The account whose shares sign
    pub address: Address,
    /// Name of the chain the transaction belongs to
    pub chain_type: String,
    /// Identifier of that chain
    pub chain_id: u64,
    /// The raw transaction
    pub raw_tx: Vec<u8>,
    /// Kind of signature the chain expects
    pub sign_type: String,
    /// One hash per signature slot
    pub hashes: Vec<[u8; 32]>,
}

/// Decides whether this node agrees to co-sign a request.
pub trait TxValidator: Send + Sync {
    /// Returns `true` when the request led by `leader` may be signed.
    fn validate(&self, leader: &PeerId, request: &SignRequest) -> bool;
}

/// Key/value storage behind an [`ApprovalValidator`].
pub trait ApprovalStore: Send + Sync {
    #[allow(missing_docs)]
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    #[allow(missing_docs)]
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    #[allow(missing_docs)]
    fn delete(&self, key: &[u8]) -> Result<()>;
}

/// An [`ApprovalStore`] held in memory.
#[derive(Debug, Default)]
pub struct MemoryApprovalStore {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl ApprovalStore for MemoryApprovalStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| InternalError::InternalInvariantFailed)?;
        let _ = entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| InternalError::InternalInvariantFailed)?;
        Ok(entries.get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| InternalError::InternalInvariantFailed)?;
        let _ = entries.remove(key);
        Ok(())
    }
}

#[derive(Serialize)]
struct ApprovalKey<'a> {
    address: &'a Address,
    chain_type: &'a str,
    chain_id: u64,
    hash: &'a [u8; 32],
}

/// Approves requests whose every hash was recorded locally for the same
/// account, chain and raw transaction.
pub struct ApprovalValidator<S: ApprovalStore> {
    store: S,
}

impl<S: ApprovalStore> ApprovalValidator<S> {
    #[allow(missing_docs)]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    fn keys(request: &SignRequest) -> Result<Vec<Vec<u8>>> {
        request
            .hashes
            .iter()
            .map(|hash| {
                serialize!(&ApprovalKey {
                    address: &request.address,
                    chain_type: &request.chain_type,
                    chain_id: request.chain_id,
                    hash,
                })
            })
            .collect()
    }

    /// Records that this node is willing to sign `request`.
    pub fn approve(&self, request: &SignRequest) -> Result<()> {
        let digest = Sha256::digest(&request.raw_tx);
        for key in Self::keys(request)? {
            self.store.put(&key, &digest)?;
        }
        Ok(())
    }

    /// Withdraws an approval.
    pub fn revoke(&self, request: &SignRequest) -> Result<()> {
        for key in Self::keys(request)? {
            self.store.delete(&key)?;
        }
        Ok(())
    }

    fn check(&self, request: &SignRequest) -> Result<bool> {
        if request.hashes.is_empty() {
            return Ok(false);
        }
        let digest = Sha256::digest(&request.raw_tx);
        for key in Self::keys(request)? {
            match self.store.get(&key)? {
                Some(stored) if stored.as_slice() == digest.as_slice() => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

impl<S: ApprovalStore> TxValidator for ApprovalValidator<S> {
    fn validate(&self, leader: &PeerId, request: &SignRequest) -> bool {
        match self.check(request) {
            Ok(true) => {
                debug!("Approved signing request from {} for {}", leader, request.address);
                true
            }
            Ok(false) => {
                warn!("No approval for signing request from {} for {}", leader, request.address);
                false
            }
            Err(e) => {
                warn!("Approval lookup failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn request() -> SignRequest {
        SignRequest {
            address: Address([9u8; 20]),
            chain_type: "WAN".into(),
            chain_id: 1,
            raw_tx: vec![1, 2, 3],
            sign_type: "schnorr".into(),
            hashes: vec![[4u8; 32], [5u8; 32]],
        }
    }

    #[test]
    fn validator_requires_a_local_approval() -> Result<()> {
        let leader = PeerId::random(&mut OsRng);
        let validator = ApprovalValidator::new(MemoryApprovalStore::default());
        let request = request();
        assert!(!validator.validate(&leader, &request));

        validator.approve(&request)?;
        assert!(validator.validate(&leader, &request));

        let mut other_tx = request.clone();
        other_tx.raw_tx.push(4);
        assert!(!validator.validate(&leader, &other_tx));

        let mut extra_slot = request.clone();
        extra_slot.hashes.push([6u8; 32]);
        assert!(!validator.validate(&leader, &extra_slot));

        validator.revoke(&request)?;
        assert!(!validator.validate(&leader, &request));
        Ok(())
    }
}
