// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The `ResultStore` type through which the steps of a context hand values
//! to one another.
//!
//! [`ResultStore`] provides a means for storing values associated with a
//! [`TypeTag`] and a signature slot. Values are written once and read by
//! later steps; the store belongs to a single context run.

use tracing::error;

use crate::errors::{InternalError, Result};
use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

/// A type implementing `TypeTag` can be used to store and retrieve
/// values of type `<T as TypeTag>::Value`.
pub(crate) trait TypeTag: 'static {
    type Value: Send + Sync;
}

/// Slot used by values that are not tied to a particular signature.
pub(crate) const SHARED_SLOT: usize = 0;

/// The well-known values of a run. Per-signature values are stored under
/// the index of their signature slot.
pub(crate) mod keys {
    use super::TypeTag;
    use crate::{protocol::Address, signature::SchnorrSignature, validator::SignRequest};
    use k256::{ProjectivePoint, Scalar};

    macro_rules! tags {
        ($($(#[$doc:meta])* $name:ident => $value:ty;)*) => {
            $(
                $(#[$doc])*
                pub(crate) struct $name;
                impl TypeTag for $name {
                    type Value = $value;
                }
            )*
        };
    }

    tags! {
        /// This node's share of the group private key
        PrivateShare => Scalar;
        /// `PrivateShare · G`
        PublicShare => ProjectivePoint;
        /// The group public key
        PublicKeyResult => ProjectivePoint;
        /// The account the run produced or signs for
        AccountAddress => Address;
        /// What a signing run was asked to sign
        Request => SignRequest;
        /// JRSS share of the nonce blinding `a`
        SignA => Scalar;
        /// This node's contribution `a0_i · G` to `A`
        SignAPointShare => ProjectivePoint;
        /// JRSS share of the mask `r`
        SignR => Scalar;
        /// JZSS share of degree `2d` blinding `a·r`
        SignB => Scalar;
        /// JZSS share of degree `2d` blinding the signature
        SignC => Scalar;
        /// `a_i · r_i + b_i`
        SignARSeed => Scalar;
        /// `A = a · G`
        SignAPoint => ProjectivePoint;
        /// `a · r`, in the clear
        SignARResult => Scalar;
        /// The nonce point `R = (a·r)⁻¹ · A`
        SignNonce => ProjectivePoint;
        /// This node's share of the signature scalar
        SignSeed => Scalar;
        /// The interpolated signature scalar
        SignS => Scalar;
        /// The finished signatures, one per slot
        Signatures => Vec<SchnorrSignature>;
    }
}

/// A type for storing values produced during one context run.
#[derive(Debug, Default)]
pub(crate) struct ResultStore {
    storage: HashMap<(usize, TypeId), Box<dyn Any + Send + Sync>>,
}

impl ResultStore {
    /// Stores `value` via a [`TypeTag`] and slot tuple. Values are written
    /// once; storing the same key twice is an error.
    pub(crate) fn store<T: TypeTag>(&mut self, slot: usize, value: T::Value) -> Result<()> {
        let key = (slot, TypeId::of::<T>());
        if self.storage.contains_key(&key) {
            error!(
                "Storage entry written twice. Type: {:?}, slot: {}",
                std::any::type_name::<T>(),
                slot
            );
            return Err(InternalError::StorageItemExists);
        }
        let _ = self.storage.insert(key, Box::new(value));
        Ok(())
    }

    /// Retrieves a reference to a value via its [`TypeTag`] and slot.
    pub(crate) fn retrieve<T: TypeTag>(&self, slot: usize) -> Result<&T::Value> {
        self.storage
            .get(&(slot, TypeId::of::<T>()))
            .map(|any| {
                any.downcast_ref::<T::Value>().ok_or_else(|| {
                    error!(
                        "Could not downcast storage entry. Type: {:?}, slot: {}",
                        std::any::type_name::<T::Value>(),
                        slot
                    );
                    InternalError::InternalInvariantFailed
                })
            })
            .unwrap_or_else(|| {
                error!(
                    "Could not retrieve storage entry. Type: {:?}, slot: {}",
                    std::any::type_name::<T>(),
                    slot
                );
                Err(InternalError::StorageItemNotFound)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{keys::*, *};
    use k256::Scalar;

    #[test]
    fn values_are_written_once_per_slot() -> Result<()> {
        let mut store = ResultStore::default();
        store.store::<SignA>(0, Scalar::ONE)?;
        store.store::<SignA>(1, Scalar::ZERO)?;
        assert_eq!(
            store.store::<SignA>(0, Scalar::ZERO),
            Err(InternalError::StorageItemExists)
        );
        assert_eq!(store.retrieve::<SignA>(0)?, &Scalar::ONE);
        assert_eq!(store.retrieve::<SignA>(1)?, &Scalar::ZERO);
        assert_eq!(
            store.retrieve::<SignR>(0).err(),
            Some(InternalError::StorageItemNotFound)
        );
        Ok(())
    }
}
