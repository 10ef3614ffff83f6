// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use super::{Contribution, Generator};
use crate::{
    errors::{InternalError, Result},
    math,
    protocol::PeerSet,
    result_store::{ResultStore, TypeTag},
};
use k256::Scalar;
use num_bigint::BigUint;
use std::{collections::BTreeMap, marker::PhantomData};
use tracing::error;

/// Publishes this node's share from `I` and interpolates the shared value
/// at zero into `O`, using the first `degree + 1` shares in seed order.
pub(crate) struct LagrangeGenerator<I, O> {
    slot: usize,
    degree: usize,
    own: Option<Scalar>,
    received: BTreeMap<u64, Scalar>,
    _tags: PhantomData<fn() -> (I, O)>,
}

impl<I, O> LagrangeGenerator<I, O>
where
    I: TypeTag<Value = Scalar>,
    O: TypeTag<Value = Scalar>,
{
    pub(crate) fn new(slot: usize, degree: usize) -> Self {
        Self {
            slot,
            degree,
            own: None,
            received: BTreeMap::new(),
            _tags: PhantomData,
        }
    }
}

impl<I, O> Generator for LagrangeGenerator<I, O>
where
    I: TypeTag<Value = Scalar>,
    O: TypeTag<Value = Scalar>,
{
    type Input = Scalar;

    fn width(&self) -> usize {
        1
    }

    fn initialize(&mut self, _peers: &PeerSet, store: &ResultStore) -> Result<()> {
        self.own = Some(*store.retrieve::<I>(self.slot)?);
        Ok(())
    }

    fn contribution(&self, _peers: &PeerSet) -> Result<Contribution> {
        let own = self.own.as_ref().ok_or(InternalError::InternalInvariantFailed)?;
        Ok(Contribution::Broadcast(vec![math::scalar_to_biguint(own)]))
    }

    fn decode(&self, values: &[BigUint]) -> Result<Scalar> {
        math::biguint_to_scalar(&values[0])
    }

    fn ingest(&mut self, seed: u64, input: Scalar) {
        let _ = self.received.insert(seed, input);
    }

    fn calculate_result(&mut self, store: &mut ResultStore) -> Result<()> {
        let needed = self.degree + 1;
        if self.received.len() < needed {
            error!(
                "Slot {} needs {} shares to interpolate, have {}",
                self.slot,
                needed,
                self.received.len()
            );
            return Err(InternalError::InternalInvariantFailed);
        }
        let points: Vec<(u64, Scalar)> = self
            .received
            .iter()
            .take(needed)
            .map(|(seed, share)| (*seed, *share))
            .collect();
        store.store::<O>(self.slot, math::interpolate_scalar(&points)?)
    }
}
