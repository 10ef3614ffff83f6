// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The signature assembly stage of a signing run.
//!
//! By now every peer holds, per signature slot, shares `a_i`, `c_i` and
//! the clear values `A = a·G` and `a·r`. The nonce point is
//! `R = (a·r)⁻¹ · A = r⁻¹ · G`, and `a_i · (a·r)⁻¹` is a share of its
//! discrete log. Each peer publishes
//! `a_i · (a·r)⁻¹ + e · x_i + c_i`, a degree `2d` share of
//! `s = r⁻¹ + e · x`, which is then interpolated.

use super::{FaultCounters, LagrangeGenerator, MpcStep, Outgoing, Quorum, Step, StepMessage};
use crate::{
    errors::{InternalError, Result},
    math,
    protocol::PeerSet,
    result_store::{keys, ResultStore, SHARED_SLOT},
    signature::SchnorrSignature,
};
use k256::{elliptic_curve::group::Group, Scalar};
use std::sync::Arc;
use tracing::{error, info};

pub(crate) struct CalSignStep {
    slots: usize,
    inner: MpcStep<LagrangeGenerator<keys::SignSeed, keys::SignS>>,
}

impl CalSignStep {
    pub(crate) fn new(
        peers: Arc<PeerSet>,
        degree: usize,
        slots: usize,
        faults: Arc<FaultCounters>,
    ) -> Self {
        let generators = (0..slots)
            .map(|slot| LagrangeGenerator::new(slot, 2 * degree))
            .collect();
        Self {
            slots,
            inner: MpcStep::new("cal_sign", peers, faults, generators),
        }
    }

    fn prepare_slot(store: &mut ResultStore, slot: usize) -> Result<()> {
        let request = store.retrieve::<keys::Request>(SHARED_SLOT)?;
        let hash = request
            .hashes
            .get(slot)
            .ok_or(InternalError::InternalInvariantFailed)?;
        let share = store.retrieve::<keys::PrivateShare>(SHARED_SLOT)?;
        let ar = store.retrieve::<keys::SignARResult>(slot)?;
        let ar_inv =
            Option::<Scalar>::from(ar.invert()).ok_or(InternalError::CouldNotInvertScalar)?;
        let nonce = store.retrieve::<keys::SignAPoint>(slot)? * &ar_inv;
        if bool::from(nonce.is_identity()) {
            return Err(InternalError::PointZero);
        }
        let e = math::challenge(hash, &nonce);
        let a = store.retrieve::<keys::SignA>(slot)?;
        let c = store.retrieve::<keys::SignC>(slot)?;
        let seed = *a * &ar_inv + e * share + c;

        store.store::<keys::SignNonce>(slot, nonce)?;
        store.store::<keys::SignSeed>(slot, seed)
    }
}

impl Step for CalSignStep {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn quorum(&mut self) -> &mut Quorum {
        self.inner.quorum()
    }

    fn init(&mut self, store: &mut ResultStore) -> Result<()> {
        for slot in 0..self.slots {
            Self::prepare_slot(store, slot)?;
        }
        self.inner.init(store)
    }

    fn create_messages(&mut self) -> Result<Vec<Outgoing>> {
        self.inner.create_messages()
    }

    fn handle_message(&mut self, message: &StepMessage) -> Result<()> {
        self.inner.handle_message(message)
    }

    /// Assembles the signatures and refuses them unless they recover to the
    /// account being signed for.
    fn finish(&mut self, store: &mut ResultStore) -> Result<()> {
        self.inner.finish(store)?;
        let expected = *store.retrieve::<keys::AccountAddress>(SHARED_SLOT)?;
        let hashes = store.retrieve::<keys::Request>(SHARED_SLOT)?.hashes.clone();

        let mut signatures = Vec::with_capacity(self.slots);
        for (slot, hash) in hashes.iter().enumerate().take(self.slots) {
            let nonce = store.retrieve::<keys::SignNonce>(slot)?;
            let s = *store.retrieve::<keys::SignS>(slot)?;
            let signature = SchnorrSignature::from_nonce(nonce, s)?;
            let signer = signature.recover_address(hash)?;
            if signer != expected {
                error!(
                    "Slot {} recovers to {}, expected {}",
                    slot, signer, expected
                );
                return Err(InternalError::FailSignRetVerify);
            }
            signatures.push(signature);
        }
        info!("Produced {} signatures for {}", signatures.len(), expected);
        store.store::<keys::Signatures>(SHARED_SLOT, signatures)
    }
}
