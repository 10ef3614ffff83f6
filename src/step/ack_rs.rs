// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The closing cross-check of a signing run.
//!
//! Every peer publishes the nonce point `R` and scalar `s` it assembled for
//! each slot. A peer that sent different signature shares to different
//! parts of the subset leaves them with different `(R, s)`, which only
//! shows once the results are compared.

use super::{FaultCounters, Outgoing, Quorum, Recipient, Step, StepMessage};
use crate::{
    errors::{InternalError, Result},
    math,
    protocol::{PeerId, PeerSet},
    result_store::{keys, ResultStore},
};
use k256::{ProjectivePoint, Scalar};
use std::{collections::HashMap, sync::Arc};
use tracing::{error, info};

/// `(R, s)` of one signature slot.
type SlotResult = (ProjectivePoint, Scalar);

/// Values per slot on the wire: `s`, then `R` as affine coordinates.
const SLOT_WIDTH: usize = 3;

pub(crate) struct AckMpcRsStep {
    slots: usize,
    quorum: Quorum,
    own: Vec<SlotResult>,
    reported: HashMap<PeerId, Vec<SlotResult>>,
}

impl AckMpcRsStep {
    pub(crate) fn new(peers: &PeerSet, slots: usize, faults: Arc<FaultCounters>) -> Self {
        Self {
            slots,
            quorum: Quorum::all(peers, faults),
            own: Vec::new(),
            reported: HashMap::new(),
        }
    }
}

impl Step for AckMpcRsStep {
    fn name(&self) -> &'static str {
        "ack_mpc_rs"
    }

    fn quorum(&mut self) -> &mut Quorum {
        &mut self.quorum
    }

    fn init(&mut self, store: &mut ResultStore) -> Result<()> {
        self.own = (0..self.slots)
            .map(|slot| {
                Ok((
                    *store.retrieve::<keys::SignNonce>(slot)?,
                    *store.retrieve::<keys::SignS>(slot)?,
                ))
            })
            .collect::<Result<_>>()?;
        Ok(())
    }

    fn create_messages(&mut self) -> Result<Vec<Outgoing>> {
        let mut data = Vec::with_capacity(self.slots * SLOT_WIDTH);
        for (nonce, s) in &self.own {
            let (x, y) = math::point_to_coordinates(nonce)?;
            data.extend([math::scalar_to_biguint(s), x, y]);
        }
        Ok(vec![Outgoing::mpc(Recipient::All, data)])
    }

    fn handle_message(&mut self, message: &StepMessage) -> Result<()> {
        if message.data.len() != self.slots * SLOT_WIDTH {
            return arg_err!(format!(
                "expected {} values, got {}",
                self.slots * SLOT_WIDTH,
                message.data.len()
            ));
        }
        let results = message
            .data
            .chunks(SLOT_WIDTH)
            .map(|values| {
                let s = math::biguint_to_scalar(&values[0])?;
                let nonce = math::coordinates_to_point(&values[1], &values[2])?;
                Ok((nonce, s))
            })
            .collect::<Result<Vec<_>>>()?;
        let _ = self.reported.insert(message.from, results);
        Ok(())
    }

    fn finish(&mut self, _store: &mut ResultStore) -> Result<()> {
        if self.reported.len() != self.quorum.contributors().count() {
            return Err(InternalError::InternalInvariantFailed);
        }
        for (peer, results) in &self.reported {
            let pairs = results.iter().zip(&self.own).enumerate();
            for (slot, ((nonce, s), (own_nonce, own_s))) in pairs {
                if nonce != own_nonce {
                    error!("{} assembled another nonce for slot {}", peer, slot);
                    return Err(InternalError::InvalidMpcR);
                }
                if s != own_s {
                    error!("{} assembled another signature for slot {}", peer, slot);
                    return Err(InternalError::InvalidMpcS);
                }
            }
        }
        info!("All peers agree on {} signatures", self.slots);
        Ok(())
    }
}
