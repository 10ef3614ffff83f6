// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use super::{Outgoing, Quorum, Recipient, Step, StepMessage};
use crate::{
    errors::{InternalError, Result},
    protocol::PeerSet,
    result_store::ResultStore,
    step::FaultCounters,
};
use num_bigint::BigUint;
use std::sync::Arc;
use tracing::{debug, error};

/// What a generator sends for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Contribution {
    /// The same values for every peer
    Broadcast(Vec<BigUint>),
    /// One list of values per peer, in peer set order
    PerPeer(Vec<Vec<BigUint>>),
}

/// Produces one value from the contributions of every peer of a step.
pub(crate) trait Generator: Send {
    /// A contribution after it has been parsed off the wire.
    type Input: Send;

    /// How many `data` values of each message belong to this generator.
    fn width(&self) -> usize;

    /// Computes this node's contribution.
    fn initialize(&mut self, peers: &PeerSet, store: &ResultStore) -> Result<()>;

    fn contribution(&self, peers: &PeerSet) -> Result<Contribution>;

    /// Parses a peer's slice of a message. `values` has length
    /// [`width`](Generator::width).
    fn decode(&self, values: &[BigUint]) -> Result<Self::Input>;

    /// Records the contribution of the peer at `seed`.
    fn ingest(&mut self, seed: u64, input: Self::Input);

    fn calculate_result(&mut self, store: &mut ResultStore) -> Result<()>;
}

/// A step driving several generators over one quorum.
///
/// Each message carries the concatenated slices of every generator, in the
/// order the generators were given.
pub(crate) struct MpcStep<G: Generator> {
    name: &'static str,
    peers: Arc<PeerSet>,
    quorum: Quorum,
    generators: Vec<G>,
}

impl<G: Generator> MpcStep<G> {
    pub(crate) fn new(
        name: &'static str,
        peers: Arc<PeerSet>,
        faults: Arc<FaultCounters>,
        generators: Vec<G>,
    ) -> Self {
        let quorum = Quorum::all(&peers, faults);
        Self {
            name,
            peers,
            quorum,
            generators,
        }
    }

    fn message_width(&self) -> usize {
        self.generators.iter().map(|g| g.width()).sum()
    }
}

impl<G: Generator> Step for MpcStep<G> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn quorum(&mut self) -> &mut Quorum {
        &mut self.quorum
    }

    fn init(&mut self, store: &mut ResultStore) -> Result<()> {
        for generator in self.generators.iter_mut() {
            generator.initialize(&self.peers, store)?;
        }
        Ok(())
    }

    fn create_messages(&mut self) -> Result<Vec<Outgoing>> {
        let mut broadcast = Vec::new();
        let mut per_peer: Vec<Vec<BigUint>> = vec![Vec::new(); self.peers.len()];
        let (mut any_broadcast, mut any_per_peer) = (false, false);

        for generator in &self.generators {
            match generator.contribution(&self.peers)? {
                Contribution::Broadcast(values) => {
                    any_broadcast = true;
                    broadcast.extend(values);
                }
                Contribution::PerPeer(values) => {
                    any_per_peer = true;
                    if values.len() != per_peer.len() {
                        error!("{}: contribution for {} peers", self.name, values.len());
                        return Err(InternalError::InternalInvariantFailed);
                    }
                    for (slot, values) in per_peer.iter_mut().zip(values) {
                        slot.extend(values);
                    }
                }
            }
        }

        match (any_broadcast, any_per_peer) {
            (true, true) => {
                error!("{} mixes broadcast and per-peer generators", self.name);
                Err(InternalError::InternalInvariantFailed)
            }
            (false, true) => Ok(self
                .peers
                .iter()
                .zip(per_peer)
                .map(|(peer, data)| Outgoing::mpc(Recipient::Peer(peer.peer_id), data))
                .collect()),
            _ => Ok(vec![Outgoing::mpc(Recipient::All, broadcast)]),
        }
    }

    fn handle_message(&mut self, message: &StepMessage) -> Result<()> {
        let seed = self
            .peers
            .seed_of(&message.from)
            .ok_or(InternalError::MisroutedMessage)?;
        if message.data.len() != self.message_width() {
            return arg_err!(format!(
                "expected {} values, got {}",
                self.message_width(),
                message.data.len()
            ));
        }

        let mut inputs = Vec::with_capacity(self.generators.len());
        let mut offset = 0;
        for generator in &self.generators {
            let width = generator.width();
            inputs.push(generator.decode(&message.data[offset..offset + width])?);
            offset += width;
        }
        for (generator, input) in self.generators.iter_mut().zip(inputs) {
            generator.ingest(seed, input);
        }
        Ok(())
    }

    fn finish(&mut self, store: &mut ResultStore) -> Result<()> {
        for generator in self.generators.iter_mut() {
            generator.calculate_result(store)?;
        }
        debug!("{} finished", self.name);
        Ok(())
    }
}
