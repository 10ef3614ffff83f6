// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use super::{FaultCounters, Outgoing, Quorum, Recipient, Step, StepMessage};
use crate::{
    errors::{InternalError, Result},
    messages::MessageCode,
    protocol::{Address, PeerId, PeerSet},
    result_store::{keys, ResultStore, SHARED_SLOT},
};
use std::{collections::HashMap, sync::Arc};
use tracing::{error, info};

/// Which round of the account agreement a step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountRound {
    /// Derive the address from the group key and compare it with every
    /// peer's
    Acknowledge,
    /// Confirm that the acknowledgement passed. Nothing is persisted
    /// unless every peer sends this.
    Commit,
}

/// Checks that every peer of a key generation ends up with the same
/// account.
///
/// The acknowledge round derives the address from the group public key and
/// compares it with every peer's. A peer only takes part in the commit
/// round once its acknowledge round passed, so the commit round completes
/// on every peer or on none of them.
pub(crate) struct AckMpcAccountStep {
    round: AccountRound,
    quorum: Quorum,
    own: Option<Address>,
    reported: HashMap<PeerId, Address>,
}

impl AckMpcAccountStep {
    pub(crate) fn acknowledge(peers: &PeerSet, faults: Arc<FaultCounters>) -> Self {
        Self::new(AccountRound::Acknowledge, peers, faults)
    }

    pub(crate) fn commit(peers: &PeerSet, faults: Arc<FaultCounters>) -> Self {
        Self::new(AccountRound::Commit, peers, faults)
    }

    fn new(round: AccountRound, peers: &PeerSet, faults: Arc<FaultCounters>) -> Self {
        Self {
            round,
            quorum: Quorum::all(peers, faults),
            own: None,
            reported: HashMap::new(),
        }
    }
}

impl Step for AckMpcAccountStep {
    fn name(&self) -> &'static str {
        match self.round {
            AccountRound::Acknowledge => "ack_mpc_account",
            AccountRound::Commit => "commit_mpc_account",
        }
    }

    fn quorum(&mut self) -> &mut Quorum {
        &mut self.quorum
    }

    fn init(&mut self, store: &mut ResultStore) -> Result<()> {
        let address = match self.round {
            AccountRound::Acknowledge => {
                let public_key = store.retrieve::<keys::PublicKeyResult>(SHARED_SLOT)?;
                let address = Address::from_public_key(public_key);
                store.store::<keys::AccountAddress>(SHARED_SLOT, address)?;
                address
            }
            AccountRound::Commit => *store.retrieve::<keys::AccountAddress>(SHARED_SLOT)?,
        };
        self.own = Some(address);
        Ok(())
    }

    fn create_messages(&mut self) -> Result<Vec<Outgoing>> {
        let own = self.own.ok_or(InternalError::InternalInvariantFailed)?;
        Ok(vec![Outgoing {
            code: MessageCode::MpcMessage,
            to: Recipient::All,
            data: vec![],
            bytes_data: vec![own.as_bytes().to_vec()],
        }])
    }

    fn handle_message(&mut self, message: &StepMessage) -> Result<()> {
        let bytes = match message.bytes_data.as_slice() {
            [bytes] => bytes,
            _ => return arg_err!("expected a single address"),
        };
        let _ = self
            .reported
            .insert(message.from, Address::from_slice(bytes)?);
        Ok(())
    }

    fn finish(&mut self, _store: &mut ResultStore) -> Result<()> {
        let own = self.own.ok_or(InternalError::InternalInvariantFailed)?;
        let contributors: Vec<PeerId> = self.quorum.contributors().copied().collect();
        if contributors.len() != self.reported.len() {
            return Err(InternalError::InternalInvariantFailed);
        }
        for (peer, address) in &self.reported {
            if address != &own {
                error!("{} reported account {}, expected {}", peer, address, own);
                return Err(InternalError::InvalidMpcAddr);
            }
        }
        match self.round {
            AccountRound::Acknowledge => info!("All peers agree on account {}", own),
            AccountRound::Commit => info!("All peers committed to account {}", own),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        math::random_nonzero_scalar,
        protocol::PeerInfo,
        step::{admit, Admission},
    };
    use k256::ProjectivePoint;
    use rand::rngs::OsRng;

    fn report(from: PeerId, address: &Address) -> StepMessage {
        StepMessage {
            from,
            data: vec![],
            bytes_data: vec![address.as_bytes().to_vec()],
        }
    }

    /// Runs the step from one peer's point of view.
    fn check(
        peers: &PeerSet,
        own_key: &ProjectivePoint,
        reports: &[(PeerId, Address)],
    ) -> Result<()> {
        let mut step = AckMpcAccountStep::acknowledge(peers, Arc::new(FaultCounters::default()));
        let mut store = ResultStore::default();
        store.store::<keys::PublicKeyResult>(SHARED_SLOT, *own_key)?;
        step.init(&mut store)?;
        let mut last = Admission::Ignored;
        for (from, address) in reports {
            last = admit(&mut step, &report(*from, address));
        }
        assert_eq!(last, Admission::Completed);
        step.finish(&mut store)
    }

    #[test]
    fn one_flipped_address_fails_every_participant() -> Result<()> {
        let mut rng = OsRng;
        let peers = PeerSet::new(
            (1..=3)
                .map(|seed| PeerInfo {
                    peer_id: PeerId::random(&mut rng),
                    seed,
                })
                .collect(),
        )?;
        let ids: Vec<PeerId> = peers.ids().collect();
        let key = ProjectivePoint::GENERATOR * random_nonzero_scalar(&mut rng);
        let good = Address::from_public_key(&key);

        let honest: Vec<(PeerId, Address)> = ids.iter().map(|id| (*id, good)).collect();
        assert!(check(&peers, &key, &honest).is_ok());

        // The last peer holds a corrupted key and reports its address to
        // everyone, itself included.
        let bad_key = key + ProjectivePoint::GENERATOR;
        let bad = Address::from_public_key(&bad_key);
        let mut flipped = honest.clone();
        flipped[2].1 = bad;
        assert_eq!(check(&peers, &key, &flipped), Err(InternalError::InvalidMpcAddr));
        assert_eq!(
            check(&peers, &bad_key, &flipped),
            Err(InternalError::InvalidMpcAddr)
        );
        Ok(())
    }

    #[test]
    fn commit_needs_every_peer_to_confirm() -> Result<()> {
        let mut rng = OsRng;
        let peers = PeerSet::new(
            (1..=3)
                .map(|seed| PeerInfo {
                    peer_id: PeerId::random(&mut rng),
                    seed,
                })
                .collect(),
        )?;
        let ids: Vec<PeerId> = peers.ids().collect();
        let key = ProjectivePoint::GENERATOR * random_nonzero_scalar(&mut rng);
        let address = Address::from_public_key(&key);

        let mut store = ResultStore::default();
        store.store::<keys::AccountAddress>(SHARED_SLOT, address)?;
        let mut step = AckMpcAccountStep::commit(&peers, Arc::new(FaultCounters::default()));
        assert_eq!(step.name(), "commit_mpc_account");
        step.init(&mut store)?;

        // A peer whose acknowledgement failed never confirms.
        assert_eq!(admit(&mut step, &report(ids[0], &address)), Admission::Accepted);
        assert_eq!(admit(&mut step, &report(ids[1], &address)), Admission::Accepted);
        assert!(!step.quorum().is_complete());

        assert_eq!(admit(&mut step, &report(ids[2], &address)), Admission::Completed);
        step.finish(&mut store)
    }
}
