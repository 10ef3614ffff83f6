// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Identifiers shared by every layer of the engine: peers, their seeds,
//! contexts, protocol kinds and account addresses.

use crate::{
    errors::{InternalError, Result},
    parameters::MAX_SEED,
};
use k256::{elliptic_curve::sec1::ToEncodedPoint, ProjectivePoint};
use rand::{CryptoRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::HashSet, fmt::Display};

/// Identifies a storeman on the network. The transport layer is trusted to
/// authenticate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Generates a random identifier, mostly useful for tests.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0[..4]))
    }
}

/// A participant of one protocol run together with its evaluation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Who the peer is
    pub peer_id: PeerId,
    /// The x-coordinate this peer's shares are evaluated at
    pub seed: u64,
}

/// The ordered set of peers taking part in a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSet {
    peers: Vec<PeerInfo>,
}

impl PeerSet {
    /// Builds a peer set, checking that every seed lies in `1..MAX_SEED` and
    /// that neither seeds nor peers repeat.
    pub fn new(peers: Vec<PeerInfo>) -> Result<Self> {
        let mut seeds = HashSet::new();
        let mut ids = HashSet::new();
        for peer in &peers {
            if peer.seed == 0 || peer.seed >= MAX_SEED {
                return Err(InternalError::SeedOutOfRange);
            }
            if !seeds.insert(peer.seed) {
                return Err(InternalError::SeedDuplicate);
            }
            if !ids.insert(peer.peer_id) {
                return arg_err!("peer listed twice");
            }
        }
        Ok(Self { peers })
    }

    /// Assigns fresh random seeds to `peer_ids`, as the leader of a key
    /// generation run does.
    pub(crate) fn with_random_seeds<R: RngCore + CryptoRng>(
        rng: &mut R,
        peer_ids: &[PeerId],
    ) -> Result<Self> {
        let mut used = HashSet::new();
        let mut peers = Vec::with_capacity(peer_ids.len());
        for peer_id in peer_ids {
            let seed = loop {
                let candidate = rng.gen_range(1..MAX_SEED);
                if used.insert(candidate) {
                    break candidate;
                }
            };
            peers.push(PeerInfo {
                peer_id: *peer_id,
                seed,
            });
        }
        Self::new(peers)
    }

    /// Number of peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers in the order they were listed.
    pub fn iter(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.iter()
    }

    #[allow(missing_docs)]
    pub fn ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.iter().map(|p| p.peer_id)
    }

    /// The seed assigned to `peer_id`, if it belongs to the set.
    pub fn seed_of(&self, peer_id: &PeerId) -> Option<u64> {
        self.peers
            .iter()
            .find(|p| &p.peer_id == peer_id)
            .map(|p| p.seed)
    }

    /// Whether `peer_id` belongs to the set.
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.seed_of(peer_id).is_some()
    }
}

/// Identifies a live context on a node. Only unique among the contexts that
/// are live at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub u64);

impl Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContextId({:#018x})", self.0)
    }
}

/// The four pipelines a context can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolType {
    /// Originates a group key generation
    GpkLeader,
    /// Joins a group key generation
    GpkPeer,
    /// Originates a signing run
    SignLeader,
    /// Joins a signing run
    SignPeer,
}

impl ProtocolType {
    pub(crate) fn code(self) -> u64 {
        match self {
            ProtocolType::GpkLeader => 0,
            ProtocolType::GpkPeer => 1,
            ProtocolType::SignLeader => 2,
            ProtocolType::SignPeer => 3,
        }
    }

    pub(crate) fn from_code(code: u64) -> Result<Self> {
        match code {
            0 => Ok(ProtocolType::GpkLeader),
            1 => Ok(ProtocolType::GpkPeer),
            2 => Ok(ProtocolType::SignLeader),
            3 => Ok(ProtocolType::SignPeer),
            _ => Err(InternalError::UnknownContextType),
        }
    }

    /// The pipeline a responder runs for a request of this type.
    pub(crate) fn responder(self) -> Result<Self> {
        match self {
            ProtocolType::GpkLeader => Ok(ProtocolType::GpkPeer),
            ProtocolType::SignLeader => Ok(ProtocolType::SignPeer),
            ProtocolType::GpkPeer | ProtocolType::SignPeer => {
                Err(InternalError::UnknownContextType)
            }
        }
    }

    pub(crate) fn is_leader(self) -> bool {
        matches!(self, ProtocolType::GpkLeader | ProtocolType::SignLeader)
    }
}

/// The 20-byte account identifier derived from a group public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Hashes the uncompressed public key (without its tag byte) and keeps
    /// the trailing 20 bytes.
    pub fn from_public_key(point: &ProjectivePoint) -> Self {
        let encoded = point.to_affine().to_encoded_point(false);
        let digest = Sha256::digest(&encoded.as_bytes()[1..]);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[12..]);
        Self(bytes)
    }

    /// Parses an address from exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| InternalError::InvalidArgument("address must be 20 bytes".into()))?;
        Ok(Self(bytes))
    }

    #[allow(missing_docs)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// The outcome of a group key generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupKey {
    /// The account address derived from `public_key`
    pub address: Address,
    /// The group public key
    pub public_key: ProjectivePoint,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn peer(rng: &mut OsRng, seed: u64) -> PeerInfo {
        PeerInfo {
            peer_id: PeerId::random(rng),
            seed,
        }
    }

    #[test]
    fn peer_set_rejects_bad_seeds() {
        let mut rng = OsRng;
        assert_eq!(
            PeerSet::new(vec![peer(&mut rng, 0)]),
            Err(InternalError::SeedOutOfRange)
        );
        assert_eq!(
            PeerSet::new(vec![peer(&mut rng, MAX_SEED)]),
            Err(InternalError::SeedOutOfRange)
        );
        assert_eq!(
            PeerSet::new(vec![peer(&mut rng, 7), peer(&mut rng, 7)]),
            Err(InternalError::SeedDuplicate)
        );
        assert!(PeerSet::new(vec![peer(&mut rng, 7), peer(&mut rng, MAX_SEED - 1)]).is_ok());
    }

    #[test]
    fn random_seeds_are_unique_and_in_range() -> Result<()> {
        let mut rng = OsRng;
        let ids: Vec<PeerId> = (0..50).map(|_| PeerId::random(&mut rng)).collect();
        let set = PeerSet::with_random_seeds(&mut rng, &ids)?;
        assert_eq!(set.len(), 50);
        assert!(ids.iter().all(|id| set.contains(id)));
        Ok(())
    }

    #[test]
    fn responder_types() {
        assert_eq!(
            ProtocolType::GpkLeader.responder(),
            Ok(ProtocolType::GpkPeer)
        );
        assert_eq!(
            ProtocolType::SignLeader.responder(),
            Ok(ProtocolType::SignPeer)
        );
        assert!(ProtocolType::SignPeer.responder().is_err());
        assert_eq!(ProtocolType::from_code(4), Err(InternalError::UnknownContextType));
    }
}
