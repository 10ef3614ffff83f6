//! Types and methods for our `ProtocolMessage` type and friends.

// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Contains the definitions for the messages that are passed between
//! storemen, and the compact encoding of the peer subset they carry.

use crate::{
    errors::{InternalError, Result},
    parameters::{MAX_SEED, PEER_ENCODING_LEN},
    protocol::{ContextId, PeerId, PeerInfo, PeerSet},
};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tracing::{error, instrument, trace};

/////////////////
// Message API //
/////////////////

/// The code a message travels under on the wire.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageCode {
    /// Aborts a context; the reason is carried in the `peers` field
    MpcError,
    /// Proposes a new protocol run
    RequestMpc,
    /// Payload for one step of a live context
    MpcMessage,
}

impl MessageCode {
    /// Numeric value of the code.
    pub fn as_u64(self) -> u64 {
        match self {
            MessageCode::MpcError => 3,
            MessageCode::RequestMpc => 4,
            MessageCode::MpcMessage => 5,
        }
    }

    /// Parses a numeric code.
    pub fn from_u64(code: u64) -> Result<Self> {
        match code {
            3 => Ok(MessageCode::MpcError),
            4 => Ok(MessageCode::RequestMpc),
            5 => Ok(MessageCode::MpcMessage),
            _ => {
                error!("Unknown message code {}", code);
                Err(InternalError::MisroutedMessage)
            }
        }
    }
}

/// The envelope shared by every message kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpcMessage {
    /// The context this message belongs to
    pub context_id: ContextId,
    /// Index of the addressed step within the context's pipeline
    pub step_id: u64,
    /// Encoded peer subset, or the reason of an abort
    pub peers: Vec<u8>,
    /// Scalar payload
    pub data: Vec<BigUint>,
    /// Byte payload
    pub bytes_data: Vec<Vec<u8>>,
}

impl MpcMessage {
    pub(crate) fn new(context_id: ContextId, step_id: u64) -> Self {
        Self {
            context_id,
            step_id,
            peers: Vec::new(),
            data: Vec::new(),
            bytes_data: Vec::new(),
        }
    }
}

/// A message together with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// See [`MessageCode::RequestMpc`]
    RequestMpc(MpcMessage),
    /// See [`MessageCode::MpcMessage`]
    Mpc(MpcMessage),
    /// See [`MessageCode::MpcError`]
    MpcError(MpcMessage),
}

impl ProtocolMessage {
    /// The wire code of this message.
    pub fn code(&self) -> MessageCode {
        match self {
            ProtocolMessage::RequestMpc(_) => MessageCode::RequestMpc,
            ProtocolMessage::Mpc(_) => MessageCode::MpcMessage,
            ProtocolMessage::MpcError(_) => MessageCode::MpcError,
        }
    }

    /// The envelope, whatever the kind.
    pub fn body(&self) -> &MpcMessage {
        match self {
            ProtocolMessage::RequestMpc(m) | ProtocolMessage::Mpc(m) | ProtocolMessage::MpcError(m) => m,
        }
    }

    /// Serializes the envelope. The code travels next to it.
    #[instrument(skip_all)]
    pub fn encode(&self) -> Result<(u64, Vec<u8>)> {
        trace!("Encoding {:?} message.", self.code());
        Ok((self.code().as_u64(), serialize!(self.body())?))
    }

    /// Inverse of [`encode`](Self::encode).
    #[instrument(skip_all)]
    pub fn decode(code: u64, payload: &[u8]) -> Result<Self> {
        let body: MpcMessage = deserialize!(payload)?;
        Ok(match MessageCode::from_u64(code)? {
            MessageCode::RequestMpc => ProtocolMessage::RequestMpc(body),
            MessageCode::MpcMessage => ProtocolMessage::Mpc(body),
            MessageCode::MpcError => ProtocolMessage::MpcError(body),
        })
    }
}

//////////////////////////
// Peer subset encoding //
//////////////////////////

/// Encodes `peers` as 4 bytes each: the peer's index in the sorted `roster`
/// followed by the low three bytes of its seed, big-endian.
pub(crate) fn encode_peers(roster: &[PeerId], peers: &PeerSet) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(peers.len() * PEER_ENCODING_LEN);
    for peer in peers.iter() {
        let index = roster
            .iter()
            .position(|id| id == &peer.peer_id)
            .ok_or_else(|| {
                error!("{} is not part of the storeman roster", peer.peer_id);
                InternalError::InvalidPeerEncoding
            })?;
        let index = u8::try_from(index).map_err(|_| InternalError::InvalidPeerEncoding)?;
        if peer.seed >= MAX_SEED {
            return Err(InternalError::SeedOutOfRange);
        }
        let seed = peer.seed.to_be_bytes();
        out.push(index);
        out.extend_from_slice(&seed[5..]);
    }
    Ok(out)
}

/// Inverse of [`encode_peers`]. Seed range and uniqueness are checked by
/// [`PeerSet::new`].
pub(crate) fn decode_peers(roster: &[PeerId], bytes: &[u8]) -> Result<PeerSet> {
    if bytes.is_empty() || bytes.len() % PEER_ENCODING_LEN != 0 {
        error!("Peer subset encoding has length {}", bytes.len());
        return Err(InternalError::InvalidPeerEncoding);
    }
    let peers = bytes
        .chunks(PEER_ENCODING_LEN)
        .map(|chunk| {
            let peer_id = *roster
                .get(chunk[0] as usize)
                .ok_or(InternalError::InvalidPeerEncoding)?;
            let seed = u64::from_be_bytes([0, 0, 0, 0, 0, chunk[1], chunk[2], chunk[3]]);
            Ok(PeerInfo { peer_id, seed })
        })
        .collect::<Result<Vec<_>>>()?;
    PeerSet::new(peers)
}
