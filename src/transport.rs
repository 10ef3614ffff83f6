// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{errors::Result, messages::ProtocolMessage, protocol::PeerId};
use tracing::warn;

/// The peer-to-peer network a [`Distributor`](crate::Distributor) talks
/// through. Implementations authenticate peers; messages are only handed
/// to the distributor together with the sender's identity.
pub trait Transport: Send + Sync {
    /// Sends `message` to a remote peer.
    fn send_to_peer(&self, peer: &PeerId, message: ProtocolMessage) -> Result<()>;

    /// Whether `peer` is currently connected.
    fn is_peer_reachable(&self, peer: &PeerId) -> bool;

    /// Sends `message` to each of `peers`, logging the ones that fail.
    fn broadcast(&self, peers: &[PeerId], message: &ProtocolMessage) {
        for peer in peers {
            if let Err(e) = self.send_to_peer(peer, message.clone()) {
                warn!("Broadcast to {} failed: {}", peer, e);
            }
        }
    }
}
