// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The request/acknowledge handshake and the ready barrier that open every
//! pipeline.
//!
//! The leader proposes a run and waits until every other peer has created
//! its mirrored context. It then announces that the run may start; the
//! other peers hold back their first share exchange until they hear it.

use super::{FaultCounters, Outgoing, Quorum, Recipient, Step, StepMessage};
use crate::{
    errors::{InternalError, Result},
    messages::{MessageCode, MpcMessage},
    protocol::{Address, PeerId, PeerSet, ProtocolType},
    result_store::{keys, ResultStore, SHARED_SLOT},
    validator::SignRequest,
};
use num_bigint::BigUint;
use std::sync::Arc;
use tracing::{debug, error};

/// Proposes the run to every other peer and waits for all of them to
/// acknowledge it.
pub(crate) struct RequestMpcStep {
    protocol: ProtocolType,
    quorum: Quorum,
    data: Vec<BigUint>,
    bytes_data: Vec<Vec<u8>>,
}

impl RequestMpcStep {
    pub(crate) fn new(
        protocol: ProtocolType,
        peers: &PeerSet,
        self_id: PeerId,
        faults: Arc<FaultCounters>,
    ) -> Self {
        let others: Vec<PeerId> = peers.ids().filter(|id| id != &self_id).collect();
        let required = others.len();
        Self {
            protocol,
            quorum: Quorum::new(others, required, faults),
            data: Vec::new(),
            bytes_data: Vec::new(),
        }
    }
}

impl Step for RequestMpcStep {
    fn name(&self) -> &'static str {
        "request_mpc"
    }

    fn quorum(&mut self) -> &mut Quorum {
        &mut self.quorum
    }

    fn init(&mut self, store: &mut ResultStore) -> Result<()> {
        match self.protocol {
            ProtocolType::SignLeader => {
                let request = store.retrieve::<keys::Request>(SHARED_SLOT)?;
                let (data, bytes_data) = encode_sign_request(request);
                self.data = data;
                self.bytes_data = bytes_data;
            }
            ProtocolType::GpkLeader => {
                self.data = vec![BigUint::from(self.protocol.code())];
            }
            _ => return Err(InternalError::UnknownContextType),
        }
        Ok(())
    }

    fn create_messages(&mut self) -> Result<Vec<Outgoing>> {
        Ok(vec![Outgoing {
            code: MessageCode::RequestMpc,
            to: Recipient::Others,
            data: self.data.clone(),
            bytes_data: self.bytes_data.clone(),
        }])
    }

    fn handle_message(&mut self, message: &StepMessage) -> Result<()> {
        let expected = BigUint::from(self.protocol.responder()?.code());
        if message.data.first() != Some(&expected) {
            return arg_err!("acknowledgement for another protocol");
        }
        debug!("{} acknowledged the request", message.from);
        Ok(())
    }
}

/// Tells the leader that this node has joined the run.
pub(crate) struct AcknowledgeMpcStep {
    protocol: ProtocolType,
    quorum: Quorum,
}

impl AcknowledgeMpcStep {
    pub(crate) fn new(protocol: ProtocolType, faults: Arc<FaultCounters>) -> Self {
        Self {
            protocol,
            quorum: Quorum::none(faults),
        }
    }
}

impl Step for AcknowledgeMpcStep {
    fn name(&self) -> &'static str {
        "acknowledge_mpc"
    }

    fn quorum(&mut self) -> &mut Quorum {
        &mut self.quorum
    }

    fn create_messages(&mut self) -> Result<Vec<Outgoing>> {
        Ok(vec![Outgoing::mpc(
            Recipient::Others,
            vec![BigUint::from(self.protocol.code())],
        )])
    }

    fn handle_message(&mut self, _message: &StepMessage) -> Result<()> {
        Ok(())
    }
}

/// The leader's announcement that every peer has joined.
pub(crate) struct MpcReadyStep {
    quorum: Quorum,
}

impl MpcReadyStep {
    pub(crate) fn new(faults: Arc<FaultCounters>) -> Self {
        Self {
            quorum: Quorum::none(faults),
        }
    }
}

impl Step for MpcReadyStep {
    fn name(&self) -> &'static str {
        "mpc_ready"
    }

    fn quorum(&mut self) -> &mut Quorum {
        &mut self.quorum
    }

    fn create_messages(&mut self) -> Result<Vec<Outgoing>> {
        Ok(vec![Outgoing::mpc(Recipient::Others, vec![BigUint::from(1u8)])])
    }

    fn handle_message(&mut self, _message: &StepMessage) -> Result<()> {
        Ok(())
    }
}

/// Waits for the leader's ready announcement.
pub(crate) struct GetMpcReadyStep {
    quorum: Quorum,
}

impl GetMpcReadyStep {
    pub(crate) fn new(leader: PeerId, faults: Arc<FaultCounters>) -> Self {
        Self {
            quorum: Quorum::new([leader], 1, faults),
        }
    }
}

impl Step for GetMpcReadyStep {
    fn name(&self) -> &'static str {
        "get_mpc_ready"
    }

    fn quorum(&mut self) -> &mut Quorum {
        &mut self.quorum
    }

    fn create_messages(&mut self) -> Result<Vec<Outgoing>> {
        Ok(vec![])
    }

    fn handle_message(&mut self, _message: &StepMessage) -> Result<()> {
        Ok(())
    }
}

///////////////////////////
// Sign request envelope //
///////////////////////////

/// `data = [type, chain id, address, hash_0, ..]`,
/// `bytes_data = [chain type, raw tx, sign type]`
fn encode_sign_request(request: &SignRequest) -> (Vec<BigUint>, Vec<Vec<u8>>) {
    let mut data = vec![
        BigUint::from(ProtocolType::SignLeader.code()),
        BigUint::from(request.chain_id),
        BigUint::from_bytes_be(request.address.as_bytes()),
    ];
    data.extend(request.hashes.iter().map(|h| BigUint::from_bytes_be(h)));
    let bytes_data = vec![
        request.chain_type.as_bytes().to_vec(),
        request.raw_tx.clone(),
        request.sign_type.as_bytes().to_vec(),
    ];
    (data, bytes_data)
}

fn fixed_bytes<const N: usize>(value: &BigUint) -> Result<[u8; N]> {
    let bytes = value.to_bytes_be();
    if bytes.len() > N {
        error!("Value does not fit in {} bytes", N);
        return Err(InternalError::Serialization);
    }
    let mut out = [0u8; N];
    out[N - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}

/// The protocol a `RequestMpc` message proposes.
pub(crate) fn requested_protocol(message: &MpcMessage) -> Result<ProtocolType> {
    let code = message
        .data
        .first()
        .and_then(|code| u64::try_from(code).ok())
        .ok_or(InternalError::UnknownContextType)?;
    ProtocolType::from_code(code)
}

/// Inverse of the encoding the sign leader's request step uses.
pub(crate) fn decode_sign_request(message: &MpcMessage) -> Result<SignRequest> {
    if message.data.len() < 4 || message.bytes_data.len() != 3 {
        error!(
            "Sign request carries {} values and {} byte strings",
            message.data.len(),
            message.bytes_data.len()
        );
        return Err(InternalError::Serialization);
    }
    let chain_id = u64::try_from(&message.data[1]).map_err(|_| InternalError::Serialization)?;
    let address = Address(fixed_bytes::<20>(&message.data[2])?);
    let hashes = message.data[3..]
        .iter()
        .map(fixed_bytes::<32>)
        .collect::<Result<Vec<_>>>()?;
    let text = |bytes: &Vec<u8>| {
        String::from_utf8(bytes.clone()).map_err(|_| InternalError::Serialization)
    };
    Ok(SignRequest {
        address,
        chain_type: text(&message.bytes_data[0])?,
        chain_id,
        raw_tx: message.bytes_data[1].clone(),
        sign_type: text(&message.bytes_data[2])?,
        hashes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ContextId;

    #[test]
    fn sign_request_survives_the_envelope() -> Result<()> {
        let mut address = [0x5a; 20];
        address[0] = 0;
        let request = SignRequest {
            address: Address(address),
            chain_type: "ETH".into(),
            chain_id: 60,
            raw_tx: vec![0xde, 0xad],
            sign_type: "schnorr".into(),
            hashes: vec![[0u8; 32], [0xffu8; 32]],
        };
        let (data, bytes_data) = encode_sign_request(&request);
        let mut message = MpcMessage::new(ContextId(1), 0);
        message.data = data;
        message.bytes_data = bytes_data;
        assert_eq!(requested_protocol(&message)?, ProtocolType::SignLeader);
        assert_eq!(decode_sign_request(&message)?, request);

        message.bytes_data.pop();
        assert_eq!(
            decode_sign_request(&message),
            Err(InternalError::Serialization)
        );
        Ok(())
    }
}
