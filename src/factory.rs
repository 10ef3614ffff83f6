// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Assembles the step pipeline of each protocol type.
//!
//! The leader and responder pipelines of a protocol have the same length,
//! so that a step index names the same stage on every peer.

use crate::{
    protocol::{PeerId, PeerSet, ProtocolType},
    result_store::keys,
    step::{
        AckMpcAccountStep, AckMpcRsStep, AcknowledgeMpcStep, CalSignStep, CombineMode,
        FaultCounters, GetMpcReadyStep, KeyShareGenerator, LagrangeGenerator, MpcReadyStep,
        MpcStep, PointGenerator, RequestMpcStep, SignShareGenerator, Step,
    },
};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Everything a pipeline is parameterised by.
#[derive(Debug, Clone)]
pub(crate) struct PipelineParams {
    pub(crate) protocol: ProtocolType,
    pub(crate) peers: Arc<PeerSet>,
    pub(crate) self_id: PeerId,
    pub(crate) leader: PeerId,
    pub(crate) degree: usize,
    /// Number of signatures produced; ignored by key generation
    pub(crate) slots: usize,
}

/// Builds the ordered steps for `params.protocol`.
#[instrument(skip_all, fields(protocol = ?params.protocol))]
pub(crate) fn build_pipeline(
    params: &PipelineParams,
    faults: &Arc<FaultCounters>,
) -> Vec<Box<dyn Step>> {
    let mut steps = handshake(params, faults);
    match params.protocol {
        ProtocolType::GpkLeader | ProtocolType::GpkPeer => {
            steps.extend(gpk_steps(params, faults));
        }
        ProtocolType::SignLeader | ProtocolType::SignPeer => {
            steps.extend(sign_steps(params, faults));
        }
    }
    debug!("Built a pipeline of {} steps", steps.len());
    steps
}

fn handshake(params: &PipelineParams, faults: &Arc<FaultCounters>) -> Vec<Box<dyn Step>> {
    if params.protocol.is_leader() {
        vec![
            Box::new(RequestMpcStep::new(
                params.protocol,
                &params.peers,
                params.self_id,
                faults.clone(),
            )),
            Box::new(MpcReadyStep::new(faults.clone())),
        ]
    } else {
        vec![
            Box::new(AcknowledgeMpcStep::new(params.protocol, faults.clone())),
            Box::new(GetMpcReadyStep::new(params.leader, faults.clone())),
        ]
    }
}

fn gpk_steps(params: &PipelineParams, faults: &Arc<FaultCounters>) -> Vec<Box<dyn Step>> {
    let degree = params.degree;
    vec![
        Box::new(MpcStep::new(
            "sk_share",
            params.peers.clone(),
            faults.clone(),
            vec![KeyShareGenerator::new(degree)],
        )),
        Box::new(MpcStep::new(
            "gpk",
            params.peers.clone(),
            faults.clone(),
            vec![PointGenerator::<keys::PublicShare, keys::PublicKeyResult>::new(
                0,
                CombineMode::Lagrange { degree },
            )],
        )),
        Box::new(AckMpcAccountStep::acknowledge(&params.peers, faults.clone())),
        Box::new(AckMpcAccountStep::commit(&params.peers, faults.clone())),
    ]
}

fn sign_steps(params: &PipelineParams, faults: &Arc<FaultCounters>) -> Vec<Box<dyn Step>> {
    let degree = params.degree;
    let slots = 0..params.slots;
    vec![
        Box::new(MpcStep::new(
            "jr_jz",
            params.peers.clone(),
            faults.clone(),
            slots
                .clone()
                .map(|slot| SignShareGenerator::new(slot, degree))
                .collect(),
        )),
        Box::new(MpcStep::new(
            "a_point",
            params.peers.clone(),
            faults.clone(),
            slots
                .clone()
                .map(|slot| {
                    PointGenerator::<keys::SignAPointShare, keys::SignAPoint>::new(
                        slot,
                        CombineMode::Sum,
                    )
                })
                .collect(),
        )),
        Box::new(MpcStep::new(
            "ar",
            params.peers.clone(),
            faults.clone(),
            slots
                .map(|slot| {
                    LagrangeGenerator::<keys::SignARSeed, keys::SignARResult>::new(
                        slot,
                        2 * degree,
                    )
                })
                .collect(),
        )),
        Box::new(CalSignStep::new(
            params.peers.clone(),
            degree,
            params.slots,
            faults.clone(),
        )),
        Box::new(AckMpcRsStep::new(&params.peers, params.slots, faults.clone())),
    ]
}
