// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Threshold multi-party computation engine for storeman nodes.
//!
//! A fixed group of mutually-distrusting storemen jointly controls an
//! account: they generate a group public key whose private key never exists
//! in one place, and later produce Schnorr signatures under that key. Any
//! `d + 1` shares determine the key; a signing run involves `2d + 1`
//! storemen.
//!
//! Every run is a context: an ordered pipeline of quorum-gated steps, each
//! of which exchanges one round of secret-shared values with the other
//! peers of the run. Two pipelines are built from the same primitives:
//!
//! - key generation, where every storeman deals a random polynomial and the
//!   group key is interpolated from the public shares;
//! - signing, where a nonce is built from jointly random and zero sharings
//!   and a degree-doubling multiplication is unmasked by interpolating
//!   `2d + 1` points.
//!
//! This library does not handle networking or storage. A node plugs in a
//! [`Transport`], a [`Keystore`] and a [`TxValidator`], hands every message
//! it receives to [`Distributor::handle_message`], and calls
//! [`Distributor::create_gpk`] or [`Distributor::sign`] to lead a run.

#![warn(missing_docs)]

#[macro_use]
pub mod errors;

mod context;
mod distributor;
mod factory;
mod keystore;
mod math;
mod messages;
mod parameters;
mod protocol;
mod result_store;
mod signature;
mod step;
mod transport;
mod validator;

pub use distributor::Distributor;
pub use errors::{InternalError, Result};
pub use keystore::{Keystore, MemoryKeystore};
pub use messages::{MessageCode, MpcMessage, ProtocolMessage};
pub use parameters::{MpcConfig, DEFAULT_STEP_TIMEOUT, MAX_SEED};
pub use protocol::{Address, ContextId, GroupKey, PeerId, PeerInfo, PeerSet, ProtocolType};
pub use signature::SchnorrSignature;
pub use step::{Fault, FaultCounters, FaultSnapshot};
pub use transport::Transport;
pub use validator::{
    ApprovalStore, ApprovalValidator, MemoryApprovalStore, SignRequest, TxValidator,
};
