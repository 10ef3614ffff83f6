// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! A list of error types which are produced during an execution of the protocol
use core::fmt::Debug;
use thiserror::Error;

/// The default Result type used in this crate
pub type Result<T> = std::result::Result<T, InternalError>;

/// Represents an error raised while driving an MPC context
#[derive(Clone, Eq, PartialEq, Error, Debug)]
#[allow(missing_docs)]
pub enum InternalError {
    #[error("Serialization Error")]
    Serialization,
    #[error("The context was asked to quit")]
    Quit,
    #[error("A step did not reach quorum before its deadline")]
    TimeOut,
    #[error("The context was aborted: `{0}`")]
    Aborted(String),
    #[error("A context with this identifier is already live")]
    ContextExists,
    #[error("Peer seed is outside the allowed range")]
    SeedOutOfRange,
    #[error("Peer seed was assigned more than once")]
    SeedDuplicate,
    #[error("Peer seeds do not match the stored account")]
    SeedMismatch,
    #[error("Peers reported an inconsistent account address")]
    InvalidMpcAddr,
    #[error("Peers reported inconsistent signature nonces")]
    InvalidMpcR,
    #[error("Peers reported inconsistent signature scalars")]
    InvalidMpcS,
    #[error("Recovered signer does not match the account address")]
    FailSignRetVerify,
    #[error("Combined curve point is the identity")]
    PointZero,
    #[error("Unknown context type")]
    UnknownContextType,
    #[error("Not enough reachable storemen to run the protocol")]
    TooFewStoremen,
    #[error("Transaction verification failed")]
    FailedTxVerify,
    #[error("Proposed peer subset has the wrong size for the protocol")]
    InvalidSubsetSize,
    #[error("Peer subset encoding is malformed")]
    InvalidPeerEncoding,
    #[error("Represents some code assumption that was checked at runtime but failed to be true")]
    InternalInvariantFailed,
    #[error("Storage does not contain the requested item")]
    StorageItemNotFound,
    #[error("Storage already contains the item")]
    StorageItemExists,
    #[error("Failed to convert BigUint to k256::Scalar, as BigUint was not in [0,p)")]
    CouldNotConvertToScalar,
    #[error("Could not invert a Scalar")]
    CouldNotInvertScalar,
    #[error("No account record for this address")]
    UnknownAccount,
    #[error("Keystore error: `{0}`")]
    Keystore(String),
    #[error("Transport error: `{0}`")]
    Transport(String),
    #[error("Encountered a message which was not expected in this context")]
    MisroutedMessage,
    #[error("Function call contained invalid arguments: `{0}`")]
    InvalidArgument(String),
}

impl InternalError {
    /// Builds the error a peer reported through an `MPCError` message.
    ///
    /// A peer's timeout is the run's timeout: every context of a run
    /// shares the same step window, so it is reported as [`Self::TimeOut`]
    /// whichever peer saw the deadline pass first.
    pub(crate) fn remote(reason: &[u8]) -> Self {
        let reason = String::from_utf8_lossy(reason);
        if reason == InternalError::TimeOut.to_string() {
            return InternalError::TimeOut;
        }
        InternalError::Aborted(reason.into_owned())
    }
}

macro_rules! serialize {
    ($x:expr) => {{
        bincode::serialize($x).or(Err(crate::errors::InternalError::Serialization))
    }};
}

macro_rules! deserialize {
    ($x:expr) => {{
        bincode::deserialize($x).or(Err(crate::errors::InternalError::Serialization))
    }};
}

macro_rules! arg_err {
    ($x:expr) => {{
        Err(crate::errors::InternalError::InvalidArgument(String::from(
            $x,
        )))
    }};
}
