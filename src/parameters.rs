// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Protocol parameters and run-time configuration.
//!
//! The constants in this module are part of the wire contract between
//! storemen. [`MpcConfig`] holds the values an operator is free to tune, and
//! is deserializable so that it can be embedded in a node's configuration
//! file.

use crate::errors::{InternalError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exclusive ceiling for peer seeds.
///
/// A seed is transmitted in three bytes of the peer subset encoding, so every
/// seed must fit in 24 bits. Zero is never a valid seed since it is the point
/// at which secrets are interpolated.
pub const MAX_SEED: u64 = 0xFF_FFFF;

/// Number of bytes used to encode a single peer of a subset.
pub(crate) const PEER_ENCODING_LEN: usize = 4;

/// Largest roster the one-byte roster index can address.
pub(crate) const MAX_ROSTER_LEN: usize = 255;

/// Default per-step quorum window.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Run-time configuration of a storeman node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MpcConfig {
    /// Polynomial degree `d` of the key sharing. The signing threshold is
    /// `d + 1` and a signing run involves `2d + 1` storemen.
    pub degree: usize,
    /// Milliseconds a single step may wait for its quorum.
    pub step_timeout_ms: u64,
    /// Passphrase handed to the keystore when account records are created
    /// or loaded.
    pub passphrase: String,
}

impl Default for MpcConfig {
    fn default() -> Self {
        Self {
            degree: 1,
            step_timeout_ms: DEFAULT_STEP_TIMEOUT.as_millis() as u64,
            passphrase: String::new(),
        }
    }
}

impl MpcConfig {
    /// The quorum window applied to every step.
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// Number of storemen taking part in a signing run.
    pub fn sign_quorum(&self) -> usize {
        2 * self.degree + 1
    }

    /// Checks that the configuration can drive a roster of `roster_len`
    /// storemen.
    pub fn validate(&self, roster_len: usize) -> Result<()> {
        if self.degree == 0 {
            return arg_err!("degree must be at least 1");
        }
        if roster_len > MAX_ROSTER_LEN {
            return arg_err!("roster is too large for the peer encoding");
        }
        if self.sign_quorum() > roster_len {
            return Err(InternalError::TooFewStoremen);
        }
        if self.step_timeout_ms == 0 {
            return arg_err!("step timeout must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fits_three_storemen() {
        let config = MpcConfig::default();
        assert_eq!(config.step_timeout(), DEFAULT_STEP_TIMEOUT);
        assert!(config.validate(3).is_ok());
        assert_eq!(config.validate(2), Err(InternalError::TooFewStoremen));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: MpcConfig = bincode::deserialize(
            &bincode::serialize(&MpcConfig {
                degree: 2,
                ..Default::default()
            })
            .unwrap(),
        )
        .unwrap();
        assert_eq!(config.degree, 2);
        assert!(config.validate(5).is_ok());
        assert!(config.validate(4).is_err());
    }
}
