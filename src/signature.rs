// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The `(R, S, V)` Schnorr signature produced by a signing run.

use crate::{
    errors::{InternalError, Result},
    math,
    protocol::Address,
};
use k256::{
    elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint},
    AffinePoint, EncodedPoint, ProjectivePoint, Scalar,
};
use serde::{Deserialize, Serialize};

/// A Schnorr signature `(r, s, v)`.
///
/// `r` is the x-coordinate of the nonce point reduced modulo the group order
/// and `v` carries what is lost by that reduction: bit 0 is the parity of
/// the nonce point's y-coordinate and bit 1 is set when the x-coordinate
/// overflowed the group order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchnorrSignature {
    r: Scalar,
    s: Scalar,
    v: u8,
}

impl SchnorrSignature {
    /// Derives `r` and `v` from the nonce point and pairs them with `s`.
    pub(crate) fn from_nonce(nonce_point: &ProjectivePoint, s: Scalar) -> Result<Self> {
        let (x, _) = math::point_to_coordinates(nonce_point)?;
        let encoded = nonce_point.to_affine().to_encoded_point(true);
        let odd = encoded.as_bytes()[0] == 0x03;
        let order = math::curve_order();
        let (r, overflow) = if x >= order {
            (x - &order, true)
        } else {
            (x, false)
        };
        Ok(Self {
            r: math::biguint_to_scalar(&r)?,
            s,
            v: (if overflow { 2 } else { 0 }) | u8::from(odd),
        })
    }

    /// The x-coordinate of the nonce point, reduced.
    pub fn r(&self) -> &Scalar {
        &self.r
    }

    #[allow(missing_docs)]
    pub fn s(&self) -> &Scalar {
        &self.s
    }

    #[allow(missing_docs)]
    pub fn v(&self) -> u8 {
        self.v
    }

    /// The 65-byte `r || s || v` encoding.
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut bytes = [0u8; 65];
        bytes[..32].copy_from_slice(&self.r.to_bytes());
        bytes[32..64].copy_from_slice(&self.s.to_bytes());
        bytes[64] = self.v;
        bytes
    }

    /// Rebuilds the nonce point from `r` and `v`.
    pub fn nonce_point(&self) -> Result<ProjectivePoint> {
        let mut x = math::scalar_to_biguint(&self.r);
        if self.v & 2 != 0 {
            x += math::curve_order();
        }
        let x_bytes = x.to_bytes_be();
        if x_bytes.len() > 32 {
            return Err(InternalError::InvalidArgument(
                "nonce x-coordinate is too large".into(),
            ));
        }
        let mut compressed = [0u8; 33];
        compressed[0] = 0x02 | (self.v & 1);
        compressed[33 - x_bytes.len()..].copy_from_slice(&x_bytes);
        let encoded = EncodedPoint::from_bytes(compressed)
            .map_err(|_| InternalError::InvalidArgument("malformed nonce point".into()))?;
        Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
            .map(ProjectivePoint::from)
            .ok_or_else(|| InternalError::InvalidArgument("nonce point is not on the curve".into()))
    }

    /// Recovers the public key this signature verifies under:
    /// `Y = e⁻¹ · (s·G − R)`.
    pub fn recover_public_key(&self, message: &[u8; 32]) -> Result<ProjectivePoint> {
        let nonce = self.nonce_point()?;
        let e = math::challenge(message, &nonce);
        let e_inv =
            Option::<Scalar>::from(e.invert()).ok_or(InternalError::CouldNotInvertScalar)?;
        Ok((ProjectivePoint::GENERATOR * self.s - nonce) * e_inv)
    }

    /// Recovers the address of the account that produced this signature.
    pub fn recover_address(&self, message: &[u8; 32]) -> Result<Address> {
        Ok(Address::from_public_key(&self.recover_public_key(message)?))
    }

    /// Checks `s·G == R + H(M || R)·Y`.
    pub fn verify(&self, public_key: &ProjectivePoint, message: &[u8; 32]) -> bool {
        let nonce = match self.nonce_point() {
            Ok(nonce) => nonce,
            Err(_) => return false,
        };
        let e = math::challenge(message, &nonce);
        ProjectivePoint::GENERATOR * self.s == nonce + public_key * &e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::random_nonzero_scalar;
    use rand::rngs::OsRng;

    /// Signs with a single key, as a reference for the threshold output.
    fn sign(secret: &Scalar, message: &[u8; 32]) -> Result<SchnorrSignature> {
        let k = random_nonzero_scalar(&mut OsRng);
        let nonce = ProjectivePoint::GENERATOR * k;
        let e = math::challenge(message, &nonce);
        SchnorrSignature::from_nonce(&nonce, k + e * secret)
    }

    #[test]
    fn signature_verifies_and_recovers_signer() -> Result<()> {
        let secret = random_nonzero_scalar(&mut OsRng);
        let public_key = ProjectivePoint::GENERATOR * secret;
        let message = [7u8; 32];
        let signature = sign(&secret, &message)?;

        assert!(signature.verify(&public_key, &message));
        assert!(!signature.verify(&public_key, &[8u8; 32]));
        assert_eq!(signature.recover_public_key(&message)?, public_key);
        assert_eq!(
            signature.recover_address(&message)?,
            Address::from_public_key(&public_key)
        );
        assert_eq!(signature.to_bytes()[64], signature.v());
        Ok(())
    }

    #[test]
    fn tampered_recovery_byte_fails_verification() -> Result<()> {
        let secret = random_nonzero_scalar(&mut OsRng);
        let public_key = ProjectivePoint::GENERATOR * secret;
        let message = [1u8; 32];
        let mut signature = sign(&secret, &message)?;
        signature.v ^= 1;
        assert!(!signature.verify(&public_key, &message));
        Ok(())
    }
}
