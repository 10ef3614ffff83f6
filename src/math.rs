// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Polynomial sharing and Lagrange interpolation over the secp256k1 scalar
//! field, plus conversions between curve values and their wire form.

use crate::errors::{InternalError, Result};
use k256::{
    elliptic_curve::{
        group::Group,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
        Field, PrimeField,
    },
    AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar, U256,
};
use num_bigint::BigUint;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use tracing::error;

/// Order of the secp256k1 group, big-endian.
const CURVE_ORDER: [u8; 32] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE,
    0xBA, 0xAE, 0xDC, 0xE6, 0xAF, 0x48, 0xA0, 0x3B, 0xBF, 0xD2, 0x5E, 0x8C, 0xD0, 0x36, 0x41, 0x41,
];

pub(crate) fn curve_order() -> BigUint {
    BigUint::from_bytes_be(&CURVE_ORDER)
}

/// Samples a uniformly random non-zero scalar.
pub(crate) fn random_nonzero_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    loop {
        let s = Scalar::random(&mut *rng);
        if !bool::from(s.is_zero()) {
            return s;
        }
    }
}

/// A polynomial with coefficients in the scalar field, lowest degree first.
#[derive(Debug, Clone)]
pub(crate) struct Polynomial {
    coefficients: Vec<Scalar>,
}

impl Polynomial {
    /// Samples a polynomial of the given degree with a fixed constant term.
    /// The remaining coefficients are never zero, so the polynomial always
    /// has full degree.
    pub(crate) fn random<R: RngCore + CryptoRng>(
        rng: &mut R,
        degree: usize,
        constant: Scalar,
    ) -> Self {
        let mut coefficients = Vec::with_capacity(degree + 1);
        coefficients.push(constant);
        for _ in 0..degree {
            coefficients.push(random_nonzero_scalar(rng));
        }
        Self { coefficients }
    }

    pub(crate) fn constant(&self) -> &Scalar {
        &self.coefficients[0]
    }

    /// Evaluates the polynomial at `x` with Horner's rule.
    pub(crate) fn evaluate(&self, x: &Scalar) -> Scalar {
        self.coefficients
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, coefficient| acc * x + coefficient)
    }
}

pub(crate) fn seed_scalar(seed: u64) -> Scalar {
    Scalar::from(seed)
}

/// Lagrange basis coefficients at `x = 0` for the points `seeds`.
///
/// `b_i = prod_{j != i} x_j / (x_j - x_i)`
pub(crate) fn lagrange_coefficients(seeds: &[u64]) -> Result<Vec<Scalar>> {
    let xs: Vec<Scalar> = seeds.iter().map(|s| seed_scalar(*s)).collect();
    let mut coefficients = Vec::with_capacity(xs.len());
    for (i, xi) in xs.iter().enumerate() {
        let mut numerator = Scalar::ONE;
        let mut denominator = Scalar::ONE;
        for (j, xj) in xs.iter().enumerate() {
            if i == j {
                continue;
            }
            numerator *= xj;
            denominator *= *xj - xi;
        }
        let inverse = Option::<Scalar>::from(denominator.invert()).ok_or_else(|| {
            error!("Lagrange interpolation over repeated seeds: {:?}", seeds);
            InternalError::CouldNotInvertScalar
        })?;
        coefficients.push(numerator * inverse);
    }
    Ok(coefficients)
}

/// Interpolates the shared scalar at zero from `(seed, share)` pairs.
pub(crate) fn interpolate_scalar(points: &[(u64, Scalar)]) -> Result<Scalar> {
    let seeds: Vec<u64> = points.iter().map(|(seed, _)| *seed).collect();
    let coefficients = lagrange_coefficients(&seeds)?;
    Ok(points
        .iter()
        .zip(coefficients)
        .fold(Scalar::ZERO, |acc, ((_, share), b)| acc + share * &b))
}

/// Interpolates in the exponent: the same as [`interpolate_scalar`] applied
/// to the discrete logs of the points.
pub(crate) fn interpolate_point(points: &[(u64, ProjectivePoint)]) -> Result<ProjectivePoint> {
    let seeds: Vec<u64> = points.iter().map(|(seed, _)| *seed).collect();
    let coefficients = lagrange_coefficients(&seeds)?;
    Ok(points
        .iter()
        .zip(coefficients)
        .fold(ProjectivePoint::IDENTITY, |acc, ((_, point), b)| {
            acc + point * &b
        }))
}

///////////////////////
// Wire conversions //
///////////////////////

fn field_bytes(value: &BigUint) -> Result<FieldBytes> {
    let bytes = value.to_bytes_be();
    if bytes.len() > 32 {
        return Err(InternalError::CouldNotConvertToScalar);
    }
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(FieldBytes::clone_from_slice(&padded))
}

pub(crate) fn scalar_to_biguint(scalar: &Scalar) -> BigUint {
    BigUint::from_bytes_be(&scalar.to_bytes())
}

/// Converts a wire value to a scalar, rejecting anything not in `[0, n)`.
pub(crate) fn biguint_to_scalar(value: &BigUint) -> Result<Scalar> {
    Option::from(Scalar::from_repr(field_bytes(value)?)).ok_or(InternalError::CouldNotConvertToScalar)
}

/// Reduces arbitrary 32 bytes modulo the group order.
pub(crate) fn reduce_bytes(bytes: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::clone_from_slice(bytes))
}

/// Affine coordinates of a point. The identity has none.
pub(crate) fn point_to_coordinates(point: &ProjectivePoint) -> Result<(BigUint, BigUint)> {
    if bool::from(point.is_identity()) {
        return Err(InternalError::PointZero);
    }
    let encoded = point.to_affine().to_encoded_point(false);
    match (encoded.x(), encoded.y()) {
        (Some(x), Some(y)) => Ok((BigUint::from_bytes_be(x), BigUint::from_bytes_be(y))),
        _ => Err(InternalError::PointZero),
    }
}

/// Rebuilds a point from affine coordinates, rejecting points not on the
/// curve.
pub(crate) fn coordinates_to_point(x: &BigUint, y: &BigUint) -> Result<ProjectivePoint> {
    let encoded = EncodedPoint::from_affine_coordinates(&field_bytes(x)?, &field_bytes(y)?, false);
    Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .map(ProjectivePoint::from)
        .ok_or_else(|| InternalError::InvalidArgument("point is not on the curve".into()))
}

/// The Schnorr challenge `e = H(M || R) mod n` with `R` uncompressed.
pub(crate) fn challenge(message: &[u8; 32], nonce_point: &ProjectivePoint) -> Scalar {
    let encoded = nonce_point.to_affine().to_encoded_point(false);
    let digest = Sha256::new()
        .chain_update(message)
        .chain_update(encoded.as_bytes())
        .finalize();
    reduce_bytes(&digest.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::OsRng, seq::SliceRandom};

    const SEEDS: [u64; 7] = [3, 17, 256, 9_001, 65_537, 1_000_003, 0xFF_FFFE];

    /// Every node contributes a polynomial, each node sums the evaluations
    /// at its seed.
    fn joint_shares(
        rng: &mut OsRng,
        degree: usize,
        contributors: usize,
        zero: bool,
    ) -> (Scalar, Vec<(u64, Scalar)>) {
        let polys: Vec<Polynomial> = (0..contributors)
            .map(|_| {
                let constant = if zero {
                    Scalar::ZERO
                } else {
                    Scalar::random(&mut *rng)
                };
                Polynomial::random(rng, degree, constant)
            })
            .collect();
        let secret = polys.iter().fold(Scalar::ZERO, |acc, p| acc + p.constant());
        let shares = SEEDS
            .iter()
            .map(|seed| {
                let x = seed_scalar(*seed);
                let share = polys
                    .iter()
                    .fold(Scalar::ZERO, |acc, p| acc + p.evaluate(&x));
                (*seed, share)
            })
            .collect();
        (secret, shares)
    }

    #[test]
    fn any_threshold_subset_recovers_the_joint_secret() -> Result<()> {
        let mut rng = OsRng;
        for degree in 1..=3 {
            let (secret, shares) = joint_shares(&mut rng, degree, SEEDS.len(), false);
            for _ in 0..10 {
                let subset: Vec<_> = shares
                    .choose_multiple(&mut rng, degree + 1)
                    .cloned()
                    .collect();
                assert_eq!(interpolate_scalar(&subset)?, secret);
            }
        }
        Ok(())
    }

    #[test]
    fn masked_product_needs_double_degree_points() -> Result<()> {
        let mut rng = OsRng;
        let degree = 2;
        let (a, a_shares) = joint_shares(&mut rng, degree, SEEDS.len(), false);
        let (r, r_shares) = joint_shares(&mut rng, degree, SEEDS.len(), false);
        let (zero, b_shares) = joint_shares(&mut rng, 2 * degree, SEEDS.len(), true);
        assert_eq!(zero, Scalar::ZERO);

        let ar: Vec<(u64, Scalar)> = a_shares
            .iter()
            .zip(&r_shares)
            .zip(&b_shares)
            .map(|(((seed, a_i), (_, r_i)), (_, b_i))| (*seed, *a_i * r_i + b_i))
            .collect();

        for _ in 0..10 {
            let subset: Vec<_> = ar
                .choose_multiple(&mut rng, 2 * degree + 1)
                .cloned()
                .collect();
            assert_eq!(interpolate_scalar(&subset)?, a * r);

            let short: Vec<_> = ar.choose_multiple(&mut rng, 2 * degree).cloned().collect();
            assert_ne!(interpolate_scalar(&short)?, a * r);
        }
        Ok(())
    }

    #[test]
    fn point_interpolation_matches_scalar_interpolation() -> Result<()> {
        let mut rng = OsRng;
        let (_, shares) = joint_shares(&mut rng, 2, 4, false);
        let points: Vec<_> = shares
            .iter()
            .map(|(seed, s)| (*seed, ProjectivePoint::GENERATOR * s))
            .collect();
        assert_eq!(
            interpolate_point(&points[..3])?,
            ProjectivePoint::GENERATOR * interpolate_scalar(&shares[..3])?
        );
        Ok(())
    }

    #[test]
    fn repeated_seeds_cannot_be_interpolated() {
        let points = [(5, Scalar::ONE), (5, Scalar::ONE)];
        assert_eq!(
            interpolate_scalar(&points),
            Err(InternalError::CouldNotInvertScalar)
        );
    }

    #[test]
    fn wire_conversions_reject_out_of_range_values() -> Result<()> {
        let mut rng = OsRng;
        let s = random_nonzero_scalar(&mut rng);
        assert_eq!(biguint_to_scalar(&scalar_to_biguint(&s))?, s);
        assert!(biguint_to_scalar(&curve_order()).is_err());

        let point = ProjectivePoint::GENERATOR * s;
        let (x, y) = point_to_coordinates(&point)?;
        assert_eq!(coordinates_to_point(&x, &y)?, point);
        assert!(coordinates_to_point(&x, &(y + 1u32)).is_err());
        assert_eq!(
            point_to_coordinates(&ProjectivePoint::IDENTITY),
            Err(InternalError::PointZero)
        );
        Ok(())
    }
}
