// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Joint random (JRSS) and joint zero (JZSS) secret sharing.
//!
//! Every peer samples a polynomial and sends its evaluation at each peer's
//! seed. A peer's share of the joint value is the sum of the evaluations it
//! received. For JZSS the constant terms are zero, so the joint value is
//! zero and the shares act as a blinding mask.

use super::{Contribution, Generator};
use crate::{
    errors::{InternalError, Result},
    math::{self, Polynomial},
    protocol::PeerSet,
    result_store::{keys, ResultStore, SHARED_SLOT},
};
use k256::{elliptic_curve::Field, ProjectivePoint, Scalar};
use num_bigint::BigUint;
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sharing {
    Random,
    Zero,
}

/// One JRSS or JZSS instance.
#[derive(Debug)]
pub(crate) struct PolynomialShare {
    degree: usize,
    sharing: Sharing,
    polynomial: Option<Polynomial>,
    received: BTreeMap<u64, Scalar>,
}

impl PolynomialShare {
    pub(crate) fn new(degree: usize, sharing: Sharing) -> Self {
        Self {
            degree,
            sharing,
            polynomial: None,
            received: BTreeMap::new(),
        }
    }

    fn initialize(&mut self) {
        let mut rng = OsRng;
        let constant = match self.sharing {
            Sharing::Random => Scalar::random(&mut rng),
            Sharing::Zero => Scalar::ZERO,
        };
        self.polynomial = Some(Polynomial::random(&mut rng, self.degree, constant));
    }

    fn polynomial(&self) -> Result<&Polynomial> {
        self.polynomial.as_ref().ok_or_else(|| {
            error!("Polynomial share used before initialization");
            InternalError::InternalInvariantFailed
        })
    }

    /// This node's evaluation for every peer, in peer set order.
    fn evaluations(&self, peers: &PeerSet) -> Result<Vec<BigUint>> {
        let polynomial = self.polynomial()?;
        Ok(peers
            .iter()
            .map(|peer| math::scalar_to_biguint(&polynomial.evaluate(&math::seed_scalar(peer.seed))))
            .collect())
    }

    /// The constant term of this node's own polynomial.
    fn own_constant(&self) -> Result<Scalar> {
        Ok(*self.polynomial()?.constant())
    }

    fn ingest(&mut self, seed: u64, value: Scalar) {
        let _ = self.received.insert(seed, value);
    }

    fn share(&self) -> Scalar {
        self.received.values().fold(Scalar::ZERO, |acc, v| acc + v)
    }
}

/// Generates this node's share of the group private key.
pub(crate) struct KeyShareGenerator {
    share: PolynomialShare,
}

impl KeyShareGenerator {
    pub(crate) fn new(degree: usize) -> Self {
        Self {
            share: PolynomialShare::new(degree, Sharing::Random),
        }
    }
}

impl Generator for KeyShareGenerator {
    type Input = Scalar;

    fn width(&self) -> usize {
        1
    }

    fn initialize(&mut self, _peers: &PeerSet, _store: &ResultStore) -> Result<()> {
        self.share.initialize();
        Ok(())
    }

    fn contribution(&self, peers: &PeerSet) -> Result<Contribution> {
        Ok(Contribution::PerPeer(
            self.share
                .evaluations(peers)?
                .into_iter()
                .map(|v| vec![v])
                .collect(),
        ))
    }

    fn decode(&self, values: &[BigUint]) -> Result<Scalar> {
        math::biguint_to_scalar(&values[0])
    }

    fn ingest(&mut self, seed: u64, input: Scalar) {
        self.share.ingest(seed, input);
    }

    fn calculate_result(&mut self, store: &mut ResultStore) -> Result<()> {
        let share = self.share.share();
        store.store::<keys::PrivateShare>(SHARED_SLOT, share)?;
        store.store::<keys::PublicShare>(SHARED_SLOT, ProjectivePoint::GENERATOR * share)
    }
}

/// Generates the four sharings one signature slot needs: `a` and `r` of
/// degree `d`, and the zero masks `b` and `c` of degree `2d`.
pub(crate) struct SignShareGenerator {
    slot: usize,
    a: PolynomialShare,
    r: PolynomialShare,
    b: PolynomialShare,
    c: PolynomialShare,
}

impl SignShareGenerator {
    pub(crate) fn new(slot: usize, degree: usize) -> Self {
        Self {
            slot,
            a: PolynomialShare::new(degree, Sharing::Random),
            r: PolynomialShare::new(degree, Sharing::Random),
            b: PolynomialShare::new(2 * degree, Sharing::Zero),
            c: PolynomialShare::new(2 * degree, Sharing::Zero),
        }
    }

    fn sharings(&mut self) -> [&mut PolynomialShare; 4] {
        [&mut self.a, &mut self.r, &mut self.b, &mut self.c]
    }
}

impl Generator for SignShareGenerator {
    type Input = [Scalar; 4];

    fn width(&self) -> usize {
        4
    }

    fn initialize(&mut self, _peers: &PeerSet, _store: &ResultStore) -> Result<()> {
        for sharing in self.sharings() {
            sharing.initialize();
        }
        Ok(())
    }

    fn contribution(&self, peers: &PeerSet) -> Result<Contribution> {
        let a = self.a.evaluations(peers)?;
        let r = self.r.evaluations(peers)?;
        let b = self.b.evaluations(peers)?;
        let c = self.c.evaluations(peers)?;
        Ok(Contribution::PerPeer(
            a.into_iter()
                .zip(r)
                .zip(b)
                .zip(c)
                .map(|(((a, r), b), c)| vec![a, r, b, c])
                .collect(),
        ))
    }

    fn decode(&self, values: &[BigUint]) -> Result<[Scalar; 4]> {
        Ok([
            math::biguint_to_scalar(&values[0])?,
            math::biguint_to_scalar(&values[1])?,
            math::biguint_to_scalar(&values[2])?,
            math::biguint_to_scalar(&values[3])?,
        ])
    }

    fn ingest(&mut self, seed: u64, input: [Scalar; 4]) {
        for (sharing, value) in self.sharings().into_iter().zip(input) {
            sharing.ingest(seed, value);
        }
    }

    fn calculate_result(&mut self, store: &mut ResultStore) -> Result<()> {
        let slot = self.slot;
        let (a, r, b, c) = (self.a.share(), self.r.share(), self.b.share(), self.c.share());
        store.store::<keys::SignA>(slot, a)?;
        store.store::<keys::SignR>(slot, r)?;
        store.store::<keys::SignB>(slot, b)?;
        store.store::<keys::SignC>(slot, c)?;
        store.store::<keys::SignAPointShare>(
            slot,
            ProjectivePoint::GENERATOR * self.a.own_constant()?,
        )?;
        store.store::<keys::SignARSeed>(slot, a * r + b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PeerId, PeerInfo};

    fn peer_set(seeds: &[u64]) -> PeerSet {
        let mut rng = OsRng;
        PeerSet::new(
            seeds
                .iter()
                .map(|seed| PeerInfo {
                    peer_id: PeerId::random(&mut rng),
                    seed: *seed,
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn key_shares_interpolate_to_the_sum_of_constants() -> Result<()> {
        let peers = peer_set(&[11, 22, 33]);
        let degree = 1;
        let mut generators: Vec<KeyShareGenerator> =
            (0..3).map(|_| KeyShareGenerator::new(degree)).collect();
        let store = ResultStore::default();
        for g in generators.iter_mut() {
            g.initialize(&peers, &store)?;
        }

        // Deliver every generator's evaluation to its addressee.
        let contributions: Vec<Vec<Vec<BigUint>>> = generators
            .iter()
            .map(|g| match g.contribution(&peers) {
                Ok(Contribution::PerPeer(values)) => values,
                _ => panic!("expected per-peer values"),
            })
            .collect();
        let secret = generators
            .iter()
            .fold(Scalar::ZERO, |acc, g| acc + g.share.own_constant().unwrap());
        let seeds: Vec<u64> = peers.iter().map(|p| p.seed).collect();
        let mut shares = vec![];
        for (receiver, generator) in generators.iter_mut().enumerate() {
            for (sender, values) in contributions.iter().enumerate() {
                let input = generator.decode(&values[receiver])?;
                generator.ingest(seeds[sender], input);
            }
            let mut store = ResultStore::default();
            generator.calculate_result(&mut store)?;
            shares.push((seeds[receiver], *store.retrieve::<keys::PrivateShare>(SHARED_SLOT)?));
            assert_eq!(
                store.retrieve::<keys::PublicShare>(SHARED_SLOT)?,
                &(ProjectivePoint::GENERATOR * shares[receiver].1)
            );
        }

        assert_eq!(math::interpolate_scalar(&shares[..2])?, secret);
        assert_eq!(math::interpolate_scalar(&shares[1..])?, secret);
        Ok(())
    }

    #[test]
    fn zero_sharing_has_zero_constant() {
        let mut share = PolynomialShare::new(2, Sharing::Zero);
        share.initialize();
        assert_eq!(share.own_constant().unwrap(), Scalar::ZERO);
    }
}
