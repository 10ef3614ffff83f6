// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use super::{Contribution, Generator};
use crate::{
    errors::{InternalError, Result},
    math,
    protocol::PeerSet,
    result_store::{ResultStore, TypeTag},
};
use k256::{elliptic_curve::group::Group, ProjectivePoint};
use num_bigint::BigUint;
use std::{collections::BTreeMap, marker::PhantomData};
use tracing::error;

/// How the published points are reduced to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CombineMode {
    /// Adds every point. Used when each peer publishes `a0_i · G` for the
    /// constant term of its own polynomial.
    Sum,
    /// Interpolates the first `degree + 1` points in seed order. Used when
    /// each peer publishes `share_i · G` for its share of a sharing.
    Lagrange { degree: usize },
}

/// Combines the curve points every peer publishes. Reads this node's point
/// from `I` and writes the combination to `O`.
pub(crate) struct PointGenerator<I, O> {
    slot: usize,
    mode: CombineMode,
    own: Option<ProjectivePoint>,
    received: BTreeMap<u64, ProjectivePoint>,
    _tags: PhantomData<fn() -> (I, O)>,
}

impl<I, O> PointGenerator<I, O>
where
    I: TypeTag<Value = ProjectivePoint>,
    O: TypeTag<Value = ProjectivePoint>,
{
    pub(crate) fn new(slot: usize, mode: CombineMode) -> Self {
        Self {
            slot,
            mode,
            own: None,
            received: BTreeMap::new(),
            _tags: PhantomData,
        }
    }

    fn combine(&self) -> Result<ProjectivePoint> {
        match self.mode {
            CombineMode::Sum => Ok(self
                .received
                .values()
                .fold(ProjectivePoint::IDENTITY, |acc, p| acc + p)),
            CombineMode::Lagrange { degree } => {
                if self.received.len() < degree + 1 {
                    error!(
                        "Need {} points to interpolate, have {}",
                        degree + 1,
                        self.received.len()
                    );
                    return Err(InternalError::InternalInvariantFailed);
                }
                let points: Vec<(u64, ProjectivePoint)> = self
                    .received
                    .iter()
                    .take(degree + 1)
                    .map(|(seed, point)| (*seed, *point))
                    .collect();
                math::interpolate_point(&points)
            }
        }
    }
}

impl<I, O> Generator for PointGenerator<I, O>
where
    I: TypeTag<Value = ProjectivePoint>,
    O: TypeTag<Value = ProjectivePoint>,
{
    type Input = ProjectivePoint;

    fn width(&self) -> usize {
        2
    }

    fn initialize(&mut self, _peers: &PeerSet, store: &ResultStore) -> Result<()> {
        self.own = Some(*store.retrieve::<I>(self.slot)?);
        Ok(())
    }

    fn contribution(&self, _peers: &PeerSet) -> Result<Contribution> {
        let own = self.own.as_ref().ok_or(InternalError::InternalInvariantFailed)?;
        let (x, y) = math::point_to_coordinates(own)?;
        Ok(Contribution::Broadcast(vec![x, y]))
    }

    fn decode(&self, values: &[BigUint]) -> Result<ProjectivePoint> {
        let point = math::coordinates_to_point(&values[0], &values[1])?;
        if bool::from(point.is_identity()) {
            return Err(InternalError::PointZero);
        }
        Ok(point)
    }

    fn ingest(&mut self, seed: u64, input: ProjectivePoint) {
        let _ = self.received.insert(seed, input);
    }

    fn calculate_result(&mut self, store: &mut ResultStore) -> Result<()> {
        let result = self.combine()?;
        if bool::from(result.is_identity()) {
            error!("Combined point of slot {} is the identity", self.slot);
            return Err(InternalError::PointZero);
        }
        store.store::<O>(self.slot, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        math::random_nonzero_scalar,
        result_store::keys::{PublicKeyResult, PublicShare},
    };
    use k256::Scalar;
    use rand::rngs::OsRng;

    #[test]
    fn sum_and_lagrange_modes() -> Result<()> {
        let mut rng = OsRng;
        let scalars: Vec<(u64, Scalar)> = [5u64, 9, 13]
            .iter()
            .map(|seed| (*seed, random_nonzero_scalar(&mut rng)))
            .collect();

        let mut sum = PointGenerator::<PublicShare, PublicKeyResult>::new(0, CombineMode::Sum);
        let mut lagrange = PointGenerator::<PublicShare, PublicKeyResult>::new(
            0,
            CombineMode::Lagrange { degree: 1 },
        );
        for (seed, s) in &scalars {
            let (x, y) = math::point_to_coordinates(&(ProjectivePoint::GENERATOR * s))?;
            sum.ingest(*seed, sum.decode(&[x.clone(), y.clone()])?);
            lagrange.ingest(*seed, lagrange.decode(&[x, y])?);
        }

        let mut store = ResultStore::default();
        sum.calculate_result(&mut store)?;
        let total = scalars.iter().fold(Scalar::ZERO, |acc, (_, s)| acc + s);
        assert_eq!(
            store.retrieve::<PublicKeyResult>(0)?,
            &(ProjectivePoint::GENERATOR * total)
        );

        let mut store = ResultStore::default();
        lagrange.calculate_result(&mut store)?;
        assert_eq!(
            store.retrieve::<PublicKeyResult>(0)?,
            &(ProjectivePoint::GENERATOR * math::interpolate_scalar(&scalars[..2])?)
        );
        Ok(())
    }

    #[test]
    fn cancelling_points_are_rejected() -> Result<()> {
        let s = random_nonzero_scalar(&mut OsRng);
        let mut generator =
            PointGenerator::<PublicShare, PublicKeyResult>::new(0, CombineMode::Sum);
        generator.ingest(1, ProjectivePoint::GENERATOR * s);
        generator.ingest(2, ProjectivePoint::GENERATOR * -s);
        let mut store = ResultStore::default();
        assert_eq!(
            generator.calculate_result(&mut store),
            Err(InternalError::PointZero)
        );
        Ok(())
    }
}
