// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Steps are the quorum-gated stages a context runs one after another.
//!
//! Every step owns a [`Quorum`] which decides which peer messages count
//! towards completion. [`await_completion`] drains a step's inbox until the
//! quorum is reached, the step's window elapses, or the context is told to
//! quit. Stages that exchange secret shares are built from [`MpcStep`] and a
//! set of [`Generator`]s.

mod account;
mod ack_rs;
mod generator;
mod handshake;
mod lagrange;
mod point;
mod share;
mod sign;

pub(crate) use account::AckMpcAccountStep;
pub(crate) use ack_rs::AckMpcRsStep;
pub(crate) use generator::{Contribution, Generator, MpcStep};
pub(crate) use handshake::{
    decode_sign_request, requested_protocol, AcknowledgeMpcStep, GetMpcReadyStep, MpcReadyStep,
    RequestMpcStep,
};
pub(crate) use lagrange::LagrangeGenerator;
pub(crate) use point::{CombineMode, PointGenerator};
pub(crate) use share::{KeyShareGenerator, SignShareGenerator};
pub(crate) use sign::CalSignStep;

use crate::{
    errors::{InternalError, Result},
    messages::MessageCode,
    protocol::{PeerId, PeerSet},
    result_store::ResultStore,
};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc::UnboundedReceiver, time::Instant};
use tracing::{trace, warn};

/// A peer's payload for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StepMessage {
    pub(crate) from: PeerId,
    pub(crate) data: Vec<BigUint>,
    pub(crate) bytes_data: Vec<Vec<u8>>,
}

/// What travels through a step's inbox.
#[derive(Debug)]
pub(crate) enum StepSignal {
    Data(StepMessage),
    Cancel,
}

/// Who an outgoing message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recipient {
    /// Every peer of the context, this node included
    All,
    /// Every peer of the context but this node
    Others,
    /// A single peer
    Peer(PeerId),
}

/// A message a step wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Outgoing {
    pub(crate) code: MessageCode,
    pub(crate) to: Recipient,
    pub(crate) data: Vec<BigUint>,
    pub(crate) bytes_data: Vec<Vec<u8>>,
}

impl Outgoing {
    pub(crate) fn mpc(to: Recipient, data: Vec<BigUint>) -> Self {
        Self {
            code: MessageCode::MpcMessage,
            to,
            data,
            bytes_data: Vec::new(),
        }
    }
}

/// One stage of a context's pipeline.
pub(crate) trait Step: Send {
    fn name(&self) -> &'static str;

    fn quorum(&mut self) -> &mut Quorum;

    /// Computes this node's contribution, reading earlier results.
    fn init(&mut self, _store: &mut ResultStore) -> Result<()> {
        Ok(())
    }

    fn create_messages(&mut self) -> Result<Vec<Outgoing>>;

    /// Ingests a message whose sender the quorum has already vetted. An
    /// error marks the message malformed; it is dropped without counting.
    fn handle_message(&mut self, message: &StepMessage) -> Result<()>;

    /// Runs once the quorum is reached and writes this step's results.
    fn finish(&mut self, _store: &mut ResultStore) -> Result<()> {
        Ok(())
    }
}

//////////////////////
// Fault accounting //
//////////////////////

/// Why a peer message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// The sender does not take part in the step
    UnknownSender,
    /// The sender repeated a message it already contributed
    Retransmission,
    /// The sender contributed twice with different payloads
    Equivocation,
    /// The payload had the wrong shape or out-of-range values
    Malformed,
}

/// Counts of dropped messages per [`Fault`], shared by every context of a
/// node.
#[derive(Debug, Default)]
pub struct FaultCounters {
    unknown_sender: AtomicU64,
    retransmission: AtomicU64,
    equivocation: AtomicU64,
    malformed: AtomicU64,
}

/// A point-in-time copy of [`FaultCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct FaultSnapshot {
    pub unknown_sender: u64,
    pub retransmission: u64,
    pub equivocation: u64,
    pub malformed: u64,
}

impl FaultCounters {
    pub(crate) fn record(&self, fault: Fault) {
        let counter = match fault {
            Fault::UnknownSender => &self.unknown_sender,
            Fault::Retransmission => &self.retransmission,
            Fault::Equivocation => &self.equivocation,
            Fault::Malformed => &self.malformed,
        };
        let _ = counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads the current counts.
    pub fn snapshot(&self) -> FaultSnapshot {
        FaultSnapshot {
            unknown_sender: self.unknown_sender.load(Ordering::Relaxed),
            retransmission: self.retransmission.load(Ordering::Relaxed),
            equivocation: self.equivocation.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

////////////////
// Quorum API //
////////////////

/// The outcome of offering a message to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Counted, more messages are needed
    Accepted,
    /// Counted, and it was the last one needed
    Completed,
    /// Arrived after the quorum was reached
    Ignored,
    /// Dropped without counting
    Rejected(Fault),
}

/// Tracks which peers have contributed to a step.
#[derive(Debug)]
pub(crate) struct Quorum {
    eligible: HashSet<PeerId>,
    required: usize,
    accepted: HashMap<PeerId, [u8; 32]>,
    faults: Arc<FaultCounters>,
}

impl Quorum {
    /// Requires `required` distinct contributions from `eligible` peers.
    pub(crate) fn new(
        eligible: impl IntoIterator<Item = PeerId>,
        required: usize,
        faults: Arc<FaultCounters>,
    ) -> Self {
        Self {
            eligible: eligible.into_iter().collect(),
            required,
            accepted: HashMap::new(),
            faults,
        }
    }

    /// Requires a contribution from every peer of the set.
    pub(crate) fn all(peers: &PeerSet, faults: Arc<FaultCounters>) -> Self {
        Self::new(peers.ids(), peers.len(), faults)
    }

    /// A quorum which is complete from the start.
    pub(crate) fn none(faults: Arc<FaultCounters>) -> Self {
        Self::new(std::iter::empty(), 0, faults)
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.accepted.len() >= self.required
    }

    pub(crate) fn remaining(&self) -> usize {
        self.required.saturating_sub(self.accepted.len())
    }

    pub(crate) fn contributors(&self) -> impl Iterator<Item = &PeerId> {
        self.accepted.keys()
    }

    fn digest(message: &StepMessage) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for value in &message.data {
            let bytes = value.to_bytes_be();
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        }
        for bytes in &message.bytes_data {
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        }
        hasher.finalize().into()
    }

    /// Classifies a message before the step looks at it. Returns the digest
    /// to record if the step should ingest it.
    fn screen(&self, message: &StepMessage) -> std::result::Result<[u8; 32], Admission> {
        if self.is_complete() {
            return Err(Admission::Ignored);
        }
        if !self.eligible.contains(&message.from) {
            return Err(self.reject(message.from, Fault::UnknownSender));
        }
        let digest = Self::digest(message);
        match self.accepted.get(&message.from) {
            Some(previous) if previous == &digest => {
                Err(self.reject(message.from, Fault::Retransmission))
            }
            Some(_) => Err(self.reject(message.from, Fault::Equivocation)),
            None => Ok(digest),
        }
    }

    fn reject(&self, from: PeerId, fault: Fault) -> Admission {
        warn!("Dropped message from {}: {:?}", from, fault);
        self.faults.record(fault);
        Admission::Rejected(fault)
    }

    fn record(&mut self, from: PeerId, digest: [u8; 32]) -> Admission {
        let _ = self.accepted.insert(from, digest);
        if self.is_complete() {
            Admission::Completed
        } else {
            trace!("{} more contributions needed", self.remaining());
            Admission::Accepted
        }
    }
}

/// Offers `message` to `step`, counting it if the step accepts it.
pub(crate) fn admit(step: &mut dyn Step, message: &StepMessage) -> Admission {
    let digest = match step.quorum().screen(message) {
        Ok(digest) => digest,
        Err(admission) => return admission,
    };
    match step.handle_message(message) {
        Ok(()) => step.quorum().record(message.from, digest),
        Err(e) => {
            warn!("{} rejected message from {}: {}", step.name(), message.from, e);
            step.quorum().reject(message.from, Fault::Malformed)
        }
    }
}

/// Waits until `step` reaches its quorum.
///
/// Returns [`InternalError::TimeOut`] once `timeout` elapses and
/// [`InternalError::Quit`] when the inbox delivers a cancellation.
pub(crate) async fn await_completion(
    step: &mut dyn Step,
    inbox: &mut UnboundedReceiver<StepSignal>,
    timeout: Duration,
) -> Result<()> {
    if step.quorum().is_complete() {
        return Ok(());
    }
    let deadline = Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, inbox.recv()).await {
            Err(_) => {
                warn!(
                    "{} timed out waiting for {} more contributions",
                    step.name(),
                    step.quorum().remaining()
                );
                return Err(InternalError::TimeOut);
            }
            Ok(None) | Ok(Some(StepSignal::Cancel)) => return Err(InternalError::Quit),
            Ok(Some(StepSignal::Data(message))) => {
                if admit(step, &message) == Admission::Completed {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use tokio::sync::mpsc;

    /// A step which accepts any message carrying exactly one value.
    pub(crate) struct CountingStep {
        quorum: Quorum,
        pub(crate) seen: Vec<PeerId>,
    }

    impl CountingStep {
        pub(crate) fn new(peers: &[PeerId], required: usize) -> Self {
            Self {
                quorum: Quorum::new(
                    peers.iter().copied(),
                    required,
                    Arc::new(FaultCounters::default()),
                ),
                seen: Vec::new(),
            }
        }
    }

    impl Step for CountingStep {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn quorum(&mut self) -> &mut Quorum {
            &mut self.quorum
        }

        fn create_messages(&mut self) -> Result<Vec<Outgoing>> {
            Ok(vec![])
        }

        fn handle_message(&mut self, message: &StepMessage) -> Result<()> {
            if message.data.len() != 1 {
                return arg_err!("expected one value");
            }
            self.seen.push(message.from);
            Ok(())
        }
    }

    pub(crate) fn message(from: PeerId, value: u32) -> StepMessage {
        StepMessage {
            from,
            data: vec![BigUint::from(value)],
            bytes_data: vec![],
        }
    }

    fn peers(n: usize) -> Vec<PeerId> {
        (0..n).map(|_| PeerId::random(&mut OsRng)).collect()
    }

    #[test]
    fn quorum_completes_exactly_at_the_kth_distinct_sender() {
        let peers = peers(4);
        let mut step = CountingStep::new(&peers, 3);

        assert_eq!(admit(&mut step, &message(peers[0], 1)), Admission::Accepted);
        assert_eq!(
            admit(&mut step, &message(peers[0], 1)),
            Admission::Rejected(Fault::Retransmission)
        );
        assert_eq!(step.quorum.remaining(), 2);
        assert_eq!(admit(&mut step, &message(peers[1], 1)), Admission::Accepted);
        assert_eq!(admit(&mut step, &message(peers[2], 1)), Admission::Completed);
        assert_eq!(admit(&mut step, &message(peers[3], 1)), Admission::Ignored);
        assert_eq!(step.seen, peers[..3].to_vec());
    }

    #[test]
    fn rejected_messages_are_classified_and_do_not_count() {
        let peers = peers(2);
        let stranger = PeerId::random(&mut OsRng);
        let mut step = CountingStep::new(&peers, 2);
        let faults = step.quorum.faults.clone();

        assert_eq!(
            admit(&mut step, &message(stranger, 1)),
            Admission::Rejected(Fault::UnknownSender)
        );
        let mut malformed = message(peers[0], 1);
        malformed.data.push(BigUint::from(2u32));
        assert_eq!(
            admit(&mut step, &malformed),
            Admission::Rejected(Fault::Malformed)
        );
        assert_eq!(admit(&mut step, &message(peers[0], 1)), Admission::Accepted);
        assert_eq!(
            admit(&mut step, &message(peers[0], 2)),
            Admission::Rejected(Fault::Equivocation)
        );
        assert_eq!(step.quorum.remaining(), 1);
        assert_eq!(
            faults.snapshot(),
            FaultSnapshot {
                unknown_sender: 1,
                retransmission: 0,
                equivocation: 1,
                malformed: 1,
            }
        );
    }

    #[tokio::test]
    async fn await_completion_returns_once_quorum_is_reached() {
        let peers = peers(3);
        let mut step = CountingStep::new(&peers, 2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        for peer in [peers[0], peers[0], peers[1], peers[2]] {
            tx.send(StepSignal::Data(message(peer, 1))).unwrap();
        }
        await_completion(&mut step, &mut rx, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(step.seen, vec![peers[0], peers[1]]);
    }

    #[tokio::test]
    async fn partial_quorum_times_out() {
        let peers = peers(3);
        let mut step = CountingStep::new(&peers, 3);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(StepSignal::Data(message(peers[0], 1))).unwrap();
        tx.send(StepSignal::Data(message(peers[1], 1))).unwrap();
        let result = await_completion(&mut step, &mut rx, Duration::from_millis(100)).await;
        assert_eq!(result, Err(InternalError::TimeOut));
        assert!(!step.quorum.is_complete());
    }

    #[tokio::test]
    async fn cancel_interrupts_the_wait() {
        let peers = peers(2);
        let mut step = CountingStep::new(&peers, 2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let waiter = tokio::spawn(async move {
            await_completion(&mut step, &mut rx, Duration::from_secs(30)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(StepSignal::Cancel).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(InternalError::Quit));
    }

    #[tokio::test]
    async fn empty_quorum_completes_immediately() {
        let mut step = CountingStep::new(&[], 0);
        let (_tx, mut rx) = mpsc::unbounded_channel();
        assert!(await_completion(&mut step, &mut rx, Duration::from_millis(1))
            .await
            .is_ok());
    }
}
