// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! One run of a protocol pipeline.
//!
//! An [`MpcContext`] owns the ordered steps of a run, their inboxes and the
//! [`ResultStore`] they share. Steps run strictly one after another; a step
//! only starts once its predecessor reached quorum and wrote its results.
//! Messages for later steps are queued in their inboxes until then.

use crate::{
    errors::{InternalError, Result},
    messages::{MessageCode, MpcMessage, ProtocolMessage},
    protocol::{ContextId, PeerId, PeerSet, ProtocolType},
    result_store::ResultStore,
    step::{self, Outgoing, Recipient, Step, StepMessage, StepSignal},
};
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, instrument, trace, warn};

/// Where a context hands the messages its steps produce.
pub(crate) trait Outbox: Send + Sync {
    fn self_id(&self) -> PeerId;

    /// Sends to one peer. Messages for this node are looped back locally.
    fn send(&self, to: &PeerId, message: ProtocolMessage) -> Result<()>;

    fn encode_peers(&self, peers: &PeerSet) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
struct QuitCause {
    error: InternalError,
    notify_peers: bool,
}

struct Pipeline {
    steps: Vec<Box<dyn Step>>,
    inboxes: Vec<UnboundedReceiver<StepSignal>>,
    store: ResultStore,
}

pub(crate) struct MpcContext {
    id: ContextId,
    protocol: ProtocolType,
    peers: Arc<PeerSet>,
    timeout: Duration,
    inboxes: Vec<UnboundedSender<StepSignal>>,
    pipeline: Mutex<Option<Pipeline>>,
    quit: Mutex<Option<QuitCause>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MpcContext {
    /// Builds a context over `steps`, with `store` holding the values the
    /// run starts from.
    pub(crate) fn new(
        id: ContextId,
        protocol: ProtocolType,
        peers: Arc<PeerSet>,
        steps: Vec<Box<dyn Step>>,
        store: ResultStore,
        timeout: Duration,
    ) -> Self {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            steps.iter().map(|_| mpsc::unbounded_channel()).unzip();
        Self {
            id,
            protocol,
            peers,
            timeout,
            inboxes: senders,
            pipeline: Mutex::new(Some(Pipeline {
                steps,
                inboxes: receivers,
                store,
            })),
            quit: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    pub(crate) fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    pub(crate) fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    /// Queues a peer's message in the inbox of the step it addresses.
    pub(crate) fn deliver(&self, from: PeerId, message: MpcMessage) -> Result<()> {
        let inbox = usize::try_from(message.step_id)
            .ok()
            .and_then(|index| self.inboxes.get(index))
            .ok_or_else(|| {
                warn!(
                    "{}: message from {} for unknown step {}",
                    self.id, from, message.step_id
                );
                InternalError::MisroutedMessage
            })?;
        let signal = StepSignal::Data(StepMessage {
            from,
            data: message.data,
            bytes_data: message.bytes_data,
        });
        if inbox.send(signal).is_err() {
            trace!("{}: step {} has already ended", self.id, message.step_id);
        }
        Ok(())
    }

    /// Stops every step of the context. Only the first call has an effect;
    /// it returns whether this call was it.
    pub(crate) fn quit(&self, error: InternalError, notify_peers: bool) -> bool {
        let mut cause = lock(&self.quit);
        if cause.is_some() {
            return false;
        }
        debug!("{} quitting: {}", self.id, error);
        *cause = Some(QuitCause {
            error,
            notify_peers,
        });
        for inbox in &self.inboxes {
            let _ = inbox.send(StepSignal::Cancel);
        }
        true
    }

    pub(crate) fn is_quit(&self) -> bool {
        lock(&self.quit).is_some()
    }

    fn quit_cause(&self) -> Option<QuitCause> {
        lock(&self.quit).clone()
    }

    /// Drives the pipeline to completion and hands back the results.
    #[instrument(skip_all, fields(context = %self.id))]
    pub(crate) async fn run(&self, outbox: &dyn Outbox) -> Result<ResultStore> {
        let Pipeline {
            steps,
            inboxes,
            mut store,
        } = lock(&self.pipeline).take().ok_or_else(|| {
            error!("{} was run twice", self.id);
            InternalError::InternalInvariantFailed
        })?;

        info!(
            "Starting {:?} with {} peers",
            self.protocol,
            self.peers.len()
        );
        match self.execute(steps, inboxes, &mut store, outbox).await {
            Ok(()) => {
                let _ = self.quit(InternalError::Quit, false);
                info!("{:?} finished", self.protocol);
                Ok(store)
            }
            Err(e) => {
                let (error, notify_peers) = match (e, self.quit_cause()) {
                    (InternalError::Quit, Some(cause)) => (cause.error, cause.notify_peers),
                    (e, _) => (e, true),
                };
                let _ = self.quit(error.clone(), notify_peers);
                error!("{:?} aborted: {}", self.protocol, error);
                if notify_peers {
                    self.notify_abort(&error, outbox);
                }
                Err(error)
            }
        }
    }

    async fn execute(
        &self,
        steps: Vec<Box<dyn Step>>,
        inboxes: Vec<UnboundedReceiver<StepSignal>>,
        store: &mut ResultStore,
        outbox: &dyn Outbox,
    ) -> Result<()> {
        for (index, (mut step, mut inbox)) in steps.into_iter().zip(inboxes).enumerate() {
            if self.is_quit() {
                return Err(InternalError::Quit);
            }
            trace!("Step {} ({}) starting", index, step.name());
            step.init(store)?;
            for outgoing in step.create_messages()? {
                self.dispatch(index, outgoing, outbox)?;
            }
            step::await_completion(step.as_mut(), &mut inbox, self.timeout).await?;
            step.finish(store)?;
            debug!("Step {} ({}) finished", index, step.name());
        }
        Ok(())
    }

    fn dispatch(&self, step_id: usize, outgoing: Outgoing, outbox: &dyn Outbox) -> Result<()> {
        let mut body = MpcMessage::new(self.id, step_id as u64);
        if outgoing.code == MessageCode::RequestMpc {
            body.peers = outbox.encode_peers(&self.peers)?;
        }
        body.data = outgoing.data;
        body.bytes_data = outgoing.bytes_data;
        let message = match outgoing.code {
            MessageCode::RequestMpc => ProtocolMessage::RequestMpc(body),
            MessageCode::MpcMessage => ProtocolMessage::Mpc(body),
            MessageCode::MpcError => ProtocolMessage::MpcError(body),
        };

        let me = outbox.self_id();
        let recipients: Vec<PeerId> = match outgoing.to {
            Recipient::All => self.peers.ids().collect(),
            Recipient::Others => self.peers.ids().filter(|id| id != &me).collect(),
            Recipient::Peer(id) => vec![id],
        };
        for to in recipients {
            outbox.send(&to, message.clone())?;
        }
        Ok(())
    }

    /// Tells every other peer why this context gave up, so that their
    /// mirrored contexts stop too.
    fn notify_abort(&self, error: &InternalError, outbox: &dyn Outbox) {
        let mut body = MpcMessage::new(self.id, 0);
        body.peers = error.to_string().into_bytes();
        let message = ProtocolMessage::MpcError(body);
        let me = outbox.self_id();
        for to in self.peers.ids().filter(|id| id != &me) {
            if let Err(e) = outbox.send(&to, message.clone()) {
                warn!("Could not notify {} of the abort: {}", to, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{protocol::PeerInfo, step::tests::CountingStep};
    use num_bigint::BigUint;
    use rand::rngs::OsRng;

    #[derive(Default)]
    struct RecordingOutbox {
        me: Option<PeerId>,
        sent: Mutex<Vec<(PeerId, ProtocolMessage)>>,
    }

    impl Outbox for RecordingOutbox {
        fn self_id(&self) -> PeerId {
            self.me.unwrap_or(PeerId([0u8; 32]))
        }

        fn send(&self, to: &PeerId, message: ProtocolMessage) -> Result<()> {
            lock(&self.sent).push((*to, message));
            Ok(())
        }

        fn encode_peers(&self, _peers: &PeerSet) -> Result<Vec<u8>> {
            Ok(vec![])
        }
    }

    fn setup(
        required: &[usize],
        timeout: Duration,
    ) -> (Arc<MpcContext>, Arc<RecordingOutbox>, Vec<PeerId>) {
        let mut rng = OsRng;
        let ids: Vec<PeerId> = (0..2).map(|_| PeerId::random(&mut rng)).collect();
        let peers = PeerSet::new(
            ids.iter()
                .enumerate()
                .map(|(i, id)| PeerInfo {
                    peer_id: *id,
                    seed: i as u64 + 1,
                })
                .collect(),
        )
        .unwrap();
        let steps: Vec<Box<dyn Step>> = required
            .iter()
            .map(|k| Box::new(CountingStep::new(&ids, *k)) as Box<dyn Step>)
            .collect();
        let context = Arc::new(MpcContext::new(
            ContextId(7),
            ProtocolType::GpkLeader,
            Arc::new(peers),
            steps,
            ResultStore::default(),
            timeout,
        ));
        let outbox = Arc::new(RecordingOutbox {
            me: Some(ids[0]),
            ..Default::default()
        });
        (context, outbox, ids)
    }

    fn step_message(step_id: u64, value: u32) -> MpcMessage {
        let mut message = MpcMessage::new(ContextId(7), step_id);
        message.data.push(BigUint::from(value));
        message
    }

    fn aborts_sent(outbox: &RecordingOutbox) -> Vec<PeerId> {
        lock(&outbox.sent)
            .iter()
            .filter(|(_, m)| m.code() == MessageCode::MpcError)
            .map(|(to, _)| *to)
            .collect()
    }

    #[tokio::test]
    async fn steps_run_in_order_with_early_messages_queued() {
        let (context, outbox, ids) = setup(&[1, 2], Duration::from_secs(5));
        // Messages for the second step arrive before the first completes.
        context.deliver(ids[0], step_message(1, 1)).unwrap();
        context.deliver(ids[1], step_message(1, 1)).unwrap();
        context.deliver(ids[1], step_message(0, 1)).unwrap();
        assert_eq!(
            context.deliver(ids[1], step_message(2, 1)),
            Err(InternalError::MisroutedMessage)
        );

        let result = context.run(outbox.as_ref()).await;
        assert!(result.is_ok());
        assert!(context.is_quit());
        assert!(aborts_sent(&outbox).is_empty());
    }

    #[tokio::test]
    async fn quit_interrupts_a_waiting_step() {
        let (context, outbox, ids) = setup(&[2], Duration::from_secs(30));
        let runner = {
            let context = context.clone();
            let outbox = outbox.clone();
            tokio::spawn(async move { context.run(outbox.as_ref()).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(context.quit(InternalError::Aborted("operator".into()), true));
        assert!(!context.quit(InternalError::TimeOut, true));

        let result = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("context did not stop in time")
            .unwrap();
        assert_eq!(result, Err(InternalError::Aborted("operator".into())));
        assert_eq!(aborts_sent(&outbox), vec![ids[1]]);
    }

    #[tokio::test]
    async fn remote_abort_is_not_echoed() {
        let (context, outbox, _) = setup(&[2], Duration::from_secs(30));
        assert!(context.quit(InternalError::remote(b"peer gave up"), false));
        let result = context.run(outbox.as_ref()).await.map(|_| ());
        assert_eq!(result, Err(InternalError::Aborted("peer gave up".into())));
        assert!(aborts_sent(&outbox).is_empty());
    }

    #[tokio::test]
    async fn peer_timeout_surfaces_as_a_timeout() {
        let (context, outbox, _) = setup(&[2], Duration::from_secs(30));
        let reason = InternalError::TimeOut.to_string();
        assert!(context.quit(InternalError::remote(reason.as_bytes()), false));
        let result = context.run(outbox.as_ref()).await.map(|_| ());
        assert_eq!(result, Err(InternalError::TimeOut));
        assert!(aborts_sent(&outbox).is_empty());
    }

    #[tokio::test]
    async fn timeout_aborts_the_run_and_notifies_peers() {
        let (context, outbox, ids) = setup(&[2], Duration::from_millis(50));
        context.deliver(ids[0], step_message(0, 1)).unwrap();
        let result = context.run(outbox.as_ref()).await.map(|_| ());
        assert_eq!(result, Err(InternalError::TimeOut));
        assert_eq!(aborts_sent(&outbox), vec![ids[1]]);
    }
}
