// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The [`Distributor`] is a storeman node's entry point into the MPC engine.
//!
//! It owns the table of live contexts, routes every inbound
//! [`ProtocolMessage`] to the context it belongs to, opens responder
//! contexts when a peer proposes a run and leads runs on behalf of its
//! caller. Finished key generations are persisted through the
//! [`Keystore`].

use crate::{
    context::{MpcContext, Outbox},
    errors::{InternalError, Result},
    factory::{build_pipeline, PipelineParams},
    keystore::Keystore,
    messages::{decode_peers, encode_peers, MpcMessage, ProtocolMessage},
    parameters::MpcConfig,
    protocol::{Address, ContextId, GroupKey, PeerId, PeerInfo, PeerSet, ProtocolType},
    result_store::{keys, ResultStore, SHARED_SLOT},
    signature::SchnorrSignature,
    step::{decode_sign_request, requested_protocol, Fault, FaultCounters, FaultSnapshot},
    transport::Transport,
    validator::{SignRequest, TxValidator},
};
use rand::{rngs::OsRng, RngCore};
use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::{debug, error, info, instrument, warn};

/// A loaded account: this node's key share and the seeds every storeman
/// was assigned when the key was generated.
#[derive(Debug)]
struct Account {
    share: k256::Scalar,
    peers: PeerSet,
}

/// Routes protocol messages to contexts and runs protocols for its caller.
pub struct Distributor {
    config: MpcConfig,
    self_id: PeerId,
    roster: Vec<PeerId>,
    transport: Arc<dyn Transport>,
    keystore: Arc<dyn Keystore>,
    validator: Arc<dyn TxValidator>,
    contexts: RwLock<HashMap<ContextId, Arc<MpcContext>>>,
    accounts: RwLock<HashMap<Address, Arc<Account>>>,
    faults: Arc<FaultCounters>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| {
        error!("Distributor lock poisoned");
        InternalError::InternalInvariantFailed
    })
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| {
        error!("Distributor lock poisoned");
        InternalError::InternalInvariantFailed
    })
}

impl Distributor {
    /// Creates the distributor of `self_id` within `roster`, the fixed list
    /// of every storeman. The roster is sorted; a peer's index in it is how
    /// the peer is named on the wire.
    pub fn new(
        config: MpcConfig,
        self_id: PeerId,
        mut roster: Vec<PeerId>,
        transport: Arc<dyn Transport>,
        keystore: Arc<dyn Keystore>,
        validator: Arc<dyn TxValidator>,
    ) -> Result<Arc<Self>> {
        roster.sort();
        roster.dedup();
        config.validate(roster.len())?;
        if roster.binary_search(&self_id).is_err() {
            return arg_err!("this node is not part of the roster");
        }
        info!(
            "Storeman {} ready, degree {} over {} storemen",
            self_id,
            config.degree,
            roster.len()
        );
        Ok(Arc::new(Self {
            config,
            self_id,
            roster,
            transport,
            keystore,
            validator,
            contexts: RwLock::new(HashMap::new()),
            accounts: RwLock::new(HashMap::new()),
            faults: Arc::new(FaultCounters::default()),
        }))
    }

    /// The identity of this node.
    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Counts of peer messages the steps of this node dropped, by kind.
    pub fn fault_counters(&self) -> FaultSnapshot {
        self.faults.snapshot()
    }

    /// Identifiers of the contexts currently running.
    pub fn live_contexts(&self) -> Vec<ContextId> {
        read(&self.contexts)
            .map(|contexts| contexts.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Aborts a live context and tells its peers. Returns `false` if no
    /// such context runs or it had already stopped.
    pub fn quit_context(&self, id: ContextId, reason: InternalError) -> bool {
        match self.lookup(id) {
            Some(context) => context.quit(reason, true),
            None => false,
        }
    }

    ///////////////////
    // Leading a run //
    ///////////////////

    /// Runs a group key generation over the whole roster and persists this
    /// node's share of the result.
    #[instrument(skip_all, fields(storeman = %self.self_id))]
    pub async fn create_gpk(&self) -> Result<GroupKey> {
        let peers = Arc::new(PeerSet::with_random_seeds(&mut OsRng, &self.roster)?);
        let results = self
            .lead(ProtocolType::GpkLeader, peers.clone(), 0, ResultStore::default())
            .await?;
        self.persist_group_key(&peers, &results)
    }

    /// Signs every hash of `request` with the shares of `request.address`.
    /// Returns one signature per hash, in order.
    #[instrument(skip_all, fields(storeman = %self.self_id, account = %request.address))]
    pub async fn sign(&self, request: SignRequest) -> Result<Vec<SchnorrSignature>> {
        let first = match request.hashes.first() {
            Some(hash) => *hash,
            None => return arg_err!("nothing to sign"),
        };
        let account = self.load_account(&request.address)?;
        let peers = select_signers(
            &self.roster,
            &account.peers,
            self.self_id,
            &first,
            self.config.sign_quorum(),
            |peer| self.transport.is_peer_reachable(peer),
        )?;

        let slots = request.hashes.len();
        let mut store = ResultStore::default();
        store.store::<keys::PrivateShare>(SHARED_SLOT, account.share)?;
        store.store::<keys::AccountAddress>(SHARED_SLOT, request.address)?;
        store.store::<keys::Request>(SHARED_SLOT, request)?;

        let results = self
            .lead(ProtocolType::SignLeader, Arc::new(peers), slots, store)
            .await?;
        Ok(results.retrieve::<keys::Signatures>(SHARED_SLOT)?.clone())
    }

    async fn lead(
        &self,
        protocol: ProtocolType,
        peers: Arc<PeerSet>,
        slots: usize,
        store: ResultStore,
    ) -> Result<ResultStore> {
        let params = PipelineParams {
            protocol,
            peers: peers.clone(),
            self_id: self.self_id,
            leader: self.self_id,
            degree: self.config.degree,
            slots,
        };
        let steps = build_pipeline(&params, &self.faults);
        let context = {
            let mut contexts = write(&self.contexts)?;
            let id = loop {
                let candidate = ContextId(OsRng.next_u64());
                if !contexts.contains_key(&candidate) {
                    break candidate;
                }
            };
            let context = Arc::new(MpcContext::new(
                id,
                protocol,
                peers,
                steps,
                store,
                self.config.step_timeout(),
            ));
            let _ = contexts.insert(id, context.clone());
            context
        };

        let result = context.run(self).await;
        self.unregister(context.id());
        result
    }

    //////////////////////
    // Inbound messages //
    //////////////////////

    /// Routes a message received from `from`.
    ///
    /// A `RequestMpc` spawns the responder context on the current tokio
    /// runtime, so this must be called from within one.
    #[instrument(skip_all, fields(storeman = %self.self_id, from = %from))]
    pub fn handle_message(self: &Arc<Self>, from: PeerId, message: ProtocolMessage) -> Result<()> {
        if self.roster.binary_search(&from).is_err() {
            warn!("Message from {}, who is not a storeman", from);
            self.faults.record(Fault::UnknownSender);
            return Err(InternalError::MisroutedMessage);
        }
        match message {
            ProtocolMessage::RequestMpc(body) => self.accept_request(from, body),
            ProtocolMessage::Mpc(body) => self.deliver(from, body),
            ProtocolMessage::MpcError(body) => {
                self.abort_from_peer(from, &body);
                Ok(())
            }
        }
    }

    fn deliver(&self, from: PeerId, body: MpcMessage) -> Result<()> {
        match self.lookup(body.context_id) {
            Some(context) => context.deliver(from, body),
            None => {
                debug!("Dropped message from {} for {}: no such context", from, body.context_id);
                Ok(())
            }
        }
    }

    fn abort_from_peer(&self, from: PeerId, body: &MpcMessage) {
        let context = match self.lookup(body.context_id) {
            Some(context) => context,
            None => return,
        };
        if !context.peers().contains(&from) {
            warn!("{} tried to abort {}, which it is not part of", from, body.context_id);
            return;
        }
        let reason = InternalError::remote(&body.peers);
        warn!("{} aborted {}: {}", from, body.context_id, reason);
        let _ = context.quit(reason, false);
    }

    fn accept_request(self: &Arc<Self>, from: PeerId, body: MpcMessage) -> Result<()> {
        let id = body.context_id;
        match self.open_responder(from, &body) {
            Ok(context) => {
                info!("Joined {:?} run {} led by {}", context.protocol(), id, from);
                let this = self.clone();
                let _ = tokio::spawn(this.run_responder(context));
                Ok(())
            }
            Err(e) => {
                error!("Refused run {} proposed by {}: {}", id, from, e);
                // The subset learns about a refused transaction so that every
                // mirrored context stops. Other refusals only concern the
                // proposer.
                let recipients = match (&e, decode_peers(&self.roster, &body.peers)) {
                    (InternalError::FailedTxVerify, Ok(peers)) => peers
                        .ids()
                        .filter(|id| id != &self.self_id)
                        .collect::<Vec<_>>(),
                    _ => vec![from],
                };
                self.transport
                    .broadcast(&recipients, &abort_message(id, &e));
                Err(e)
            }
        }
    }

    fn open_responder(&self, from: PeerId, body: &MpcMessage) -> Result<Arc<MpcContext>> {
        let id = body.context_id;
        let protocol = requested_protocol(body)?.responder()?;
        if read(&self.contexts)?.contains_key(&id) {
            return Err(InternalError::ContextExists);
        }
        let peers = decode_peers(&self.roster, &body.peers)?;
        if !peers.contains(&self.self_id) || !peers.contains(&from) {
            return arg_err!("proposed peer set does not include both ends");
        }
        let expected = match protocol {
            ProtocolType::GpkPeer => self.roster.len(),
            _ => self.config.sign_quorum(),
        };
        if peers.len() != expected {
            error!(
                "{:?} needs {} peers, the proposal names {}",
                protocol,
                expected,
                peers.len()
            );
            return Err(InternalError::InvalidSubsetSize);
        }

        let mut store = ResultStore::default();
        let mut slots = 0;
        if protocol == ProtocolType::SignPeer {
            let request = decode_sign_request(body)?;
            if !self.validator.validate(&from, &request) {
                return Err(InternalError::FailedTxVerify);
            }
            let account = self.load_account(&request.address)?;
            for peer in peers.iter() {
                if account.peers.seed_of(&peer.peer_id) != Some(peer.seed) {
                    error!("{} carries a seed the account does not know", peer.peer_id);
                    return Err(InternalError::SeedMismatch);
                }
            }
            slots = request.hashes.len();
            store.store::<keys::PrivateShare>(SHARED_SLOT, account.share)?;
            store.store::<keys::AccountAddress>(SHARED_SLOT, request.address)?;
            store.store::<keys::Request>(SHARED_SLOT, request)?;
        }

        let peers = Arc::new(peers);
        let params = PipelineParams {
            protocol,
            peers: peers.clone(),
            self_id: self.self_id,
            leader: from,
            degree: self.config.degree,
            slots,
        };
        let context = Arc::new(MpcContext::new(
            id,
            protocol,
            peers,
            build_pipeline(&params, &self.faults),
            store,
            self.config.step_timeout(),
        ));
        match write(&self.contexts)?.entry(id) {
            Entry::Occupied(_) => Err(InternalError::ContextExists),
            Entry::Vacant(entry) => {
                let _ = entry.insert(context.clone());
                Ok(context)
            }
        }
    }

    async fn run_responder(self: Arc<Self>, context: Arc<MpcContext>) {
        // The context stays registered until its key is stored, so an idle
        // distributor has no writes pending.
        match context.run(self.as_ref()).await {
            Ok(results) if context.protocol() == ProtocolType::GpkPeer => {
                if let Err(e) = self.persist_group_key(context.peers(), &results) {
                    error!("Could not persist the key of {}: {}", context.id(), e);
                }
            }
            Ok(_) => info!("Run {} finished", context.id()),
            Err(e) => warn!("Run {} failed: {}", context.id(), e),
        }
        self.unregister(context.id());
    }

    ////////////////////////
    // Accounts and state //
    ////////////////////////

    fn lookup(&self, id: ContextId) -> Option<Arc<MpcContext>> {
        read(&self.contexts).ok()?.get(&id).cloned()
    }

    fn unregister(&self, id: ContextId) {
        if let Ok(mut contexts) = write(&self.contexts) {
            let _ = contexts.remove(&id);
        }
    }

    fn load_account(&self, address: &Address) -> Result<Arc<Account>> {
        if let Some(account) = read(&self.accounts)?.get(address) {
            return Ok(account.clone());
        }
        let (share, peers) = self
            .keystore
            .load_private_share(address, &self.config.passphrase)?;
        let account = Arc::new(Account {
            share,
            peers: PeerSet::new(peers)?,
        });
        let _ = write(&self.accounts)?.insert(*address, account.clone());
        debug!("Loaded account {}", address);
        Ok(account)
    }

    fn persist_group_key(&self, peers: &PeerSet, results: &ResultStore) -> Result<GroupKey> {
        let share = *results.retrieve::<keys::PrivateShare>(SHARED_SLOT)?;
        let public_key = *results.retrieve::<keys::PublicKeyResult>(SHARED_SLOT)?;
        let address = *results.retrieve::<keys::AccountAddress>(SHARED_SLOT)?;
        let seeds: Vec<PeerInfo> = peers.iter().copied().collect();

        let stored = self.keystore.create_account_record(
            &public_key,
            &share,
            &seeds,
            &self.config.passphrase,
        )?;
        if stored != address {
            error!("Keystore filed the key under {}, expected {}", stored, address);
            return Err(InternalError::InvalidMpcAddr);
        }
        let _ = write(&self.accounts)?.insert(
            address,
            Arc::new(Account {
                share,
                peers: peers.clone(),
            }),
        );
        info!("Stored group key {}", address);
        Ok(GroupKey {
            address,
            public_key,
        })
    }
}

impl Outbox for Distributor {
    fn self_id(&self) -> PeerId {
        self.self_id
    }

    fn send(&self, to: &PeerId, message: ProtocolMessage) -> Result<()> {
        if to != &self.self_id {
            return self.transport.send_to_peer(to, message);
        }
        match message {
            ProtocolMessage::Mpc(body) => self.deliver(self.self_id, body),
            other => {
                error!("Cannot loop a {:?} message back", other.code());
                Err(InternalError::MisroutedMessage)
            }
        }
    }

    fn encode_peers(&self, peers: &PeerSet) -> Result<Vec<u8>> {
        encode_peers(&self.roster, peers)
    }
}

fn abort_message(id: ContextId, reason: &InternalError) -> ProtocolMessage {
    let mut body = MpcMessage::new(id, 0);
    body.peers = reason.to_string().into_bytes();
    ProtocolMessage::MpcError(body)
}

/// Picks the `quorum` storemen that sign a request whose first hash is
/// `hash`.
///
/// The walk over the sorted `roster` starts at an offset derived from the
/// hash, so the same transaction maps to the same subset as long as the
/// same peers are reachable. This node always signs and comes first.
pub(crate) fn select_signers(
    roster: &[PeerId],
    account: &PeerSet,
    self_id: PeerId,
    hash: &[u8; 32],
    quorum: usize,
    is_reachable: impl Fn(&PeerId) -> bool,
) -> Result<PeerSet> {
    let own_seed = account
        .seed_of(&self_id)
        .ok_or(InternalError::UnknownAccount)?;
    let mut chosen = vec![PeerInfo {
        peer_id: self_id,
        seed: own_seed,
    }];

    let n = roster.len();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash[..8]);
    let start = (u64::from_be_bytes(prefix) % n.max(1) as u64) as usize;
    for i in 0..n {
        if chosen.len() >= quorum {
            break;
        }
        let candidate = roster[(i + start) % n];
        if candidate == self_id {
            continue;
        }
        let seed = match account.seed_of(&candidate) {
            Some(seed) => seed,
            None => continue,
        };
        if !is_reachable(&candidate) {
            debug!("Skipping unreachable storeman {}", candidate);
            continue;
        }
        chosen.push(PeerInfo {
            peer_id: candidate,
            seed,
        });
    }

    if chosen.len() < quorum {
        error!(
            "Only {} of the {} storemen needed are reachable",
            chosen.len(),
            quorum
        );
        return Err(InternalError::TooFewStoremen);
    }
    PeerSet::new(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(n: u8) -> (Vec<PeerId>, PeerSet) {
        let roster: Vec<PeerId> = (0..n).map(|i| PeerId([i; 32])).collect();
        let account = PeerSet::new(
            roster
                .iter()
                .zip(1u64..)
                .map(|(id, seed)| PeerInfo {
                    peer_id: *id,
                    seed: seed * 10,
                })
                .collect(),
        )
        .unwrap();
        (roster, account)
    }

    fn ids(set: &PeerSet) -> Vec<PeerId> {
        set.ids().collect()
    }

    #[test]
    fn signers_follow_the_hash_offset() -> Result<()> {
        let (roster, account) = roster(5);
        let mut hash = [0u8; 32];
        hash[7] = 3;
        let chosen = select_signers(&roster, &account, roster[0], &hash, 3, |_| true)?;
        assert_eq!(ids(&chosen), vec![roster[0], roster[3], roster[4]]);
        assert_eq!(chosen.seed_of(&roster[3]), Some(40));

        // The same hash always selects the same subset.
        let again = select_signers(&roster, &account, roster[0], &hash, 3, |_| true)?;
        assert_eq!(chosen, again);
        Ok(())
    }

    #[test]
    fn unreachable_storemen_are_skipped() -> Result<()> {
        let (roster, account) = roster(5);
        let mut hash = [0u8; 32];
        hash[7] = 3;
        let offline = roster[3];
        let chosen = select_signers(&roster, &account, roster[0], &hash, 3, |peer| {
            peer != &offline
        })?;
        assert_eq!(ids(&chosen), vec![roster[0], roster[4], roster[1]]);

        assert_eq!(
            select_signers(&roster, &account, roster[0], &hash, 3, |peer| peer == &roster[1]),
            Err(InternalError::TooFewStoremen)
        );
        Ok(())
    }

    #[test]
    fn a_node_outside_the_account_cannot_sign() {
        let (roster, account) = roster(3);
        assert_eq!(
            select_signers(&roster, &account, PeerId([9; 32]), &[0; 32], 3, |_| true),
            Err(InternalError::UnknownAccount)
        );
    }
}
