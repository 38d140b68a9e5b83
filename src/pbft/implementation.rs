/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus state machine.
//!
//! [`Core`] owns all round state of a replica. It is driven by exactly one thread, the
//! [algorithm thread](crate::algorithm), through two entry points:
//! 1. [`on_input`](Core::on_input): a verified message, a request, or a new peer.
//! 2. [`on_timer`](Core::on_timer): the passage of time, which may expire the view timer or the sync
//!    deadline.
//!
//! Neither entry point ever blocks. Rejected inputs (stale, unverifiable, or conflicting messages) are
//! logged and dropped inside the handlers. The only errors that escape are [`CoreError`]s, which mean
//! that the replica can no longer safely participate.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt::{self, Display, Formatter},
    mem,
    sync::mpsc::Sender,
    time::{Duration, Instant, SystemTime},
};

use crate::{
    algorithm::Input,
    backend::{Backend, BackendError, ChainHead},
    checkpoint::{
        messages::Hello,
        pluggables::KVStore,
        store::{checkpoint_subject, CheckpointError, CheckpointStore, Snapshot},
        sync::{required_claims, SyncCandidates},
        types::{CheckpointCollector, CheckpointProgress},
    },
    events::*,
    networking::{
        messages::{Envelope, Message},
        network::Network,
        receiving::{MessageBuffer, VerifiedMessage},
        sending::SenderHandle,
    },
    replica::SealError,
    types::{
        crypto_primitives::{hash, Keypair},
        data_types::{Address, BufferSize, CryptoHash, SequenceNumber, View, ViewNumber},
        proposal::Proposal,
        validator_set::SharedValidatorSet,
    },
    view_change::{
        messages::{NewView, ViewChange},
        types::{
            select_carry_forward, verify_new_view, view_change_is_consistent, PreparedCertificate,
            ViewChangeCollector,
        },
    },
};

use super::{
    messages::{Preprepare, Request, Subject},
    roles::{is_proposer, proposer},
    types::{QuorumBook, QuorumCertificate, VoteError, VotePhase},
};

/// Number of recently committed payload hashes remembered, so that late copies of already committed
/// requests are not queued again.
const RECENT_COMMITS: usize = 1024;

/// The phase of the round that a replica is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    AcceptRequest,
    Preprepared,
    Prepared,
    Committed,
    ViewChanging { target: View },
    Sync,
}

pub(crate) struct CoreConfiguration {
    pub(crate) keypair: Keypair,
    pub(crate) request_timeout: Duration,
    pub(crate) max_view_timeout: Duration,
    pub(crate) sync_timeout: Duration,
    pub(crate) checkpoint_interval: u64,
    pub(crate) checkpoint_retention: usize,
    pub(crate) progress_msg_buffer_capacity: BufferSize,
    pub(crate) max_pending_requests: usize,
    pub(crate) sync_on_start: bool,
}

/// A request waiting to be proposed.
struct PendingRequest {
    payload: Vec<u8>,
    data_hash: CryptoHash,
    /// Present if a local caller of [`Replica::seal`](crate::replica::Replica::seal) waits on the result.
    reply: Option<Sender<Result<Proposal, SealError>>>,
}

impl PendingRequest {
    fn resolve(self, result: Result<Proposal, SealError>) {
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
    }
}

/// A request that this replica proposed at `sequence`, and which has not been settled yet.
struct InFlight {
    sequence: SequenceNumber,
    request: PendingRequest,
}

/// The view timer. Its timeout doubles with every view number, up to a maximum.
pub(crate) struct ViewTimer {
    base: Duration,
    max: Duration,
    deadline: Option<Instant>,
}

impl ViewTimer {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            deadline: None,
        }
    }

    /// Get the timeout of a round at `view_number`: `base * 2^view_number`, capped at `max`.
    pub(crate) fn timeout(&self, view_number: ViewNumber) -> Duration {
        let exponent = view_number.int().min(31) as u32;
        self.base
            .checked_mul(2u32.pow(exponent))
            .map_or(self.max, |timeout| timeout.min(self.max))
    }

    /// Cancel any running timer, and start one for a round at `view_number`.
    pub(crate) fn arm(&mut self, view_number: ViewNumber) {
        self.deadline = Some(Instant::now() + self.timeout(view_number));
    }

    pub(crate) fn stop(&mut self) {
        self.deadline = None;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

pub(crate) struct Core<N: Network, B: Backend, K: KVStore> {
    me: Address,
    checkpoint_interval: u64,
    max_pending_requests: usize,
    sync_timeout: Duration,
    sync_on_start: bool,

    state: State,
    view: View,
    head: ChainHead,
    preprepare: Option<Preprepare>,
    book: QuorumBook,
    prepared: Option<PreparedCertificate>,
    p_set: Vec<Subject>,
    q_set: Vec<Subject>,
    view_changes: ViewChangeCollector,

    checkpoints: CheckpointCollector,
    unmatched_certificates: BTreeMap<SequenceNumber, QuorumCertificate>,
    committed: BTreeMap<SequenceNumber, Preprepare>,
    checkpoint_store: CheckpointStore<K>,
    sync: Option<SyncCandidates>,

    pending: VecDeque<PendingRequest>,
    in_flight: Option<InFlight>,
    recent_commits: VecDeque<CryptoHash>,

    timer: ViewTimer,
    buffer: MessageBuffer,
    backend: B,
    validator_set: SharedValidatorSet,
    sender: SenderHandle<N>,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network, B: Backend, K: KVStore> Core<N, B, K> {
    /// Create the state machine. The replica resumes consensus at the sequence after the higher of the
    /// backend's chain head and the latest stable snapshot.
    pub(crate) fn new(
        config: CoreConfiguration,
        backend: B,
        checkpoint_store: CheckpointStore<K>,
        validator_set: SharedValidatorSet,
        network: N,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        let mut head = backend.head();
        if let Some(snapshot) = checkpoint_store.latest() {
            if snapshot.sequence() > head.sequence {
                head = ChainHead {
                    sequence: snapshot.sequence(),
                    hash: snapshot.digest(),
                };
            }
        }
        let view = View::new(ViewNumber::new(0), head.sequence + 1);
        let quorum = validator_set.read().quorum();

        Self {
            me: config.keypair.address(),
            checkpoint_interval: config.checkpoint_interval,
            max_pending_requests: config.max_pending_requests,
            sync_timeout: config.sync_timeout,
            sync_on_start: config.sync_on_start,
            state: State::AcceptRequest,
            view,
            head,
            preprepare: None,
            book: QuorumBook::new(view, quorum),
            prepared: None,
            p_set: Vec::new(),
            q_set: Vec::new(),
            view_changes: ViewChangeCollector::new(view.sequence),
            checkpoints: CheckpointCollector::new(
                config.checkpoint_interval,
                config.checkpoint_retention,
            ),
            unmatched_certificates: BTreeMap::new(),
            committed: BTreeMap::new(),
            checkpoint_store,
            sync: None,
            pending: VecDeque::new(),
            in_flight: None,
            recent_commits: VecDeque::new(),
            timer: ViewTimer::new(config.request_timeout, config.max_view_timeout),
            buffer: MessageBuffer::new(config.progress_msg_buffer_capacity),
            backend,
            validator_set,
            sender: SenderHandle::new(network, config.keypair, event_publisher.clone()),
            event_publisher,
        }
    }

    /// Begin participating: either start syncing, or wait for requests in the resumed round.
    pub(crate) fn start(&mut self) -> Result<(), CoreError> {
        log::info!("{} starting at {}", self.me, self.view);
        if self.sync_on_start {
            self.enter_sync()
        } else {
            Ok(())
        }
    }

    /// Get the earliest instant at which [`on_timer`](Self::on_timer) has something to do.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let sync_deadline = self.sync.as_ref().map(SyncCandidates::deadline);
        match (self.timer.deadline(), sync_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn on_input(&mut self, input: Input) -> Result<(), CoreError> {
        match input {
            Input::Message(msg) => self.on_message(msg),
            Input::Request { payload, reply } => self.on_local_request(payload, reply),
            Input::PeerConnected(peer) => {
                self.sender.send(
                    peer,
                    Hello {
                        snapshot: self.checkpoint_store.latest(),
                        syncing: self.state == State::Sync,
                    },
                );
                Ok(())
            }
        }
    }

    pub(crate) fn on_timer(&mut self, now: Instant) -> Result<(), CoreError> {
        if self.sync.as_ref().is_some_and(|sync| now >= sync.deadline()) {
            self.end_sync()?;
        }

        if self.timer.deadline().is_some_and(|deadline| now >= deadline) {
            self.timer.stop();
            match self.state {
                State::Sync => (),
                State::ViewChanging { target } => {
                    log::debug!("{} timed out waiting for new view {}", self.me, target);
                    self.start_view_change(target.view_number + 1, ViewChangeCause::Timeout)?;
                }
                _ => {
                    log::debug!("{} timed out in {}", self.me, self.view);
                    self.start_view_change(self.view.view_number + 1, ViewChangeCause::Timeout)?;
                }
            }
        }
        Ok(())
    }

    /// Stop taking part in consensus: fail every waiting seal and forget every queued request.
    pub(crate) fn halt(&mut self) {
        self.timer.stop();
        self.sync = None;
        let in_flight = self.in_flight.take().map(|in_flight| in_flight.request);
        in_flight
            .into_iter()
            .chain(mem::take(&mut self.pending))
            .for_each(|request| request.resolve(Err(SealError::Halted)));
    }

    /* ↓↓↓ Requests ↓↓↓ */

    fn on_local_request(
        &mut self,
        payload: Vec<u8>,
        reply: Option<Sender<Result<Proposal, SealError>>>,
    ) -> Result<(), CoreError> {
        match reply {
            Some(reply) => {
                if self.state == State::Sync || !self.is_proposer(&self.me, &self.view) {
                    let _ = reply.send(Err(SealError::NotProposer));
                    return Ok(());
                }
                let data_hash = hash(&payload);
                self.publish_request(&payload);
                self.pending.push_front(PendingRequest {
                    payload,
                    data_hash,
                    reply: Some(reply),
                });
            }
            None => {
                self.sender.broadcast(Request {
                    payload: payload.clone(),
                });
                self.queue_request(payload);
            }
        }
        self.on_request_queued()
    }

    /// Queue a fire-and-forget request, unless it is already queued, was recently committed, or the
    /// queue is full.
    fn queue_request(&mut self, payload: Vec<u8>) {
        if self.pending.len() >= self.max_pending_requests {
            log::warn!("{} request queue is full, dropping request", self.me);
            return;
        }
        let data_hash = hash(&payload);
        let in_flight = self
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.request.data_hash == data_hash);
        if in_flight
            || self.recent_commits.contains(&data_hash)
            || self.pending.iter().any(|request| request.data_hash == data_hash)
        {
            return;
        }
        self.publish_request(&payload);
        self.pending.push_back(PendingRequest {
            payload,
            data_hash,
            reply: None,
        });
    }

    fn on_request_queued(&mut self) -> Result<(), CoreError> {
        if self.state == State::AcceptRequest && !self.timer.is_armed() {
            self.timer.arm(self.view.view_number);
        }
        self.try_propose()
    }

    fn publish_request(&self, payload: &[u8]) {
        Event::Request(RequestEvent {
            timestamp: SystemTime::now(),
            payload: payload.to_vec(),
        })
        .publish(&self.event_publisher);
    }

    /// If this replica is the proposer of the current view and has not proposed yet, propose the
    /// request at the front of the queue.
    fn try_propose(&mut self) -> Result<(), CoreError> {
        if self.state != State::AcceptRequest
            || self.preprepare.is_some()
            || !self.is_proposer(&self.me, &self.view)
        {
            return Ok(());
        }

        let sequence = self.view.sequence;
        if let Some(in_flight) = self.in_flight.take() {
            self.pending.push_front(in_flight.request);
        }

        // Requests that our own backend rejects would only stall the round until the view timer fires.
        let mut rejected = false;
        let (request, proposal) = loop {
            let Some(request) = self.pending.pop_front() else {
                if rejected {
                    self.timer.stop();
                }
                return Ok(());
            };
            let proposal = Proposal::new(sequence, self.head.hash, request.payload.clone());
            if self.backend.validate(&proposal) {
                break (request, proposal);
            }
            log::warn!("{} dropping request {} rejected by the backend", self.me, request.data_hash);
            request.resolve(Err(SealError::Rejected));
            rejected = true;
        };

        let preprepare = Preprepare {
            view: self.view,
            proposal,
        };
        self.in_flight = Some(InFlight { sequence, request });
        log::debug!("{} proposing {} in {}", self.me, preprepare.proposal.digest(), self.view);
        self.sender.broadcast(preprepare.clone());
        self.accept_preprepare(self.me, preprepare)
    }

    /* ↓↓↓ Inbound messages ↓↓↓ */

    fn on_message(&mut self, msg: VerifiedMessage) -> Result<(), CoreError> {
        if let Some(view) = msg.message.view() {
            if self.is_future(&msg.message, view) {
                self.buffer.insert(view, msg);
                return Ok(());
            }
        }

        let VerifiedMessage {
            origin,
            message,
            envelope,
        } = msg;
        match message {
            Message::Request(request) => {
                self.queue_request(request.payload);
                self.on_request_queued()
            }
            Message::Preprepare(preprepare) => self.on_preprepare(origin, preprepare),
            Message::Prepare(subject) => self.on_vote(VotePhase::Prepare, origin, subject, &envelope),
            Message::Commit(subject) => self.on_vote(VotePhase::Commit, origin, subject, &envelope),
            Message::Checkpoint(subject) => self.on_checkpoint_vote(origin, subject, &envelope),
            Message::ViewChange(view_change) => self.on_view_change(origin, view_change, envelope),
            Message::NewView(new_view) => self.on_new_view(origin, new_view),
            Message::Hello(hello) => self.on_hello(origin, hello),
        }
    }

    /// Whether a message for `view` belongs to a round this replica has not reached yet.
    fn is_future(&self, message: &Message, view: View) -> bool {
        if self.state == State::Sync {
            return view.sequence >= self.view.sequence;
        }
        match message {
            Message::Preprepare(_) | Message::Prepare(_) | Message::Commit(_) => view > self.view,
            _ => view.sequence > self.view.sequence,
        }
    }

    fn on_preprepare(&mut self, origin: Address, preprepare: Preprepare) -> Result<(), CoreError> {
        if preprepare.view < self.view {
            log::debug!("{} dropping stale preprepare for {}", self.me, preprepare.view);
            return Ok(());
        }
        if matches!(self.state, State::ViewChanging { .. }) {
            log::debug!("{} dropping preprepare while changing views", self.me);
            return Ok(());
        }
        if !self.is_proposer(&origin, &preprepare.view) {
            log::warn!("{} dropping preprepare from non-proposer {}", self.me, origin);
            return Ok(());
        }

        if let Some(accepted) = &self.preprepare {
            let first = accepted.proposal.digest();
            let second = preprepare.proposal.digest();
            if first != second {
                log::warn!("{} caught proposer {} equivocating in {}", self.me, origin, self.view);
                Event::Equivocation(EquivocationEvent {
                    timestamp: SystemTime::now(),
                    offender: origin,
                    view: self.view,
                    first,
                    second,
                })
                .publish(&self.event_publisher);
                return self.start_view_change(self.view.view_number + 1, ViewChangeCause::Equivocation);
            }
            return Ok(());
        }

        self.accept_preprepare(origin, preprepare)
    }

    /// Validate `preprepare` for the current view and, if it is valid, vote Prepare for it.
    fn accept_preprepare(&mut self, origin: Address, preprepare: Preprepare) -> Result<(), CoreError> {
        let proposal = &preprepare.proposal;
        let valid = proposal.sequence() == self.view.sequence
            && proposal.extends(&self.head.hash)
            && proposal.is_correct()
            && self.backend.validate(proposal);
        if !valid {
            log::warn!(
                "{} rejecting invalid proposal {} from {}",
                self.me,
                proposal.digest(),
                origin
            );
            if !self.timer.is_armed() {
                self.timer.arm(self.view.view_number);
            }
            return Ok(());
        }

        let subject = preprepare.subject();
        self.preprepare = Some(preprepare);
        if !self.q_set.contains(&subject) {
            self.q_set.push(subject);
        }
        self.state = State::Preprepared;
        self.timer.arm(self.view.view_number);
        Event::AcceptPreprepare(AcceptPreprepareEvent {
            timestamp: SystemTime::now(),
            origin,
            view: self.view,
            digest: subject.digest,
        })
        .publish(&self.event_publisher);

        let envelope = self.sender.broadcast(Message::Prepare(subject));
        self.record_own_vote(VotePhase::Prepare, subject, &envelope);
        self.check_prepared()
    }

    fn on_vote(
        &mut self,
        phase: VotePhase,
        origin: Address,
        subject: Subject,
        envelope: &Envelope,
    ) -> Result<(), CoreError> {
        let Some(signature) = envelope.signature else {
            return Ok(());
        };
        match self
            .book
            .record_vote(phase, subject.view, subject.digest, origin, signature)
        {
            Ok(_) => (),
            Err(VoteError::Equivocation {
                sender,
                first,
                second,
            }) => {
                Event::Equivocation(EquivocationEvent {
                    timestamp: SystemTime::now(),
                    offender: sender,
                    view: subject.view,
                    first,
                    second,
                })
                .publish(&self.event_publisher);
                return Ok(());
            }
            Err(err) => {
                log::debug!("{} dropping {} vote from {}: {}", self.me, phase, origin, err);
                return Ok(());
            }
        }

        match phase {
            VotePhase::Prepare => self.check_prepared(),
            VotePhase::Commit => self.check_committed(),
            VotePhase::Checkpoint => Ok(()),
        }
    }

    fn record_own_vote(&mut self, phase: VotePhase, subject: Subject, envelope: &Envelope) {
        if let Some(signature) = envelope.signature {
            let _ = self
                .book
                .record_vote(phase, subject.view, subject.digest, self.me, signature);
        }
    }

    fn check_prepared(&mut self) -> Result<(), CoreError> {
        if self.state != State::Preprepared {
            return Ok(());
        }
        let Some(preprepare) = &self.preprepare else {
            return Ok(());
        };
        let subject = preprepare.subject();
        let Some(certificate) = self
            .book
            .certificate(VotePhase::Prepare, subject.view, &subject.digest)
        else {
            return Ok(());
        };

        self.prepared = Some(PreparedCertificate {
            proposal: preprepare.proposal.clone(),
            certificate,
        });
        if !self.p_set.contains(&subject) {
            self.p_set.push(subject);
        }
        self.state = State::Prepared;
        self.timer.arm(self.view.view_number);
        Event::Prepared(PreparedEvent {
            timestamp: SystemTime::now(),
            view: subject.view,
            digest: subject.digest,
        })
        .publish(&self.event_publisher);

        let envelope = self.sender.broadcast(Message::Commit(subject));
        self.record_own_vote(VotePhase::Commit, subject, &envelope);
        self.check_committed()
    }

    /// Commit the accepted proposal if a quorum of Commit votes for it has been collected. A commit
    /// quorum is final, so this is also done while changing views.
    fn check_committed(&mut self) -> Result<(), CoreError> {
        if matches!(self.state, State::AcceptRequest | State::Committed | State::Sync) {
            return Ok(());
        }
        let Some(preprepare) = &self.preprepare else {
            return Ok(());
        };
        let subject = preprepare.subject();
        match self
            .book
            .certificate(VotePhase::Commit, subject.view, &subject.digest)
        {
            Some(certificate) => self.commit(certificate),
            None => Ok(()),
        }
    }

    fn commit(&mut self, certificate: QuorumCertificate) -> Result<(), CoreError> {
        let Some(preprepare) = self.preprepare.take() else {
            return Ok(());
        };
        let mut proposal = preprepare.proposal.clone();
        proposal.signatures = certificate.seals;
        self.state = State::Committed;
        self.timer.stop();

        self.backend.insert_block(&proposal)?;
        let sequence = proposal.sequence();
        self.head = ChainHead {
            sequence,
            hash: proposal.digest(),
        };

        let proposer = self.proposer(&preprepare.view).unwrap_or(self.me);
        log::info!("{} committed {} at {}", self.me, proposal.digest(), preprepare.view);
        Event::FinalCommitted(FinalCommittedEvent {
            timestamp: SystemTime::now(),
            proposal: proposal.clone(),
            proposer,
            view: preprepare.view,
        })
        .publish(&self.event_publisher);
        if proposer != self.me {
            Event::NewCommitted(NewCommittedEvent {
                timestamp: SystemTime::now(),
                proposal: proposal.clone(),
            })
            .publish(&self.event_publisher);
        }

        self.settle_requests(Some(&proposal));

        if self.checkpoint_interval > 0 && sequence.int() % self.checkpoint_interval == 0 {
            let subject = checkpoint_subject(sequence, proposal.digest());
            self.committed.insert(sequence, preprepare);
            let envelope = self.sender.broadcast(Message::Checkpoint(subject));
            self.on_checkpoint_vote(self.me, subject, &envelope)?;
            if let Some(certificate) = self.unmatched_certificates.remove(&sequence) {
                self.on_checkpoint_certificate(certificate)?;
            }
        }

        self.start_sequence(sequence + 1)
    }

    /// Resolve the requests that were waiting on the sequence that just ended with `committed`, or with
    /// no commit at all if it was skipped by sync.
    fn settle_requests(&mut self, committed: Option<&Proposal>) {
        let data_hash = committed.map(|proposal| proposal.header.data_hash);
        if let Some(hash) = data_hash {
            self.recent_commits.push_back(hash);
            if self.recent_commits.len() > RECENT_COMMITS {
                self.recent_commits.pop_front();
            }
        }

        let settle = |request: PendingRequest, requeue: &mut VecDeque<PendingRequest>| {
            match committed {
                Some(proposal) if Some(request.data_hash) == data_hash => {
                    request.resolve(Ok(proposal.clone()))
                }
                _ if request.reply.is_some() => request.resolve(Err(SealError::RoundAbandoned)),
                _ => requeue.push_back(request),
            }
        };

        let mut requeue = VecDeque::new();
        if let Some(in_flight) = self.in_flight.take() {
            settle(in_flight.request, &mut requeue);
        }
        for request in mem::take(&mut self.pending) {
            settle(request, &mut requeue);
        }
        self.pending = requeue;
    }

    /// Reset round state and enter view 0 of `sequence`.
    fn start_sequence(&mut self, sequence: SequenceNumber) -> Result<(), CoreError> {
        self.view = View::new(ViewNumber::new(0), sequence);
        self.state = State::AcceptRequest;
        self.preprepare = None;
        self.prepared = None;
        self.p_set.clear();
        self.q_set.clear();
        let quorum = self.validator_set.read().quorum();
        self.book.reset(self.view, quorum);
        self.view_changes.reset(sequence);

        if self.pending.is_empty() {
            self.timer.stop();
        } else {
            self.timer.arm(self.view.view_number);
        }

        self.replay_buffered()?;
        self.try_propose()
    }

    fn replay_buffered(&mut self) -> Result<(), CoreError> {
        let view = self.view;
        for msg in self.buffer.take_ready(view) {
            if self.view != view {
                // A replayed message moved the replica on. The rest is re-filed or dropped as stale.
                if let Some(msg_view) = msg.message.view() {
                    if self.is_future(&msg.message, msg_view) {
                        self.buffer.insert(msg_view, msg);
                    }
                }
                continue;
            }
            self.on_message(msg)?;
        }
        Ok(())
    }

    /* ↓↓↓ View change ↓↓↓ */

    fn start_view_change(
        &mut self,
        target_view_number: ViewNumber,
        cause: ViewChangeCause,
    ) -> Result<(), CoreError> {
        let target = View::new(target_view_number, self.view.sequence);
        match self.state {
            State::Sync => return Ok(()),
            State::ViewChanging { target: current } if current >= target => return Ok(()),
            _ => (),
        }

        self.state = State::ViewChanging { target };
        self.timer.arm(target.view_number);
        let view_change = ViewChange {
            view: target,
            p_set: self.p_set.clone(),
            q_set: self.q_set.clone(),
            prepared: self.prepared.clone(),
        };
        log::info!("{} asking to move to {} ({:?})", self.me, target, cause);
        let envelope = self.sender.broadcast(view_change.clone());
        self.view_changes.collect(self.me, view_change, envelope);
        Event::StartViewChange(StartViewChangeEvent {
            timestamp: SystemTime::now(),
            target,
            cause,
        })
        .publish(&self.event_publisher);

        self.check_view_change_quorum(target.view_number)
    }

    fn on_view_change(
        &mut self,
        origin: Address,
        view_change: ViewChange,
        envelope: Envelope,
    ) -> Result<(), CoreError> {
        if view_change.view.sequence < self.view.sequence
            || view_change.view.view_number <= self.view.view_number
        {
            log::debug!("{} dropping stale view change for {}", self.me, view_change.view);
            return Ok(());
        }
        let consistent = view_change_is_consistent(&view_change, &self.validator_set.read());
        if !consistent {
            log::warn!("{} dropping inconsistent view change from {}", self.me, origin);
            return Ok(());
        }

        let target = view_change.view;
        let count = self.view_changes.collect(origin, view_change, envelope);
        let quorum = self.validator_set.read().quorum();
        let behind_target = match self.state {
            State::ViewChanging { target: current } => current < target,
            _ => true,
        };
        if count >= quorum && behind_target {
            return self.start_view_change(target.view_number, ViewChangeCause::Quorum);
        }
        self.check_view_change_quorum(target.view_number)
    }

    /// If this replica is the proposer of `target` and has collected a quorum of `ViewChange`s for it,
    /// broadcast a `NewView` and install it.
    fn check_view_change_quorum(&mut self, target_view_number: ViewNumber) -> Result<(), CoreError> {
        let target = View::new(target_view_number, self.view.sequence);
        if self.state != (State::ViewChanging { target })
            || !self.is_proposer(&self.me, &target)
            || self.view_changes.count(target_view_number) < self.validator_set.read().quorum()
        {
            return Ok(());
        }

        let carried = select_carry_forward(&self.view_changes.view_changes(target_view_number));
        let new_view = NewView {
            view: target,
            v_set: self.view_changes.envelopes(target_view_number),
            x_set: carried.as_ref().map(|prepared| prepared.certificate.subject),
            proposal: carried.as_ref().map(|prepared| prepared.proposal.clone()),
        };
        self.sender.broadcast(new_view);
        self.enter_new_view(target, carried.map(|prepared| prepared.proposal))
    }

    fn on_new_view(&mut self, origin: Address, new_view: NewView) -> Result<(), CoreError> {
        if new_view.view.sequence < self.view.sequence
            || new_view.view.view_number <= self.view.view_number
        {
            log::debug!("{} dropping stale new view for {}", self.me, new_view.view);
            return Ok(());
        }
        if !self.is_proposer(&origin, &new_view.view) {
            log::warn!("{} dropping new view from non-proposer {}", self.me, origin);
            return Ok(());
        }
        let verified = verify_new_view(&new_view, &self.validator_set.read());
        match verified {
            Ok(carried) => self.enter_new_view(new_view.view, carried),
            Err(err) => {
                log::warn!("{} dropping new view from {}: {}", self.me, origin, err);
                Ok(())
            }
        }
    }

    /// Move to `view`, re-proposing the `carried` proposal if there is one.
    fn enter_new_view(&mut self, view: View, carried: Option<Proposal>) -> Result<(), CoreError> {
        self.view = view;
        self.state = State::AcceptRequest;
        self.preprepare = None;
        let quorum = self.validator_set.read().quorum();
        self.book.reset(view, quorum);
        self.view_changes.prune_up_to(view.view_number);
        self.timer.stop();
        Event::EnterNewView(EnterNewViewEvent {
            timestamp: SystemTime::now(),
            view,
            carried: carried.as_ref().map(Proposal::digest),
        })
        .publish(&self.event_publisher);
        log::info!("{} entered {}", self.me, view);

        match carried {
            Some(proposal) => {
                let proposer = self.proposer(&view).unwrap_or(self.me);
                self.accept_preprepare(proposer, Preprepare { view, proposal })?;
            }
            None if !self.pending.is_empty() => self.timer.arm(view.view_number),
            None => (),
        }

        self.replay_buffered()?;
        self.try_propose()
    }

    /* ↓↓↓ Checkpoints ↓↓↓ */

    fn on_checkpoint_vote(
        &mut self,
        origin: Address,
        subject: Subject,
        envelope: &Envelope,
    ) -> Result<(), CoreError> {
        let Some(signature) = envelope.signature else {
            return Ok(());
        };
        if subject.view.view_number != ViewNumber::new(0) {
            log::debug!("{} dropping checkpoint vote with non-zero view from {}", self.me, origin);
            return Ok(());
        }
        let (quorum, max_faulty) = {
            let validator_set = self.validator_set.read();
            (validator_set.quorum(), validator_set.max_faulty())
        };
        match self
            .checkpoints
            .collect(origin, subject, signature, quorum, self.view.sequence)
        {
            CheckpointProgress::Certified(certificate) => self.on_checkpoint_certificate(certificate),
            CheckpointProgress::Pending => Ok(()),
            // At least one correct validator has moved too far ahead to ever certify a checkpoint in reach.
            CheckpointProgress::Ahead { senders } if senders > max_faulty => {
                log::info!(
                    "{} fell behind {} validators checkpointing past {}",
                    self.me,
                    senders,
                    self.view.sequence
                );
                self.enter_sync()
            }
            CheckpointProgress::Ahead { .. } => Ok(()),
            CheckpointProgress::Dropped => {
                log::debug!(
                    "{} dropping checkpoint vote for {} from {}",
                    self.me,
                    subject.view.sequence,
                    origin
                );
                Ok(())
            }
        }
    }

    /// Persist the snapshot that `certificate` certifies if this replica committed the same proposal.
    /// If it has not reached that sequence yet, it has fallen behind and starts to sync.
    fn on_checkpoint_certificate(&mut self, certificate: QuorumCertificate) -> Result<(), CoreError> {
        let sequence = certificate.subject.view.sequence;
        let matching = self
            .committed
            .get(&sequence)
            .filter(|preprepare| preprepare.proposal.digest() == certificate.subject.digest)
            .cloned();

        let Some(preprepare) = matching else {
            if sequence >= self.view.sequence {
                if sequence > self.view.sequence {
                    self.enter_sync()?;
                }
                self.unmatched_certificates.insert(sequence, certificate);
            }
            return Ok(());
        };

        let digest = certificate.subject.digest;
        match self.checkpoint_store.append(Snapshot {
            preprepare,
            certificate,
        }) {
            Ok(()) => {
                Event::StableCheckpoint(StableCheckpointEvent {
                    timestamp: SystemTime::now(),
                    sequence,
                    digest,
                })
                .publish(&self.event_publisher);
                self.prune_checkpoint_state(sequence);
                Ok(())
            }
            Err(CheckpointError::OutOfOrder { latest, incoming }) => {
                log::debug!(
                    "{} not storing checkpoint {}, already at {}",
                    self.me,
                    incoming,
                    latest
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn prune_checkpoint_state(&mut self, sequence: SequenceNumber) {
        self.committed = self.committed.split_off(&(sequence + 1));
        self.unmatched_certificates = self.unmatched_certificates.split_off(&(sequence + 1));
        self.checkpoints.prune_up_to(sequence);
    }

    /* ↓↓↓ Sync ↓↓↓ */

    fn enter_sync(&mut self) -> Result<(), CoreError> {
        if self.state == State::Sync {
            return Ok(());
        }
        log::info!("{} falling back to sync at {}", self.me, self.view);
        self.state = State::Sync;
        self.timer.stop();
        self.sync = Some(SyncCandidates::new(Instant::now() + self.sync_timeout));
        Event::StartSync(StartSyncEvent {
            timestamp: SystemTime::now(),
            sequence: self.view.sequence,
        })
        .publish(&self.event_publisher);
        self.sender.broadcast(Hello {
            snapshot: self.checkpoint_store.latest(),
            syncing: true,
        });
        self.check_sync_complete()
    }

    fn on_hello(&mut self, origin: Address, hello: Hello) -> Result<(), CoreError> {
        if origin == self.me {
            return Ok(());
        }
        if let Some(snapshot) = &hello.snapshot {
            let correct = snapshot.is_correct(&self.validator_set.read());
            if !correct {
                log::warn!("{} dropping hello with unverifiable snapshot from {}", self.me, origin);
                return Ok(());
            }
        }
        let claimed = hello.snapshot.as_ref().map(Snapshot::sequence);

        if self.state != State::Sync && claimed.is_some_and(|sequence| sequence >= self.view.sequence) {
            self.enter_sync()?;
        }

        if self.state == State::Sync {
            if let Some(sync) = self.sync.as_mut() {
                sync.add_claim(origin, hello.snapshot);
            }
            return self.check_sync_complete();
        }

        // A syncing peer needs an answer even if there is nothing newer to offer, so that it can stop
        // waiting for claims.
        let latest = self.checkpoint_store.latest();
        if hello.syncing || latest.as_ref().map(Snapshot::sequence) > claimed {
            self.sender.send(
                origin,
                Hello {
                    snapshot: latest,
                    syncing: false,
                },
            );
        }
        Ok(())
    }

    fn check_sync_complete(&mut self) -> Result<(), CoreError> {
        let required = required_claims(self.validator_set.read().len());
        if self.sync.as_ref().is_some_and(|sync| sync.claim_count() >= required) {
            self.end_sync()?;
        }
        Ok(())
    }

    /// Adopt the best verified claim if it is ahead of local state, and resume at the next sequence.
    fn end_sync(&mut self) -> Result<(), CoreError> {
        let Some(sync) = self.sync.take() else {
            return Ok(());
        };

        if let Some(best) = sync.best().filter(|best| best.sequence() > self.head.sequence) {
            let sequence = best.sequence();
            self.head = ChainHead {
                sequence,
                hash: best.digest(),
            };
            match self.checkpoint_store.append(best.clone()) {
                Ok(()) | Err(CheckpointError::OutOfOrder { .. }) => (),
                Err(err) => return Err(err.into()),
            }
            self.prune_checkpoint_state(sequence);
            self.buffer.prune_up_to(sequence);
            self.settle_requests(None);
            // Queued requests may have been decided in the skipped sequences. Validators that kept
            // deciding still hold the ones that were not.
            let dropped = mem::take(&mut self.pending).len();
            log::info!(
                "{} adopted checkpoint {}, dropping {} queued requests",
                self.me,
                sequence,
                dropped
            );
        }

        let resume_at = self.head.sequence + 1;
        Event::EndSync(EndSyncEvent {
            timestamp: SystemTime::now(),
            sequence: resume_at,
            claims: sync.claim_count(),
        })
        .publish(&self.event_publisher);
        self.start_sequence(resume_at)
    }

    /* ↓↓↓ Roles ↓↓↓ */

    fn proposer(&self, view: &View) -> Option<Address> {
        proposer(view, &self.validator_set.read())
    }

    fn is_proposer(&self, validator: &Address, view: &View) -> bool {
        is_proposer(validator, view, &self.validator_set.read())
    }
}

/// Errors that stop the state machine. After one of these, the replica no longer takes part in
/// consensus.
#[derive(Debug)]
pub enum CoreError {
    /// The backend failed to persist a committed block.
    Backend(BackendError),
    /// The checkpoint store failed to persist a stable snapshot.
    Checkpoint(CheckpointError),
}

impl From<BackendError> for CoreError {
    fn from(value: BackendError) -> Self {
        CoreError::Backend(value)
    }
}

impl From<CheckpointError> for CoreError {
    fn from(value: CheckpointError) -> Self {
        CoreError::Checkpoint(value)
    }
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Backend(err) => write!(f, "{}", err),
            CoreError::Checkpoint(err) => write!(f, "checkpoint store failure: {}", err),
        }
    }
}
