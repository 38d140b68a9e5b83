/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a replica.
//!
//! PBFT-rs agrees on one block per sequence among a fixed set of validators, tolerating up to `f`
//! Byzantine validators out of `3f+1`. Each validator is uniquely identified by an
//! [Ed25519 public key](ed25519_dalek::VerifyingKey), and addressed by the
//! [20-byte address](crate::types::data_types::Address) derived from it.
//!
//! They key components of this module are:
//! - The builder-pattern interface to construct a [specification of the replica](ReplicaSpec) with:
//!   1. `ReplicaSpec::builder` to construct a `ReplicaSpecBuilder`,
//!   2. The setters of the `ReplicaSpecBuilder`, and
//!   3. The `ReplicaSpecBuilder::build` method to construct a [ReplicaSpec],
//! - The function to [start](ReplicaSpec::start) a [Replica] given its specification,
//! - [The type](Replica) which keeps the replica alive, and through which requests are submitted.
//!
//! ## Starting a replica
//!
//! Here is an example that demonstrates how to build and start running a replica using the builder pattern:
//!
//! ```ignore
//! let replica =
//!     ReplicaSpec::builder()
//!     .backend(backend)
//!     .network(network)
//!     .kv_store(kv_store)
//!     .validator_set(validator_set)
//!     .configuration(configuration)
//!     .on_final_committed(final_committed_handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! ### Required setters
//!
//! The required setters are for providing the trait implementations and the initial state required to
//! run a replica:
//! - `.backend(...)`
//! - `.network(...)`
//! - `.kv_store(...)`
//! - `.validator_set(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! The optional setters are for registering user-defined event handlers for events from [crate::events]:
//! - `.on_request(...)`
//! - `.on_receive_message(...)`
//! - `.on_consensus_data(...)`
//! - `.on_accept_preprepare(...)`
//! - `.on_prepared(...)`
//! - `.on_final_committed(...)`
//! - `.on_new_committed(...)`
//! - `.on_start_view_change(...)`
//! - `.on_enter_new_view(...)`
//! - `.on_equivocation(...)`
//! - `.on_stable_checkpoint(...)`
//! - `.on_start_sync(...)`
//! - `.on_end_sync(...)`
//!
//! The replica's [configuration](Configuration) can also be defined using the builder pattern, for example:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .me(keypair)
//!     .request_timeout(Duration::from_secs(2))
//!     .max_view_timeout(Duration::from_secs(60))
//!     .sync_timeout(Duration::from_secs(5))
//!     .checkpoint_interval(10)
//!     .checkpoint_retention(3)
//!     .progress_msg_buffer_capacity(BufferSize::new(1024 * 1024))
//!     .verifier_threads(2)
//!     .inbound_queue_capacity(4096)
//!     .sync_on_start(true)
//!     .log_events(true)
//!     .build()
//! ```
//!
//! ## Proposing
//!
//! Blocks are proposed in one of two ways:
//! 1. [`Replica::seal`] asks this replica to propose a payload in the current round and blocks until
//!    the round ends. It fails immediately if this replica is not the round's proposer.
//! 2. [`Replica::submit_request`] hands a payload to every validator, so that whichever validator is
//!    the proposer when it gets its turn can propose it.

use std::{
    fmt::{self, Display, Formatter},
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError, TrySendError},
    thread::JoinHandle,
    time::Duration,
};

use ed25519_dalek::{SigningKey, VerifyingKey};
use typed_builder::TypedBuilder;

use crate::{
    algorithm::{Algorithm, Input},
    backend::Backend,
    checkpoint::{pluggables::KVStore, store::CheckpointStore},
    event_bus::*,
    events::*,
    networking::{
        network::Network,
        receiving::{start_polling, start_verifiers},
    },
    pbft::implementation::{Core, CoreConfiguration, CoreError},
    types::{
        crypto_primitives::{address_of, Keypair},
        data_types::{Address, BufferSize},
        proposal::Proposal,
        validator_set::{SharedValidatorSet, ValidatorSet},
    },
};

/// How often a blocked [`seal`](Replica::seal) call checks its stop signal.
const SEAL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Stores the user-defined parameters required to start the replica, that is:
/// 1. The replica's [keypair](ed25519_dalek::SigningKey).
/// 2. The request timeout, which is the view timeout of view 0 of every sequence.
/// 3. The maximum view timeout. The view timeout doubles with every view change within a sequence,
///    up to this value.
/// 4. The sync timeout, which bounds how long the replica waits for its peers' checkpoint claims when
///    syncing.
/// 5. The checkpoint interval. Every sequence that is a multiple of it is checkpointed. 0 disables
///    checkpointing.
/// 6. The checkpoint retention, which is how many stable snapshots are kept.
/// 7. The progress message buffer capacity, which defines the maximum allowed capacity of the buffer
///    for messages from future rounds. If this capacity is about to be exceeded, messages for the
///    highest views are removed to make space for new messages.
/// 8. The number of verifier threads, which decode and authenticate inbound messages in parallel.
/// 9. The inbound queue capacity, which is how many raw inbound messages may wait for a verifier
///    before new ones are dropped.
/// 10. The "Sync on Start" flag, if set to "true" the replica asks its peers for their latest
///     checkpoint before taking part in consensus.
/// 11. The "Log Events" flag, if set to "true" then logs should be printed.
///
/// ## Timeouts
///
/// Durations stored in [Configuration::request_timeout] and [Configuration::max_view_timeout] must be
/// "well below" [u64::MAX] seconds. A good limit is to cap them at [u32::MAX].
///
/// ## Log Events
///
/// PBFT-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.request_timeout(...)`
    - `.max_view_timeout(...)`
    - `.sync_timeout(...)`
    - `.checkpoint_interval(...)`
    - `.checkpoint_retention(...)`
    - `.progress_msg_buffer_capacity(...)`
    - `.log_events(...)`

    Optional:
    - `.verifier_threads(...)`
    - `.inbound_queue_capacity(...)`
    - `.max_pending_requests(...)`
    - `.sync_on_start(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the replica's keypair, used to sign messages. Required."))]
    pub me: SigningKey,
    #[builder(setter(doc = "Set the view timeout of view 0 of every sequence. Required."))]
    pub request_timeout: Duration,
    #[builder(setter(doc = "Set the maximum view timeout. Required."))]
    pub max_view_timeout: Duration,
    #[builder(setter(doc = "Set how long the replica waits for checkpoint claims when syncing. Required."))]
    pub sync_timeout: Duration,
    #[builder(setter(doc = "Set the interval between checkpointed sequences. 0 disables checkpointing. Required."))]
    pub checkpoint_interval: u64,
    #[builder(setter(doc = "Set the number of stable snapshots that are kept. Required."))]
    pub checkpoint_retention: usize,
    #[builder(setter(doc = "Set the maximum number of bytes that can be stored in the replica's message buffer at any given moment. Required."))]
    pub progress_msg_buffer_capacity: BufferSize,
    #[builder(default = 2, setter(doc = "Set the number of threads that verify inbound messages. Defaults to 2."))]
    pub verifier_threads: usize,
    #[builder(default = 4096, setter(doc = "Set the number of raw inbound messages that may wait for verification. Defaults to 4096."))]
    pub inbound_queue_capacity: usize,
    #[builder(default = 1024, setter(doc = "Set the number of requests that may wait to be proposed. Further requests are dropped. Defaults to 1024."))]
    pub max_pending_requests: usize,
    #[builder(default = false, setter(doc = "Sync with peers before taking part in consensus? Defaults to false."))]
    pub sync_on_start: bool,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

/// Stores all necessary parameters and trait implementations required to run the [Replica].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ReplicaSpec]. On the builder call the following methods to construct a valid [ReplicaSpec].

    Required:
    - `.backend(...)`
    - `.network(...)`
    - `.kv_store(...)`
    - `.validator_set(...)`
    - `.configuration(...)`

    Optional:
    - `.on_request(...)`
    - `.on_receive_message(...)`
    - `.on_consensus_data(...)`
    - `.on_accept_preprepare(...)`
    - `.on_prepared(...)`
    - `.on_final_committed(...)`
    - `.on_new_committed(...)`
    - `.on_start_view_change(...)`
    - `.on_enter_new_view(...)`
    - `.on_equivocation(...)`
    - `.on_stable_checkpoint(...)`
    - `.on_start_sync(...)`
    - `.on_end_sync(...)`
"))]
pub struct ReplicaSpec<B: Backend, N: Network + 'static, K: KVStore> {
    // Required parameters
    #[builder(setter(doc = "Set the chain backend that blocks are validated against and persisted to. The argument must implement the [Backend](crate::backend::Backend) trait. Required."))]
    backend: B,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::network::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the implementation of the replica's Key-Value store, in which stable checkpoints are persisted. The argument must implement the [KVStore](crate::checkpoint::pluggables::KVStore) trait. Required."))]
    kv_store: K,
    #[builder(setter(doc = "Set the validator set. Required."))]
    validator_set: ValidatorSet,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a replica. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&RequestEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RequestEvent>),
    doc = "Register a handler closure to be invoked after the replica queues a request to be proposed. Optional."))]
    on_request: Option<HandlerPtr<RequestEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveMessageEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveMessageEvent>),
    doc = "Register a handler closure to be invoked after the replica authenticates an inbound message. Optional."))]
    on_receive_message: Option<HandlerPtr<ReceiveMessageEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ConsensusDataEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ConsensusDataEvent>),
    doc = "Register a handler closure to be invoked after the replica sends or broadcasts a message. Optional."))]
    on_consensus_data: Option<HandlerPtr<ConsensusDataEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&AcceptPreprepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<AcceptPreprepareEvent>),
    doc = "Register a handler closure to be invoked after the replica accepts a proposal. Optional."))]
    on_accept_preprepare: Option<HandlerPtr<AcceptPreprepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PreparedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PreparedEvent>),
    doc = "Register a handler closure to be invoked after the replica collects a quorum of Prepare votes. Optional."))]
    on_prepared: Option<HandlerPtr<PreparedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&FinalCommittedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FinalCommittedEvent>),
    doc = "Register a handler closure to be invoked after the replica commits a block. Optional."))]
    on_final_committed: Option<HandlerPtr<FinalCommittedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewCommittedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewCommittedEvent>),
    doc = "Register a handler closure to be invoked after the replica commits a block proposed by another validator. Optional."))]
    on_new_committed: Option<HandlerPtr<NewCommittedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartViewChangeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartViewChangeEvent>),
    doc = "Register a handler closure to be invoked after the replica asks to change views. Optional."))]
    on_start_view_change: Option<HandlerPtr<StartViewChangeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EnterNewViewEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EnterNewViewEvent>),
    doc = "Register a handler closure to be invoked after the replica enters a new view. Optional."))]
    on_enter_new_view: Option<HandlerPtr<EnterNewViewEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EquivocationEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EquivocationEvent>),
    doc = "Register a handler closure to be invoked after the replica catches a validator equivocating. Optional."))]
    on_equivocation: Option<HandlerPtr<EquivocationEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StableCheckpointEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StableCheckpointEvent>),
    doc = "Register a handler closure to be invoked after the replica persists a stable checkpoint. Optional."))]
    on_stable_checkpoint: Option<HandlerPtr<StableCheckpointEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartSyncEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartSyncEvent>),
    doc = "Register a handler closure to be invoked after the replica starts syncing with its peers. Optional."))]
    on_start_sync: Option<HandlerPtr<StartSyncEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EndSyncEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EndSyncEvent>),
    doc = "Register a handler closure to be invoked after the replica finishes syncing with its peers. Optional."))]
    on_end_sync: Option<HandlerPtr<EndSyncEvent>>,
}

impl<B: Backend, N: Network + 'static, K: KVStore> ReplicaSpec<B, N, K> {
    /// Starts all threads and channels associated with running a replica, and returns the handles to
    /// them in a [Replica] struct.
    ///
    /// Fails if the checkpoint history persisted in the key-value store cannot be read back.
    pub fn start(mut self) -> Result<Replica<K>, CoreError> {
        let config = self.configuration;
        let keypair = Keypair::new(config.me);
        let address = keypair.address();

        let checkpoint_store = CheckpointStore::open(self.kv_store, config.checkpoint_retention)?;
        self.network.init_validator_set(self.validator_set.clone());
        let validator_set = SharedValidatorSet::new(self.validator_set);

        let event_handlers = EventHandlers::new(
            config.log_events,
            self.on_request,
            self.on_receive_message,
            self.on_consensus_data,
            self.on_accept_preprepare,
            self.on_prepared,
            self.on_final_committed,
            self.on_new_committed,
            self.on_start_view_change,
            self.on_enter_new_view,
            self.on_equivocation,
            self.on_stable_checkpoint,
            self.on_start_sync,
            self.on_end_sync,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let (event_bus, event_bus_shutdown) = match event_subscriber {
            Some(event_subscriber) => {
                let (shutdown, shutdown_receiver) = mpsc::channel();
                (
                    Some(start_event_bus(event_handlers, event_subscriber, shutdown_receiver)),
                    Some(shutdown),
                )
            }
            None => (None, None),
        };

        let (inputs, input_receiver) = mpsc::channel();
        let (raw_messages, raw_message_receiver) = mpsc::sync_channel(config.inbound_queue_capacity);
        let verifiers = start_verifiers(
            config.verifier_threads,
            raw_message_receiver,
            validator_set.clone(),
            inputs.clone(),
            event_publisher.clone(),
        );

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let poller = start_polling(self.network.clone(), raw_messages.clone(), poller_shutdown_receiver);

        let core = Core::new(
            CoreConfiguration {
                keypair,
                request_timeout: config.request_timeout,
                max_view_timeout: config.max_view_timeout,
                sync_timeout: config.sync_timeout,
                checkpoint_interval: config.checkpoint_interval,
                checkpoint_retention: config.checkpoint_retention,
                progress_msg_buffer_capacity: config.progress_msg_buffer_capacity,
                max_pending_requests: config.max_pending_requests,
                sync_on_start: config.sync_on_start,
            },
            self.backend,
            checkpoint_store.clone(),
            validator_set.clone(),
            self.network,
            event_publisher,
        );
        let (algorithm_shutdown, algorithm_shutdown_receiver) = mpsc::channel();
        let algorithm = Algorithm::new(core, input_receiver, algorithm_shutdown_receiver).start();

        Ok(Replica {
            address,
            checkpoint_store,
            validator_set,
            inputs,
            raw_messages: Some(raw_messages),
            algorithm: Some(algorithm),
            algorithm_shutdown,
            poller: Some(poller),
            poller_shutdown,
            verifiers,
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// A handle to the background threads of a PBFT-rs replica. When this value is dropped, all background
/// threads are gracefully shut down.
pub struct Replica<K: KVStore> {
    address: Address,
    checkpoint_store: CheckpointStore<K>,
    validator_set: SharedValidatorSet,
    inputs: Sender<Input>,
    raw_messages: Option<SyncSender<(Address, Vec<u8>)>>,
    algorithm: Option<JoinHandle<()>>,
    algorithm_shutdown: Sender<()>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    verifiers: Vec<JoinHandle<()>>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<K: KVStore> Replica<K> {
    /// Propose `payload` in the current round and wait for the round to end.
    ///
    /// Returns the finalized proposal, with its commit seals, once it commits.
    ///
    /// # Errors
    ///
    /// - [`SealError::NotProposer`] if this replica is not the proposer of the current round.
    /// - [`SealError::RoundAbandoned`] if the round ended without committing `payload`.
    /// - [`SealError::Rejected`] if this replica's backend considers `payload` invalid.
    /// - [`SealError::Stopped`] if a value is sent on `stop`, or its sender is dropped.
    /// - [`SealError::Halted`] if the replica stopped taking part in consensus.
    pub fn seal(&self, payload: Vec<u8>, stop: &Receiver<()>) -> Result<Proposal, SealError> {
        let (reply, result) = mpsc::channel();
        self.inputs
            .send(Input::Request {
                payload,
                reply: Some(reply),
            })
            .map_err(|_| SealError::Halted)?;

        loop {
            match result.recv_timeout(SEAL_POLL_INTERVAL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return Err(SealError::Halted),
            }
            match stop.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return Err(SealError::Stopped),
                Err(TryRecvError::Empty) => (),
            }
        }
    }

    /// Hand `payload` to every validator to be proposed by whichever validator's turn comes first.
    ///
    /// Once [`max_pending_requests`](Configuration::max_pending_requests) requests are waiting, further
    /// payloads are still relayed to the other validators but no longer queued here.
    ///
    /// Returns `false` if the replica stopped taking part in consensus.
    pub fn submit_request(&self, payload: Vec<u8>) -> bool {
        self.inputs
            .send(Input::Request {
                payload,
                reply: None,
            })
            .is_ok()
    }

    /// Feed bytes received from `peer` by a transport other than the replica's [`Network`].
    ///
    /// Returns `false` if the bytes were dropped because the inbound queue is full.
    pub fn handle_msg(&self, peer: Address, bytes: Vec<u8>) -> bool {
        match &self.raw_messages {
            Some(raw_messages) => match raw_messages.try_send((peer, bytes)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::warn!("inbound queue is full, dropping message from {}", peer);
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
            None => false,
        }
    }

    /// Tell the replica that the validator with `verifying_key` is connected, so that it can be brought
    /// up to date with this replica's latest checkpoint.
    ///
    /// Returns `false` if `verifying_key` does not belong to a validator.
    pub fn add_peer(&self, verifying_key: &VerifyingKey) -> bool {
        let peer = address_of(verifying_key);
        if peer == self.address || !self.validator_set.read().contains(&peer) {
            return false;
        }
        self.inputs.send(Input::PeerConnected(peer)).is_ok()
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn validator_set(&self) -> &SharedValidatorSet {
        &self.validator_set
    }

    /// Returns the replica's [checkpoint store](crate::checkpoint::store::CheckpointStore), which can be
    /// used to read its stable snapshots.
    pub fn checkpoint_store(&self) -> &CheckpointStore<K> {
        &self.checkpoint_store
    }
}

impl<K: KVStore> Drop for Replica<K> {
    fn drop(&mut self) {
        // The order matters. The algorithm thread stops first so that no more votes are accepted. The
        // verifiers exit once every sender of the raw queue is gone, which includes the poller's. The
        // event bus stops last, so events published before shutdown are still delivered.
        let _ = self.algorithm_shutdown.send(());
        if let Some(algorithm) = self.algorithm.take() {
            let _ = algorithm.join();
        }

        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }

        self.raw_messages = None;
        self.verifiers.drain(..).for_each(|verifier| {
            let _ = verifier.join();
        });

        self.event_bus_shutdown.iter().for_each(|shutdown| {
            let _ = shutdown.send(());
        });
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }
    }
}

/// Reasons why [`Replica::seal`] did not return a finalized proposal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SealError {
    /// This replica is not the proposer of the current round.
    NotProposer,
    /// The round ended without committing the sealed payload.
    RoundAbandoned,
    /// The backend considers the payload invalid.
    Rejected,
    /// The caller's stop signal fired.
    Stopped,
    /// The replica stopped taking part in consensus after a fatal error.
    Halted,
}

impl Display for SealError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SealError::NotProposer => write!(f, "this replica is not the proposer of the current round"),
            SealError::RoundAbandoned => write!(f, "the round ended without committing the payload"),
            SealError::Rejected => write!(f, "the backend rejected the payload"),
            SealError::Stopped => write!(f, "stopped"),
            SealError::Halted => write!(f, "the replica has halted"),
        }
    }
}
