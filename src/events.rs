/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events that a PBFT-rs replica emits.
//!
//! An event for a given action is emitted after the action has completed. Events are delivered to
//! user-registered handlers (see [`ReplicaSpec`](crate::replica::ReplicaSpec)) on a dedicated event bus
//! thread, so a slow handler never blocks consensus. If `log_events` is set in the replica's
//! [configuration](crate::replica::Configuration), every event is also [logged](crate::logging).
//!
//! The variants fall into four groups:
//! 1. Traffic: [`Request`], [`ReceiveMessage`], and [`ConsensusData`].
//! 2. Progress within a sequence: [`AcceptPreprepare`], [`Prepared`], [`FinalCommitted`], and
//!    [`NewCommitted`].
//! 3. Recovery: [`StartViewChange`], [`EnterNewView`], and [`Equivocation`].
//! 4. Checkpointing and sync: [`StableCheckpoint`], [`StartSync`], and [`EndSync`].
//!
//! [`Request`]: RequestEvent
//! [`ReceiveMessage`]: ReceiveMessageEvent
//! [`ConsensusData`]: ConsensusDataEvent
//! [`AcceptPreprepare`]: AcceptPreprepareEvent
//! [`Prepared`]: PreparedEvent
//! [`FinalCommitted`]: FinalCommittedEvent
//! [`NewCommitted`]: NewCommittedEvent
//! [`StartViewChange`]: StartViewChangeEvent
//! [`EnterNewView`]: EnterNewViewEvent
//! [`Equivocation`]: EquivocationEvent
//! [`StableCheckpoint`]: StableCheckpointEvent
//! [`StartSync`]: StartSyncEvent
//! [`EndSync`]: EndSyncEvent

use std::{sync::mpsc::Sender, time::SystemTime};

use crate::{
    networking::messages::MessageCode,
    types::{
        data_types::{Address, CryptoHash, SequenceNumber, View},
        proposal::Proposal,
    },
};

/// Enumerates all events defined for PBFT-rs.
pub enum Event {
    // Traffic.
    Request(RequestEvent),
    ReceiveMessage(ReceiveMessageEvent),
    ConsensusData(ConsensusDataEvent),
    // Progress within a sequence.
    AcceptPreprepare(AcceptPreprepareEvent),
    Prepared(PreparedEvent),
    FinalCommitted(FinalCommittedEvent),
    NewCommitted(NewCommittedEvent),
    // Recovery.
    StartViewChange(StartViewChangeEvent),
    EnterNewView(EnterNewViewEvent),
    Equivocation(EquivocationEvent),
    // Checkpointing and sync.
    StableCheckpoint(StableCheckpointEvent),
    StartSync(StartSyncEvent),
    EndSync(EndSyncEvent),
}

impl Event {
    /// Publish this event on `event_publisher`, if there is one.
    ///
    /// Events are best-effort: an event bus that has already shut down is not an error.
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// A request was queued to be proposed, either by the local application or by a peer.
pub struct RequestEvent {
    pub timestamp: SystemTime,
    pub payload: Vec<u8>,
}

/// An authenticated message was received from `origin`.
pub struct ReceiveMessageEvent {
    pub timestamp: SystemTime,
    pub origin: Address,
    pub code: MessageCode,
    pub data: Vec<u8>,
}

/// An encoded envelope was handed to the network. `targets` is `None` for a broadcast.
pub struct ConsensusDataEvent {
    pub timestamp: SystemTime,
    pub targets: Option<Vec<Address>>,
    pub data: Vec<u8>,
}

/// The replica accepted a preprepare from the proposer of `view` and voted Prepare for it.
pub struct AcceptPreprepareEvent {
    pub timestamp: SystemTime,
    pub origin: Address,
    pub view: View,
    pub digest: CryptoHash,
}

/// The replica collected a quorum of Prepare votes for `digest` in `view`.
pub struct PreparedEvent {
    pub timestamp: SystemTime,
    pub view: View,
    pub digest: CryptoHash,
}

/// A proposal was committed and inserted into the backend. `proposal.signatures` carries its commit
/// seals.
pub struct FinalCommittedEvent {
    pub timestamp: SystemTime,
    pub proposal: Proposal,
    pub proposer: Address,
    pub view: View,
}

/// A proposal made by another validator was committed.
pub struct NewCommittedEvent {
    pub timestamp: SystemTime,
    pub proposal: Proposal,
}

/// Why a replica asked to move to a new view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewChangeCause {
    /// The round timer expired.
    Timeout,
    /// The proposer sent two different preprepares for the same view.
    Equivocation,
    /// A quorum of other validators already asked for the target view.
    Quorum,
}

/// The replica broadcast a `ViewChange` for `target`.
pub struct StartViewChangeEvent {
    pub timestamp: SystemTime,
    pub target: View,
    pub cause: ViewChangeCause,
}

/// The replica installed a verified `NewView` for `view`. `carried` is the digest of the proposal
/// carried forward into the new view, if any.
pub struct EnterNewViewEvent {
    pub timestamp: SystemTime,
    pub view: View,
    pub carried: Option<CryptoHash>,
}

/// `offender` signed two different digests, `first` and `second`, for the same slot in `view`.
pub struct EquivocationEvent {
    pub timestamp: SystemTime,
    pub offender: Address,
    pub view: View,
    pub first: CryptoHash,
    pub second: CryptoHash,
}

/// A checkpoint certificate for `sequence` was formed and its snapshot persisted.
pub struct StableCheckpointEvent {
    pub timestamp: SystemTime,
    pub sequence: SequenceNumber,
    pub digest: CryptoHash,
}

/// The replica stopped taking part in rounds to catch up. `sequence` is the sequence it was deciding.
pub struct StartSyncEvent {
    pub timestamp: SystemTime,
    pub sequence: SequenceNumber,
}

/// The replica finished catching up and resumed rounds at `sequence`, after hearing from `claims`
/// distinct peers.
pub struct EndSyncEvent {
    pub timestamp: SystemTime,
    pub sequence: SequenceNumber,
    pub claims: usize,
}
