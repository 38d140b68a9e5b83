/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions and types for sending messages to the P2P network.

use std::{sync::mpsc::Sender, time::SystemTime};

use crate::{
    events::{ConsensusDataEvent, Event},
    types::{crypto_primitives::Keypair, data_types::Address},
};

use super::{
    messages::{Envelope, Message},
    network::Network,
};

/// Handle for sending and broadcasting messages to the [`Network`].
///
/// Every message is sealed with the replica's keypair before it leaves, and each transmission is
/// published as a [`ConsensusDataEvent`].
///
/// It can be used to send or broadcast instances of any type that implement the [`Into<Message>`]
/// trait.
#[derive(Clone)]
pub(crate) struct SenderHandle<N: Network> {
    network: N,
    keypair: Keypair,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(network: N, keypair: Keypair, event_publisher: Option<Sender<Event>>) -> Self {
        Self {
            network,
            keypair,
            event_publisher,
        }
    }

    pub(crate) fn address(&self) -> Address {
        self.keypair.address()
    }

    /// Seal `msg` and send it to `peer`. Returns the sealed envelope.
    pub(crate) fn send<S: Into<Message>>(&mut self, peer: Address, msg: S) -> Envelope {
        let envelope = Envelope::seal(&msg.into(), &self.keypair);
        let data = envelope.to_bytes();
        self.network.send(peer, data.clone());
        Event::ConsensusData(ConsensusDataEvent {
            timestamp: SystemTime::now(),
            targets: Some(vec![peer]),
            data,
        })
        .publish(&self.event_publisher);
        envelope
    }

    /// Seal `msg` and broadcast it to every peer. Returns the sealed envelope.
    pub(crate) fn broadcast<S: Into<Message>>(&mut self, msg: S) -> Envelope {
        let envelope = Envelope::seal(&msg.into(), &self.keypair);
        let data = envelope.to_bytes();
        self.network.broadcast(data.clone());
        Event::ConsensusData(ConsensusDataEvent {
            timestamp: SystemTime::now(),
            targets: None,
            data,
        })
        .publish(&self.event_publisher);
        envelope
    }
}
