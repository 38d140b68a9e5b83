/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The pluggable peer-to-peer transport.

use crate::types::{data_types::Address, validator_set::ValidatorSet};

/// The interface that PBFT-rs consumes to exchange encoded [envelopes](super::messages::Envelope) with
/// peers.
///
/// The transport carries opaque bytes. Framing, connection handshakes and peer discovery are its
/// own business. Every message PBFT-rs hands to the network is a complete, signed envelope, and every
/// message it receives is authenticated before it can affect consensus, so the transport does not
/// need to authenticate peers itself.
pub trait Network: Clone + Send {
    /// Inform the network provider of the validator set on wake-up.
    fn init_validator_set(&mut self, validator_set: ValidatorSet);

    /// Send `message` to all peers without blocking. The message does not have to be delivered back to
    /// the sender.
    fn broadcast(&mut self, message: Vec<u8>);

    /// Send `message` to the peer identified by `peer` without blocking.
    fn send(&mut self, peer: Address, message: Vec<u8>);

    /// Receive a message from any peer. Returns immediately with a `None` if no message is available
    /// now.
    fn recv(&mut self) -> Option<(Address, Vec<u8>)>;
}
