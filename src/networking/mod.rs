/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable peer-to-peer (P2P) networking, and the wire format of every message.
//!
//! Inbound bytes flow through three stages before they reach the state machine:
//! 1. A poller thread drains the [`Network`](network::Network) into a bounded raw queue.
//! 2. A pool of verifier threads decodes and authenticates envelopes from the raw queue in parallel.
//! 3. Verified messages are handed, in the order verification finishes, to the single algorithm
//!    thread.

pub mod messages;

pub mod network;

pub(crate) mod receiving;

pub(crate) mod sending;
