/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of the PBFT/Istanbul Byzantine fault tolerant consensus core.
//!
//! A PBFT-rs [replica](replica) drives a fixed set of validators through a per-sequence, per-view
//! protocol (preprepare, prepare, commit) to agree on the next block to append to a shared chain,
//! tolerating up to `f` faulty validators out of `3f+1`. Liveness is recovered through the
//! [view change](view_change) sub-protocol, and lagging validators catch up using quorum-certified
//! [checkpoints](checkpoint).
//!
//! ## Pluggables
//!
//! Library users plug three things into a replica:
//! 1. A [`Backend`](backend::Backend) that validates proposals and persists finalized blocks.
//! 2. A [`Network`](networking::network::Network) that carries signed envelopes between validators.
//! 3. A [`KVStore`](checkpoint::pluggables::KVStore) that persists stable checkpoints.

pub mod backend;

pub mod checkpoint;

pub mod events;

pub mod networking;

pub mod pbft;

pub mod replica;

pub mod types;

pub mod view_change;

pub(crate) mod algorithm;

pub(crate) mod event_bus;

pub(crate) mod logging;
