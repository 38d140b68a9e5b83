/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Stable checkpoints, their persistence, and the peer sync handshake built on them.
//!
//! Every `checkpoint_interval` sequences, each validator broadcasts a Checkpoint vote for the proposal
//! it just committed. A quorum of matching votes makes the checkpoint *stable*: the validator records
//! a [`Snapshot`](store::Snapshot) in its [`CheckpointStore`](store::CheckpointStore), and may prune
//! older ones. Stable snapshots let lagging or restarting validators [sync](sync) back into consensus.

pub mod messages;

pub mod pluggables;

pub mod store;

pub mod sync;

pub(crate) mod types;
