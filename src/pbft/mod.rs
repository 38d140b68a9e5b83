/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Subprotocol for agreeing on, and committing, one proposal per sequence.
//!
//! ## Normal case operation
//!
//! Every sequence starts in view 0. A round of the protocol at a given [`View`](crate::types::data_types::View)
//! proceeds through three phases:
//! 1. **Preprepare**: the view's [proposer](roles::proposer) wraps a pending request into a
//!    [`Proposal`](crate::types::proposal::Proposal) and broadcasts a [`Preprepare`](messages::Preprepare)
//!    binding it to the view. Every validator (including the proposer) that accepts it broadcasts a
//!    Prepare vote for the proposal's digest.
//! 2. **Prepare**: once a validator has collected a quorum (`2f+1`) of matching Prepare votes, it holds
//!    a *prepared certificate* for the digest. It then broadcasts a Commit vote.
//! 3. **Commit**: once a validator has collected a quorum of matching Commit votes, the proposal is
//!    final. The validator hands it to the [`Backend`](crate::backend::Backend), moves on to the next
//!    sequence, and starts again from view 0.
//!
//! Every `checkpoint_interval` sequences, validators additionally exchange Checkpoint votes to form
//! a [stable checkpoint](crate::checkpoint).
//!
//! ## Leaving the normal case
//!
//! If a round does not make progress before the view timer fires, or the proposer is caught
//! equivocating, validators move to the [view change](crate::view_change) sub-protocol. If a validator
//! finds out that it has fallen behind the rest, it moves to [sync](crate::checkpoint::sync).
//!
//! The state machine implementing all of the above is [`Core`](implementation::Core).

pub mod messages;

pub mod types;

pub(crate) mod implementation;

pub mod roles;
