/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable chain backend.
//!
//! The backend is the blockchain and storage layer that PBFT-rs agrees on blocks for. It is consulted
//! for three things:
//! 1. The [`head`](Backend::head) of the chain, which decides what sequence the replica resumes
//!    consensus at on start-up and which parent new proposals must extend.
//! 2. Whether a proposal's payload is [valid](Backend::validate) in the context of the chain.
//!    Validators that find a proposal invalid do not vote for it.
//! 3. [Persisting](Backend::insert_block) every finalized block, in sequence order.
//!
//! ## Fatal errors
//!
//! An error returned from `insert_block` means the replica can no longer keep its chain in step with
//! the rest of the validator set. The replica stops participating in consensus when this happens. It
//! does not retry or continue in a possibly-unsafe state.

use std::fmt::{self, Display, Formatter};

use crate::types::{
    data_types::{CryptoHash, SequenceNumber},
    proposal::Proposal,
};

pub trait Backend: Send + 'static {
    /// Get the sequence and digest of the latest persisted block. For a fresh chain, this is the genesis
    /// block at sequence 0.
    fn head(&self) -> ChainHead;

    /// Decide whether `proposal` may be voted for.
    ///
    /// Called only after PBFT-rs has checked that the proposal extends the current chain head and that
    /// its data hash commits to its payload.
    fn validate(&mut self, proposal: &Proposal) -> bool;

    /// Persist `proposal`, which has been finalized together with the commit seals in its
    /// `signatures` field.
    fn insert_block(&mut self, proposal: &Proposal) -> Result<(), BackendError>;
}

/// The position of the latest block in the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainHead {
    pub sequence: SequenceNumber,
    pub hash: CryptoHash,
}

impl ChainHead {
    /// The head of a chain that only contains the genesis block.
    pub const fn genesis() -> Self {
        Self {
            sequence: SequenceNumber::new(0),
            hash: CryptoHash::new([0u8; 32]),
        }
    }
}

/// Error returned by a [`Backend`] that cannot persist a finalized block.
#[derive(Debug)]
pub struct BackendError(pub String);

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "backend failure: {}", self.0)
    }
}
