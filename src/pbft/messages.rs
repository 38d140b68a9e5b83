/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages exchanged in the normal-case phases of the protocol.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    data_types::{CryptoHash, View},
    proposal::Proposal,
};

/// An opaque payload that the proposer of the current view should wrap into a proposal.
///
/// Requests submitted locally through [`Replica::submit_request`](crate::replica::Replica::submit_request)
/// are relayed to every other validator in this form, so that whichever validator becomes proposer can
/// propose them.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Request {
    pub payload: Vec<u8>,
}

/// The proposer's binding of `view` to `proposal`. At most one is accepted per view.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Preprepare {
    pub view: View,
    pub proposal: Proposal,
}

impl Preprepare {
    /// The subject that Prepare and Commit votes for this preprepare carry.
    pub fn subject(&self) -> Subject {
        Subject {
            view: self.view,
            digest: self.proposal.digest(),
        }
    }
}

/// A vote for the proposal with `digest` at `view`. Carried by Prepare, Commit, and Checkpoint messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct Subject {
    pub view: View,
    pub digest: CryptoHash,
}
