/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The candidate unit of agreement.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::pbft::{
    messages::Subject,
    types::{QuorumCertificate, VotePhase},
};

use super::{
    crypto_primitives::{canonical_bytes, hash},
    data_types::{CryptoHash, SequenceNumber, View, ViewNumber},
    signed_messages::Seal,
    validator_set::ValidatorSet,
};

/// Commits a proposal to its position in the chain and to its payload.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ProposalHeader {
    pub sequence: SequenceNumber,
    pub parent_hash: CryptoHash,
    pub data_hash: CryptoHash,
}

/// A proposal for the next block in the chain.
///
/// ## Digest
///
/// A proposal is identified throughout the protocol by its [`digest`](Self::digest), which is the
/// SHA256 hash of its header only. In particular, filling in `signatures` once the proposal is
/// finalized does not change its digest.
///
/// ## Signatures
///
/// `signatures` is empty while the proposal is being agreed on. When the proposal commits, it is
/// filled with the seals of the commit quorum, which can be checked with
/// [`verify_seals`](Self::verify_seals).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Proposal {
    pub header: ProposalHeader,
    pub payload: Vec<u8>,
    pub signatures: Vec<Seal>,
}

impl Proposal {
    /// Create an unsealed proposal at `sequence` that extends `parent_hash` with `payload`.
    pub fn new(sequence: SequenceNumber, parent_hash: CryptoHash, payload: Vec<u8>) -> Proposal {
        Proposal {
            header: ProposalHeader {
                sequence,
                parent_hash,
                data_hash: hash(&payload),
            },
            payload,
            signatures: Vec::new(),
        }
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.header.sequence
    }

    /// Get the digest that identifies this proposal.
    pub fn digest(&self) -> CryptoHash {
        hash(&canonical_bytes(&self.header))
    }

    /// Check that the header's data hash commits to the payload.
    pub fn is_correct(&self) -> bool {
        hash(&self.payload) == self.header.data_hash
    }

    /// Check that this proposal directly extends the block identified by `parent_hash`.
    pub fn extends(&self, parent_hash: &CryptoHash) -> bool {
        self.header.parent_hash == *parent_hash
    }

    /// Check that `signatures` contains a quorum of correct commit seals for this proposal, produced at
    /// `view_number`.
    pub fn verify_seals(&self, view_number: ViewNumber, validator_set: &ValidatorSet) -> bool {
        QuorumCertificate {
            phase: VotePhase::Commit,
            subject: Subject {
                view: View::new(view_number, self.sequence()),
                digest: self.digest(),
            },
            seals: self.signatures.clone(),
        }
        .is_correct(validator_set)
    }
}
