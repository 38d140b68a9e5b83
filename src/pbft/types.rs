/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Vote bookkeeping: certificates, and the per-round accumulator that forms them.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::{self, Display, Formatter},
};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    networking::messages::{signing_bytes, MessageCode},
    types::{
        crypto_primitives::{canonical_bytes, verify},
        data_types::{Address, CryptoHash, SignatureBytes, View},
        signed_messages::Seal,
        validator_set::ValidatorSet,
    },
};

use super::messages::Subject;

/// The kinds of vote that can be aggregated into a [`QuorumCertificate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum VotePhase {
    Prepare,
    Commit,
    Checkpoint,
}

impl VotePhase {
    /// The message code that votes of this phase are sent with, and signed under.
    pub const fn code(self) -> MessageCode {
        match self {
            VotePhase::Prepare => MessageCode::Prepare,
            VotePhase::Commit => MessageCode::Commit,
            VotePhase::Checkpoint => MessageCode::Checkpoint,
        }
    }
}

impl Display for VotePhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Evidence that a quorum of validators voted for `subject` in `phase`.
///
/// Each seal is the signature that its signer put on the envelope of its vote, so the certificate can
/// be re-checked by anyone that knows the validator set.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct QuorumCertificate {
    pub phase: VotePhase,
    pub subject: Subject,
    pub seals: Vec<Seal>,
}

impl QuorumCertificate {
    /// Check whether the certificate is correctly signed by a quorum of distinct validators in
    /// `validator_set`.
    pub fn is_correct(&self, validator_set: &ValidatorSet) -> bool {
        let message = signing_bytes(self.phase.code().code(), &canonical_bytes(&self.subject));
        let mut signers = HashSet::new();
        for seal in &self.seals {
            let Some(verifying_key) = validator_set.verifying_key(&seal.signer) else {
                return false;
            };
            if !signers.insert(seal.signer) || !verify(verifying_key, &message, &seal.signature) {
                return false;
            }
        }
        signers.len() >= validator_set.quorum()
    }
}

/// Reasons why [`QuorumBook::record_vote`] refuses a vote. None of these are fatal.
#[derive(Debug, PartialEq, Eq)]
pub enum VoteError {
    /// The vote is for a round that the book has already moved past.
    Stale { current: View, received: View },
    /// The vote is for a round that the book has not reached yet.
    Future { current: View, received: View },
    /// The sender already voted for a different digest in the same phase and round. The first vote
    /// stands.
    Equivocation {
        sender: Address,
        first: CryptoHash,
        second: CryptoHash,
    },
}

impl Display for VoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VoteError::Stale { current, received } => {
                write!(f, "stale vote for {} at {}", received, current)
            }
            VoteError::Future { current, received } => {
                write!(f, "future vote for {} at {}", received, current)
            }
            VoteError::Equivocation {
                sender,
                first,
                second,
            } => write!(f, "{} voted for both {} and {}", sender, first, second),
        }
    }
}

/// Votes of a single phase in a single round.
#[derive(Default)]
struct VoteSet {
    by_digest: HashMap<CryptoHash, BTreeMap<Address, SignatureBytes>>,
    by_sender: HashMap<Address, CryptoHash>,
}

/// Accumulates Prepare and Commit votes for the current round, and decides when a quorum is reached.
///
/// A `QuorumBook` only counts: it holds no opinion about which digest is correct. Votes are keyed by
/// `(phase, digest)` and counted by distinct sender, so recording the same vote twice never counts it
/// twice, and the order in which votes arrive does not matter.
pub struct QuorumBook {
    view: View,
    quorum: usize,
    votes: HashMap<VotePhase, VoteSet>,
}

impl QuorumBook {
    /// Create an empty book for `view`, in which `quorum` distinct votes certify a digest.
    pub fn new(view: View, quorum: usize) -> QuorumBook {
        QuorumBook {
            view,
            quorum,
            votes: HashMap::new(),
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Discard every vote and start counting for `view`.
    pub fn reset(&mut self, view: View, quorum: usize) {
        self.view = view;
        self.quorum = quorum;
        self.votes.clear();
    }

    /// Record `sender`'s vote for `digest` in `phase` at `view`.
    ///
    /// Returns whether the vote was new. Recording a vote that is already recorded is a no-op that
    /// returns `Ok(false)`.
    pub fn record_vote(
        &mut self,
        phase: VotePhase,
        view: View,
        digest: CryptoHash,
        sender: Address,
        signature: SignatureBytes,
    ) -> Result<bool, VoteError> {
        if view < self.view {
            return Err(VoteError::Stale {
                current: self.view,
                received: view,
            });
        }
        if view > self.view {
            return Err(VoteError::Future {
                current: self.view,
                received: view,
            });
        }

        let vote_set = self.votes.entry(phase).or_default();
        match vote_set.by_sender.get(&sender) {
            Some(first) if *first == digest => Ok(false),
            Some(first) => Err(VoteError::Equivocation {
                sender,
                first: *first,
                second: digest,
            }),
            None => {
                vote_set.by_sender.insert(sender, digest);
                vote_set
                    .by_digest
                    .entry(digest)
                    .or_default()
                    .insert(sender, signature);
                Ok(true)
            }
        }
    }

    /// Number of distinct senders that voted for `digest` in `phase` at `view`.
    pub fn vote_count(&self, phase: VotePhase, view: View, digest: &CryptoHash) -> usize {
        if view != self.view {
            return 0;
        }
        self.votes
            .get(&phase)
            .and_then(|vote_set| vote_set.by_digest.get(digest))
            .map_or(0, |votes| votes.len())
    }

    /// Whether at least a quorum of distinct senders voted for `digest` in `phase` at `view`.
    pub fn quorum_reached(&self, phase: VotePhase, view: View, digest: &CryptoHash) -> bool {
        self.vote_count(phase, view, digest) >= self.quorum
    }

    /// Get a certificate for `digest` in `phase` at `view`, if a quorum has been reached.
    pub fn certificate(
        &self,
        phase: VotePhase,
        view: View,
        digest: &CryptoHash,
    ) -> Option<QuorumCertificate> {
        if !self.quorum_reached(phase, view, digest) {
            return None;
        }
        let votes = self.votes.get(&phase)?.by_digest.get(digest)?;
        Some(QuorumCertificate {
            phase,
            subject: Subject {
                view,
                digest: *digest,
            },
            seals: votes
                .iter()
                .map(|(signer, signature)| Seal::new(*signer, *signature))
                .collect(),
        })
    }
}
