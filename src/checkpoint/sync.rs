/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Catching up to the latest stable checkpoint.
//!
//! ## Entering sync
//!
//! A validator enters sync when:
//! 1. It starts with `sync_on_start` configured,
//! 2. It observes a checkpoint certificate for a sequence it has not committed yet, or
//! 3. It receives a verified [`Hello`](super::messages::Hello) advertising a snapshot at or beyond the
//!    sequence it is currently deciding.
//!
//! On entering sync, the validator broadcasts its own `Hello` and stops taking part in rounds.
//!
//! ## Leaving sync
//!
//! Every verified snapshot a peer advertises while the validator is syncing is recorded as a claim. A
//! snapshot is verified if it carries a correct checkpoint certificate, so a single claim cannot be
//! forged. The validator still waits for claims from [`required_claims`] distinct peers, so that it
//! adopts the highest checkpoint that a quorum-consistent set of peers agrees it is behind, and not
//! just the first one it hears about. Once enough claims arrive, or the sync timeout expires, the
//! validator adopts the highest claim (if it is ahead of its own state) and resumes at the next
//! sequence.

use std::{collections::BTreeMap, time::Instant};

use crate::types::data_types::Address;

use super::store::Snapshot;

/// Number of distinct peers whose claims end sync early: `min(f+1, N-1)`.
pub fn required_claims(validator_set_len: usize) -> usize {
    let max_faulty = validator_set_len.saturating_sub(1) / 3;
    (max_faulty + 1).min(validator_set_len.saturating_sub(1))
}

/// The verified claims received while syncing. A peer without any stable snapshot yet still counts
/// as a claim: it confirms that there is nothing newer to catch up to.
pub(crate) struct SyncCandidates {
    claims: BTreeMap<Address, Option<Snapshot>>,
    deadline: Instant,
}

impl SyncCandidates {
    pub(crate) fn new(deadline: Instant) -> Self {
        Self {
            claims: BTreeMap::new(),
            deadline,
        }
    }

    /// Record `peer`'s verified claim, keeping only the highest claim per peer.
    pub(crate) fn add_claim(&mut self, peer: Address, snapshot: Option<Snapshot>) {
        let incoming = snapshot.as_ref().map(Snapshot::sequence);
        match self.claims.get(&peer) {
            Some(existing) if existing.as_ref().map(Snapshot::sequence) >= incoming => (),
            _ => {
                self.claims.insert(peer, snapshot);
            }
        }
    }

    pub(crate) fn claim_count(&self) -> usize {
        self.claims.len()
    }

    /// Get the highest claimed snapshot.
    pub(crate) fn best(&self) -> Option<&Snapshot> {
        self.claims
            .values()
            .flatten()
            .max_by_key(|snapshot| snapshot.sequence())
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }
}
