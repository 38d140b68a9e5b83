/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Collector of Checkpoint votes.

use std::collections::{BTreeMap, HashMap};

use crate::{
    pbft::{
        messages::Subject,
        types::{QuorumCertificate, VotePhase},
    },
    types::{
        data_types::{Address, CryptoHash, SequenceNumber, SignatureBytes},
        signed_messages::Seal,
    },
};

/// Checkpoint votes received for one sequence.
#[derive(Default)]
struct CheckpointVotes {
    by_digest: HashMap<CryptoHash, BTreeMap<Address, SignatureBytes>>,
    by_sender: HashMap<Address, CryptoHash>,
}

/// What a single Checkpoint vote amounted to.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CheckpointProgress {
    /// The vote completed a quorum for its checkpoint.
    Certified(QuorumCertificate),
    /// The vote was kept, but no quorum has formed yet.
    Pending,
    /// The vote is for a checkpoint beyond the collection window. `senders` distinct validators have
    /// voted beyond the window so far.
    Ahead { senders: usize },
    /// The vote is not for a checkpoint sequence, is for an already stable one, or is too old.
    Dropped,
}

/// Collects Checkpoint votes across sequences, and forms a checkpoint certificate for a
/// `(sequence, digest)` pair once a quorum of distinct validators voted for it.
///
/// Unlike Prepare and Commit votes, Checkpoint votes are not tied to the round being decided: a
/// validator may receive votes for a checkpoint it has not committed yet, which is how it learns that
/// it has fallen behind. A sender's first vote for a sequence is the one that counts.
///
/// Only multiples of the checkpoint interval above the latest stable checkpoint, and within `window`
/// sequences of the current one, are collected. For votes further ahead only the highest sequence per
/// sender is remembered, so memory stays bounded by the window and the size of the validator set.
pub(crate) struct CheckpointCollector {
    interval: u64,
    window: u64,
    stable: SequenceNumber,
    votes: BTreeMap<SequenceNumber, CheckpointVotes>,
    ahead: BTreeMap<Address, SequenceNumber>,
}

impl CheckpointCollector {
    /// Create a collector for checkpoints every `interval` sequences, whose window spans `retention`
    /// checkpoints.
    pub(crate) fn new(interval: u64, retention: usize) -> Self {
        Self {
            interval,
            window: interval.saturating_mul(retention.max(1) as u64),
            stable: SequenceNumber::new(0),
            votes: BTreeMap::new(),
            ahead: BTreeMap::new(),
        }
    }

    /// Collect `sender`'s Checkpoint vote for `subject`, given that the replica is deciding `current`.
    /// Returns a certificate if this vote brings the number of distinct votes for `subject` to exactly
    /// `quorum`.
    pub(crate) fn collect(
        &mut self,
        sender: Address,
        subject: Subject,
        signature: SignatureBytes,
        quorum: usize,
        current: SequenceNumber,
    ) -> CheckpointProgress {
        let sequence = subject.view.sequence;
        if self.interval == 0
            || sequence.int() == 0
            || sequence.int() % self.interval != 0
            || sequence <= self.stable
            || sequence.int().saturating_add(self.window) < current.int()
        {
            return CheckpointProgress::Dropped;
        }

        let horizon = current.int().saturating_add(self.window);
        if sequence.int() > horizon {
            let highest = self.ahead.entry(sender).or_insert(sequence);
            if *highest < sequence {
                *highest = sequence;
            }
            let senders = self
                .ahead
                .values()
                .filter(|sequence| sequence.int() > horizon)
                .count();
            return CheckpointProgress::Ahead { senders };
        }

        let votes = self.votes.entry(sequence).or_default();
        if votes.by_sender.contains_key(&sender) {
            return CheckpointProgress::Pending;
        }
        votes.by_sender.insert(sender, subject.digest);
        let signatures = votes.by_digest.entry(subject.digest).or_default();
        signatures.insert(sender, signature);

        if signatures.len() != quorum {
            return CheckpointProgress::Pending;
        }
        CheckpointProgress::Certified(QuorumCertificate {
            phase: VotePhase::Checkpoint,
            subject,
            seals: signatures
                .iter()
                .map(|(signer, signature)| Seal::new(*signer, *signature))
                .collect(),
        })
    }

    /// Forget every vote for sequences up to and including the stable checkpoint `sequence`.
    pub(crate) fn prune_up_to(&mut self, sequence: SequenceNumber) {
        self.stable = self.stable.max(sequence);
        self.votes = self.votes.split_off(&(sequence + 1));
        self.ahead.retain(|_, ahead| *ahead > sequence);
    }

    /// Number of sequences that votes are currently kept for.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.votes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{CheckpointCollector, CheckpointProgress};
    use crate::{
        pbft::messages::Subject,
        types::data_types::{Address, CryptoHash, SequenceNumber, SignatureBytes, View, ViewNumber},
    };

    fn vote(sequence: u64) -> Subject {
        Subject {
            view: View::new(ViewNumber::new(0), SequenceNumber::new(sequence)),
            digest: CryptoHash::new([sequence as u8; 32]),
        }
    }

    fn sender(i: u8) -> Address {
        Address::new([i; 20])
    }

    const SIGNATURE: SignatureBytes = SignatureBytes::new([0; 64]);

    #[test]
    fn a_flood_from_one_sender_stays_within_the_window() {
        let mut collector = CheckpointCollector::new(2, 3);
        let current = SequenceNumber::new(5);

        for sequence in 1..50_000 {
            collector.collect(sender(1), vote(sequence), SIGNATURE, 3, current);
        }

        // Checkpoints 2, 4, ..., 10 lie within six sequences of the current one.
        assert_eq!(collector.len(), 5);
        assert_eq!(
            collector.collect(sender(1), vote(60_000), SIGNATURE, 3, current),
            CheckpointProgress::Ahead { senders: 1 }
        );
    }

    #[test]
    fn only_fresh_checkpoint_sequences_are_collected() {
        let mut collector = CheckpointCollector::new(2, 3);
        let current = SequenceNumber::new(9);
        collector.prune_up_to(SequenceNumber::new(4));

        assert_eq!(
            collector.collect(sender(1), vote(7), SIGNATURE, 3, current),
            CheckpointProgress::Dropped
        );
        assert_eq!(
            collector.collect(sender(1), vote(4), SIGNATURE, 3, current),
            CheckpointProgress::Dropped
        );
        assert_eq!(
            collector.collect(sender(1), vote(0), SIGNATURE, 3, current),
            CheckpointProgress::Dropped
        );
        assert_eq!(
            collector.collect(sender(1), vote(6), SIGNATURE, 3, current),
            CheckpointProgress::Pending
        );

        // Checkpointing disabled.
        let mut disabled = CheckpointCollector::new(0, 3);
        assert_eq!(
            disabled.collect(sender(1), vote(6), SIGNATURE, 3, current),
            CheckpointProgress::Dropped
        );
    }

    #[test]
    fn a_quorum_of_matching_votes_certifies_a_checkpoint() {
        let mut collector = CheckpointCollector::new(2, 3);
        let current = SequenceNumber::new(4);

        assert_eq!(
            collector.collect(sender(1), vote(4), SIGNATURE, 2, current),
            CheckpointProgress::Pending
        );
        // A second vote from the same sender does not count twice.
        assert_eq!(
            collector.collect(sender(1), vote(4), SIGNATURE, 2, current),
            CheckpointProgress::Pending
        );
        let CheckpointProgress::Certified(certificate) =
            collector.collect(sender(2), vote(4), SIGNATURE, 2, current)
        else {
            panic!("expected a certificate");
        };
        assert_eq!(certificate.subject, vote(4));
        assert_eq!(certificate.seals.len(), 2);

        collector.prune_up_to(SequenceNumber::new(4));
        assert_eq!(collector.len(), 0);
    }

    #[test]
    fn senders_beyond_the_window_are_counted_once_each() {
        let mut collector = CheckpointCollector::new(2, 3);
        let current = SequenceNumber::new(1);

        assert_eq!(
            collector.collect(sender(1), vote(100), SIGNATURE, 3, current),
            CheckpointProgress::Ahead { senders: 1 }
        );
        assert_eq!(
            collector.collect(sender(1), vote(102), SIGNATURE, 3, current),
            CheckpointProgress::Ahead { senders: 1 }
        );
        assert_eq!(
            collector.collect(sender(2), vote(100), SIGNATURE, 3, current),
            CheckpointProgress::Ahead { senders: 2 }
        );

        collector.prune_up_to(SequenceNumber::new(102));
        assert_eq!(
            collector.collect(sender(3), vote(200), SIGNATURE, 3, current),
            CheckpointProgress::Ahead { senders: 1 }
        );
    }
}
