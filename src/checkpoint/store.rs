/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Ordered, append-only history of stable snapshots.
//!
//! A [`Snapshot`] is the preprepare of a committed checkpoint sequence together with a quorum
//! certificate of Checkpoint votes for it. Snapshots serve two purposes:
//! 1. **Crash recovery**: on restart, a replica resumes consensus from the latest persisted snapshot if
//!    it is ahead of the backend's chain head.
//! 2. **Peer bootstrap**: the latest snapshot is what a replica advertises in its
//!    [`Hello`](super::messages::Hello) messages.
//!
//! ## Concurrency
//!
//! [`CheckpointStore`] is cheap to clone, and all clones share the same history. The algorithm thread is
//! the single writer. Any other thread may read concurrently, for example through
//! [`Replica::checkpoint_store`](crate::replica::Replica::checkpoint_store).

use std::{
    fmt::{self, Display, Formatter},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard},
};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    pbft::{
        messages::{Preprepare, Subject},
        types::{QuorumCertificate, VotePhase},
    },
    types::{
        crypto_primitives::canonical_bytes,
        data_types::{CryptoHash, SequenceNumber, View, ViewNumber},
        validator_set::ValidatorSet,
    },
};

use super::pluggables::{
    snapshot_key, KVGetError, KVStore, KVStoreError, Key, WriteBatch, SNAPSHOT_INDEX,
};

/// A quorum-certified record of a committed sequence.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Snapshot {
    pub preprepare: Preprepare,
    pub certificate: QuorumCertificate,
}

impl Snapshot {
    pub fn sequence(&self) -> SequenceNumber {
        self.preprepare.view.sequence
    }

    pub fn digest(&self) -> CryptoHash {
        self.preprepare.proposal.digest()
    }

    /// Check that `certificate` is a correctly signed quorum of Checkpoint votes for exactly the proposal
    /// in `preprepare`.
    pub fn is_correct(&self, validator_set: &ValidatorSet) -> bool {
        self.certificate.phase == VotePhase::Checkpoint
            && self.certificate.subject == checkpoint_subject(self.sequence(), self.digest())
            && self.preprepare.proposal.sequence() == self.sequence()
            && self.preprepare.proposal.is_correct()
            && self.certificate.is_correct(validator_set)
    }
}

/// Get the subject of a Checkpoint vote for the proposal with `digest` at `sequence`.
///
/// Checkpoint votes are cast at view number 0 no matter which view the proposal was committed in, so
/// that validators which committed the same proposal in different views still vote for the same
/// subject.
pub fn checkpoint_subject(sequence: SequenceNumber, digest: CryptoHash) -> Subject {
    Subject {
        view: View::new(ViewNumber::new(0), sequence),
        digest,
    }
}

#[derive(Clone)]
pub struct CheckpointStore<K: KVStore> {
    kv_store: K,
    retention: usize,
    snapshots: Arc<RwLock<Vec<Snapshot>>>,
}

impl<K: KVStore> CheckpointStore<K> {
    /// Open the checkpoint store persisted in `kv_store`, keeping at most `retention` snapshots (and
    /// always at least one).
    pub fn open(kv_store: K, retention: usize) -> Result<Self, CheckpointError> {
        let mut snapshots = Vec::new();
        for sequence in kv_store.snapshot_index()? {
            let snapshot = kv_store
                .snapshot(sequence)?
                .ok_or(KVGetError::ValueExpectedButNotFound {
                    key: Key::Snapshot { sequence },
                })?;
            snapshots.push(snapshot);
        }

        Ok(Self {
            kv_store,
            retention: retention.max(1),
            snapshots: Arc::new(RwLock::new(snapshots)),
        })
    }

    /// Get the most recent snapshot at or before `sequence`.
    pub fn snapshot(&self, sequence: SequenceNumber) -> Option<Snapshot> {
        self.read()
            .iter()
            .rev()
            .find(|snapshot| snapshot.sequence() <= sequence)
            .cloned()
    }

    /// Get the most recent snapshot.
    pub fn latest(&self) -> Option<Snapshot> {
        self.read().last().cloned()
    }

    /// Get the sequence of the most recent snapshot.
    pub fn latest_sequence(&self) -> Option<SequenceNumber> {
        self.read().last().map(Snapshot::sequence)
    }

    /// Number of snapshots currently retained.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Append a newly certified `snapshot`, then prune the oldest snapshots beyond the retention
    /// horizon.
    ///
    /// The snapshot is persisted before it becomes visible to readers. Stored snapshots are never
    /// mutated.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::OutOfOrder`] if `snapshot` is not strictly newer than the latest stored
    ///   snapshot. The store is left unchanged.
    /// - [`CheckpointError::Storage`] if the key-value store fails to persist the write.
    pub fn append(&mut self, snapshot: Snapshot) -> Result<(), CheckpointError> {
        let mut snapshots = self
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(latest) = snapshots.last() {
            if snapshot.sequence() <= latest.sequence() {
                return Err(CheckpointError::OutOfOrder {
                    latest: latest.sequence(),
                    incoming: snapshot.sequence(),
                });
            }
        }

        let excess = (snapshots.len() + 1).saturating_sub(self.retention);
        let mut index: Vec<SequenceNumber> = snapshots
            .iter()
            .skip(excess)
            .map(Snapshot::sequence)
            .collect();
        index.push(snapshot.sequence());

        let mut wb = K::WriteBatch::new();
        snapshots
            .iter()
            .take(excess)
            .for_each(|pruned| wb.delete(&snapshot_key(pruned.sequence())));
        wb.set(&snapshot_key(snapshot.sequence()), &canonical_bytes(&snapshot));
        wb.set(&SNAPSHOT_INDEX, &canonical_bytes(&index));
        self.kv_store.write(wb)?;

        snapshots.drain(..excess);
        snapshots.push(snapshot);
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Snapshot>> {
        self.snapshots.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub enum CheckpointError {
    /// The incoming snapshot is not newer than the latest stored one.
    OutOfOrder {
        latest: SequenceNumber,
        incoming: SequenceNumber,
    },
    /// The persisted history cannot be read back.
    Corrupted(KVGetError),
    /// The key-value store failed to persist a snapshot.
    Storage(KVStoreError),
}

impl From<KVGetError> for CheckpointError {
    fn from(value: KVGetError) -> Self {
        CheckpointError::Corrupted(value)
    }
}

impl From<KVStoreError> for CheckpointError {
    fn from(value: KVStoreError) -> Self {
        CheckpointError::Storage(value)
    }
}

impl Display for CheckpointError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::OutOfOrder { latest, incoming } => write!(
                f,
                "checkpoint at sequence {} is not newer than the latest at sequence {}",
                incoming, latest
            ),
            CheckpointError::Corrupted(err) => write!(f, "checkpoint history is corrupted: {}", err),
            CheckpointError::Storage(err) => write!(f, "{}", err),
        }
    }
}
