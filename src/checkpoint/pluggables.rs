/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for pluggable checkpoint persistence.
//!
//! # State variables
//!
//! The [checkpoint store](super::store::CheckpointStore) persists two variables in the library user's
//! key-value store, each stored as **Borsh-serialized values**:
//!
//! |Variable|Key|Type|Description|
//! |---|---|---|---|
//! |Snapshot Index|[`SNAPSHOT_INDEX`]|`Vec<`[`SequenceNumber`]`>`|Sequences of the retained snapshots, in ascending order.|
//! |Snapshots|[`SNAPSHOTS`] ∥ `sequence.to_le_bytes()`|[`Snapshot`]|The retained stable snapshots.|

use std::fmt::{self, Display, Formatter};

use borsh::BorshDeserialize;

use crate::types::data_types::SequenceNumber;

use super::store::Snapshot;

pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;

    /// Atomically apply every insertion and deletion in `wb`.
    fn write(&mut self, wb: Self::WriteBatch) -> Result<(), KVStoreError>;
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /* ↓↓↓ Snapshot Index ↓↓↓ */

    fn snapshot_index(&self) -> Result<Vec<SequenceNumber>, KVGetError> {
        match self.get(&SNAPSHOT_INDEX) {
            Some(bytes) => Vec::<SequenceNumber>::deserialize(&mut bytes.as_slice()).map_err(
                |err| KVGetError::DeserializeValueError {
                    key: Key::SnapshotIndex,
                    source: err,
                },
            ),
            None => Ok(Vec::new()),
        }
    }

    /* ↓↓↓ Snapshots ↓↓↓ */

    fn snapshot(&self, sequence: SequenceNumber) -> Result<Option<Snapshot>, KVGetError> {
        match self.get(&snapshot_key(sequence)) {
            Some(bytes) => Snapshot::deserialize(&mut bytes.as_slice())
                .map(Some)
                .map_err(|err| KVGetError::DeserializeValueError {
                    key: Key::Snapshot { sequence },
                    source: err,
                }),
            None => Ok(None),
        }
    }
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

// State variables
pub const SNAPSHOT_INDEX: [u8; 1] = [0];
pub const SNAPSHOTS: [u8; 1] = [1];

/// Get the key that the snapshot of `sequence` is stored at.
pub fn snapshot_key(sequence: SequenceNumber) -> Vec<u8> {
    concat(&SNAPSHOTS, &sequence.to_le_bytes())
}

/// Concatenate two byteslices into one vector.
pub fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}

/// Error when trying to read a value corresponding to a given key from the [key value store][KVStore].
#[derive(Debug)]
pub enum KVGetError {
    DeserializeValueError { key: Key, source: std::io::Error },
    ValueExpectedButNotFound { key: Key },
}

impl Display for KVGetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KVGetError::DeserializeValueError { key, source } => {
                write!(f, "cannot deserialize {:?}: {}", key, source)
            }
            KVGetError::ValueExpectedButNotFound { key } => write!(f, "{:?} not found", key),
        }
    }
}

#[derive(Debug)]
pub enum Key {
    SnapshotIndex,
    Snapshot { sequence: SequenceNumber },
}

/// Error returned by a [`KVStore`] that failed to persist a write batch.
#[derive(Debug)]
pub struct KVStoreError(pub String);

impl Display for KVStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "key-value store write failed: {}", self.0)
    }
}
