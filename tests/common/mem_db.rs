//! A simple, volatile, in-memory implementation of [`KVStore`].

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use pbft_rs::checkpoint::pluggables::{KVGet, KVStore, KVStoreError, WriteBatch};

/// An in-memory implementation of [`KVStore`].
#[derive(Clone)]
pub(crate) struct MemDB(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

impl MemDB {
    /// Create a new, empty `MemDB`.
    pub(crate) fn new() -> MemDB {
        MemDB(Arc::new(Mutex::new(HashMap::new())))
    }
}

impl KVStore for MemDB {
    type WriteBatch = MemWriteBatch;

    fn write(&mut self, wb: Self::WriteBatch) -> Result<(), KVStoreError> {
        let mut map = self.0.lock().unwrap();
        for (key, value) in wb.insertions {
            map.insert(key, value);
        }
        for key in wb.deletions {
            map.remove(&key);
        }
        Ok(())
    }
}

impl KVGet for MemDB {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }
}

// A simple implementation of [`WriteBatch`].
pub(crate) struct MemWriteBatch {
    insertions: HashMap<Vec<u8>, Vec<u8>>,
    deletions: HashSet<Vec<u8>>,
}

impl WriteBatch for MemWriteBatch {
    fn new() -> Self {
        MemWriteBatch {
            insertions: HashMap::new(),
            deletions: HashSet::new(),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        let _ = self.deletions.remove(key);
        self.insertions.insert(key.to_vec(), value.to_vec());
    }

    fn delete(&mut self, key: &[u8]) {
        let _ = self.insertions.remove(key);
        self.deletions.insert(key.to_vec());
    }
}

/// A [`KVStore`] whose writes always fail, for exercising the fatal path.
#[derive(Clone)]
pub(crate) struct FailingDB;

impl KVStore for FailingDB {
    type WriteBatch = MemWriteBatch;

    fn write(&mut self, _: Self::WriteBatch) -> Result<(), KVStoreError> {
        Err(KVStoreError(String::from("disk full")))
    }
}

impl KVGet for FailingDB {
    fn get(&self, _: &[u8]) -> Option<Vec<u8>> {
        None
    }
}
