//! [`MemChain`], a simple in-memory implementation of [`Backend`] used in all of the integration tests.

use std::sync::{Arc, Mutex};

use pbft_rs::{
    backend::{Backend, BackendError, ChainHead},
    types::proposal::Proposal,
};

/// Payloads that [`MemChain`] refuses to vote for.
pub(crate) const INVALID_PAYLOAD: &[u8] = b"invalid";

/// An in-memory chain of finalized proposals.
///
/// The chain is shared between clones, so tests keep one clone to inspect what the replica committed.
#[derive(Clone)]
pub(crate) struct MemChain {
    blocks: Arc<Mutex<Vec<Proposal>>>,
    fail_inserts: bool,
}

impl MemChain {
    pub(crate) fn new() -> MemChain {
        MemChain {
            blocks: Arc::new(Mutex::new(Vec::new())),
            fail_inserts: false,
        }
    }

    /// Create a chain that cannot persist anything.
    pub(crate) fn failing() -> MemChain {
        MemChain {
            blocks: Arc::new(Mutex::new(Vec::new())),
            fail_inserts: true,
        }
    }

    pub(crate) fn blocks(&self) -> Vec<Proposal> {
        self.blocks.lock().unwrap().clone()
    }

    pub(crate) fn height(&self) -> u64 {
        self.blocks
            .lock()
            .unwrap()
            .last()
            .map_or(0, |block| block.sequence().int())
    }
}

impl Backend for MemChain {
    fn head(&self) -> ChainHead {
        match self.blocks.lock().unwrap().last() {
            Some(block) => ChainHead {
                sequence: block.sequence(),
                hash: block.digest(),
            },
            None => ChainHead::genesis(),
        }
    }

    fn validate(&mut self, proposal: &Proposal) -> bool {
        proposal.payload != INVALID_PAYLOAD
    }

    fn insert_block(&mut self, proposal: &Proposal) -> Result<(), BackendError> {
        if self.fail_inserts {
            return Err(BackendError(String::from("read-only chain")));
        }
        self.blocks.lock().unwrap().push(proposal.clone());
        Ok(())
    }
}
