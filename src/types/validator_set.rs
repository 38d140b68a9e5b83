/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The set of validators that vote and propose, and the thresholds derived from its size.
//!
//! A [`ValidatorSet`] maps validator [addresses](Address) to the Ed25519 verifying keys that their
//! signatures are checked against. Validators are kept sorted by address, which gives every replica the
//! same deterministic order for [proposer election](crate::pbft::roles).
//!
//! The validator set is read-mostly shared state. The replica shares it between the algorithm thread
//! and the message verifiers as a [`SharedValidatorSet`].

use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard},
};

use super::{
    crypto_primitives::{address_of, VerifyingKey},
    data_types::Address,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: BTreeMap<Address, VerifyingKey>,
}

impl ValidatorSet {
    /// Create an empty validator set.
    pub fn new() -> Self {
        Self {
            validators: BTreeMap::new(),
        }
    }

    /// Insert `verifying_key` into the validator set and return the address it is known by.
    pub fn put(&mut self, verifying_key: VerifyingKey) -> Address {
        let address = address_of(&verifying_key);
        self.validators.insert(address, verifying_key);
        address
    }

    pub fn contains(&self, validator: &Address) -> bool {
        self.validators.contains_key(validator)
    }

    /// Get the verifying key registered for `validator`, if it is a member.
    pub fn verifying_key(&self, validator: &Address) -> Option<&VerifyingKey> {
        self.validators.get(validator)
    }

    /// Number of validators, `N`.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Iterate through the addresses of the validators in ascending order.
    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.validators.keys()
    }

    /// Get the address of the validator at `index` in ascending address order.
    pub fn nth(&self, index: usize) -> Option<Address> {
        self.validators.keys().nth(index).copied()
    }

    /// Position of `validator` in ascending address order.
    pub fn position(&self, validator: &Address) -> Option<usize> {
        self.validators.keys().position(|address| address == validator)
    }

    /// Maximum number of faulty validators tolerated: `f = (N-1)/3`.
    pub fn max_faulty(&self) -> usize {
        self.len().saturating_sub(1) / 3
    }

    /// Minimum number of distinct matching votes that certify a decision: `2f+1`.
    pub fn quorum(&self) -> usize {
        2 * self.max_faulty() + 1
    }
}

impl FromIterator<VerifyingKey> for ValidatorSet {
    fn from_iter<I: IntoIterator<Item = VerifyingKey>>(iter: I) -> Self {
        let mut validator_set = ValidatorSet::new();
        iter.into_iter().for_each(|verifying_key| {
            validator_set.put(verifying_key);
        });
        validator_set
    }
}

/// A [`ValidatorSet`] shared between threads behind a read/write guard.
#[derive(Clone)]
pub struct SharedValidatorSet(Arc<RwLock<ValidatorSet>>);

impl SharedValidatorSet {
    pub fn new(validator_set: ValidatorSet) -> Self {
        Self(Arc::new(RwLock::new(validator_set)))
    }

    /// Acquire a read guard over the validator set.
    pub fn read(&self) -> RwLockReadGuard<'_, ValidatorSet> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }
}
