/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that determine what roles a validator should play at any given View.

use crate::types::{
    data_types::{Address, View},
    validator_set::ValidatorSet,
};

/// Get the proposer of `view`.
///
/// ## Proposer election
///
/// The proposer is the validator at index `(sequence + view_number) mod N` when the validator set is
/// sorted by address. Moving to the next view therefore always elects the next validator in line, and
/// so does moving to the next sequence.
///
/// Returns `None` only if the validator set is empty.
pub fn proposer(view: &View, validator_set: &ValidatorSet) -> Option<Address> {
    if validator_set.is_empty() {
        return None;
    }
    let n = validator_set.len() as u64;
    let index = (view.sequence.int() % n + view.view_number.int() % n) % n;
    validator_set.nth(index as usize)
}

/// Determine whether `validator` is the proposer of `view`.
pub(crate) fn is_proposer(validator: &Address, view: &View, validator_set: &ValidatorSet) -> bool {
    proposer(view, validator_set).is_some_and(|proposer| proposer == *validator)
}
