/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages exchanged in the view change sub-protocol.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    networking::messages::Envelope,
    pbft::messages::Subject,
    types::{data_types::View, proposal::Proposal},
};

use super::types::PreparedCertificate;

/// A validator's request to move to `view`, together with its report of what it had prepared and
/// preprepared in the sequence being decided.
///
/// - `p_set`: the subjects that the sender holds a prepared certificate for.
/// - `q_set`: the subjects of the preprepares that the sender accepted.
/// - `prepared`: the proposal and prepared certificate behind the highest-view entry of `p_set`. It is
///   `Some` exactly when `p_set` is non-empty.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ViewChange {
    pub view: View,
    pub p_set: Vec<Subject>,
    pub q_set: Vec<Subject>,
    pub prepared: Option<PreparedCertificate>,
}

/// The new proposer's announcement that `view` has started.
///
/// - `v_set`: the signed envelopes of a quorum of `ViewChange`s for `view`.
/// - `x_set`: the subject of the proposal carried forward from the previous views, if any.
/// - `proposal`: the proposal that `x_set` refers to.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NewView {
    pub view: View,
    pub v_set: Vec<Envelope>,
    pub x_set: Option<Subject>,
    pub proposal: Option<Proposal>,
}
