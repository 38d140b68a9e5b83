/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Prepared certificates, the collector of `ViewChange` messages, and the carry-forward rule.

use std::{
    collections::{BTreeMap, HashSet},
    fmt::{self, Display, Formatter},
};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    networking::messages::{CodecError, Envelope, Message},
    pbft::types::{QuorumCertificate, VotePhase},
    types::{
        data_types::{Address, SequenceNumber, ViewNumber},
        proposal::Proposal,
        validator_set::ValidatorSet,
    },
};

use super::messages::{NewView, ViewChange};

/// A proposal together with a quorum of Prepare votes for it: proof that a quorum of validators locked
/// onto the proposal at the certificate's view.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PreparedCertificate {
    pub proposal: Proposal,
    pub certificate: QuorumCertificate,
}

impl PreparedCertificate {
    /// Check that the certificate is a correctly signed quorum of Prepare votes for exactly this
    /// proposal.
    pub fn is_correct(&self, validator_set: &ValidatorSet) -> bool {
        self.certificate.phase == VotePhase::Prepare
            && self.certificate.subject.digest == self.proposal.digest()
            && self.certificate.subject.view.sequence == self.proposal.sequence()
            && self.proposal.is_correct()
            && self.certificate.is_correct(validator_set)
    }
}

/// Check that a `ViewChange` reports its preparation state consistently: every reported subject
/// belongs to the sequence being decided and to a view before the target, and the highest entry of
/// `p_set` is backed by a correct prepared certificate.
pub fn view_change_is_consistent(view_change: &ViewChange, validator_set: &ValidatorSet) -> bool {
    let target = view_change.view;
    let subjects_are_in_range = view_change
        .p_set
        .iter()
        .chain(view_change.q_set.iter())
        .all(|subject| {
            subject.view.sequence == target.sequence && subject.view.view_number < target.view_number
        });
    if !subjects_are_in_range {
        return false;
    }

    let highest_prepared = view_change.p_set.iter().max_by_key(|subject| subject.view);
    match (highest_prepared, &view_change.prepared) {
        (None, None) => true,
        (Some(subject), Some(prepared)) => {
            prepared.certificate.subject == *subject && prepared.is_correct(validator_set)
        }
        _ => false,
    }
}

/// Select the prepared certificate that a new view must carry forward, given the `ViewChange`s of a
/// quorum and their senders.
///
/// The selected certificate is the one with the highest view. Ties are broken in favor of the sender
/// with the lowest address. Returns `None` if no sender reports a prepared certificate, in which case
/// the new proposer is free to propose a fresh request.
pub fn select_carry_forward(view_changes: &[(Address, ViewChange)]) -> Option<PreparedCertificate> {
    view_changes
        .iter()
        .filter_map(|(sender, view_change)| {
            view_change
                .prepared
                .as_ref()
                .map(|prepared| (sender, prepared))
        })
        .min_by(|(sender_a, prepared_a), (sender_b, prepared_b)| {
            prepared_b
                .certificate
                .subject
                .view
                .cmp(&prepared_a.certificate.subject.view)
                .then(sender_a.cmp(sender_b))
        })
        .map(|(_, prepared)| prepared.clone())
}

/// Check a `NewView` independently of the proposer that sent it, and return the proposal it carries
/// forward, if any.
///
/// The check passes if and only if:
/// 1. Every envelope in `v_set` authenticates against `validator_set` and holds a consistent
///    `ViewChange` for exactly `new_view.view`,
/// 2. The envelopes come from at least a quorum of distinct validators, and
/// 3. Running [`select_carry_forward`] over them yields exactly the `x_set` and `proposal` of `new_view`.
pub fn verify_new_view(
    new_view: &NewView,
    validator_set: &ValidatorSet,
) -> Result<Option<Proposal>, NewViewError> {
    let mut senders = HashSet::new();
    let mut view_changes = Vec::with_capacity(new_view.v_set.len());
    for envelope in &new_view.v_set {
        let view_change = match envelope.decode(Some(validator_set))? {
            Message::ViewChange(view_change) => view_change,
            other => return Err(NewViewError::NotAViewChange(other.code().code())),
        };
        if view_change.view != new_view.view {
            return Err(NewViewError::ViewMismatch(envelope.address));
        }
        if !view_change_is_consistent(&view_change, validator_set) {
            return Err(NewViewError::InconsistentViewChange(envelope.address));
        }
        if !senders.insert(envelope.address) {
            return Err(NewViewError::DuplicateSender(envelope.address));
        }
        view_changes.push((envelope.address, view_change));
    }

    if senders.len() < validator_set.quorum() {
        return Err(NewViewError::InsufficientQuorum {
            received: senders.len(),
            required: validator_set.quorum(),
        });
    }

    match (
        select_carry_forward(&view_changes),
        &new_view.x_set,
        &new_view.proposal,
    ) {
        (None, None, None) => Ok(None),
        (Some(selected), Some(x_set), Some(proposal))
            if selected.certificate.subject == *x_set
                && proposal.digest() == x_set.digest
                && proposal.is_correct() =>
        {
            Ok(Some(selected.proposal))
        }
        _ => Err(NewViewError::SelectionMismatch),
    }
}

/// Reasons why [`verify_new_view`] rejects a `NewView`.
#[derive(Debug)]
pub enum NewViewError {
    InvalidEnvelope(CodecError),
    NotAViewChange(u64),
    ViewMismatch(Address),
    InconsistentViewChange(Address),
    DuplicateSender(Address),
    InsufficientQuorum { received: usize, required: usize },
    SelectionMismatch,
}

impl From<CodecError> for NewViewError {
    fn from(value: CodecError) -> Self {
        NewViewError::InvalidEnvelope(value)
    }
}

impl Display for NewViewError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NewViewError::InvalidEnvelope(err) => write!(f, "bundled envelope: {}", err),
            NewViewError::NotAViewChange(code) => {
                write!(f, "bundled envelope has code {}, not a view change", code)
            }
            NewViewError::ViewMismatch(sender) => {
                write!(f, "view change from {} targets another view", sender)
            }
            NewViewError::InconsistentViewChange(sender) => {
                write!(f, "view change from {} is inconsistent", sender)
            }
            NewViewError::DuplicateSender(sender) => {
                write!(f, "more than one view change from {}", sender)
            }
            NewViewError::InsufficientQuorum { received, required } => {
                write!(f, "{} view changes, {} required", received, required)
            }
            NewViewError::SelectionMismatch => {
                write!(f, "carried-forward proposal does not match the selection rule")
            }
        }
    }
}

/// Collects the `ViewChange`s of the sequence being decided, grouped by their target view number.
///
/// Only the first `ViewChange` from each sender for each target is kept.
pub(crate) struct ViewChangeCollector {
    sequence: SequenceNumber,
    view_changes: BTreeMap<ViewNumber, BTreeMap<Address, (ViewChange, Envelope)>>,
}

impl ViewChangeCollector {
    pub(crate) fn new(sequence: SequenceNumber) -> Self {
        Self {
            sequence,
            view_changes: BTreeMap::new(),
        }
    }

    /// Forget every collected `ViewChange` and start collecting for `sequence`.
    pub(crate) fn reset(&mut self, sequence: SequenceNumber) {
        self.sequence = sequence;
        self.view_changes.clear();
    }

    /// Collect a `ViewChange` from `sender` and return the number of distinct senders that asked for
    /// the same target.
    pub(crate) fn collect(
        &mut self,
        sender: Address,
        view_change: ViewChange,
        envelope: Envelope,
    ) -> usize {
        if view_change.view.sequence != self.sequence {
            return 0;
        }
        let target = view_change.view.view_number;
        let senders = self.view_changes.entry(target).or_default();
        senders.entry(sender).or_insert((view_change, envelope));
        senders.len()
    }

    pub(crate) fn count(&self, target: ViewNumber) -> usize {
        self.view_changes.get(&target).map_or(0, |senders| senders.len())
    }

    /// Get the collected `ViewChange`s for `target` together with their senders, in address order.
    pub(crate) fn view_changes(&self, target: ViewNumber) -> Vec<(Address, ViewChange)> {
        self.view_changes
            .get(&target)
            .map(|senders| {
                senders
                    .iter()
                    .map(|(sender, (view_change, _))| (*sender, view_change.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get the signed envelopes of the collected `ViewChange`s for `target`, in address order.
    pub(crate) fn envelopes(&self, target: ViewNumber) -> Vec<Envelope> {
        self.view_changes
            .get(&target)
            .map(|senders| {
                senders
                    .values()
                    .map(|(_, envelope)| envelope.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forget the `ViewChange`s for every target up to and including `view_number`.
    pub(crate) fn prune_up_to(&mut self, view_number: ViewNumber) {
        self.view_changes = self.view_changes.split_off(&(view_number + 1));
    }
}
