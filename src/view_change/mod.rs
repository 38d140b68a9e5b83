/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Subprotocol for replacing a faulty or silent proposer.
//!
//! ## Triggers
//!
//! A validator moves from the current view `v` to view-changing towards a target view `v' > v` when:
//! 1. Its view timer fires before the round makes progress (target `v+1`, or the next target up if it
//!    was already view-changing),
//! 2. The proposer of the current view is caught sending two conflicting preprepares, or
//! 3. It observes a quorum of [`ViewChange`](messages::ViewChange) messages for a target higher than
//!    its current view.
//!
//! On entering view-changing, the validator broadcasts a `ViewChange` that faithfully reports the
//! highest-view proposal it holds a [prepared certificate](types::PreparedCertificate) for, if any.
//!
//! ## New view
//!
//! The proposer of the target view collects a quorum of `ViewChange`s for the same target, picks the
//! proposal to carry forward with [`select_carry_forward`](types::select_carry_forward), and broadcasts a
//! [`NewView`](messages::NewView) bundling the signed `ViewChange` envelopes together with its choice.
//!
//! Recipients do not trust the choice: they re-verify every bundled envelope and re-run the selection
//! with [`verify_new_view`](types::verify_new_view) before entering the new view.

pub mod messages;

pub mod types;
