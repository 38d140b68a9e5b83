/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages exchanged in the peer sync handshake.

use borsh::{BorshDeserialize, BorshSerialize};

use super::store::Snapshot;

/// Advertises the sender's latest stable snapshot.
///
/// Sent to every newly connected peer and broadcast on entering sync. A validator that is not syncing
/// answers with its own Hello if the sender is `syncing`, or if the sender advertises an older
/// snapshot than its own. Answers never have `syncing` set, so two validators that are not syncing
/// exchange at most one pair of Hellos. `snapshot` is `None` if the sender has no stable checkpoint yet.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Hello {
    pub snapshot: Option<Snapshot>,
    pub syncing: bool,
}
