/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the replica's
//! [config](crate::replica::Configuration).
//!
//! PBFT-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how an [AcceptPreprepare](crate::events::AcceptPreprepareEvent) is printed:
//!
//! ```text
//! AcceptPreprepare, 1701329264, Id5u7f6, 0, 12, fNGCJyk
//! ```
//!
//! In the snippet:
//! - The third value is the first seven characters of the Base64 encoding of the address of the
//!   proposer that sent the preprepare.
//! - The fourth and fifth values are the view number and sequence of the round.
//! - The sixth value is the first seven characters of the Base64 encoding of the proposal's digest.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const REQUEST: &str = "Request";
pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
pub const CONSENSUS_DATA: &str = "ConsensusData";

pub const ACCEPT_PREPREPARE: &str = "AcceptPreprepare";
pub const PREPARED: &str = "Prepared";
pub const FINAL_COMMITTED: &str = "FinalCommitted";
pub const NEW_COMMITTED: &str = "NewCommitted";

pub const START_VIEW_CHANGE: &str = "StartViewChange";
pub const ENTER_NEW_VIEW: &str = "EnterNewView";
pub const EQUIVOCATION: &str = "Equivocation";

pub const STABLE_CHECKPOINT: &str = "StableCheckpoint";
pub const START_SYNC: &str = "StartSync";
pub const END_SYNC: &str = "EndSync";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for RequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |request_event: &RequestEvent| {
            log::info!(
                "{}, {}, {}",
                REQUEST,
                secs_since_unix_epoch(request_event.timestamp),
                request_event.payload.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_message_event: &ReceiveMessageEvent| {
            log::debug!(
                "{}, {}, {}, {}, {}",
                RECEIVE_MESSAGE,
                secs_since_unix_epoch(receive_message_event.timestamp),
                first_seven_base64_chars(&receive_message_event.origin.bytes()),
                receive_message_event.code,
                receive_message_event.data.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ConsensusDataEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |consensus_data_event: &ConsensusDataEvent| {
            let targets = match &consensus_data_event.targets {
                Some(targets) => targets
                    .iter()
                    .map(|target| first_seven_base64_chars(&target.bytes()))
                    .collect::<Vec<String>>()
                    .join(" "),
                None => String::from("all"),
            };
            log::debug!(
                "{}, {}, {}, {}",
                CONSENSUS_DATA,
                secs_since_unix_epoch(consensus_data_event.timestamp),
                targets,
                consensus_data_event.data.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for AcceptPreprepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |accept_preprepare_event: &AcceptPreprepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                ACCEPT_PREPREPARE,
                secs_since_unix_epoch(accept_preprepare_event.timestamp),
                first_seven_base64_chars(&accept_preprepare_event.origin.bytes()),
                accept_preprepare_event.view.view_number,
                accept_preprepare_event.view.sequence,
                first_seven_base64_chars(&accept_preprepare_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for PreparedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |prepared_event: &PreparedEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PREPARED,
                secs_since_unix_epoch(prepared_event.timestamp),
                prepared_event.view.view_number,
                prepared_event.view.sequence,
                first_seven_base64_chars(&prepared_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for FinalCommittedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |final_committed_event: &FinalCommittedEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                FINAL_COMMITTED,
                secs_since_unix_epoch(final_committed_event.timestamp),
                first_seven_base64_chars(&final_committed_event.proposer.bytes()),
                final_committed_event.view.view_number,
                final_committed_event.view.sequence,
                first_seven_base64_chars(&final_committed_event.proposal.digest().bytes()),
                final_committed_event.proposal.signatures.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for NewCommittedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |new_committed_event: &NewCommittedEvent| {
            log::info!(
                "{}, {}, {}, {}",
                NEW_COMMITTED,
                secs_since_unix_epoch(new_committed_event.timestamp),
                new_committed_event.proposal.sequence(),
                first_seven_base64_chars(&new_committed_event.proposal.digest().bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_view_change_event: &StartViewChangeEvent| {
            log::info!(
                "{}, {}, {}, {}, {:?}",
                START_VIEW_CHANGE,
                secs_since_unix_epoch(start_view_change_event.timestamp),
                start_view_change_event.target.view_number,
                start_view_change_event.target.sequence,
                start_view_change_event.cause
            )
        };
        Box::new(logger)
    }
}

impl Logger for EnterNewViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |enter_new_view_event: &EnterNewViewEvent| {
            let carried = enter_new_view_event
                .carried
                .map_or(String::from("none"), |digest| {
                    first_seven_base64_chars(&digest.bytes())
                });
            log::info!(
                "{}, {}, {}, {}, {}",
                ENTER_NEW_VIEW,
                secs_since_unix_epoch(enter_new_view_event.timestamp),
                enter_new_view_event.view.view_number,
                enter_new_view_event.view.sequence,
                carried
            )
        };
        Box::new(logger)
    }
}

impl Logger for EquivocationEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |equivocation_event: &EquivocationEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}, {}, {}",
                EQUIVOCATION,
                secs_since_unix_epoch(equivocation_event.timestamp),
                first_seven_base64_chars(&equivocation_event.offender.bytes()),
                equivocation_event.view.view_number,
                equivocation_event.view.sequence,
                first_seven_base64_chars(&equivocation_event.first.bytes()),
                first_seven_base64_chars(&equivocation_event.second.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for StableCheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |stable_checkpoint_event: &StableCheckpointEvent| {
            log::info!(
                "{}, {}, {}, {}",
                STABLE_CHECKPOINT,
                secs_since_unix_epoch(stable_checkpoint_event.timestamp),
                stable_checkpoint_event.sequence,
                first_seven_base64_chars(&stable_checkpoint_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartSyncEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_sync_event: &StartSyncEvent| {
            log::info!(
                "{}, {}, {}",
                START_SYNC,
                secs_since_unix_epoch(start_sync_event.timestamp),
                start_sync_event.sequence
            )
        };
        Box::new(logger)
    }
}

impl Logger for EndSyncEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |end_sync_event: &EndSyncEvent| {
            log::info!(
                "{}, {}, {}, {}",
                END_SYNC,
                secs_since_unix_epoch(end_sync_event.timestamp),
                end_sync_event.sequence,
                end_sync_event.claims
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
