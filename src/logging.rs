/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via replica's
//! [config](crate::replica::Configuration).
//!
//! This crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
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
//! is how a [Prepared](crate::events::PreparedEvent) event is printed:
//!
//! ```text
//! Prepared, 1701329264, 3, 17, ZmFrZS1
//! ```
//!
//! In the snippet:
//! - The third value is the epoch of the slot.
//! - The fourth value is the sequence number of the slot.
//! - The fifth value is the first seven characters of the Base64 encoding of the prepared digest.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const ACTIVATE_EPOCH: &str = "ActivateEpoch";
pub const STABLE_CHECKPOINT: &str = "StableCheckpoint";

pub const ADMIT_REQUEST: &str = "AdmitRequest";
pub const CUT_BATCH: &str = "CutBatch";

pub const PREPREPARE: &str = "Preprepare";
pub const RECEIVE_PREPREPARE: &str = "ReceivePreprepare";
pub const PREPARED: &str = "Prepared";
pub const COMMIT_SLOT: &str = "CommitSlot";
pub const REQUEST_CHECKPOINT: &str = "RequestCheckpoint";

pub const PROTOCOL_VIOLATION: &str = "ProtocolViolation";
pub const DROP_MESSAGE: &str = "DropMessage";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ActivateEpochEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |activate_epoch_event: &ActivateEpochEvent| {
            log::info!(
                "{}, {}, {}, {:?}, {}",
                ACTIVATE_EPOCH,
                secs_since_unix_epoch(activate_epoch_event.timestamp),
                activate_epoch_event.epoch,
                activate_epoch_event.leaders,
                activate_epoch_event.starting_checkpoint.seq_no
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
                stable_checkpoint_event.checkpoint.seq_no,
                first_seven_base64_chars(stable_checkpoint_event.checkpoint.value.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for AdmitRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |admit_request_event: &AdmitRequestEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {:?}",
                ADMIT_REQUEST,
                secs_since_unix_epoch(admit_request_event.timestamp),
                admit_request_event.origin,
                first_seven_base64_chars(admit_request_event.client_id.bytes()),
                admit_request_event.req_no,
                admit_request_event.admission
            )
        };
        Box::new(logger)
    }
}

impl Logger for CutBatchEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |cut_batch_event: &CutBatchEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                CUT_BATCH,
                secs_since_unix_epoch(cut_batch_event.timestamp),
                cut_batch_event.epoch,
                cut_batch_event.seq_no,
                cut_batch_event.bucket,
                cut_batch_event.requests
            )
        };
        Box::new(logger)
    }
}

impl Logger for PreprepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |preprepare_event: &PreprepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PREPREPARE,
                secs_since_unix_epoch(preprepare_event.timestamp),
                preprepare_event.epoch,
                preprepare_event.seq_no,
                first_seven_base64_chars(preprepare_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceivePreprepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_preprepare_event: &ReceivePreprepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PREPREPARE,
                secs_since_unix_epoch(receive_preprepare_event.timestamp),
                receive_preprepare_event.origin,
                receive_preprepare_event.epoch,
                receive_preprepare_event.seq_no,
                receive_preprepare_event.requests
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
                prepared_event.epoch,
                prepared_event.seq_no,
                first_seven_base64_chars(prepared_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitSlotEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_slot_event: &CommitSlotEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT_SLOT,
                secs_since_unix_epoch(commit_slot_event.timestamp),
                commit_slot_event.epoch,
                commit_slot_event.seq_no,
                first_seven_base64_chars(commit_slot_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for RequestCheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |request_checkpoint_event: &RequestCheckpointEvent| {
            log::info!(
                "{}, {}, {}",
                REQUEST_CHECKPOINT,
                secs_since_unix_epoch(request_checkpoint_event.timestamp),
                request_checkpoint_event.seq_no
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProtocolViolationEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |protocol_violation_event: &ProtocolViolationEvent| {
            log::warn!(
                "{}, {}, {}, {}",
                PROTOCOL_VIOLATION,
                secs_since_unix_epoch(protocol_violation_event.timestamp),
                protocol_violation_event.origin,
                protocol_violation_event.violation
            )
        };
        Box::new(logger)
    }
}

impl Logger for DropMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |drop_message_event: &DropMessageEvent| {
            log::info!(
                "{}, {}, {}, {}, {:?}",
                DROP_MESSAGE,
                secs_since_unix_epoch(drop_message_event.timestamp),
                drop_message_event.origin,
                drop_message_event.kind,
                drop_message_event.reason
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
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
