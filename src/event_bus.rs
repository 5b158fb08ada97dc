/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that runs event handlers, so that they never block the serializer.
//!
//! For every kind of [event](crate::events) there is a list of handlers: the default logger for
//! that event (if the replica was configured to log events), followed by the handler the user
//! registered on the [`ReplicaSpec`](crate::replica::ReplicaSpec) (if any).

use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

pub(crate) struct EventHandlers {
    pub(crate) activate_epoch_handlers: Vec<HandlerPtr<ActivateEpochEvent>>,
    pub(crate) stable_checkpoint_handlers: Vec<HandlerPtr<StableCheckpointEvent>>,
    pub(crate) admit_request_handlers: Vec<HandlerPtr<AdmitRequestEvent>>,
    pub(crate) cut_batch_handlers: Vec<HandlerPtr<CutBatchEvent>>,
    pub(crate) preprepare_handlers: Vec<HandlerPtr<PreprepareEvent>>,
    pub(crate) receive_preprepare_handlers: Vec<HandlerPtr<ReceivePreprepareEvent>>,
    pub(crate) prepared_handlers: Vec<HandlerPtr<PreparedEvent>>,
    pub(crate) commit_slot_handlers: Vec<HandlerPtr<CommitSlotEvent>>,
    pub(crate) request_checkpoint_handlers: Vec<HandlerPtr<RequestCheckpointEvent>>,
    pub(crate) protocol_violation_handlers: Vec<HandlerPtr<ProtocolViolationEvent>>,
    pub(crate) drop_message_handlers: Vec<HandlerPtr<DropMessageEvent>>,
}

/// Collects the logger (if `log_events`) and the user's handler (if any) of one kind of event.
fn handlers_for<T: Logger>(
    log_events: bool,
    user_handler: Option<HandlerPtr<T>>,
) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    if let Some(handler) = user_handler {
        handlers.push(handler);
    }
    handlers
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        activate_epoch_handler: Option<HandlerPtr<ActivateEpochEvent>>,
        stable_checkpoint_handler: Option<HandlerPtr<StableCheckpointEvent>>,
        admit_request_handler: Option<HandlerPtr<AdmitRequestEvent>>,
        cut_batch_handler: Option<HandlerPtr<CutBatchEvent>>,
        preprepare_handler: Option<HandlerPtr<PreprepareEvent>>,
        receive_preprepare_handler: Option<HandlerPtr<ReceivePreprepareEvent>>,
        prepared_handler: Option<HandlerPtr<PreparedEvent>>,
        commit_slot_handler: Option<HandlerPtr<CommitSlotEvent>>,
        request_checkpoint_handler: Option<HandlerPtr<RequestCheckpointEvent>>,
        protocol_violation_handler: Option<HandlerPtr<ProtocolViolationEvent>>,
        drop_message_handler: Option<HandlerPtr<DropMessageEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            activate_epoch_handlers: handlers_for(log_events, activate_epoch_handler),
            stable_checkpoint_handlers: handlers_for(log_events, stable_checkpoint_handler),
            admit_request_handlers: handlers_for(log_events, admit_request_handler),
            cut_batch_handlers: handlers_for(log_events, cut_batch_handler),
            preprepare_handlers: handlers_for(log_events, preprepare_handler),
            receive_preprepare_handlers: handlers_for(log_events, receive_preprepare_handler),
            prepared_handlers: handlers_for(log_events, prepared_handler),
            commit_slot_handlers: handlers_for(log_events, commit_slot_handler),
            request_checkpoint_handlers: handlers_for(log_events, request_checkpoint_handler),
            protocol_violation_handlers: handlers_for(log_events, protocol_violation_handler),
            drop_message_handlers: handlers_for(log_events, drop_message_handler),
        }
    }

    /// Whether there is no handler at all, in which case events need not be published.
    pub(crate) fn is_empty(&self) -> bool {
        self.activate_epoch_handlers.is_empty()
            && self.stable_checkpoint_handlers.is_empty()
            && self.admit_request_handlers.is_empty()
            && self.cut_batch_handlers.is_empty()
            && self.preprepare_handlers.is_empty()
            && self.receive_preprepare_handlers.is_empty()
            && self.prepared_handlers.is_empty()
            && self.commit_slot_handlers.is_empty()
            && self.request_checkpoint_handlers.is_empty()
            && self.protocol_violation_handlers.is_empty()
            && self.drop_message_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::ActivateEpoch(activate_epoch_event) =>
                self.activate_epoch_handlers.iter().for_each(|handler| handler(&activate_epoch_event)),

            Event::StableCheckpoint(stable_checkpoint_event) =>
                self.stable_checkpoint_handlers.iter().for_each(|handler| handler(&stable_checkpoint_event)),

            Event::AdmitRequest(admit_request_event) =>
                self.admit_request_handlers.iter().for_each(|handler| handler(&admit_request_event)),

            Event::CutBatch(cut_batch_event) =>
                self.cut_batch_handlers.iter().for_each(|handler| handler(&cut_batch_event)),

            Event::Preprepare(preprepare_event) =>
                self.preprepare_handlers.iter().for_each(|handler| handler(&preprepare_event)),

            Event::ReceivePreprepare(receive_preprepare_event) =>
                self.receive_preprepare_handlers.iter().for_each(|handler| handler(&receive_preprepare_event)),

            Event::Prepared(prepared_event) =>
                self.prepared_handlers.iter().for_each(|handler| handler(&prepared_event)),

            Event::CommitSlot(commit_slot_event) =>
                self.commit_slot_handlers.iter().for_each(|handler| handler(&commit_slot_event)),

            Event::RequestCheckpoint(request_checkpoint_event) =>
                self.request_checkpoint_handlers.iter().for_each(|handler| handler(&request_checkpoint_event)),

            Event::ProtocolViolation(protocol_violation_event) =>
                self.protocol_violation_handlers.iter().for_each(|handler| handler(&protocol_violation_event)),

            Event::DropMessage(drop_message_event) =>
                self.drop_message_handlers.iter().for_each(|handler| handler(&drop_message_event)),
        }
    }
}

/// Start the event bus thread. It fires the handlers of every event published until the serializer
/// (the only event publisher) stops, and then exits.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for event in event_subscriber {
            event_handlers.fire_handlers(event)
        }
    })
}
