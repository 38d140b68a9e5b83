/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that delivers [events](crate::events) to their handlers.
//!
//! Event handlers are registered when the replica is [built](crate::replica::ReplicaSpec). Their
//! number is fixed from then on. If no handler is registered and logging is disabled, the event bus
//! is not started at all and no events are published.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{events::*, logging::Logger};

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// How long the event bus blocks waiting for an event before checking for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct EventHandlers {
    pub(crate) request_handlers: Vec<HandlerPtr<RequestEvent>>,
    pub(crate) receive_message_handlers: Vec<HandlerPtr<ReceiveMessageEvent>>,
    pub(crate) consensus_data_handlers: Vec<HandlerPtr<ConsensusDataEvent>>,
    pub(crate) accept_preprepare_handlers: Vec<HandlerPtr<AcceptPreprepareEvent>>,
    pub(crate) prepared_handlers: Vec<HandlerPtr<PreparedEvent>>,
    pub(crate) final_committed_handlers: Vec<HandlerPtr<FinalCommittedEvent>>,
    pub(crate) new_committed_handlers: Vec<HandlerPtr<NewCommittedEvent>>,
    pub(crate) start_view_change_handlers: Vec<HandlerPtr<StartViewChangeEvent>>,
    pub(crate) enter_new_view_handlers: Vec<HandlerPtr<EnterNewViewEvent>>,
    pub(crate) equivocation_handlers: Vec<HandlerPtr<EquivocationEvent>>,
    pub(crate) stable_checkpoint_handlers: Vec<HandlerPtr<StableCheckpointEvent>>,
    pub(crate) start_sync_handlers: Vec<HandlerPtr<StartSyncEvent>>,
    pub(crate) end_sync_handlers: Vec<HandlerPtr<EndSyncEvent>>,
}

impl EventHandlers {
    /// Collect the handlers for every event type. If `log_events` is true, the default logger of each
    /// event type is registered ahead of the user's handler.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        on_request: Option<HandlerPtr<RequestEvent>>,
        on_receive_message: Option<HandlerPtr<ReceiveMessageEvent>>,
        on_consensus_data: Option<HandlerPtr<ConsensusDataEvent>>,
        on_accept_preprepare: Option<HandlerPtr<AcceptPreprepareEvent>>,
        on_prepared: Option<HandlerPtr<PreparedEvent>>,
        on_final_committed: Option<HandlerPtr<FinalCommittedEvent>>,
        on_new_committed: Option<HandlerPtr<NewCommittedEvent>>,
        on_start_view_change: Option<HandlerPtr<StartViewChangeEvent>>,
        on_enter_new_view: Option<HandlerPtr<EnterNewViewEvent>>,
        on_equivocation: Option<HandlerPtr<EquivocationEvent>>,
        on_stable_checkpoint: Option<HandlerPtr<StableCheckpointEvent>>,
        on_start_sync: Option<HandlerPtr<StartSyncEvent>>,
        on_end_sync: Option<HandlerPtr<EndSyncEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            request_handlers: handlers(log_events, on_request),
            receive_message_handlers: handlers(log_events, on_receive_message),
            consensus_data_handlers: handlers(log_events, on_consensus_data),
            accept_preprepare_handlers: handlers(log_events, on_accept_preprepare),
            prepared_handlers: handlers(log_events, on_prepared),
            final_committed_handlers: handlers(log_events, on_final_committed),
            new_committed_handlers: handlers(log_events, on_new_committed),
            start_view_change_handlers: handlers(log_events, on_start_view_change),
            enter_new_view_handlers: handlers(log_events, on_enter_new_view),
            equivocation_handlers: handlers(log_events, on_equivocation),
            stable_checkpoint_handlers: handlers(log_events, on_stable_checkpoint),
            start_sync_handlers: handlers(log_events, on_start_sync),
            end_sync_handlers: handlers(log_events, on_end_sync),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.request_handlers.is_empty()
            && self.receive_message_handlers.is_empty()
            && self.consensus_data_handlers.is_empty()
            && self.accept_preprepare_handlers.is_empty()
            && self.prepared_handlers.is_empty()
            && self.final_committed_handlers.is_empty()
            && self.new_committed_handlers.is_empty()
            && self.start_view_change_handlers.is_empty()
            && self.enter_new_view_handlers.is_empty()
            && self.equivocation_handlers.is_empty()
            && self.stable_checkpoint_handlers.is_empty()
            && self.start_sync_handlers.is_empty()
            && self.end_sync_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::Request(request_event) => self
                .request_handlers
                .iter()
                .for_each(|handler| handler(&request_event)),

            Event::ReceiveMessage(receive_message_event) => self
                .receive_message_handlers
                .iter()
                .for_each(|handler| handler(&receive_message_event)),

            Event::ConsensusData(consensus_data_event) => self
                .consensus_data_handlers
                .iter()
                .for_each(|handler| handler(&consensus_data_event)),

            Event::AcceptPreprepare(accept_preprepare_event) => self
                .accept_preprepare_handlers
                .iter()
                .for_each(|handler| handler(&accept_preprepare_event)),

            Event::Prepared(prepared_event) => self
                .prepared_handlers
                .iter()
                .for_each(|handler| handler(&prepared_event)),

            Event::FinalCommitted(final_committed_event) => self
                .final_committed_handlers
                .iter()
                .for_each(|handler| handler(&final_committed_event)),

            Event::NewCommitted(new_committed_event) => self
                .new_committed_handlers
                .iter()
                .for_each(|handler| handler(&new_committed_event)),

            Event::StartViewChange(start_view_change_event) => self
                .start_view_change_handlers
                .iter()
                .for_each(|handler| handler(&start_view_change_event)),

            Event::EnterNewView(enter_new_view_event) => self
                .enter_new_view_handlers
                .iter()
                .for_each(|handler| handler(&enter_new_view_event)),

            Event::Equivocation(equivocation_event) => self
                .equivocation_handlers
                .iter()
                .for_each(|handler| handler(&equivocation_event)),

            Event::StableCheckpoint(stable_checkpoint_event) => self
                .stable_checkpoint_handlers
                .iter()
                .for_each(|handler| handler(&stable_checkpoint_event)),

            Event::StartSync(start_sync_event) => self
                .start_sync_handlers
                .iter()
                .for_each(|handler| handler(&start_sync_event)),

            Event::EndSync(end_sync_event) => self
                .end_sync_handlers
                .iter()
                .for_each(|handler| handler(&end_sync_event)),
        }
    }
}

fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    if let Some(handler) = user_handler {
        handlers.push(handler);
    }
    handlers
}

/// Start the event bus thread, which fires the handlers of every event received on
/// `event_subscriber` in the order they were published.
///
/// The thread exits when it receives a shutdown signal, or once every publisher is gone and the
/// remaining events have been delivered.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
