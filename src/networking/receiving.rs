/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions and types for receiving messages from the P2P network.

use std::{
    collections::{BTreeMap, VecDeque},
    mem,
    sync::{
        mpsc::{Receiver, Sender, SyncSender, TryRecvError, TrySendError},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::SystemTime,
};

use crate::{
    algorithm::Input,
    events::{Event, ReceiveMessageEvent},
    types::{
        data_types::{Address, BufferSize, SequenceNumber, View, ViewNumber},
        validator_set::SharedValidatorSet,
    },
};

use super::{
    messages::{Envelope, Message},
    network::Network,
};

/// Spawn the poller thread, which polls the [`Network`] for messages and pushes their raw bytes onto
/// the bounded `raw_messages` queue for the verifiers to pick up.
///
/// If the queue is full, the message is dropped with a warning. Under a message flood, this keeps
/// memory bounded at the cost of dropping some messages, which the protocol recovers from through
/// timeouts.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    raw_messages: SyncSender<(Address, Vec<u8>)>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        if let Some((origin, bytes)) = network.recv() {
            match raw_messages.try_send((origin, bytes)) {
                Ok(()) => (),
                Err(TrySendError::Full(_)) => {
                    log::warn!("inbound queue is full, dropping message from {}", origin)
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        } else {
            thread::yield_now()
        }
    })
}

/// An authenticated, decoded message, ready to be processed by the state machine.
#[derive(Clone, Debug)]
pub(crate) struct VerifiedMessage {
    /// The validator that signed the message. This is not necessarily the peer that relayed it.
    pub(crate) origin: Address,
    pub(crate) message: Message,
    /// The envelope the message arrived in, kept so that signatures can be lifted into certificates.
    pub(crate) envelope: Envelope,
}

impl VerifiedMessage {
    fn size(&self) -> u64 {
        mem::size_of::<Address>() as u64 + self.envelope.size()
    }
}

/// Spawn `threads` verifier threads, which take raw messages off the shared `raw_messages` queue,
/// decode and authenticate them against the current validator set, and forward those that pass to
/// the algorithm thread's `inputs` queue.
///
/// Messages that fail to decode or authenticate are dropped and logged. They never reach the state
/// machine. The verifiers exit once every sender of `raw_messages` has been dropped and the queue has
/// been drained, or once the algorithm thread has stopped consuming `inputs`.
pub(crate) fn start_verifiers(
    threads: usize,
    raw_messages: Receiver<(Address, Vec<u8>)>,
    validator_set: SharedValidatorSet,
    inputs: Sender<Input>,
    event_publisher: Option<Sender<Event>>,
) -> Vec<JoinHandle<()>> {
    let raw_messages = Arc::new(Mutex::new(raw_messages));
    (0..threads.max(1))
        .map(|_| {
            let raw_messages = Arc::clone(&raw_messages);
            let validator_set = validator_set.clone();
            let inputs = inputs.clone();
            let event_publisher = event_publisher.clone();
            thread::spawn(move || loop {
                // The lock is held only while waiting, so decoding and verification run in parallel.
                let next = raw_messages
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .recv();
                let Ok((peer, bytes)) = next else {
                    return;
                };

                let Some(verified) = verify(peer, &bytes, &validator_set) else {
                    continue;
                };
                Event::ReceiveMessage(ReceiveMessageEvent {
                    timestamp: SystemTime::now(),
                    origin: verified.origin,
                    code: verified.message.code(),
                    data: bytes,
                })
                .publish(&event_publisher);

                if inputs.send(Input::Message(verified)).is_err() {
                    return;
                }
            })
        })
        .collect()
}

fn verify(peer: Address, bytes: &[u8], validator_set: &SharedValidatorSet) -> Option<VerifiedMessage> {
    let envelope = match Envelope::from_bytes(bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            log::debug!("dropping message relayed by {}: {}", peer, err);
            return None;
        }
    };
    match envelope.decode(Some(&validator_set.read())) {
        Ok(message) => Some(VerifiedMessage {
            origin: envelope.address,
            message,
            envelope,
        }),
        Err(err) => {
            log::warn!(
                "dropping message from {} relayed by {}: {}",
                envelope.address,
                peer,
                err
            );
            None
        }
    }
}

/// Message buffer intended for storing verified messages that belong to a round later than the one
/// being decided.
///
/// Its size is bounded by its capacity, and when the capacity is reached messages for the highest
/// views may be removed.
pub(crate) struct MessageBuffer {
    buffer_capacity: BufferSize,
    buffer: BTreeMap<View, VecDeque<VerifiedMessage>>,
    buffer_size: BufferSize,
}

impl MessageBuffer {
    /// Create an empty message buffer.
    pub(crate) fn new(buffer_capacity: BufferSize) -> Self {
        Self {
            buffer_capacity,
            buffer: BTreeMap::new(),
            buffer_size: BufferSize::new(0),
        }
    }

    /// Try inserting a message for `view` into the buffer.
    ///
    /// In case caching the message makes the buffer grow beyond its capacity, this function either:
    /// 1. If the message has the highest view among the views of messages currently in the buffer,
    ///    drops the message, or
    /// 2. Otherwise, removes just enough highest-viewed messages to make space for the new message.
    ///
    /// Returns whether the message was inserted into the buffer.
    pub(crate) fn insert(&mut self, view: View, msg: VerifiedMessage) -> bool {
        let bytes_requested = msg.size();
        let buffer_will_be_overloaded = self
            .buffer_size
            .int()
            .checked_add(bytes_requested)
            .map_or(true, |new_size| new_size > self.buffer_capacity.int());
        let make_space = self
            .buffer
            .keys()
            .next_back()
            .map_or(true, |max_view| view < *max_view);

        if buffer_will_be_overloaded {
            if !make_space {
                log::debug!("message buffer is full, dropping message for {}", view);
                return false;
            }
            self.remove_highest_viewed_msgs(bytes_requested);
            if self.buffer_size.int() + bytes_requested > self.buffer_capacity.int() {
                log::debug!("message for {} is larger than the message buffer", view);
                return false;
            }
        }

        self.buffer_size += bytes_requested;
        self.buffer.entry(view).or_default().push_back(msg);
        true
    }

    /// Remove and return every buffered message for `current.sequence` at or after `current`, in view
    /// order. Messages for views before `current` are discarded.
    ///
    /// Returned messages that are still ahead of the state machine are expected to be inserted again.
    pub(crate) fn take_ready(&mut self, current: View) -> Vec<VerifiedMessage> {
        let mut ready = self.buffer.split_off(&current);
        self.buffer = ready.split_off(&View::new(ViewNumber::new(0), current.sequence + 1));
        self.recompute_size();
        ready.into_values().flatten().collect()
    }

    /// Discard every buffered message for sequences up to and including `sequence`.
    pub(crate) fn prune_up_to(&mut self, sequence: SequenceNumber) {
        self.buffer = self
            .buffer
            .split_off(&View::new(ViewNumber::new(0), sequence + 1));
        self.recompute_size();
    }

    fn recompute_size(&mut self) {
        let size = self
            .buffer
            .values()
            .flatten()
            .map(VerifiedMessage::size)
            .sum();
        self.buffer_size = BufferSize::new(size);
    }

    /// Given the number of bytes that need to be removed, removes just enough highest-viewed messages
    /// to free up (at least) the required number of bytes in the buffer.
    fn remove_highest_viewed_msgs(&mut self, bytes_to_remove: u64) {
        let mut bytes_removed = 0;
        let mut views_removed = Vec::new();

        for (view, msg_queue) in self.buffer.iter_mut().rev() {
            while bytes_removed < bytes_to_remove {
                match msg_queue.pop_back() {
                    Some(msg) => bytes_removed += msg.size(),
                    None => break,
                }
            }
            if msg_queue.is_empty() {
                views_removed.push(*view);
            }
            if bytes_removed >= bytes_to_remove {
                break;
            }
        }

        self.buffer_size -= bytes_removed;

        // Views that lost all their messages are removed from the buffer too.
        views_removed.iter().for_each(|view| {
            let _ = self.buffer.remove(view);
        });
    }
}
