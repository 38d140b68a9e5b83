/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that drives the consensus state machine.
//!
//! The algorithm thread is the only owner of the replica's [`Core`]. It takes [inputs](Input) off a
//! single queue, fed by the verifier threads and by the [`Replica`](crate::replica::Replica) handle, and
//! hands them to the state machine one at a time. Between inputs it wakes up at the state machine's
//! next deadline so that view timers and sync deadlines fire even when the network is silent.
//!
//! If the state machine fails with a [`CoreError`], the thread stops participating in consensus but
//! keeps answering [`seal`](crate::replica::Replica::seal) calls with [`SealError::Halted`] until it is
//! shut down.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    backend::Backend,
    checkpoint::pluggables::KVStore,
    networking::{network::Network, receiving::VerifiedMessage},
    pbft::implementation::{Core, CoreError},
    replica::SealError,
    types::{data_types::Address, proposal::Proposal},
};

/// Upper bound on how long the algorithm thread blocks before checking for shutdown.
const MAX_WAIT: Duration = Duration::from_millis(100);

/// Everything that can make the state machine take a step, other than time passing.
pub(crate) enum Input {
    /// A message that passed verification.
    Message(VerifiedMessage),
    /// A request submitted through the local replica handle. `reply` is present if the caller waits for
    /// the request to be committed.
    Request {
        payload: Vec<u8>,
        reply: Option<Sender<Result<Proposal, SealError>>>,
    },
    /// A peer joined the network.
    PeerConnected(Address),
}

pub(crate) struct Algorithm<N: Network, B: Backend, K: KVStore> {
    core: Core<N, B, K>,
    inputs: Receiver<Input>,
    shutdown_signal: Receiver<()>,
}

impl<N: Network + 'static, B: Backend, K: KVStore> Algorithm<N, B, K> {
    pub(crate) fn new(core: Core<N, B, K>, inputs: Receiver<Input>, shutdown_signal: Receiver<()>) -> Self {
        Self {
            core,
            inputs,
            shutdown_signal,
        }
    }

    pub(crate) fn start(mut self) -> JoinHandle<()> {
        thread::spawn(move || {
            if let Err(err) = self.run() {
                log::error!("consensus halted: {}", err);
                self.core.halt();
                self.halted();
            }
        })
    }

    /// Run the state machine until shutdown or until it fails.
    fn run(&mut self) -> Result<(), CoreError> {
        self.core.start()?;
        loop {
            if self.should_shutdown() {
                return Ok(());
            }

            let now = Instant::now();
            let wait = self
                .core
                .next_deadline()
                .map_or(MAX_WAIT, |deadline| deadline.saturating_duration_since(now).min(MAX_WAIT));

            match self.inputs.recv_timeout(wait) {
                Ok(input) => self.core.on_input(input)?,
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }

            self.core.on_timer(Instant::now())?;
        }
    }

    /// Refuse every seal request until shutdown.
    fn halted(&mut self) {
        loop {
            if self.should_shutdown() {
                return;
            }
            match self.inputs.recv_timeout(MAX_WAIT) {
                Ok(Input::Request {
                    reply: Some(reply), ..
                }) => {
                    let _ = reply.send(Err(SealError::Halted));
                }
                Ok(_) | Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn should_shutdown(&self) -> bool {
        match self.shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => true,
            Err(TryRecvError::Empty) => false,
        }
    }
}
