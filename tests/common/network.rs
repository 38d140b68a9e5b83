use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use pbft_rs::{
    networking::network::Network,
    types::{data_types::Address, validator_set::ValidatorSet},
};

/// A mock network stub which passes messages from and to threads using channels.
///
/// A stub can be muted, after which everything it sends is silently lost. This is how tests simulate
/// a crashed validator.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    my_address: Address,
    all_peers: HashMap<Address, Sender<(Address, Vec<u8>)>>,
    inbox: Arc<Mutex<Receiver<(Address, Vec<u8>)>>>,
    muted: Arc<AtomicBool>,
}

impl NetworkStub {
    pub(crate) fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst)
    }

    pub(crate) fn unmute(&self) {
        self.muted.store(false, Ordering::SeqCst)
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }
}

impl Network for NetworkStub {
    fn init_validator_set(&mut self, _: ValidatorSet) {}

    fn send(&mut self, peer: Address, message: Vec<u8>) {
        if self.is_muted() {
            return;
        }
        if let Some(peer) = self.all_peers.get(&peer) {
            let _ = peer.send((self.my_address, message));
        }
    }

    fn broadcast(&mut self, message: Vec<u8>) {
        if self.is_muted() {
            return;
        }
        for (address, peer) in &self.all_peers {
            if *address != self.my_address {
                let _ = peer.send((self.my_address, message.clone()));
            }
        }
    }

    fn recv(&mut self) -> Option<(Address, Vec<u8>)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(o_m) => Some(o_m),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => panic!(),
        }
    }
}

pub(crate) fn mock_network(peers: impl Iterator<Item = Address>) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let peer_and_inboxes: Vec<(Address, Receiver<(Address, Vec<u8>)>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);

            (peer, receiver)
        })
        .collect();

    peer_and_inboxes
        .into_iter()
        .map(|(my_address, inbox)| NetworkStub {
            my_address,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
            muted: Arc::new(AtomicBool::new(false)),
        })
        .collect()
}
