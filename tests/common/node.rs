use std::{
    sync::{mpsc::Receiver, Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use ed25519_dalek::SigningKey;
use pbft_rs::{
    checkpoint::store::Snapshot,
    events::{
        EndSyncEvent, EnterNewViewEvent, EquivocationEvent, FinalCommittedEvent, RequestEvent,
        StableCheckpointEvent, StartViewChangeEvent, ViewChangeCause,
    },
    replica::{Configuration, Replica, ReplicaSpec, SealError},
    types::{
        data_types::{Address, BufferSize, SequenceNumber, View},
        proposal::Proposal,
        validator_set::ValidatorSet,
    },
};

use crate::common::{
    chain::MemChain,
    logging::{first_seven_base64_chars, log_with_context},
    mem_db::MemDB,
    network::NetworkStub,
};

/// Parameters that differ between the integration tests.
#[derive(Clone, Copy)]
pub(crate) struct TestParams {
    pub(crate) request_timeout: Duration,
    pub(crate) checkpoint_interval: u64,
    pub(crate) sync_on_start: bool,
    pub(crate) max_pending_requests: usize,
}

impl Default for TestParams {
    fn default() -> Self {
        TestParams {
            request_timeout: Duration::from_millis(500),
            checkpoint_interval: 0,
            sync_on_start: false,
            max_pending_requests: 1024,
        }
    }
}

/// Things the Nodes will have in common:
/// - Validator Set.
/// - Configuration.
///
/// Things that they will differ in:
/// - Chain instance.
/// - Network instance.
/// - KVStore.
/// - Keypair.
pub(crate) struct Node {
    address: Address,
    chain: MemChain,
    kv_store: MemDB,
    network: NetworkStub,
    entered_views: Arc<Mutex<Vec<View>>>,
    stable_checkpoints: Arc<Mutex<Vec<SequenceNumber>>>,
    syncs: Arc<Mutex<Vec<SequenceNumber>>>,
    queued_requests: Arc<Mutex<Vec<Vec<u8>>>>,
    equivocations: Arc<Mutex<Vec<Address>>>,
    view_change_causes: Arc<Mutex<Vec<ViewChangeCause>>>,
    replica: Replica<MemDB>,
}

impl Node {
    pub(crate) fn new(
        keypair: SigningKey,
        network: NetworkStub,
        validator_set: ValidatorSet,
        params: TestParams,
    ) -> Node {
        Node::with_state(keypair, network, validator_set, params, MemChain::new(), MemDB::new())
    }

    /// Start a node on top of an existing chain and key-value store, as if restarting it.
    pub(crate) fn with_state(
        keypair: SigningKey,
        network: NetworkStub,
        validator_set: ValidatorSet,
        params: TestParams,
        chain: MemChain,
        kv_store: MemDB,
    ) -> Node {
        let configuration = Configuration::builder()
            .me(keypair)
            .request_timeout(params.request_timeout)
            .max_view_timeout(Duration::from_secs(8))
            .sync_timeout(Duration::from_secs(5))
            .checkpoint_interval(params.checkpoint_interval)
            .checkpoint_retention(3)
            .progress_msg_buffer_capacity(BufferSize::new(1024 * 1024))
            .sync_on_start(params.sync_on_start)
            .max_pending_requests(params.max_pending_requests)
            .log_events(false)
            .build();

        let entered_views = Arc::new(Mutex::new(Vec::new()));
        let stable_checkpoints = Arc::new(Mutex::new(Vec::new()));
        let syncs = Arc::new(Mutex::new(Vec::new()));
        let queued_requests = Arc::new(Mutex::new(Vec::new()));
        let equivocations = Arc::new(Mutex::new(Vec::new()));
        let view_change_causes = Arc::new(Mutex::new(Vec::new()));

        let address = pbft_rs::types::crypto_primitives::address_of(&configuration.me.verifying_key());
        let replica = ReplicaSpec::builder()
            .backend(chain.clone())
            .network(network.clone())
            .kv_store(kv_store.clone())
            .validator_set(validator_set)
            .configuration(configuration)
            .on_final_committed(final_committed_handler(address))
            .on_enter_new_view({
                let entered_views = entered_views.clone();
                move |event: &EnterNewViewEvent| entered_views.lock().unwrap().push(event.view)
            })
            .on_stable_checkpoint({
                let stable_checkpoints = stable_checkpoints.clone();
                move |event: &StableCheckpointEvent| {
                    stable_checkpoints.lock().unwrap().push(event.sequence)
                }
            })
            .on_end_sync({
                let syncs = syncs.clone();
                move |event: &EndSyncEvent| syncs.lock().unwrap().push(event.sequence)
            })
            .on_request({
                let queued_requests = queued_requests.clone();
                move |event: &RequestEvent| queued_requests.lock().unwrap().push(event.payload.clone())
            })
            .on_equivocation({
                let equivocations = equivocations.clone();
                move |event: &EquivocationEvent| equivocations.lock().unwrap().push(event.offender)
            })
            .on_start_view_change({
                let view_change_causes = view_change_causes.clone();
                move |event: &StartViewChangeEvent| view_change_causes.lock().unwrap().push(event.cause)
            })
            .build()
            .start()
            .unwrap();

        Node {
            address,
            chain,
            kv_store,
            network,
            entered_views,
            stable_checkpoints,
            syncs,
            queued_requests,
            equivocations,
            view_change_causes,
            replica,
        }
    }

    pub(crate) fn address(&self) -> Address {
        self.address
    }

    pub(crate) fn seal(&self, payload: &[u8], stop: &Receiver<()>) -> Result<Proposal, SealError> {
        self.replica.seal(payload.to_vec(), stop)
    }

    pub(crate) fn submit_request(&self, payload: &[u8]) {
        assert!(self.replica.submit_request(payload.to_vec()));
    }

    pub(crate) fn height(&self) -> u64 {
        self.chain.height()
    }

    pub(crate) fn blocks(&self) -> Vec<Proposal> {
        self.chain.blocks()
    }

    pub(crate) fn network(&self) -> &NetworkStub {
        &self.network
    }

    pub(crate) fn entered_views(&self) -> Vec<View> {
        self.entered_views.lock().unwrap().clone()
    }

    pub(crate) fn stable_checkpoints(&self) -> Vec<SequenceNumber> {
        self.stable_checkpoints.lock().unwrap().clone()
    }

    pub(crate) fn syncs(&self) -> Vec<SequenceNumber> {
        self.syncs.lock().unwrap().clone()
    }

    /// Payloads this node queued to be proposed, in the order it queued them.
    pub(crate) fn queued_requests(&self) -> Vec<Vec<u8>> {
        self.queued_requests.lock().unwrap().clone()
    }

    /// Validators this node caught signing two different digests for the same slot.
    pub(crate) fn equivocations(&self) -> Vec<Address> {
        self.equivocations.lock().unwrap().clone()
    }

    pub(crate) fn view_change_causes(&self) -> Vec<ViewChangeCause> {
        self.view_change_causes.lock().unwrap().clone()
    }

    pub(crate) fn latest_snapshot(&self) -> Option<Snapshot> {
        self.replica.checkpoint_store().latest()
    }

    /// Stop the replica, keeping its chain, key-value store, and network endpoint so that it can be
    /// restarted.
    pub(crate) fn stop(self) -> (MemChain, MemDB, NetworkStub) {
        (self.chain, self.kv_store, self.network)
    }
}

fn final_committed_handler(address: Address) -> impl Fn(&FinalCommittedEvent) + Send + 'static {
    move |final_committed_event: &FinalCommittedEvent| {
        log_with_context(
            Some(address),
            &format!(
                "Committed, sequence: {}, digest: {}, proposer: {}, seals: {}",
                final_committed_event.proposal.sequence(),
                first_seven_base64_chars(&final_committed_event.proposal.digest().bytes()),
                first_seven_base64_chars(&final_committed_event.proposer.bytes()),
                final_committed_event.proposal.signatures.len()
            ),
        );
    }
}

/// Poll `condition` until it holds or `timeout` elapses. Returns whether it held.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}
