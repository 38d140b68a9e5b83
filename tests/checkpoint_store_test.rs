//! Tests of the persistent history of stable snapshots.

mod common;

use borsh::BorshSerialize;
use ed25519_dalek::SigningKey;
use pbft_rs::{
    checkpoint::{
        pluggables::{snapshot_key, KVGet, KVStore, WriteBatch, SNAPSHOT_INDEX},
        store::{checkpoint_subject, CheckpointError, CheckpointStore, Snapshot},
    },
    networking::messages::{Envelope, Message},
    pbft::{
        messages::Preprepare,
        types::{QuorumCertificate, VotePhase},
    },
    types::{
        crypto_primitives::Keypair,
        data_types::{CryptoHash, SequenceNumber, View, ViewNumber},
        proposal::Proposal,
        signed_messages::Seal,
        validator_set::ValidatorSet,
    },
};
use rand_core::OsRng;

use common::mem_db::{FailingDB, MemDB, MemWriteBatch};

fn validators(n: usize) -> (Vec<Keypair>, ValidatorSet) {
    let keypairs: Vec<Keypair> = (0..n)
        .map(|_| Keypair::new(SigningKey::generate(&mut OsRng {})))
        .collect();
    let validator_set = keypairs.iter().map(Keypair::public).collect();
    (keypairs, validator_set)
}

/// A snapshot of a proposal committed at `sequence`, certified by the Checkpoint votes of `signers`.
fn snapshot(sequence: u64, signers: &[Keypair]) -> Snapshot {
    let sequence = SequenceNumber::new(sequence);
    let proposal = Proposal::new(sequence, CryptoHash::new([0; 32]), sequence.to_le_bytes().to_vec());
    let subject = checkpoint_subject(sequence, proposal.digest());
    let seals = signers
        .iter()
        .map(|keypair| {
            let envelope = Envelope::seal(&Message::Checkpoint(subject), keypair);
            Seal::new(keypair.address(), envelope.signature.unwrap())
        })
        .collect();
    Snapshot {
        preprepare: Preprepare {
            view: View::new(ViewNumber::new(2), sequence),
            proposal,
        },
        certificate: QuorumCertificate {
            phase: VotePhase::Checkpoint,
            subject,
            seals,
        },
    }
}

#[test]
fn snapshots_are_kept_in_order_and_pruned_beyond_retention() {
    let (keypairs, validator_set) = validators(4);
    let kv_store = MemDB::new();
    let mut store = CheckpointStore::open(kv_store.clone(), 3).unwrap();
    assert!(store.is_empty());
    assert_eq!(store.latest(), None);

    for sequence in (2..=10).step_by(2) {
        let snapshot = snapshot(sequence, &keypairs[..3]);
        assert!(snapshot.is_correct(&validator_set));
        store.append(snapshot).unwrap();
    }

    assert_eq!(store.len(), 3);
    assert_eq!(store.latest_sequence(), Some(SequenceNumber::new(10)));
    assert_eq!(
        store.snapshot(SequenceNumber::new(9)).map(|snapshot| snapshot.sequence()),
        Some(SequenceNumber::new(8))
    );
    assert_eq!(store.snapshot(SequenceNumber::new(5)), None);

    // Pruned snapshots are deleted from the key-value store too.
    assert!(kv_store.get(&snapshot_key(SequenceNumber::new(2))).is_none());
    assert!(kv_store.get(&snapshot_key(SequenceNumber::new(4))).is_none());
    assert_eq!(
        kv_store.snapshot_index().unwrap(),
        vec![
            SequenceNumber::new(6),
            SequenceNumber::new(8),
            SequenceNumber::new(10)
        ]
    );
}

#[test]
fn snapshots_must_be_strictly_newer_than_the_latest() {
    let (keypairs, _) = validators(4);
    let mut store = CheckpointStore::open(MemDB::new(), 3).unwrap();
    store.append(snapshot(4, &keypairs[..3])).unwrap();

    for sequence in [4, 2] {
        match store.append(snapshot(sequence, &keypairs[..3])) {
            Err(CheckpointError::OutOfOrder { latest, incoming }) => {
                assert_eq!(latest, SequenceNumber::new(4));
                assert_eq!(incoming, SequenceNumber::new(sequence));
            }
            other => panic!("expected OutOfOrder, got {:?}", other),
        }
    }
    assert_eq!(store.len(), 1);
}

#[test]
fn reopening_a_store_restores_its_history() {
    let (keypairs, _) = validators(4);
    let kv_store = MemDB::new();
    {
        let mut store = CheckpointStore::open(kv_store.clone(), 2).unwrap();
        for sequence in [3, 6, 9] {
            store.append(snapshot(sequence, &keypairs[1..])).unwrap();
        }
    }

    let store = CheckpointStore::open(kv_store, 2).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(store.latest(), Some(snapshot(9, &keypairs[1..])));
    assert_eq!(
        store.snapshot(SequenceNumber::new(8)).map(|snapshot| snapshot.sequence()),
        Some(SequenceNumber::new(6))
    );
}

#[test]
fn clones_share_the_same_history() {
    let (keypairs, _) = validators(1);
    let mut store = CheckpointStore::open(MemDB::new(), 3).unwrap();
    let reader = store.clone();
    store.append(snapshot(1, &keypairs)).unwrap();
    assert_eq!(reader.latest_sequence(), Some(SequenceNumber::new(1)));
}

#[test]
fn an_unreadable_history_is_reported_as_corrupted() {
    let mut kv_store = MemDB::new();
    let mut wb = MemWriteBatch::new();
    wb.set(&SNAPSHOT_INDEX, &[1, 2, 3]);
    kv_store.write(wb).unwrap();
    assert!(matches!(
        CheckpointStore::open(kv_store, 3),
        Err(CheckpointError::Corrupted(_))
    ));

    // An index that points at a missing snapshot.
    let mut kv_store = MemDB::new();
    let mut wb = MemWriteBatch::new();
    let index = vec![SequenceNumber::new(5)].try_to_vec().unwrap();
    wb.set(&SNAPSHOT_INDEX, &index);
    kv_store.write(wb).unwrap();
    assert!(matches!(
        CheckpointStore::open(kv_store, 3),
        Err(CheckpointError::Corrupted(_))
    ));
}

#[test]
fn a_failed_write_leaves_the_store_unchanged() {
    let (keypairs, _) = validators(1);
    let mut store = CheckpointStore::open(FailingDB, 3).unwrap();
    assert!(matches!(
        store.append(snapshot(1, &keypairs)),
        Err(CheckpointError::Storage(_))
    ));
    assert!(store.is_empty());
}
