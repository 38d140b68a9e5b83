//! Tests of vote bookkeeping: counting distinct votes, forming certificates, and refusing votes that
//! are out of round or equivocating.

use ed25519_dalek::SigningKey;
use pbft_rs::{
    networking::messages::{Envelope, Message},
    pbft::{
        messages::Subject,
        types::{QuorumBook, VoteError, VotePhase},
    },
    types::{
        crypto_primitives::Keypair,
        data_types::{CryptoHash, SequenceNumber, SignatureBytes, View, ViewNumber},
        validator_set::ValidatorSet,
    },
};
use rand_core::OsRng;

fn validators(n: usize) -> (Vec<Keypair>, ValidatorSet) {
    let keypairs: Vec<Keypair> = (0..n)
        .map(|_| Keypair::new(SigningKey::generate(&mut OsRng {})))
        .collect();
    let validator_set = keypairs.iter().map(Keypair::public).collect();
    (keypairs, validator_set)
}

fn view(view_number: u64, sequence: u64) -> View {
    View::new(ViewNumber::new(view_number), SequenceNumber::new(sequence))
}

/// The signature that `keypair` puts on its vote for `subject` in `phase`.
fn vote(keypair: &Keypair, phase: VotePhase, subject: Subject) -> SignatureBytes {
    let message = match phase {
        VotePhase::Prepare => Message::Prepare(subject),
        VotePhase::Commit => Message::Commit(subject),
        VotePhase::Checkpoint => Message::Checkpoint(subject),
    };
    Envelope::seal(&message, keypair).signature.unwrap()
}

#[test]
fn quorum_sizes() {
    for (n, quorum) in [(1, 1), (2, 1), (3, 1), (4, 3), (5, 3), (7, 5), (10, 7)] {
        let (_, validator_set) = validators(n);
        assert_eq!(validator_set.quorum(), quorum, "N = {}", n);
    }
}

#[test]
fn a_quorum_of_distinct_votes_forms_a_certificate() {
    let (keypairs, validator_set) = validators(4);
    let round = view(0, 1);
    let subject = Subject {
        view: round,
        digest: CryptoHash::new([1; 32]),
    };
    let mut book = QuorumBook::new(round, validator_set.quorum());

    for (i, keypair) in keypairs.iter().take(2).enumerate() {
        let signature = vote(keypair, VotePhase::Prepare, subject);
        assert_eq!(
            book.record_vote(VotePhase::Prepare, round, subject.digest, keypair.address(), signature),
            Ok(true)
        );
        assert_eq!(book.vote_count(VotePhase::Prepare, round, &subject.digest), i + 1);
    }
    assert!(!book.quorum_reached(VotePhase::Prepare, round, &subject.digest));
    assert!(book.certificate(VotePhase::Prepare, round, &subject.digest).is_none());

    // Recording the same vote again does not count it twice.
    let repeated = vote(&keypairs[1], VotePhase::Prepare, subject);
    assert_eq!(
        book.record_vote(VotePhase::Prepare, round, subject.digest, keypairs[1].address(), repeated),
        Ok(false)
    );
    assert_eq!(book.vote_count(VotePhase::Prepare, round, &subject.digest), 2);

    // Commit votes are counted separately.
    let commit = vote(&keypairs[2], VotePhase::Commit, subject);
    book.record_vote(VotePhase::Commit, round, subject.digest, keypairs[2].address(), commit)
        .unwrap();
    assert_eq!(book.vote_count(VotePhase::Prepare, round, &subject.digest), 2);

    let third = vote(&keypairs[3], VotePhase::Prepare, subject);
    book.record_vote(VotePhase::Prepare, round, subject.digest, keypairs[3].address(), third)
        .unwrap();
    assert!(book.quorum_reached(VotePhase::Prepare, round, &subject.digest));

    let certificate = book
        .certificate(VotePhase::Prepare, round, &subject.digest)
        .unwrap();
    assert_eq!(certificate.subject, subject);
    assert_eq!(certificate.seals.len(), 3);
    assert!(certificate.is_correct(&validator_set));
}

#[test]
fn votes_outside_the_current_round_are_refused() {
    let (keypairs, validator_set) = validators(4);
    let mut book = QuorumBook::new(view(0, 11), validator_set.quorum());
    let digest = CryptoHash::new([2; 32]);
    let sender = keypairs[0].address();
    let signature = SignatureBytes::new([0; 64]);

    assert_eq!(
        book.record_vote(VotePhase::Commit, view(3, 10), digest, sender, signature),
        Err(VoteError::Stale {
            current: view(0, 11),
            received: view(3, 10)
        })
    );
    assert_eq!(
        book.record_vote(VotePhase::Commit, view(1, 11), digest, sender, signature),
        Err(VoteError::Future {
            current: view(0, 11),
            received: view(1, 11)
        })
    );
    assert_eq!(book.vote_count(VotePhase::Commit, view(0, 11), &digest), 0);

    book.reset(view(1, 11), validator_set.quorum());
    assert_eq!(
        book.record_vote(VotePhase::Commit, view(1, 11), digest, sender, signature),
        Ok(true)
    );
}

#[test]
fn the_first_vote_of_an_equivocating_sender_stands() {
    let (keypairs, validator_set) = validators(4);
    let round = view(2, 5);
    let mut book = QuorumBook::new(round, validator_set.quorum());
    let first = CryptoHash::new([3; 32]);
    let second = CryptoHash::new([4; 32]);
    let sender = keypairs[0].address();
    let signature = SignatureBytes::new([0; 64]);

    book.record_vote(VotePhase::Prepare, round, first, sender, signature)
        .unwrap();
    assert_eq!(
        book.record_vote(VotePhase::Prepare, round, second, sender, signature),
        Err(VoteError::Equivocation {
            sender,
            first,
            second
        })
    );
    assert_eq!(book.vote_count(VotePhase::Prepare, round, &first), 1);
    assert_eq!(book.vote_count(VotePhase::Prepare, round, &second), 0);
}

#[test]
fn certificates_with_forged_or_repeated_seals_are_incorrect() {
    let (keypairs, validator_set) = validators(4);
    let round = view(0, 1);
    let subject = Subject {
        view: round,
        digest: CryptoHash::new([5; 32]),
    };
    let mut book = QuorumBook::new(round, validator_set.quorum());
    for keypair in &keypairs[..3] {
        let signature = vote(keypair, VotePhase::Commit, subject);
        book.record_vote(VotePhase::Commit, round, subject.digest, keypair.address(), signature)
            .unwrap();
    }
    let certificate = book
        .certificate(VotePhase::Commit, round, &subject.digest)
        .unwrap();
    assert!(certificate.is_correct(&validator_set));

    // Seals are only valid for the phase they were cast in.
    let mut relabelled = certificate.clone();
    relabelled.phase = VotePhase::Prepare;
    assert!(!relabelled.is_correct(&validator_set));

    // The same signer twice does not make up a quorum.
    let mut repeated = certificate.clone();
    repeated.seals[2] = repeated.seals[0];
    assert!(!repeated.is_correct(&validator_set));

    // Too few seals.
    let mut short = certificate.clone();
    short.seals.pop();
    assert!(!short.is_correct(&validator_set));

    // Seals from outside the validator set.
    let (_, other_set) = validators(4);
    assert!(!certificate.is_correct(&other_set));
}
