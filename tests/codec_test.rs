//! Tests of the wire envelope: signing, authenticating, and decoding every kind of message.

use borsh::BorshSerialize;
use ed25519_dalek::SigningKey;
use pbft_rs::{
    checkpoint::messages::Hello,
    networking::messages::{AuthenticationError, CodecError, Envelope, Message, MessageCode},
    pbft::{
        messages::{Preprepare, Request, Subject},
        types::{QuorumCertificate, VotePhase},
    },
    types::{
        crypto_primitives::Keypair,
        data_types::{Address, CryptoHash, SequenceNumber, SignatureBytes, View, ViewNumber},
        proposal::Proposal,
        signed_messages::Seal,
        validator_set::ValidatorSet,
    },
    view_change::{
        messages::{NewView, ViewChange},
        types::PreparedCertificate,
    },
};
use rand_core::OsRng;

fn random_keypair() -> Keypair {
    Keypair::new(SigningKey::generate(&mut OsRng {}))
}

fn view(view_number: u64, sequence: u64) -> View {
    View::new(ViewNumber::new(view_number), SequenceNumber::new(sequence))
}

/// Seals from `count` made-up signers. Their contents only matter to the codec here.
fn seals(count: u8) -> Vec<Seal> {
    (0..count)
        .map(|i| Seal::new(Address::new([i; 20]), SignatureBytes::new([i; 64])))
        .collect()
}

/// One message of every kind, in the order of their codes.
fn sample_messages() -> Vec<Message> {
    let proposal = Proposal::new(SequenceNumber::new(3), CryptoHash::new([7; 32]), b"payload".to_vec());
    let subject = Subject {
        view: view(1, 3),
        digest: proposal.digest(),
    };
    let prepared = PreparedCertificate {
        proposal: proposal.clone(),
        certificate: QuorumCertificate {
            phase: VotePhase::Prepare,
            subject,
            seals: seals(3),
        },
    };
    let view_change = ViewChange {
        view: view(2, 3),
        p_set: vec![subject],
        q_set: vec![subject],
        prepared: Some(prepared.clone()),
    };
    let view_change_envelopes = (0..3)
        .map(|_| Envelope::seal(&Message::ViewChange(view_change.clone()), &random_keypair()))
        .collect();
    vec![
        Message::Request(Request {
            payload: b"payload".to_vec(),
        }),
        Message::Preprepare(Preprepare {
            view: view(1, 3),
            proposal,
        }),
        Message::Prepare(subject),
        Message::Commit(subject),
        Message::Checkpoint(subject),
        Message::ViewChange(view_change),
        Message::NewView(NewView {
            view: view(2, 3),
            v_set: view_change_envelopes,
            x_set: Some(subject),
            proposal: Some(prepared.proposal),
        }),
        Message::Hello(Hello {
            snapshot: None,
            syncing: true,
        }),
    ]
}

#[test]
fn signed_envelopes_survive_the_wire() {
    let keypair = random_keypair();
    let validator_set: ValidatorSet = [keypair.public()].into_iter().collect();

    for message in sample_messages() {
        let envelope = Envelope::seal(&message, &keypair);
        assert_eq!(envelope.address, keypair.address());
        assert_eq!(envelope.code, message.code().code());

        let received = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(received, envelope);
        assert_eq!(received.decode(Some(&validator_set)).unwrap(), message);
    }
}

#[test]
fn boundary_sized_fields_survive_the_wire() {
    let keypair = random_keypair();
    let validator_set: ValidatorSet = [keypair.public()].into_iter().collect();

    let large_payload = vec![0xab; 4 * 1024 * 1024];
    let unsealed = Proposal::new(SequenceNumber::new(1), CryptoHash::new([0; 32]), Vec::new());
    let mut sealed = Proposal::new(SequenceNumber::new(2), unsealed.digest(), large_payload.clone());
    sealed.signatures = seals(7);
    assert!(unsealed.signatures.is_empty());

    let messages = vec![
        Message::Request(Request {
            payload: large_payload,
        }),
        Message::Request(Request {
            payload: Vec::new(),
        }),
        Message::Preprepare(Preprepare {
            view: view(0, 1),
            proposal: unsealed,
        }),
        Message::Preprepare(Preprepare {
            view: view(0, 2),
            proposal: sealed.clone(),
        }),
        Message::ViewChange(ViewChange {
            view: view(1, 2),
            p_set: Vec::new(),
            q_set: Vec::new(),
            prepared: None,
        }),
        Message::NewView(NewView {
            view: view(1, 2),
            v_set: Vec::new(),
            x_set: None,
            proposal: None,
        }),
    ];

    for message in messages {
        let envelope = Envelope::seal(&message, &keypair);
        let received = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(received.decode(Some(&validator_set)).unwrap(), message);
    }

    // Commit seals are not part of the digest, so sealing does not change a proposal's identity.
    let mut resealed = sealed.clone();
    resealed.signatures.clear();
    assert_eq!(resealed.digest(), sealed.digest());
}

#[test]
fn message_codes_are_stable() {
    let codes: Vec<u64> = sample_messages()
        .iter()
        .map(|message| message.code().code())
        .collect();
    assert_eq!(codes, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(MessageCode::from_code(8), None);
}

#[test]
fn unsigned_envelopes_decode_only_without_authentication() {
    let keypair = random_keypair();
    let validator_set: ValidatorSet = [keypair.public()].into_iter().collect();
    let message = Message::Request(Request {
        payload: vec![1, 2, 3],
    });

    let envelope = Envelope::encode(&message, keypair.address(), None);
    assert_eq!(envelope.decode(None).unwrap(), message);
    assert!(matches!(
        envelope.decode(Some(&validator_set)),
        Err(CodecError::Authentication(AuthenticationError::MissingSignature))
    ));
}

#[test]
fn envelopes_from_outside_the_validator_set_are_rejected() {
    let member = random_keypair();
    let outsider = random_keypair();
    let validator_set: ValidatorSet = [member.public()].into_iter().collect();

    let envelope = Envelope::seal(&sample_messages()[0], &outsider);
    match envelope.decode(Some(&validator_set)) {
        Err(CodecError::Authentication(AuthenticationError::UnknownSigner(address))) => {
            assert_eq!(address, outsider.address())
        }
        other => panic!("expected UnknownSigner, got {:?}", other),
    }
}

#[test]
fn tampered_envelopes_are_rejected() {
    let keypair = random_keypair();
    let impostor = random_keypair();
    let validator_set: ValidatorSet = [keypair.public(), impostor.public()].into_iter().collect();

    // A modified payload no longer matches the signature.
    let mut envelope = Envelope::seal(&sample_messages()[0], &keypair);
    envelope.payload.push(0);
    assert!(matches!(
        envelope.decode(Some(&validator_set)),
        Err(CodecError::Authentication(AuthenticationError::InvalidSignature(_)))
    ));

    // A message re-attributed to another validator fails too.
    let mut envelope = Envelope::seal(&sample_messages()[2], &keypair);
    envelope.address = impostor.address();
    assert!(matches!(
        envelope.decode(Some(&validator_set)),
        Err(CodecError::Authentication(AuthenticationError::InvalidSignature(_)))
    ));

    // The signature covers the code, so a Prepare cannot be replayed as a Commit.
    let mut envelope = Envelope::seal(&sample_messages()[2], &keypair);
    envelope.code = MessageCode::Commit.code();
    assert!(matches!(
        envelope.decode(Some(&validator_set)),
        Err(CodecError::Authentication(AuthenticationError::InvalidSignature(_)))
    ));
}

#[test]
fn unknown_codes_are_rejected() {
    let keypair = random_keypair();
    let envelope = Envelope::encode(&sample_messages()[0], keypair.address(), None);
    let envelope = Envelope {
        code: 42,
        ..envelope
    };
    assert!(matches!(
        envelope.decode(None),
        Err(CodecError::UnknownCode(42))
    ));
}

#[test]
fn payloads_that_do_not_match_their_code_are_malformed() {
    let keypair = random_keypair();
    let validator_set: ValidatorSet = [keypair.public()].into_iter().collect();

    // A Prepare payload with a trailing byte.
    let mut payload = sample_messages()[2].payload();
    payload.push(0);
    let envelope = Envelope {
        code: MessageCode::Prepare.code(),
        address: keypair.address(),
        payload: payload.clone(),
        signature: None,
    };
    assert!(matches!(envelope.decode(None), Err(CodecError::Malformed(_))));

    // A Request payload labelled as a Preprepare, correctly signed.
    let request = Request {
        payload: vec![9; 4],
    }
    .try_to_vec()
    .unwrap();
    let mut envelope = Envelope::encode(&sample_messages()[0], keypair.address(), Some(&keypair));
    envelope.code = MessageCode::Preprepare.code();
    envelope.payload = request;
    envelope.signature = Some(keypair.sign(&signing_input(&envelope)));
    assert!(matches!(
        envelope.decode(Some(&validator_set)),
        Err(CodecError::Malformed(_))
    ));
}

#[test]
fn truncated_wire_bytes_are_malformed() {
    let keypair = random_keypair();
    let bytes = Envelope::seal(&sample_messages()[1], &keypair).to_bytes();
    assert!(matches!(
        Envelope::from_bytes(&bytes[..bytes.len() - 1]),
        Err(CodecError::Malformed(_))
    ));

    let mut extended = bytes.clone();
    extended.push(0);
    assert!(matches!(
        Envelope::from_bytes(&extended),
        Err(CodecError::Malformed(_))
    ));
}

fn signing_input(envelope: &Envelope) -> Vec<u8> {
    let mut bytes = envelope.code.to_le_bytes().to_vec();
    bytes.extend_from_slice(&envelope.payload);
    bytes
}
