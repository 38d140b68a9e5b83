/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exhaustive enumeration of every message variant used in PBFT-rs, and the signed envelope that
//! carries them over the wire.
//!
//! ## Wire format
//!
//! Every message crosses the network as the Borsh encoding of an [`Envelope`]:
//! `(code: u64, address: [u8; 20], payload: Vec<u8>, signature: Option<[u8; 64]>)`.
//!
//! `code` is one of the [`MessageCode`]s, and `payload` is the Borsh encoding of the typed message
//! that `code` names. The signature is an Ed25519 signature over
//! `code.to_le_bytes() ∥ payload`, made by the validator whose address is `address`.
//!
//! ## Decoding
//!
//! [`Envelope::decode`] first authenticates the envelope (if given a validator set to check against),
//! then parses the payload into the concrete type named by `code`. Any payload that does not match its
//! declared kind's schema exactly, including one with trailing bytes, is rejected as
//! [`CodecError::Malformed`].

use std::fmt::{self, Display, Formatter};
use std::io;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    checkpoint::messages::Hello,
    pbft::messages::{Preprepare, Request, Subject},
    types::{
        crypto_primitives::{canonical_bytes, Keypair},
        data_types::{Address, SignatureBytes, View},
        signed_messages::SignedMessage,
        validator_set::ValidatorSet,
    },
    view_change::messages::{NewView, ViewChange},
};

/// Numeric identifier of each message kind on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageCode {
    Request,
    Preprepare,
    Prepare,
    Commit,
    Checkpoint,
    ViewChange,
    NewView,
    Hello,
}

impl MessageCode {
    pub const fn code(self) -> u64 {
        match self {
            MessageCode::Request => 0,
            MessageCode::Preprepare => 1,
            MessageCode::Prepare => 2,
            MessageCode::Commit => 3,
            MessageCode::Checkpoint => 4,
            MessageCode::ViewChange => 5,
            MessageCode::NewView => 6,
            MessageCode::Hello => 7,
        }
    }

    pub const fn from_code(code: u64) -> Option<MessageCode> {
        match code {
            0 => Some(MessageCode::Request),
            1 => Some(MessageCode::Preprepare),
            2 => Some(MessageCode::Prepare),
            3 => Some(MessageCode::Commit),
            4 => Some(MessageCode::Checkpoint),
            5 => Some(MessageCode::ViewChange),
            6 => Some(MessageCode::NewView),
            7 => Some(MessageCode::Hello),
            _ => None,
        }
    }
}

impl Display for MessageCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// All message variants used in PBFT-rs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Preprepare(Preprepare),
    Prepare(Subject),
    Commit(Subject),
    Checkpoint(Subject),
    ViewChange(ViewChange),
    NewView(NewView),
    Hello(Hello),
}

impl Message {
    pub fn code(&self) -> MessageCode {
        match self {
            Message::Request(_) => MessageCode::Request,
            Message::Preprepare(_) => MessageCode::Preprepare,
            Message::Prepare(_) => MessageCode::Prepare,
            Message::Commit(_) => MessageCode::Commit,
            Message::Checkpoint(_) => MessageCode::Checkpoint,
            Message::ViewChange(_) => MessageCode::ViewChange,
            Message::NewView(_) => MessageCode::NewView,
            Message::Hello(_) => MessageCode::Hello,
        }
    }

    /// Get the canonical encoding of the inner message.
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Message::Request(request) => canonical_bytes(request),
            Message::Preprepare(preprepare) => canonical_bytes(preprepare),
            Message::Prepare(subject) | Message::Commit(subject) | Message::Checkpoint(subject) => {
                canonical_bytes(subject)
            }
            Message::ViewChange(view_change) => canonical_bytes(view_change),
            Message::NewView(new_view) => canonical_bytes(new_view),
            Message::Hello(hello) => canonical_bytes(hello),
        }
    }

    /// Get the round that the inner message belongs to, if it belongs to one.
    ///
    /// Checkpoints are not bound to a round: their view number is always 0.
    pub fn view(&self) -> Option<View> {
        match self {
            Message::Preprepare(preprepare) => Some(preprepare.view),
            Message::Prepare(subject) | Message::Commit(subject) => Some(subject.view),
            Message::ViewChange(view_change) => Some(view_change.view),
            Message::NewView(new_view) => Some(new_view.view),
            Message::Request(_) | Message::Checkpoint(_) | Message::Hello(_) => None,
        }
    }

    fn from_payload(code: MessageCode, payload: &[u8]) -> Result<Message, CodecError> {
        let message = match code {
            MessageCode::Request => Message::Request(Request::try_from_slice(payload)?),
            MessageCode::Preprepare => Message::Preprepare(Preprepare::try_from_slice(payload)?),
            MessageCode::Prepare => Message::Prepare(Subject::try_from_slice(payload)?),
            MessageCode::Commit => Message::Commit(Subject::try_from_slice(payload)?),
            MessageCode::Checkpoint => Message::Checkpoint(Subject::try_from_slice(payload)?),
            MessageCode::ViewChange => Message::ViewChange(ViewChange::try_from_slice(payload)?),
            MessageCode::NewView => Message::NewView(NewView::try_from_slice(payload)?),
            MessageCode::Hello => Message::Hello(Hello::try_from_slice(payload)?),
        };
        Ok(message)
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Message::Request(value)
    }
}

impl From<Preprepare> for Message {
    fn from(value: Preprepare) -> Self {
        Message::Preprepare(value)
    }
}

impl From<ViewChange> for Message {
    fn from(value: ViewChange) -> Self {
        Message::ViewChange(value)
    }
}

impl From<NewView> for Message {
    fn from(value: NewView) -> Self {
        Message::NewView(value)
    }
}

impl From<Hello> for Message {
    fn from(value: Hello) -> Self {
        Message::Hello(value)
    }
}

/// A protocol message wrapped for transmission: its kind, its sender, its canonical encoding, and the
/// sender's signature over the first and third.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Envelope {
    pub code: u64,
    pub address: Address,
    pub payload: Vec<u8>,
    pub signature: Option<SignatureBytes>,
}

impl Envelope {
    /// Encode `message` into an envelope from `sender`. If `signer` is provided, the envelope is signed
    /// with it.
    pub fn encode(message: &Message, sender: Address, signer: Option<&Keypair>) -> Envelope {
        let code = message.code();
        let payload = message.payload();
        let signature = signer.map(|keypair| keypair.sign(&signing_bytes(code.code(), &payload)));
        Envelope {
            code: code.code(),
            address: sender,
            payload,
            signature,
        }
    }

    /// Encode `message` into an envelope signed by, and sent from, `keypair`.
    pub fn seal(message: &Message, keypair: &Keypair) -> Envelope {
        Self::encode(message, keypair.address(), Some(keypair))
    }

    /// Decode the typed message inside this envelope.
    ///
    /// If `validator_set` is provided, the envelope is first authenticated: it must carry a signature,
    /// its sender must be a member of `validator_set`, and the signature must verify against the
    /// sender's registered verifying key.
    pub fn decode(&self, validator_set: Option<&ValidatorSet>) -> Result<Message, CodecError> {
        if let Some(validator_set) = validator_set {
            self.authenticate(validator_set)?;
        }
        let code = MessageCode::from_code(self.code).ok_or(CodecError::UnknownCode(self.code))?;
        Message::from_payload(code, &self.payload)
    }

    fn authenticate(&self, validator_set: &ValidatorSet) -> Result<(), AuthenticationError> {
        if self.signature.is_none() {
            return Err(AuthenticationError::MissingSignature);
        }
        let verifying_key = validator_set
            .verifying_key(&self.address)
            .ok_or(AuthenticationError::UnknownSigner(self.address))?;
        if !self.is_correct(verifying_key) {
            return Err(AuthenticationError::InvalidSignature(self.address));
        }
        Ok(())
    }

    /// Get the wire bytes of this envelope.
    pub fn to_bytes(&self) -> Vec<u8> {
        canonical_bytes(self)
    }

    /// Parse an envelope from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Envelope, CodecError> {
        Ok(Envelope::try_from_slice(bytes)?)
    }

    pub fn size(&self) -> u64 {
        (self.payload.len() + std::mem::size_of::<Envelope>()) as u64
    }
}

impl SignedMessage for Envelope {
    fn message_bytes(&self) -> Vec<u8> {
        signing_bytes(self.code, &self.payload)
    }

    fn signature_bytes(&self) -> Option<SignatureBytes> {
        self.signature
    }
}

/// Get the bytes that a message with `code` and `payload` is signed over: `code.to_le_bytes() ∥ payload`.
///
/// Votes are signed over these bytes too, so that the signature of a Prepare, Commit, or Checkpoint
/// envelope can be lifted as-is into a [quorum certificate](crate::pbft::types::QuorumCertificate).
pub(crate) fn signing_bytes(code: u64, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + payload.len());
    bytes.extend_from_slice(&code.to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Reasons why an envelope fails to decode.
#[derive(Debug)]
pub enum CodecError {
    /// The envelope's code is not one of the [`MessageCode`]s.
    UnknownCode(u64),
    /// The envelope, or its payload, does not match the schema of its declared kind.
    Malformed(io::Error),
    /// The envelope failed authentication.
    Authentication(AuthenticationError),
}

impl From<io::Error> for CodecError {
    fn from(value: io::Error) -> Self {
        CodecError::Malformed(value)
    }
}

impl From<AuthenticationError> for CodecError {
    fn from(value: AuthenticationError) -> Self {
        CodecError::Authentication(value)
    }
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnknownCode(code) => write!(f, "unknown message code {}", code),
            CodecError::Malformed(err) => write!(f, "malformed message: {}", err),
            CodecError::Authentication(err) => write!(f, "authentication failed: {}", err),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthenticationError {
    /// The envelope carries no signature.
    MissingSignature,
    /// The sender is not a member of the validator set.
    UnknownSigner(Address),
    /// The signature does not verify against the sender's verifying key.
    InvalidSignature(Address),
}

impl Display for AuthenticationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AuthenticationError::MissingSignature => write!(f, "missing signature"),
            AuthenticationError::UnknownSigner(address) => {
                write!(f, "{} is not in the validator set", address)
            }
            AuthenticationError::InvalidSignature(address) => {
                write!(f, "invalid signature from {}", address)
            }
        }
    }
}
