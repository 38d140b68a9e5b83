/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signed messages and the seals that certificates are made of.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    crypto_primitives::{verify, VerifyingKey},
    data_types::{Address, SignatureBytes},
};

/// Data types that contain: 1. A message, and 2. A digital signature over said message whose
/// correctness can be verified against a `VerifyingKey`.
pub trait SignedMessage {
    /// Get the bytes that are passed as input into the signing function to form the signature
    /// of the `SignedMessage`.
    fn message_bytes(&self) -> Vec<u8>;

    /// Get the signature of the `SignedMessage`, if it carries one.
    fn signature_bytes(&self) -> Option<SignatureBytes>;

    /// Verify that `signature_bytes` is a signature created by `verifying_key` over `message_bytes`.
    fn is_correct(&self, verifying_key: &VerifyingKey) -> bool {
        match self.signature_bytes() {
            Some(signature) => verify(verifying_key, &self.message_bytes(), &signature),
            None => false,
        }
    }
}

/// A validator's signature over a vote, together with the address of the validator that produced it.
///
/// Seals are what [quorum certificates](crate::pbft::types::QuorumCertificate) aggregate, and what a
/// finalized [`Proposal`](super::proposal::Proposal) carries in its `signatures` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct Seal {
    pub signer: Address,
    pub signature: SignatureBytes,
}

impl Seal {
    pub fn new(signer: Address, signature: SignatureBytes) -> Self {
        Self { signer, signature }
    }
}
