/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.
//!
//! The definitions and re-exports in this module provide two categories of cryptographic primitives:
//! 1. **Cryptographic Hashes**: provided by the [`sha2`] crate.
//! 2. **Digital Signatures**: provided by the [`ed25519_dalek`] crate.

use borsh::BorshSerialize;

use super::data_types::{Address, CryptoHash, SignatureBytes};

// re-exports below.
pub use sha2::Digest;
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};

/// A facade around [`SigningKey`] that implements method for [`sign`](Self::sign)-ing messages as well
/// as getters for the [`public`](Self::public) key and the [`address`](Self::address) associated with
/// the signing key.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    address: Address,
}

impl Keypair {
    /// Create a `Keypair` that wraps over `signing_key`.
    pub fn new(signing_key: SigningKey) -> Keypair {
        let address = address_of(&signing_key.verifying_key());
        Keypair {
            signing_key,
            address,
        }
    }

    /// Sign an arbitrary `message` with the `Keypair`.
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes::new(self.signing_key.sign(message).to_bytes())
    }

    /// Get the `VerifyingKey` of this `Keypair`.
    pub fn public(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Get the validator address of this `Keypair`.
    pub fn address(&self) -> Address {
        self.address
    }
}

/// Derive the validator [`Address`] of `verifying_key`: the last 20 bytes of the SHA256 hash of the
/// key's compressed encoding.
pub fn address_of(verifying_key: &VerifyingKey) -> Address {
    let digest = hash(verifying_key.as_bytes());
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest.bytes()[12..]);
    Address::new(bytes)
}

/// Compute the SHA256 hash of `bytes`.
pub fn hash(bytes: &[u8]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update(bytes);
    CryptoHash::new(hasher.finalize().into())
}

/// Check that `signature` is a signature created by `verifying_key` over `message`.
pub fn verify(verifying_key: &VerifyingKey, message: &[u8], signature: &SignatureBytes) -> bool {
    let signature = Signature::from_bytes(&signature.bytes());
    verifying_key.verify(message, &signature).is_ok()
}

/// Get the canonical (Borsh) encoding of `value`.
pub(crate) fn canonical_bytes<T: BorshSerialize>(value: &T) -> Vec<u8> {
    // Writing into a `Vec<u8>` never fails.
    value
        .try_to_vec()
        .expect("Borsh serialization into a Vec<u8> failed")
}
