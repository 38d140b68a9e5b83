/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes, and do not have any major "active" behavior.

use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    ops::{Add, AddAssign, SubAssign},
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Number that identifies a round of leader rotation within a single sequence.
///
/// Resets to 0 every time the sequence advances, and increases by 1 on every successful view change.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    /// Create a new `ViewNumber` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `ViewNumber`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for ViewNumber {
    type Output = ViewNumber;
    fn add(self, rhs: u64) -> Self::Output {
        ViewNumber::new(self.0.saturating_add(rhs))
    }
}

/// Height of a proposal in the chain.
///
/// Starts at 0 for the genesis block. The first proposal agreed on by the validator set has sequence 1.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// Create a new `SequenceNumber` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `SequenceNumber`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the little-endian representation of the inner `u64` value of this `SequenceNumber`.
    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for SequenceNumber {
    type Output = SequenceNumber;
    fn add(self, rhs: u64) -> Self::Output {
        SequenceNumber::new(self.0.saturating_add(rhs))
    }
}

impl AddAssign<u64> for SequenceNumber {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.saturating_add(rhs)
    }
}

/// A `(view_number, sequence)` pair identifying a round and, through it, the round's proposer.
///
/// # Ordering
///
/// Views are ordered by `sequence` first and by `view_number` second, so that every view of a later
/// sequence is greater than every view of an earlier one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct View {
    pub view_number: ViewNumber,
    pub sequence: SequenceNumber,
}

impl View {
    pub const fn new(view_number: ViewNumber, sequence: SequenceNumber) -> Self {
        Self {
            view_number,
            sequence,
        }
    }
}

impl Ord for View {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then(self.view_number.cmp(&other.view_number))
    }
}

impl PartialOrd for View {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for View {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "(view: {}, sequence: {})", self.view_number, self.sequence)
    }
}

/// 32-byte cryptographic hash.
///
/// Within PBFT-rs, `CryptoHash`-es are always SHA256 hashes. They are used as proposal digests and as
/// payload data hashes.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|byte| write!(f, "{:02x}", byte))
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "CryptoHash({})", self)
    }
}

/// 20-byte identifier of a validator.
///
/// The address of a validator is the last 20 bytes of the SHA256 hash of its Ed25519 verifying key.
/// Use [`Keypair::address`](super::crypto_primitives::Keypair::address) or
/// [`address_of`](super::crypto_primitives::address_of) to derive one.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Address([u8; 20]);

impl Address {
    /// Create a new `Address` wrapping `bytes`.
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 20]` value of this `Address`.
    pub const fn bytes(&self) -> [u8; 20] {
        self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        self.0.iter().try_for_each(|byte| write!(f, "{:02x}", byte))
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

/// Ed25519 digital signature.
///
/// Within PBFT-rs, these are produced using the [`ed25519_dalek`] crate, whose main definitions
/// are re-exported from the [`crypto_primitives`](super::crypto_primitives) module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes(")?;
        self.0[..4]
            .iter()
            .try_for_each(|byte| write!(f, "{:02x}", byte))?;
        write!(f, "..)")
    }
}

/// Size of a message buffer, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BufferSize(u64);

impl BufferSize {
    /// Create a new `BufferSize` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `BufferSize`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl AddAssign<u64> for BufferSize {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.saturating_add(rhs)
    }
}

impl SubAssign<u64> for BufferSize {
    fn sub_assign(&mut self, rhs: u64) {
        self.0 = self.0.saturating_sub(rhs)
    }
}
