/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types shared by every sub-protocol: plain byte-carrying data types, cryptographic primitives,
//! the validator set, and proposals.

pub mod crypto_primitives;

pub mod data_types;

pub mod proposal;

pub mod signed_messages;

pub mod validator_set;
