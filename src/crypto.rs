// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cryptographic primitives.
//!
//! The harness only needs the digest the consensus nodes use for block
//! identities, so it can predict leader selection before submitting a block.

pub mod hash;

pub use self::hash::{Hash, block_hash, hash, sha256_hex, transactions_hash};
