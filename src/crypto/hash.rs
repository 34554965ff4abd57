// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cryptographic hash function.
//!
//! This module abstracts the specific cryptographic hash function shared by
//! the harness and the consensus nodes. Currently, SHA-256 is used.
//!
//! Nodes identify blocks by hex strings, so most functions here return the
//! lowercase hex rendering of the digest rather than raw bytes.
//! Any divergence from the node's digest silently breaks grinding.

use sha2::{Digest, Sha256};

/// Raw SHA-256 digest.
pub type Hash = [u8; 32];

/// Hashes the given data using SHA-256.
#[must_use]
pub fn hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hashes all the given data slices together using SHA-256.
///
/// Equivalent to hashing the concatenation of all slices.
#[must_use]
pub fn hash_all(data: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for item in data {
        hasher.update(item);
    }
    hasher.finalize().into()
}

/// Hashes the given data and returns the digest as 64 lowercase hex characters.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(hash(data))
}

/// Hashes the concatenation of all transaction ids, in the given order.
#[must_use]
pub fn transactions_hash<S: AsRef<str>>(txids: &[S]) -> String {
    let parts: Vec<&[u8]> = txids.iter().map(|id| id.as_ref().as_bytes()).collect();
    hex::encode(hash_all(&parts))
}

/// Recomputes a block's hash the way the consensus nodes do.
///
/// This is `sha256(prev_block_hash || sha256(txid_0 || txid_1 || ...))`,
/// where both inner and outer digests are hex strings.
#[must_use]
pub fn block_hash<S: AsRef<str>>(prev_block_hash: &str, txids: &[S]) -> String {
    let txs_hash = transactions_hash(txids);
    hex::encode(hash_all(&[prev_block_hash.as_bytes(), txs_hash.as_bytes()]))
}
