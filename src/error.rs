// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy of the harness.
//!
//! Only transport failures during bootstrap are retried.
//! Everything else ends the run after stopping all nodes.

use thiserror::Error;

use crate::network::ChannelError;

/// Error type for harness operations.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("node {node} is unreachable")]
    Transport {
        node: String,
        #[source]
        source: ChannelError,
    },
    #[error("malformed response to '{command}'")]
    MalformedResponse {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("node {node} returned an empty response to '{command}'")]
    EmptyResponse { node: String, command: &'static str },
    #[error("nodes did not start within {attempts} attempts")]
    BootstrapTimeout { attempts: usize },
    #[error("node {node} computed next validator {actual}, expected {expected}")]
    Desynchronized {
        node: String,
        expected: String,
        actual: String,
    },
    #[error("validator {0} is not known")]
    UnknownValidator(String),
    #[error("stake pool is empty")]
    EmptyStakePool,
    #[error("fleet has no nodes")]
    EmptyFleet,
    #[error("blockchain is empty")]
    EmptyBlockchain,
    #[error("newest block has no coinbase transaction")]
    MissingCoinbase,
    #[error("node {node} kept output {txid} unspent after spending it")]
    UnspentNotConsumed { node: String, txid: String },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl HarnessError {
    /// Returns `true` iff this error stems from a node being unreachable.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}
