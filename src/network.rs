// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! An abstraction layer for talking to consensus nodes.
//!
//! Nodes are driven through a plain-text command protocol: one [`Command`]
//! per connection, answered by exactly one response string.
//! The [`NodeChannel`] trait provides a common interface for this.
//!
//! Specific implementations are provided:
//! - [`TcpChannel`] opens a fresh TCP connection for every command
//! - [`SimulatedCluster`] answers commands from in-memory node models, for testing
//!
//! # Examples
//!
//! ```
//! use std::net::SocketAddr;
//!
//! use grinding_attack::network::{Command, NodeChannel};
//!
//! async fn block_count(channel: impl NodeChannel, node: SocketAddr) -> Option<u64> {
//!     let response = channel.send(&Command::GetBlockCount, node).await.ok()?;
//!     response.parse().ok()
//! }
//! ```

pub mod simulated;
mod tcp;

use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use static_assertions::const_assert;
use thiserror::Error;

pub use self::simulated::SimulatedCluster;
pub use self::tcp::TcpChannel;

/// Maximum number of bytes a node accepts in a single command.
///
/// This bounds how many transaction ids fit into one `proposeBlock` command.
pub const MAX_COMMAND_BYTES: usize = 4096;

/// Number of bytes used as buffer for any response.
///
/// Some responses (`printBlockchain` in particular) grow with the chain.
pub const RECEIVE_BUFFER_SIZE: usize = 60_000;
const_assert!(MAX_COMMAND_BYTES < RECEIVE_BUFFER_SIZE);

/// Keeps the longest prefix of `txids` whose `proposeBlock` command fits into `max_bytes`.
///
/// Returns the number of ids that were cut.
pub fn fit_proposal(txids: &mut Vec<String>, max_bytes: usize) -> usize {
    // "proposeBlock {" + "}", ids are joined by single spaces
    let mut len = Command::ProposeBlock { txids: Vec::new() }.to_string().len();
    let fitting = txids
        .iter()
        .take_while(|txid| {
            len += txid.len() + 1;
            len <= max_bytes + 1
        })
        .count();
    let cut = txids.len() - fitting;
    txids.truncate(fitting);
    cut
}

/// Command understood by the consensus nodes.
///
/// Its [`Display`] implementation renders the exact wire format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Mine a block containing only a coinbase transaction.
    Generate,
    /// Dump the full chain as JSON.
    PrintBlockchain,
    /// Fetch details of a single transaction as JSON.
    PrintTransaction { txid: String },
    /// Fetch the node's own address.
    PrintAddress,
    /// Fetch the chain height.
    GetBlockCount,
    /// List pending transactions as JSON.
    ListMempool,
    /// List spendable outputs owned by the node as JSON.
    ListUnspentLinkedToMe,
    /// List the current stake pool as JSON.
    ListStakepool,
    /// List the previous stake pool snapshot as JSON.
    ListOldStakepool,
    /// Compute the address of the next block proposer.
    CountNextValidator,
    /// Register a coinbase transaction that is not part of a block yet.
    LoadCoinbaseTransaction { address: String, timestamp: String },
    /// Register a transfer created on another node.
    LoadTransaction {
        from_txid: String,
        from_address: String,
        to_address: String,
        timestamp: String,
    },
    /// Originate a new transfer spending the given output.
    CreateNewTransaction {
        txid: String,
        from_address: String,
        to_address: String,
    },
    /// Commit a block with the given ordered transactions.
    ProposeBlock { txids: Vec<String> },
    /// Deposit the given output as stake.
    Stake { txid: String, address: String },
    /// Terminate the node process.
    Stop,
}

impl Command {
    /// Returns the command's name, without arguments.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::PrintBlockchain => "printBlockchain",
            Self::PrintTransaction { .. } => "printTransaction",
            Self::PrintAddress => "printAddress",
            Self::GetBlockCount => "getBlockCount",
            Self::ListMempool => "listMempool",
            Self::ListUnspentLinkedToMe => "listUnspentLinkedToMe",
            Self::ListStakepool => "listStakepool",
            Self::ListOldStakepool => "listOldStakepool",
            Self::CountNextValidator => "countNextValidator",
            Self::LoadCoinbaseTransaction { .. } => "loadCoinbaseTransaction",
            Self::LoadTransaction { .. } => "loadTransaction",
            Self::CreateNewTransaction { .. } => "createNewTransaction",
            Self::ProposeBlock { .. } => "proposeBlock",
            Self::Stake { .. } => "stake",
            Self::Stop => "stop",
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        match self {
            Self::PrintTransaction { txid } => write!(f, "{name} {txid}"),
            Self::LoadCoinbaseTransaction { address, timestamp } => {
                write!(f, "{name} {address} {timestamp}")
            }
            Self::LoadTransaction {
                from_txid,
                from_address,
                to_address,
                timestamp,
            } => write!(
                f,
                "{name} {from_txid} {from_address} {to_address} {timestamp}"
            ),
            Self::CreateNewTransaction {
                txid,
                from_address,
                to_address,
            } => write!(f, "{name} {txid} {from_address} {to_address}"),
            Self::ProposeBlock { txids } => write!(f, "{name} {{{}}}", txids.join(" ")),
            Self::Stake { txid, address } => write!(f, "{name} {txid} {address}"),
            _ => f.write_str(name),
        }
    }
}

/// Error type for channel operations.
///
/// Any of these means the node could not be reached or answered unusably.
/// Whether that is fatal is decided by the caller.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("timed out waiting for the node")]
    Timeout,
    #[error("command of {len} bytes exceeds the limit of {max} bytes")]
    CommandTooLarge { len: usize, max: usize },
    #[error("response exceeds the receive buffer of {max} bytes")]
    ResponseTooLarge { max: usize },
    #[error("response is not valid UTF-8")]
    InvalidUtf8,
    #[error("bad socket state")]
    Io(#[from] std::io::Error),
}

/// Abstraction of a synchronous request/response channel to consensus nodes.
///
/// Implementations must not reorder commands sent to the same node.
#[async_trait]
pub trait NodeChannel: Send + Sync {
    /// Sends one command to the node at `to` and waits for its single reply.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the node is unreachable or its reply unusable.
    async fn send(&self, command: &Command, to: SocketAddr) -> Result<String, ChannelError>;

    /// Gives the length of the longest command [`NodeChannel::send`] accepts.
    fn max_command_bytes(&self) -> usize {
        MAX_COMMAND_BYTES
    }
}

#[async_trait]
impl<C: NodeChannel + ?Sized> NodeChannel for Arc<C> {
    async fn send(&self, command: &Command, to: SocketAddr) -> Result<String, ChannelError> {
        (**self).send(command, to).await
    }

    fn max_command_bytes(&self) -> usize {
        (**self).max_command_bytes()
    }
}
