// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Simulated node channel.
//!
//! This module provides an in-memory cluster of consensus nodes,
//! which may be used for local testing and simulations.
//! A [`SimulatedCluster`] owns one ledger model per node and implements
//! [`NodeChannel`] by executing each command directly on the addressed node.
//! Node `i` is reachable at `127.0.0.{i+1}` on [`PORT`].
//!
//! Faults can be injected per node: delayed startup, refused connections,
//! crashes after a number of commands and diverging leader selection.

mod node;

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::debug;

use self::node::SimulatedNode;
use super::{ChannelError, Command, MAX_COMMAND_BYTES, NodeChannel, RECEIVE_BUFFER_SIZE};
use crate::crypto::sha256_hex;
use crate::fleet::{Fleet, Node};
use crate::types::{BlockInfo, OutputRef, StakeEntry};

/// Port all simulated nodes listen on.
pub const PORT: u16 = 8080;

/// Maximum number of nodes, bounded by the last octet of their IPs.
const MAX_NODES: usize = 254;

/// A node together with its injected faults.
struct NodeSlot {
    node: SimulatedNode,
    stopped: bool,
    refusing: bool,
    /// Number of `getBlockCount` polls still answered as if starting up.
    startup_polls: usize,
    /// Number of commands handled before the node crashes.
    crash_after: Option<usize>,
}

/// In-memory cluster of simulated consensus nodes.
///
/// Cloning gives another handle to the same cluster.
#[derive(Clone)]
pub struct SimulatedCluster {
    nodes: Arc<Mutex<Vec<NodeSlot>>>,
    max_command_bytes: Arc<AtomicUsize>,
}

impl SimulatedCluster {
    /// Creates a new cluster of `count` freshly started nodes.
    ///
    /// All nodes share the same genesis block and have distinct addresses.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the number of addressable nodes (254).
    #[must_use]
    pub fn new(count: usize) -> Self {
        assert!(count <= MAX_NODES, "at most {MAX_NODES} simulated nodes");
        let nodes = (0..count)
            .map(|i| NodeSlot {
                node: SimulatedNode::new(sha256_hex(format!("simulated node {i}").as_bytes())),
                stopped: false,
                refusing: false,
                startup_polls: 0,
                crash_after: None,
            })
            .collect();
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
            max_command_bytes: Arc::new(AtomicUsize::new(MAX_COMMAND_BYTES)),
        }
    }

    /// Gives the number of nodes in the cluster.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Gives fleet entries for all nodes, in order.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        (0..self.len())
            .map(|i| Node::new(format!("node{i}"), Self::ip(i)))
            .collect()
    }

    /// Creates a fleet driving all nodes of this cluster.
    ///
    /// # Panics
    ///
    /// Panics if the cluster has no nodes.
    #[must_use]
    pub fn fleet(&self) -> Fleet<Self> {
        Fleet::new(self.nodes(), PORT, self.clone()).expect("cluster has nodes")
    }

    /// Gives the consensus address of node `index`.
    #[must_use]
    pub fn address(&self, index: usize) -> String {
        self.lock()[index].node.address().to_owned()
    }

    /// Gives node `index`'s copy of the chain.
    #[must_use]
    pub fn chain(&self, index: usize) -> Vec<BlockInfo> {
        self.lock()[index].node.chain().to_vec()
    }

    /// Gives node `index`'s pending transactions.
    #[must_use]
    pub fn mempool(&self, index: usize) -> Vec<OutputRef> {
        self.lock()[index].node.mempool().to_vec()
    }

    /// Gives all spendable outputs known to node `index`, of all owners.
    #[must_use]
    pub fn unspent(&self, index: usize) -> Vec<OutputRef> {
        self.lock()[index].node.unspent()
    }

    /// Gives node `index`'s current stake pool.
    #[must_use]
    pub fn stake_pool(&self, index: usize) -> Vec<StakeEntry> {
        self.lock()[index]
            .node
            .stake_pool_addresses()
            .into_iter()
            .map(|address| StakeEntry { address })
            .collect()
    }

    /// Returns `true` iff node `index` received `stop` or crashed.
    #[must_use]
    pub fn is_stopped(&self, index: usize) -> bool {
        self.lock()[index].stopped
    }

    /// Makes node `index` report height 0 for its next `polls` height queries.
    pub fn delay_start(&self, index: usize, polls: usize) {
        self.lock()[index].startup_polls = polls;
    }

    /// Makes node `index` refuse all connections.
    pub fn refuse_connections(&self, index: usize) {
        self.lock()[index].refusing = true;
    }

    /// Makes node `index` crash after handling `commands` more commands.
    pub fn crash_after(&self, index: usize, commands: usize) {
        self.lock()[index].crash_after = Some(commands);
    }

    /// Makes node `index` disagree with all others on the next block proposer.
    pub fn diverge_validator(&self, index: usize) {
        self.lock()[index].node.diverged = true;
    }

    /// Makes every node reject commands longer than `max` bytes.
    pub fn limit_commands(&self, max: usize) {
        self.max_command_bytes.store(max, Ordering::Relaxed);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<NodeSlot>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ip(index: usize) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, index as u8 + 1))
    }

    fn index_of(addr: SocketAddr) -> Option<usize> {
        match addr.ip() {
            IpAddr::V4(ip) if addr.port() == PORT && ip.octets()[..3] == [127, 0, 0] => {
                usize::from(ip.octets()[3]).checked_sub(1)
            }
            _ => None,
        }
    }
}

fn refused() -> ChannelError {
    ChannelError::Io(std::io::Error::from(ErrorKind::ConnectionRefused))
}

#[async_trait]
impl NodeChannel for SimulatedCluster {
    async fn send(&self, command: &Command, to: SocketAddr) -> Result<String, ChannelError> {
        let len = command.to_string().len();
        let max = self.max_command_bytes();
        if len > max {
            return Err(ChannelError::CommandTooLarge { len, max });
        }

        let mut nodes = self.lock();
        let slot = Self::index_of(to)
            .and_then(|i| nodes.get_mut(i))
            .ok_or_else(refused)?;
        if slot.refusing || slot.stopped {
            return Err(refused());
        }
        if let Some(remaining) = slot.crash_after.as_mut() {
            if *remaining == 0 {
                debug!("simulated node at {to} crashed");
                slot.stopped = true;
                return Err(refused());
            }
            *remaining -= 1;
        }

        let response = match command {
            Command::GetBlockCount if slot.startup_polls > 0 => {
                slot.startup_polls -= 1;
                "0".to_owned()
            }
            Command::Stop => {
                slot.stopped = true;
                String::new()
            }
            _ => slot.node.handle(command),
        };
        if response.len() > RECEIVE_BUFFER_SIZE {
            return Err(ChannelError::ResponseTooLarge {
                max: RECEIVE_BUFFER_SIZE,
            });
        }
        Ok(response)
    }

    fn max_command_bytes(&self) -> usize {
        self.max_command_bytes.load(Ordering::Relaxed)
    }
}
