// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The fixed set of consensus nodes driven by the harness.
//!
//! A [`Fleet`] owns the ordered list of [`Node`]s, the port they all listen on
//! and the [`NodeChannel`] used to reach them. Position 0 is the attacker.
//!
//! Node processes are started by a [`Launcher`], one background task per node.
//! Each task owns the lifetime of its remote process for the whole run.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use crate::HarnessError;
use crate::config::HarnessConfig;
use crate::network::{Command, NodeChannel};

/// A single consensus node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Login name on the node's host, also used in log output.
    pub name: String,
    pub ip: IpAddr,
    /// Consensus address of the node, known after [`Fleet::load_addresses`].
    address: Option<String>,
}

impl Node {
    /// Creates a new node whose consensus address is not known yet.
    #[must_use]
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            ip,
            address: None,
        }
    }

    /// Returns the node's consensus address, if already loaded.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }
}

/// Starts and supervises the process of a single node.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Runs the node's process, resolving once it terminated.
    ///
    /// # Errors
    ///
    /// Implementors should return an [`std::io::Error`] iff the process could not be run.
    async fn run(&self, node: &Node, port: u16) -> std::io::Result<()>;
}

/// Launches node processes on remote hosts over `ssh`.
#[derive(Clone, Debug)]
pub struct SshLauncher {
    binary: String,
}

impl SshLauncher {
    /// Creates a launcher that runs `binary` on every node's host.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Remote shell command starting the node in the background.
    fn remote_command(&self, port: u16) -> String {
        format!("({} {port} 0)&", self.binary)
    }
}

#[async_trait]
impl Launcher for SshLauncher {
    async fn run(&self, node: &Node, port: u16) -> std::io::Result<()> {
        let status = tokio::process::Command::new("ssh")
            .arg(format!("{}@{}", node.name, node.ip))
            .arg(self.remote_command(port))
            .status()
            .await?;
        if !status.success() {
            return Err(std::io::Error::other(format!(
                "ssh to {} exited with {status}",
                node.name
            )));
        }
        Ok(())
    }
}

/// Launcher for nodes that were started out of band.
#[derive(Clone, Copy, Debug, Default)]
pub struct DetachedLauncher;

#[async_trait]
impl Launcher for DetachedLauncher {
    async fn run(&self, _node: &Node, _port: u16) -> std::io::Result<()> {
        Ok(())
    }
}

/// Ordered, never empty collection of nodes plus the channel to reach them.
pub struct Fleet<C> {
    nodes: Vec<Node>,
    port: u16,
    channel: C,
}

impl<C: NodeChannel> Fleet<C> {
    /// Creates a new fleet of the given nodes, all listening on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::EmptyFleet`] if `nodes` is empty.
    pub fn new(nodes: Vec<Node>, port: u16, channel: C) -> Result<Self, HarnessError> {
        if nodes.is_empty() {
            return Err(HarnessError::EmptyFleet);
        }
        Ok(Self {
            nodes,
            port,
            channel,
        })
    }

    /// Creates the fleet described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::EmptyFleet`] if the config lists no nodes.
    pub fn from_config(config: &HarnessConfig, channel: C) -> Result<Self, HarnessError> {
        let nodes = config
            .nodes
            .iter()
            .map(|n| Node::new(n.name.clone(), n.ip))
            .collect();
        Self::new(nodes, config.port, channel)
    }

    /// Gives the number of nodes in the fleet.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always `false`, fleets cannot be empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Gives the length of the longest command the fleet's channel sends.
    #[must_use]
    pub fn max_command_bytes(&self) -> usize {
        self.channel.max_command_bytes()
    }

    /// Gives the node at the given fleet position.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Gives the socket address of the node at the given fleet position.
    #[must_use]
    pub fn socket_addr(&self, index: usize) -> SocketAddr {
        SocketAddr::new(self.nodes[index].ip, self.port)
    }

    /// Gives the consensus addresses of all nodes, in fleet order.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if addresses have not been loaded yet.
    pub fn addresses(&self) -> Result<Vec<String>, HarnessError> {
        self.nodes
            .iter()
            .map(|n| {
                n.address.clone().ok_or_else(|| {
                    HarnessError::Config(format!("address of {} not loaded", n.name))
                })
            })
            .collect()
    }

    /// Gives the consensus address of the attacker.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if addresses have not been loaded yet.
    pub fn attacker_address(&self) -> Result<&str, HarnessError> {
        self.nodes[0]
            .address()
            .ok_or_else(|| HarnessError::Config("attacker address not loaded".into()))
    }

    /// Finds the fleet position of the node with the given consensus address.
    #[must_use]
    pub fn position_of(&self, address: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.address() == Some(address))
    }

    /// Sends `command` to the node at fleet position `index`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Transport`] if the node is unreachable.
    pub async fn send(&self, index: usize, command: &Command) -> Result<String, HarnessError> {
        self.channel
            .send(command, self.socket_addr(index))
            .await
            .map_err(|source| HarnessError::Transport {
                node: self.nodes[index].name.clone(),
                source,
            })
    }

    /// Like [`Fleet::send`], but treats an empty response as an error.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::EmptyResponse`] if the node answered with nothing.
    pub async fn send_nonempty(
        &self,
        index: usize,
        command: &Command,
    ) -> Result<String, HarnessError> {
        let response = self.send(index, command).await?;
        if response.is_empty() {
            return Err(HarnessError::EmptyResponse {
                node: self.nodes[index].name.clone(),
                command: command.name(),
            });
        }
        Ok(response)
    }

    /// Sends `command` and parses the JSON response.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::MalformedResponse`] if the response does not parse as `T`.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        index: usize,
        command: &Command,
    ) -> Result<T, HarnessError> {
        let response = self.send(index, command).await?;
        serde_json::from_str(&response).map_err(|source| HarnessError::MalformedResponse {
            command: command.name(),
            source,
        })
    }

    /// Sends `command` to every node, in fleet order.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Transport`] on the first unreachable node.
    pub async fn broadcast(&self, command: &Command) -> Result<(), HarnessError> {
        for index in 0..self.len() {
            self.send(index, command).await?;
        }
        Ok(())
    }

    /// Sends `command` to every node except the one at fleet position `except`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Transport`] on the first unreachable node.
    pub async fn broadcast_except(
        &self,
        except: usize,
        command: &Command,
    ) -> Result<(), HarnessError> {
        for index in (0..self.len()).filter(|&i| i != except) {
            self.send(index, command).await?;
        }
        Ok(())
    }

    /// Queries every node for its consensus address and remembers it.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError`] if any node is unreachable or answers with nothing.
    pub async fn load_addresses(&mut self) -> Result<(), HarnessError> {
        for index in 0..self.len() {
            let address = self.send_nonempty(index, &Command::PrintAddress).await?;
            debug!("node {} has address {address}", self.nodes[index].name);
            self.nodes[index].address = Some(address);
        }
        Ok(())
    }

    /// Polls all nodes until each reports `expected_height` blocks.
    ///
    /// Polls once, then retries up to `retries` times, waiting `delay` before each retry.
    /// Unreachable nodes count as not ready yet.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::BootstrapTimeout`] if the retry budget is exhausted.
    pub async fn wait_until_ready(
        &self,
        expected_height: u64,
        retries: usize,
        delay: Duration,
    ) -> Result<(), HarnessError> {
        let expected = expected_height.to_string();
        for attempt in 0..=retries {
            let mut ready = true;
            for index in 0..self.len() {
                match self.send(index, &Command::GetBlockCount).await {
                    Ok(height) if height == expected => {}
                    Ok(height) => {
                        debug!("node {} at height '{height}'", self.nodes[index].name);
                        ready = false;
                    }
                    Err(err) => {
                        debug!("{err}");
                        ready = false;
                    }
                }
            }
            if ready {
                info!("all {} nodes are up", self.len());
                return Ok(());
            }
            if attempt < retries {
                info!("waiting for nodes to start ({}/{retries})", attempt + 1);
                tokio::time::sleep(delay).await;
            }
        }
        Err(HarnessError::BootstrapTimeout { attempts: retries })
    }

    /// Tells every node to stop, ignoring failures.
    pub async fn stop_all(&self) {
        for index in 0..self.len() {
            if let Err(err) = self.send(index, &Command::Stop).await {
                warn!("failed to stop node: {err}");
            }
        }
    }

    /// Launches every node's process in its own task, in fleet order.
    ///
    /// Waits `stagger` between consecutive launches so that each node can
    /// derive a distinct identity before the next one starts.
    pub async fn launch_all<L>(&self, launcher: Arc<L>, stagger: Duration) -> Vec<JoinHandle<()>>
    where
        L: Launcher + 'static,
    {
        let mut handles = Vec::with_capacity(self.len());
        for (index, node) in self.nodes.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(stagger).await;
            }
            let launcher = Arc::clone(&launcher);
            let node = node.clone();
            let port = self.port;
            handles.push(tokio::spawn(async move {
                match launcher.run(&node, port).await {
                    Ok(()) => debug!("launcher for {} finished", node.name),
                    Err(err) => warn!("launcher for {} failed: {err}", node.name),
                }
            }));
        }
        handles
    }
}

/// Waits for all launcher tasks to finish.
pub async fn join_launchers(handles: Vec<JoinHandle<()>>) {
    for res in join_all(handles).await {
        if let Err(err) = res {
            warn!("launcher task failed: {err}");
        }
    }
}
