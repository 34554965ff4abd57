// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Harness configuration.
//!
//! Configuration is read from a TOML file. Only the port and the list of
//! nodes are mandatory, everything else falls back to defaults that work
//! against the reference node implementation.
//!
//! ```toml
//! port = 8080
//!
//! [[nodes]]
//! name = "attacker"
//! ip = "10.0.0.1"
//!
//! [[nodes]]
//! name = "victim1"
//! ip = "10.0.0.2"
//!
//! [launch]
//! binary = "vulnCoin-server"
//!
//! [attack]
//! consensus_rounds = 15
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::HarnessError;
use crate::network::{MAX_COMMAND_BYTES, RECEIVE_BUFFER_SIZE};

/// Fewer pre-generated blocks than this may leave no node with two outputs to stake.
const MIN_SENSIBLE_PREGENERATED_BLOCKS: usize = 4;

/// Smallest command limit that still fits a `loadTransaction` with three full ids.
const MIN_COMMAND_BYTES: usize = 256;

/// Complete harness configuration, as stored in the config file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Port all nodes listen on.
    pub port: u16,
    /// All nodes, the attacker first.
    pub nodes: Vec<NodeConfig>,
    /// How to start the node processes, `None` if they are started out of band.
    #[serde(default)]
    pub launch: Option<LaunchConfig>,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub attack: AttackParams,
}

/// A single node, identified by login name and IP.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Login name on the node's host, also used in log output.
    pub name: String,
    pub ip: IpAddr,
}

/// Remote process launch settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Node executable on the remote hosts.
    #[serde(default = "default_binary")]
    pub binary: String,
}

/// Limits and timeouts of the node channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub connect_timeout_ms: u64,
    /// Maximum wait for the first byte of a response.
    pub response_timeout_ms: u64,
    /// Once a response started, it is considered complete after this much silence.
    pub response_idle_ms: u64,
    pub max_command_bytes: usize,
    pub receive_buffer_bytes: usize,
}

/// Parameters of the attack run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackParams {
    /// Number of random blocks created before staking starts.
    pub pregenerated_blocks: usize,
    /// Number of consensus rounds to run.
    pub consensus_rounds: usize,
    /// Chain height every node reports right after starting.
    pub expected_initial_height: u64,
    /// Number of liveness polls before giving up on bootstrap.
    pub startup_attempts: usize,
    pub retry_delay_ms: u64,
    /// Delay between launching consecutive nodes.
    pub launch_stagger_ms: u64,
    /// Pause after each created transaction, so no two share a timestamp.
    pub transaction_pause_ms: u64,
    /// Pause after each pre-generated block.
    pub block_pause_ms: u64,
    /// Seed for the harness's randomness, random if not set.
    pub seed: Option<u64>,
}

fn default_binary() -> String {
    "vulnCoin-server".to_owned()
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            response_timeout_ms: 30_000,
            response_idle_ms: 100,
            max_command_bytes: MAX_COMMAND_BYTES,
            receive_buffer_bytes: RECEIVE_BUFFER_SIZE,
        }
    }
}

impl ChannelConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    #[must_use]
    pub const fn response_idle(&self) -> Duration {
        Duration::from_millis(self.response_idle_ms)
    }
}

impl Default for AttackParams {
    fn default() -> Self {
        Self {
            pregenerated_blocks: 10,
            consensus_rounds: 15,
            expected_initial_height: 1,
            startup_attempts: 5,
            retry_delay_ms: 2_000,
            launch_stagger_ms: 1_000,
            transaction_pause_ms: 1_000,
            block_pause_ms: 1_000,
            seed: None,
        }
    }
}

impl AttackParams {
    /// Parameters without any pauses, for driving in-memory nodes.
    #[must_use]
    pub fn without_delays() -> Self {
        Self {
            retry_delay_ms: 0,
            launch_stagger_ms: 0,
            transaction_pause_ms: 0,
            block_pause_ms: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    #[must_use]
    pub const fn launch_stagger(&self) -> Duration {
        Duration::from_millis(self.launch_stagger_ms)
    }

    #[must_use]
    pub const fn transaction_pause(&self) -> Duration {
        Duration::from_millis(self.transaction_pause_ms)
    }

    #[must_use]
    pub const fn block_pause(&self) -> Duration {
        Duration::from_millis(self.block_pause_ms)
    }
}

impl HarnessConfig {
    /// Reads and validates the config file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if the file cannot be read, parsed or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| HarnessError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml(&contents)
    }

    /// Parses and validates a config from TOML.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if parsing or validation fails.
    pub fn from_toml(contents: &str) -> Result<Self, HarnessError> {
        let config: Self =
            toml::from_str(contents).map_err(|err| HarnessError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants the rest of the harness relies on.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::EmptyFleet`] without nodes and
    /// [`HarnessError::Config`] for other unusable values.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.nodes.is_empty() {
            return Err(HarnessError::EmptyFleet);
        }
        if self.port == 0 {
            return Err(HarnessError::Config("port must not be 0".into()));
        }
        if self.attack.startup_attempts == 0 {
            return Err(HarnessError::Config(
                "startup_attempts must be at least 1".into(),
            ));
        }
        if self.channel.max_command_bytes < MIN_COMMAND_BYTES {
            return Err(HarnessError::Config(format!(
                "max_command_bytes must be at least {MIN_COMMAND_BYTES}"
            )));
        }
        if self.channel.max_command_bytes >= self.channel.receive_buffer_bytes {
            return Err(HarnessError::Config(
                "max_command_bytes must be below receive_buffer_bytes".into(),
            ));
        }
        if self.attack.pregenerated_blocks < MIN_SENSIBLE_PREGENERATED_BLOCKS {
            warn!(
                "only {} pre-generated blocks, some nodes may have nothing to stake",
                self.attack.pregenerated_blocks
            );
        }
        Ok(())
    }

    /// Example config for three nodes on the local machine.
    #[must_use]
    pub fn template() -> Self {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let nodes = ["attacker", "victim1", "victim2"]
            .into_iter()
            .map(|name| NodeConfig {
                name: name.to_owned(),
                ip: localhost,
            })
            .collect();
        Self {
            port: 8080,
            nodes,
            launch: Some(LaunchConfig::default()),
            channel: ChannelConfig::default(),
            attack: AttackParams::default(),
        }
    }

    /// Serializes this config to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if serialization fails.
    pub fn to_toml(&self) -> Result<String, HarnessError> {
        toml::to_string(self).map_err(|err| HarnessError::Config(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config() {
        let config = HarnessConfig::from_toml(
            r#"
            port = 9000

            [[nodes]]
            name = "attacker"
            ip = "10.0.0.1"

            [[nodes]]
            name = "victim"
            ip = "10.0.0.2"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].name, "attacker");
        assert!(config.launch.is_none());
        assert_eq!(config.attack.startup_attempts, 5);
        assert_eq!(config.attack.retry_delay(), Duration::from_secs(2));
        assert_eq!(config.channel.receive_buffer_bytes, RECEIVE_BUFFER_SIZE);
    }

    #[test]
    fn partial_sections() {
        let config = HarnessConfig::from_toml(
            r#"
            port = 9000

            [[nodes]]
            name = "attacker"
            ip = "127.0.0.1"

            [launch]

            [attack]
            consensus_rounds = 3
            seed = 42
            "#,
        )
        .unwrap();
        assert_eq!(config.launch.unwrap().binary, "vulnCoin-server");
        assert_eq!(config.attack.consensus_rounds, 3);
        assert_eq!(config.attack.pregenerated_blocks, 10);
        assert_eq!(config.attack.seed, Some(42));
    }

    #[test]
    fn reject_empty_fleet() {
        let res = HarnessConfig::from_toml("port = 9000\nnodes = []\n");
        assert!(matches!(res, Err(HarnessError::EmptyFleet)));
    }

    #[test]
    fn reject_port_zero() {
        let res = HarnessConfig::from_toml(
            "port = 0\n[[nodes]]\nname = \"a\"\nip = \"127.0.0.1\"\n",
        );
        assert!(matches!(res, Err(HarnessError::Config(_))));
    }

    #[test]
    fn command_limit_bounds() {
        let nodes = "port = 9000\n[[nodes]]\nname = \"a\"\nip = \"127.0.0.1\"\n";
        let config =
            HarnessConfig::from_toml(&format!("{nodes}[channel]\nmax_command_bytes = 1024\n"))
                .unwrap();
        assert_eq!(config.channel.max_command_bytes, 1024);

        for max in [64, 60_000] {
            let res =
                HarnessConfig::from_toml(&format!("{nodes}[channel]\nmax_command_bytes = {max}\n"));
            assert!(matches!(res, Err(HarnessError::Config(_))), "{max}");
        }
    }

    #[test]
    fn reject_garbage() {
        assert!(matches!(
            HarnessConfig::from_toml("port = \"x\""),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn template_roundtrip() {
        let template = HarnessConfig::template();
        let toml = template.to_toml().unwrap();
        let parsed = HarnessConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed.nodes.len(), 3);
        assert_eq!(parsed.port, template.port);
    }
}
