// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Grinding attack harness for a proof-of-stake leader selection.
//!
//! Drives a small fleet of consensus nodes through consensus rounds and lets
//! one of them, the attacker, reorder the transactions of each block it
//! proposes until the block's hash selects the attacker again.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod crypto;
pub mod driver;
pub mod error;
pub mod fleet;
pub mod grinding;
pub mod logging;
pub mod network;
pub mod probe;
pub mod propagation;
pub mod types;

pub use self::config::{AttackParams, HarnessConfig};
pub use self::driver::{AttackReport, AttackRun};
pub use self::error::HarnessError;
pub use self::fleet::{DetachedLauncher, Fleet, Launcher, Node, SshLauncher};
pub use self::network::{NodeChannel, SimulatedCluster, TcpChannel};
