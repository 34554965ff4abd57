// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Driver of a complete attack run.
//!
//! An [`AttackRun`] launches the fleet, waits for it to come up, creates
//! spendable outputs, places the first stakes and then runs the configured
//! number of consensus rounds. Each round:
//!
//! 1. fills the mempool with random transfers,
//! 2. asks all nodes for the next proposer (which snapshots the stake pool),
//! 3. re-stakes,
//! 4. lets the attacker grind its block, or builds a block for the honest proposer.
//!
//! Any failure stops all nodes before the error is returned.

use std::fmt::{self, Display};
use std::sync::Arc;

use fastrace::prelude::*;
use log::{error, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::task::JoinHandle;

use crate::HarnessError;
use crate::config::AttackParams;
use crate::fleet::{Fleet, Launcher, join_launchers};
use crate::grinding::{self, GrindOutcome};
use crate::network::{Command, NodeChannel};
use crate::probe::next_validator;
use crate::propagation::{self, Timestamps};

/// Phase of an attack run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Bootstrapping,
    PreGenerating { block: usize, of: usize },
    Staking,
    RoundLoop { round: usize, of: usize },
    Draining,
    Reporting,
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootstrapping => f.write_str("bootstrapping"),
            Self::PreGenerating { block, of } => write!(f, "pre-generating block {block}/{of}"),
            Self::Staking => f.write_str("placing initial stakes"),
            Self::RoundLoop { round, of } => write!(f, "consensus round {round}/{of}"),
            Self::Draining => f.write_str("stopping nodes"),
            Self::Reporting => f.write_str("reporting"),
        }
    }
}

/// Number of blocks created by the attacker and by the rest of the network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    pub attacker: usize,
    pub network: usize,
}

/// What happened in a single consensus round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundRecord {
    pub round: usize,
    /// Address of the proposer the nodes selected.
    pub proposer: String,
    pub attacker_selected: bool,
    /// Number of transfers created before selection.
    pub transactions: usize,
    /// Number of stakes placed after selection.
    pub stakes: usize,
    /// Result of the attacker's grinding, if it proposed.
    pub grind: Option<GrindOutcome>,
}

/// Final result of an attack run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttackReport {
    pub attacker_blocks: usize,
    pub network_blocks: usize,
    /// Number of rounds in which the attacker found a self-selecting block.
    pub successful_grinds: usize,
    pub rounds: Vec<RoundRecord>,
}

impl AttackReport {
    /// Returns `true` iff the attacker proposed more blocks than everyone else.
    #[must_use]
    pub const fn is_successful(&self) -> bool {
        self.attacker_blocks > self.network_blocks
    }
}

impl Display for AttackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attacker created {} blocks, rest of the network created {} blocks ({} successful grinds)",
            self.attacker_blocks, self.network_blocks, self.successful_grinds
        )
    }
}

/// Mutable state carried through a run.
pub struct RunContext {
    phase: Phase,
    tally: Tally,
    timestamps: Timestamps,
    rng: StdRng,
    rounds: Vec<RoundRecord>,
}

impl RunContext {
    #[must_use]
    pub fn new(rng: StdRng) -> Self {
        Self {
            phase: Phase::Bootstrapping,
            tally: Tally::default(),
            timestamps: Timestamps::new(),
            rng,
            rounds: Vec::new(),
        }
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub const fn tally(&self) -> Tally {
        self.tally
    }

    fn enter(&mut self, phase: Phase) {
        info!("{phase}");
        self.phase = phase;
    }

    fn report(&self) -> AttackReport {
        AttackReport {
            attacker_blocks: self.tally.attacker,
            network_blocks: self.tally.network,
            successful_grinds: self
                .rounds
                .iter()
                .filter(|r| r.grind.as_ref().is_some_and(|g| g.found))
                .count(),
            rounds: self.rounds.clone(),
        }
    }
}

/// A complete attack against a fleet.
pub struct AttackRun<C, L> {
    fleet: Fleet<C>,
    launcher: Arc<L>,
    params: AttackParams,
    ctx: RunContext,
}

impl<C, L> AttackRun<C, L>
where
    C: NodeChannel,
    L: Launcher + 'static,
{
    /// Creates a new run; randomness is seeded from `params.seed` if set.
    #[must_use]
    pub fn new(fleet: Fleet<C>, launcher: Arc<L>, params: AttackParams) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self {
            fleet,
            launcher,
            params,
            ctx: RunContext::new(rng),
        }
    }

    /// Runs the attack to completion.
    ///
    /// # Errors
    ///
    /// Returns the first [`HarnessError`] of any phase, after stopping all nodes.
    pub async fn run(mut self) -> Result<AttackReport, HarnessError> {
        let root = Span::root("attack run", SpanContext::random());
        let handles = self
            .fleet
            .launch_all(Arc::clone(&self.launcher), self.params.launch_stagger())
            .await;

        let res = self.execute().in_span(root).await;
        match res {
            Ok(()) => {
                self.ctx.enter(Phase::Draining);
                self.fleet.stop_all().await;
                join_launchers(handles).await;
                self.ctx.enter(Phase::Reporting);
                let report = self.ctx.report();
                if report.is_successful() {
                    info!("attack successful: {report}");
                } else {
                    warn!("attack unsuccessful: {report}");
                }
                Ok(report)
            }
            Err(err) => {
                error!("aborting during {}: {err}", self.ctx.phase());
                self.fleet.stop_all().await;
                abort_launchers(handles);
                Err(err)
            }
        }
    }

    async fn execute(&mut self) -> Result<(), HarnessError> {
        self.ctx.enter(Phase::Bootstrapping);
        self.fleet
            .wait_until_ready(
                self.params.expected_initial_height,
                self.params.startup_attempts,
                self.params.retry_delay(),
            )
            .await?;
        self.fleet.load_addresses().await?;

        let of = self.params.pregenerated_blocks;
        for block in 0..of {
            self.ctx.enter(Phase::PreGenerating { block: block + 1, of });
            let creator = propagation::random_block(&self.fleet, &mut self.ctx.rng).await?;
            info!("block {block} was created by {}", self.fleet.node(creator).name);
            tokio::time::sleep(self.params.block_pause()).await;
        }

        self.ctx.enter(Phase::Staking);
        let stakes = propagation::create_stakes(&self.fleet).await?;
        let pool = self.fleet.send(0, &Command::ListStakepool).await?;
        info!("placed {stakes} stakes, stake pool is {pool}");

        let of = self.params.consensus_rounds;
        for round in 0..of {
            self.ctx.enter(Phase::RoundLoop {
                round: round + 1,
                of,
            });
            let record = self.round(round).await?;
            self.ctx.rounds.push(record);
        }
        Ok(())
    }

    #[fastrace::trace(short_name = true)]
    async fn round(&mut self, round: usize) -> Result<RoundRecord, HarnessError> {
        let transactions = propagation::create_transactions(
            &self.fleet,
            self.params.transaction_pause(),
            &mut self.ctx.rng,
        )
        .await?;
        info!("network created {transactions} transactions");

        let proposer = next_validator(&self.fleet).await?;
        let stakes = propagation::create_stakes(&self.fleet).await?;

        let attacker = self.fleet.attacker_address()?.to_owned();
        let attacker_selected = proposer == attacker;
        let grind = if attacker_selected {
            info!("attacker was chosen as block proposer");
            self.ctx.tally.attacker += 1;
            let outcome = grinding::grind(&self.fleet, &attacker, &mut self.ctx.timestamps).await?;
            Some(outcome)
        } else {
            info!("attacker was not chosen, building block for the chosen proposer");
            self.ctx.tally.network += 1;
            propagation::block_to(
                &self.fleet,
                &proposer,
                &mut self.ctx.timestamps,
                &mut self.ctx.rng,
            )
            .await?;
            None
        };

        Ok(RoundRecord {
            round,
            proposer,
            attacker_selected,
            transactions,
            stakes,
            grind,
        })
    }
}

fn abort_launchers(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::DetachedLauncher;
    use crate::network::SimulatedCluster;

    fn params(rounds: usize) -> AttackParams {
        AttackParams {
            consensus_rounds: rounds,
            seed: Some(3),
            ..AttackParams::without_delays()
        }
    }

    #[test]
    fn success_criterion() {
        let mut report = AttackReport {
            attacker_blocks: 8,
            network_blocks: 7,
            ..AttackReport::default()
        };
        assert!(report.is_successful());
        report.network_blocks = 8;
        assert!(!report.is_successful());
    }

    #[test]
    fn phase_names() {
        assert_eq!(
            Phase::RoundLoop { round: 3, of: 15 }.to_string(),
            "consensus round 3/15"
        );
        assert_eq!(
            Phase::PreGenerating { block: 1, of: 10 }.to_string(),
            "pre-generating block 1/10"
        );
    }

    #[tokio::test]
    async fn short_run() {
        let cluster = SimulatedCluster::new(3);
        let run = AttackRun::new(cluster.fleet(), Arc::new(DetachedLauncher), params(4));
        let report = run.run().await.unwrap();
        assert_eq!(report.rounds.len(), 4);
        assert_eq!(report.attacker_blocks + report.network_blocks, 4);
        for i in 0..3 {
            assert!(cluster.is_stopped(i));
        }
        // genesis, pre-generated blocks and one block per round
        assert_eq!(cluster.chain(0).len(), 1 + 10 + 4);
    }

    #[tokio::test]
    async fn stops_nodes_on_failure() {
        let cluster = SimulatedCluster::new(3);
        cluster.diverge_validator(1);
        let run = AttackRun::new(cluster.fleet(), Arc::new(DetachedLauncher), params(4));
        let res = run.run().await;
        assert!(matches!(res, Err(HarnessError::Desynchronized { .. })));
        assert!(cluster.is_stopped(0));
        assert!(cluster.is_stopped(2));
    }
}
