// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Replication of ledger changes across the fleet.
//!
//! Nodes do not gossip with each other. Whenever one node creates a block,
//! a transaction or a stake, the harness replays the same change on every
//! other node, in fleet order, so that all ledgers stay identical.

use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use time::OffsetDateTime;

use crate::HarnessError;
use crate::fleet::Fleet;
use crate::network::{Command, NodeChannel, fit_proposal};
use crate::types::{BlockInfo, OutputRef, TransactionInfo};

/// Source of unix-second timestamps for harness-created coinbase transactions.
///
/// Never yields the same second twice, so two coinbase transactions
/// for the same address can never end up with the same txid.
#[derive(Clone, Debug, Default)]
pub struct Timestamps {
    last: i64,
}

impl Timestamps {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current unix time, or one second after the last timestamp.
    pub fn next_timestamp(&mut self) -> String {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.last = now.max(self.last + 1);
        self.last.to_string()
    }
}

/// Lets a random node mine a coinbase-only block and replicates it.
///
/// Returns the fleet position of the block's creator.
///
/// # Errors
///
/// Returns [`HarnessError`] if any node is unreachable or answers unusably.
pub async fn random_block<C: NodeChannel>(
    fleet: &Fleet<C>,
    rng: &mut impl Rng,
) -> Result<usize, HarnessError> {
    let creator = rng.random_range(0..fleet.len());
    fleet.send(creator, &Command::Generate).await?;

    let chain: Vec<BlockInfo> = fleet.send_json(creator, &Command::PrintBlockchain).await?;
    let block = chain.last().ok_or(HarnessError::EmptyBlockchain)?;
    let coinbase_txid = block.coinbase().ok_or(HarnessError::MissingCoinbase)?;
    let coinbase: TransactionInfo = fleet
        .send_json(
            creator,
            &Command::PrintTransaction {
                txid: coinbase_txid.to_owned(),
            },
        )
        .await?;

    let load = Command::LoadCoinbaseTransaction {
        address: coinbase.address,
        timestamp: coinbase.timestamp,
    };
    let propose = Command::ProposeBlock {
        txids: vec![coinbase_txid.to_owned()],
    };
    for index in (0..fleet.len()).filter(|&i| i != creator) {
        fleet.send(index, &load).await?;
        fleet.send(index, &propose).await?;
    }
    Ok(creator)
}

/// Builds a block for `proposer` with a random prefix of its mempool and replicates it.
///
/// The block is created on node 0 first, then on all remaining nodes.
/// Returns the number of mempool transactions included.
///
/// # Errors
///
/// Returns [`HarnessError::UnknownValidator`] if no node has address `proposer`.
pub async fn block_to<C: NodeChannel>(
    fleet: &Fleet<C>,
    proposer: &str,
    timestamps: &mut Timestamps,
    rng: &mut impl Rng,
) -> Result<usize, HarnessError> {
    let creator = fleet
        .position_of(proposer)
        .ok_or_else(|| HarnessError::UnknownValidator(proposer.to_owned()))?;

    let mempool: Vec<OutputRef> = fleet.send_json(creator, &Command::ListMempool).await?;
    info!(
        "block creator {} has {} transactions in their mempool",
        fleet.node(creator).name,
        mempool.len()
    );
    let count = if mempool.is_empty() {
        0
    } else {
        rng.random_range(0..mempool.len())
    };

    let load = Command::LoadCoinbaseTransaction {
        address: proposer.to_owned(),
        timestamp: timestamps.next_timestamp(),
    };
    let coinbase_txid = fleet.send_nonempty(0, &load).await?;
    let mut txids = Vec::with_capacity(count + 1);
    txids.push(coinbase_txid);
    txids.extend(mempool.into_iter().take(count).map(|tx| tx.txid));
    let cut = fit_proposal(&mut txids, fleet.max_command_bytes());
    if cut > 0 {
        warn!("{cut} mempool transactions do not fit into the block proposal");
    }
    let count = txids.len().saturating_sub(1);
    let propose = Command::ProposeBlock { txids };
    fleet.send(0, &propose).await?;

    for index in 1..fleet.len() {
        fleet.send(index, &load).await?;
        fleet.send(index, &propose).await?;
    }
    Ok(count)
}

/// Spends all but one spendable output of every node in random transfers.
///
/// Each new transaction is relayed to all other nodes. The remaining output
/// of each node is left for staking. Sleeps `pause` after every transaction,
/// since nodes reject transactions created within the same second.
/// Returns the total number of transactions created.
///
/// # Errors
///
/// Returns [`HarnessError`] if any node is unreachable or answers unusably.
pub async fn create_transactions<C: NodeChannel>(
    fleet: &Fleet<C>,
    pause: Duration,
    rng: &mut impl Rng,
) -> Result<usize, HarnessError> {
    let addresses = fleet.addresses()?;
    let mut created = 0;
    for sender in 0..fleet.len() {
        let mut unspent: Vec<OutputRef> = fleet
            .send_json(sender, &Command::ListUnspentLinkedToMe)
            .await?;
        let mut last_receiver = None;
        while unspent.len() > 1 {
            let input = unspent.swap_remove(0);
            let receiver = pick_receiver(rng, addresses.len(), last_receiver);
            let create = Command::CreateNewTransaction {
                txid: input.txid.clone(),
                from_address: input.address.clone(),
                to_address: addresses[receiver].clone(),
            };
            let txid = fleet.send_nonempty(sender, &create).await?;
            let tx: TransactionInfo = fleet
                .send_json(sender, &Command::PrintTransaction { txid })
                .await?;

            let load = Command::LoadTransaction {
                from_txid: input.txid.clone(),
                from_address: input.address.clone(),
                to_address: tx.address.clone(),
                timestamp: tx.timestamp,
            };
            fleet.broadcast_except(sender, &load).await?;
            debug!(
                "output {} of {} spent in transaction {} to {}",
                input.txid, input.address, tx.txid, tx.address
            );
            created += 1;

            unspent = fleet
                .send_json(sender, &Command::ListUnspentLinkedToMe)
                .await?;
            if unspent.iter().any(|o| o.txid == input.txid) {
                return Err(HarnessError::UnspentNotConsumed {
                    node: fleet.node(sender).name.clone(),
                    txid: input.txid,
                });
            }
            last_receiver = Some(receiver);
            tokio::time::sleep(pause).await;
        }
    }
    Ok(created)
}

/// Stakes the first spendable output of every node that has one.
///
/// Every stake is registered on all nodes.
/// Returns the number of stakes placed.
///
/// # Errors
///
/// Returns [`HarnessError`] if any node is unreachable or answers unusably.
pub async fn create_stakes<C: NodeChannel>(fleet: &Fleet<C>) -> Result<usize, HarnessError> {
    let mut placed = 0;
    for index in 0..fleet.len() {
        let unspent: Vec<OutputRef> = fleet
            .send_json(index, &Command::ListUnspentLinkedToMe)
            .await?;
        let Some(output) = unspent.into_iter().next() else {
            continue;
        };
        debug!("{} stakes output {}", fleet.node(index).name, output.txid);
        let stake = Command::Stake {
            txid: output.txid,
            address: output.address,
        };
        fleet.broadcast(&stake).await?;
        placed += 1;
    }
    Ok(placed)
}

/// Picks a receiver index different from the previous one.
///
/// Sending twice in a row to the same receiver risks duplicate txids.
/// With a single node there is no alternative, so it is always picked.
fn pick_receiver(rng: &mut impl Rng, num_nodes: usize, last: Option<usize>) -> usize {
    if num_nodes == 1 {
        return 0;
    }
    loop {
        let receiver = rng.random_range(0..num_nodes);
        if Some(receiver) != last {
            return receiver;
        }
    }
}
