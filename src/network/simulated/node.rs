// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ledger model of a single simulated consensus node.
//!
//! Each [`SimulatedNode`] keeps its own chain, mempool, unspent outputs and
//! stake pool, and reacts to commands like a real node would. Nodes never
//! talk to each other, so their ledgers only agree if every change is
//! replayed on every node.

use std::collections::{BTreeMap, HashMap};

use log::trace;
use serde_json::json;

use crate::crypto::sha256_hex;
use crate::network::Command;
use crate::types::{BlockInfo, OutputRef, TransactionInfo};

/// Timestamp of the first transaction a simulated node creates.
const CLOCK_START: u64 = 1_600_000_000;

/// Parent hash of the genesis block.
const GENESIS_PARENT: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Address the genesis coinbase pays to, owned by no node.
const GENESIS_ADDRESS: &str = "genesis";

/// Reply to commands that change state without producing anything.
const OK: &str = "";

/// Complete state of one simulated node.
#[derive(Clone, Debug)]
pub(super) struct SimulatedNode {
    address: String,
    /// Logical clock used for timestamps of transactions this node originates.
    clock: u64,
    chain: Vec<BlockInfo>,
    transactions: HashMap<String, TransactionInfo>,
    /// Pending transfers, in arrival order.
    mempool: Vec<OutputRef>,
    /// Coinbase transactions loaded but not committed yet.
    pending_coinbases: Vec<String>,
    /// Spendable outputs of all addresses, keyed by txid.
    unspent: BTreeMap<String, String>,
    /// Staked txids per address.
    stakepool: BTreeMap<String, Vec<String>>,
    /// Snapshot of the stake pool, taken on each leader selection.
    old_stakepool: BTreeMap<String, Vec<String>>,
    /// Answer leader selection with a wrong address.
    pub(super) diverged: bool,
}

impl SimulatedNode {
    /// Creates a node with the given address and the common genesis block.
    pub(super) fn new(address: String) -> Self {
        let genesis_tx = coinbase_txid(GENESIS_ADDRESS, "0");
        let mut transactions = HashMap::new();
        transactions.insert(
            genesis_tx.clone(),
            TransactionInfo {
                txid: genesis_tx.clone(),
                address: GENESIS_ADDRESS.to_owned(),
                timestamp: "0".to_owned(),
            },
        );
        let genesis = BlockInfo {
            prev_block_hash: GENESIS_PARENT.to_owned(),
            transactions: vec![genesis_tx],
        };
        Self {
            address,
            clock: CLOCK_START,
            chain: vec![genesis],
            transactions,
            mempool: Vec::new(),
            pending_coinbases: Vec::new(),
            unspent: BTreeMap::new(),
            stakepool: BTreeMap::new(),
            old_stakepool: BTreeMap::new(),
            diverged: false,
        }
    }

    pub(super) fn address(&self) -> &str {
        &self.address
    }

    pub(super) fn chain(&self) -> &[BlockInfo] {
        &self.chain
    }

    pub(super) fn mempool(&self) -> &[OutputRef] {
        &self.mempool
    }

    pub(super) fn unspent(&self) -> Vec<OutputRef> {
        self.unspent
            .iter()
            .map(|(txid, address)| OutputRef {
                txid: txid.clone(),
                address: address.clone(),
            })
            .collect()
    }

    pub(super) fn stake_pool_addresses(&self) -> Vec<String> {
        self.stakepool.keys().cloned().collect()
    }

    /// Executes `command` and returns the node's reply.
    pub(super) fn handle(&mut self, command: &Command) -> String {
        trace!("node {} handles '{}'", self.address, command.name());
        match command {
            Command::Generate => self.generate(),
            Command::PrintBlockchain => json!(self.chain).to_string(),
            Command::PrintTransaction { txid } => self
                .transactions
                .get(txid)
                .map(|tx| json!(tx).to_string())
                .unwrap_or_default(),
            Command::PrintAddress => self.address.clone(),
            Command::GetBlockCount => self.chain.len().to_string(),
            Command::ListMempool => json!(self.mempool).to_string(),
            Command::ListUnspentLinkedToMe => {
                let mine: Vec<_> = self
                    .unspent()
                    .into_iter()
                    .filter(|o| o.address == self.address)
                    .collect();
                json!(mine).to_string()
            }
            Command::ListStakepool => stake_pool_json(&self.stakepool),
            Command::ListOldStakepool => stake_pool_json(&self.old_stakepool),
            Command::CountNextValidator => self.count_next_validator(),
            Command::LoadCoinbaseTransaction { address, timestamp } => {
                self.load_coinbase(address, timestamp)
            }
            Command::LoadTransaction {
                from_txid,
                from_address,
                to_address,
                timestamp,
            } => self
                .transfer(from_txid, from_address, to_address, timestamp)
                .unwrap_or_default(),
            Command::CreateNewTransaction {
                txid,
                from_address,
                to_address,
            } => {
                if from_address != &self.address {
                    return String::new();
                }
                let timestamp = self.tick();
                self.transfer(txid, from_address, to_address, &timestamp)
                    .unwrap_or_default()
            }
            Command::ProposeBlock { txids } => self.propose_block(txids),
            Command::Stake { txid, address } => self.stake(txid, address),
            Command::Stop => OK.to_owned(),
        }
    }

    fn tick(&mut self) -> String {
        self.clock += 1;
        self.clock.to_string()
    }

    fn last_hash(&self) -> String {
        // the chain always holds at least the genesis block
        self.chain.last().map(BlockInfo::hash).unwrap_or_default()
    }

    fn generate(&mut self) -> String {
        let timestamp = self.tick();
        let address = self.address.clone();
        let txid = self.load_coinbase(&address, &timestamp);
        self.propose_block(&[txid])
    }

    fn load_coinbase(&mut self, address: &str, timestamp: &str) -> String {
        let txid = coinbase_txid(address, timestamp);
        if !self.transactions.contains_key(&txid) {
            self.transactions.insert(
                txid.clone(),
                TransactionInfo {
                    txid: txid.clone(),
                    address: address.to_owned(),
                    timestamp: timestamp.to_owned(),
                },
            );
            self.pending_coinbases.push(txid.clone());
        }
        txid
    }

    /// Spends output `from_txid` of `from_address` in a transfer to `to_address`.
    ///
    /// Returns the new txid, or `None` if the output is not spendable.
    fn transfer(
        &mut self,
        from_txid: &str,
        from_address: &str,
        to_address: &str,
        timestamp: &str,
    ) -> Option<String> {
        if self.unspent.get(from_txid).map(String::as_str) != Some(from_address) {
            return None;
        }
        let txid = sha256_hex(format!("{from_txid}{from_address}{to_address}{timestamp}").as_bytes());
        if self.transactions.contains_key(&txid) {
            return None;
        }
        self.unspent.remove(from_txid);
        self.transactions.insert(
            txid.clone(),
            TransactionInfo {
                txid: txid.clone(),
                address: to_address.to_owned(),
                timestamp: timestamp.to_owned(),
            },
        );
        self.mempool.push(OutputRef {
            txid: txid.clone(),
            address: to_address.to_owned(),
        });
        Some(txid)
    }

    /// Appends a block if it holds exactly one pending coinbase, in any
    /// position, and every other transaction is in the mempool.
    fn propose_block(&mut self, txids: &[String]) -> String {
        let (coinbases, rest): (Vec<&String>, Vec<&String>) = txids
            .iter()
            .partition(|id| self.pending_coinbases.contains(id));
        if coinbases.len() != 1 {
            return format!("block rejected: {} coinbase transactions", coinbases.len());
        }
        if let Some(unknown) = rest
            .iter()
            .find(|id| !self.mempool.iter().any(|tx| &&tx.txid == *id))
        {
            return format!("block rejected: unknown transaction {unknown}");
        }

        self.pending_coinbases.retain(|id| id != coinbases[0]);
        self.mempool.retain(|tx| !rest.contains(&&tx.txid));
        for txid in txids {
            if let Some(tx) = self.transactions.get(txid) {
                self.unspent.insert(txid.clone(), tx.address.clone());
            }
        }
        let block = BlockInfo {
            prev_block_hash: self.last_hash(),
            transactions: txids.to_vec(),
        };
        self.chain.push(block);
        OK.to_owned()
    }

    fn stake(&mut self, txid: &str, address: &str) -> String {
        if self.unspent.get(txid).map(String::as_str) != Some(address) {
            return format!("stake rejected: {txid} is not spendable by {address}");
        }
        self.unspent.remove(txid);
        self.stakepool
            .entry(address.to_owned())
            .or_default()
            .push(txid.to_owned());
        OK.to_owned()
    }

    /// Selects the next block proposer and snapshots the stake pool.
    fn count_next_validator(&mut self) -> String {
        let pool = self.stake_pool_addresses();
        if pool.is_empty() {
            return String::new();
        }
        let len = pool.len() as u64;
        let creator = self.old_stakepool.keys().fold(0_u32, |acc, addr| {
            acc.wrapping_add((u64::from(scan_hex(addr)) % len) as u32)
        });
        let index = (u64::from(creator) + u64::from(scan_hex(&self.last_hash())) % len) % len;
        let index = index as usize;
        self.old_stakepool = self.stakepool.clone();

        if self.diverged {
            return sha256_hex(pool[index].as_bytes());
        }
        pool[index].clone()
    }
}

/// Reads the leading hex digits of the first 16 characters into a 32-bit word.
///
/// Overflowing digits wrap, anything else ends the number.
fn scan_hex(s: &str) -> u32 {
    s.chars()
        .take(16)
        .map_while(|c| c.to_digit(16))
        .fold(0_u32, |acc, digit| (acc << 4) | digit)
}

fn coinbase_txid(address: &str, timestamp: &str) -> String {
    sha256_hex(format!("coinbase{address}{timestamp}").as_bytes())
}

fn stake_pool_json(pool: &BTreeMap<String, Vec<String>>) -> String {
    let entries: Vec<_> = pool
        .iter()
        .map(|(address, txids)| json!({ "address": address, "stakes": txids }))
        .collect();
    json!(entries).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StakeEntry;

    fn node_with_outputs(outputs: usize) -> SimulatedNode {
        let mut node = SimulatedNode::new("me".into());
        for _ in 0..outputs {
            node.handle(&Command::Generate);
        }
        node
    }

    fn my_outputs(node: &mut SimulatedNode) -> Vec<OutputRef> {
        serde_json::from_str(&node.handle(&Command::ListUnspentLinkedToMe)).unwrap()
    }

    #[test]
    fn genesis() {
        let mut a = SimulatedNode::new("a".into());
        let mut b = SimulatedNode::new("b".into());
        assert_eq!(a.handle(&Command::GetBlockCount), "1");
        assert_eq!(a.chain(), b.chain());
        assert_eq!(a.handle(&Command::ListUnspentLinkedToMe), "[]");
        assert_eq!(b.handle(&Command::CountNextValidator), "");
    }

    #[test]
    fn generate_pays_creator() {
        let mut node = node_with_outputs(2);
        assert_eq!(node.handle(&Command::GetBlockCount), "3");
        let outputs = my_outputs(&mut node);
        assert_eq!(outputs.len(), 2);
        assert_ne!(outputs[0].txid, outputs[1].txid);
        assert_eq!(node.chain()[2].prev_block_hash, node.chain()[1].hash());
    }

    #[test]
    fn transfer_locks_output_until_mined() {
        let mut node = node_with_outputs(1);
        let input = my_outputs(&mut node).remove(0);
        let txid = node.handle(&Command::CreateNewTransaction {
            txid: input.txid.clone(),
            from_address: "me".into(),
            to_address: "me".into(),
        });
        assert_eq!(txid.len(), 64);
        assert!(my_outputs(&mut node).is_empty());
        assert_eq!(node.mempool().len(), 1);

        // spending twice fails
        let again = node.handle(&Command::CreateNewTransaction {
            txid: input.txid,
            from_address: "me".into(),
            to_address: "me".into(),
        });
        assert_eq!(again, "");

        let coinbase = node.handle(&Command::LoadCoinbaseTransaction {
            address: "other".into(),
            timestamp: "5".into(),
        });
        let reply = node.handle(&Command::ProposeBlock {
            txids: vec![coinbase, txid.clone()],
        });
        assert_eq!(reply, "");
        assert!(node.mempool().is_empty());
        assert_eq!(my_outputs(&mut node)[0].txid, txid);
    }

    #[test]
    fn replayed_transfer_has_same_id() {
        let mut origin = node_with_outputs(1);
        let mut replica = origin.clone();
        let input = my_outputs(&mut origin).remove(0);
        let txid = origin.handle(&Command::CreateNewTransaction {
            txid: input.txid.clone(),
            from_address: "me".into(),
            to_address: "you".into(),
        });
        let tx: TransactionInfo =
            serde_json::from_str(&origin.handle(&Command::PrintTransaction { txid: txid.clone() }))
                .unwrap();
        let replayed = replica.handle(&Command::LoadTransaction {
            from_txid: input.txid,
            from_address: input.address,
            to_address: tx.address,
            timestamp: tx.timestamp,
        });
        assert_eq!(replayed, txid);
        assert_eq!(origin.mempool(), replica.mempool());
    }

    #[test]
    fn reject_unknown_transactions() {
        let mut node = node_with_outputs(0);
        let coinbase = node.handle(&Command::LoadCoinbaseTransaction {
            address: "me".into(),
            timestamp: "1".into(),
        });
        let reply = node.handle(&Command::ProposeBlock {
            txids: vec![coinbase.clone(), "nope".into()],
        });
        assert!(reply.starts_with("block rejected"));
        let reply = node.handle(&Command::ProposeBlock {
            txids: vec!["nope".into()],
        });
        assert!(reply.starts_with("block rejected"));
        assert_eq!(node.chain().len(), 1);

        assert_eq!(node.handle(&Command::ProposeBlock { txids: vec![coinbase] }), "");
        assert_eq!(node.chain().len(), 2);
    }

    #[test]
    fn stake_and_select() {
        let mut node = node_with_outputs(1);
        let output = my_outputs(&mut node).remove(0);
        assert_eq!(
            node.handle(&Command::Stake {
                txid: output.txid.clone(),
                address: "me".into(),
            }),
            ""
        );
        assert!(my_outputs(&mut node).is_empty());
        let pool: Vec<StakeEntry> =
            serde_json::from_str(&node.handle(&Command::ListStakepool)).unwrap();
        assert_eq!(pool, vec![StakeEntry { address: "me".into() }]);
        assert_eq!(node.handle(&Command::ListOldStakepool), "[]");

        assert_eq!(node.handle(&Command::CountNextValidator), "me");
        let old: Vec<StakeEntry> =
            serde_json::from_str(&node.handle(&Command::ListOldStakepool)).unwrap();
        assert_eq!(old, pool);

        // staking a spent output is rejected
        let reply = node.handle(&Command::Stake {
            txid: output.txid,
            address: "me".into(),
        });
        assert!(reply.starts_with("stake rejected"));
    }

    #[test]
    fn diverged_selection() {
        let mut node = node_with_outputs(1);
        let output = my_outputs(&mut node).remove(0);
        node.handle(&Command::Stake {
            txid: output.txid,
            address: "me".into(),
        });
        node.diverged = true;
        assert_ne!(node.handle(&Command::CountNextValidator), "me");
    }

    #[test]
    fn hex_scan() {
        assert_eq!(scan_hex("ff"), 0xff);
        assert_eq!(scan_hex("123456789abcdef0"), 0x9abc_def0);
        assert_eq!(scan_hex("ABCDEF"), 0xab_cdef);
        assert_eq!(scan_hex("1g2"), 1);
        assert_eq!(scan_hex("zz"), 0);
        assert_eq!(scan_hex(""), 0);
        // only the first 16 characters count
        assert_eq!(scan_hex(&"1".repeat(20)), 0x1111_1111);
        assert_eq!(scan_hex("000000000000000ff"), 0xf);
    }

    #[test]
    fn selection_with_old_pool() {
        let mut node = SimulatedNode::new("me".into());
        node.stakepool = ["1", "2", "3"]
            .into_iter()
            .map(|a| (a.to_owned(), vec![format!("tx{a}")]))
            .collect();
        // old pool: 0x5 % 3 + 0xff % 3 == 2 + 0 == 2
        node.old_stakepool = ["5", "ff"]
            .into_iter()
            .map(|a| (a.to_owned(), Vec::new()))
            .collect();
        let last = u64::from(scan_hex(&node.last_hash()));
        let expected = ["1", "2", "3"][((2 + last % 3) % 3) as usize];
        assert_eq!(node.handle(&Command::CountNextValidator), expected);
    }
}
