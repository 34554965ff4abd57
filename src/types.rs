// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Structured views of node responses.
//!
//! Nodes answer queries with JSON. The harness never constructs or validates
//! ledger contents itself, it only reads ids and addresses from these views
//! and relays them to other nodes.

use serde::{Deserialize, Deserializer, Serialize};

/// Block as reported by `printBlockchain`.
///
/// Blocks mined by `generate` hold their coinbase as the only transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    #[serde(rename = "prevBlockHash")]
    pub prev_block_hash: String,
    pub transactions: Vec<String>,
}

impl BlockInfo {
    /// Returns the id of the block's first transaction.
    ///
    /// This is the coinbase for blocks mined by `generate`.
    #[must_use]
    pub fn coinbase(&self) -> Option<&str> {
        self.transactions.first().map(String::as_str)
    }

    /// Recomputes the hash of this block from its parent hash and transactions.
    #[must_use]
    pub fn hash(&self) -> String {
        crate::crypto::block_hash(&self.prev_block_hash, &self.transactions)
    }
}

/// Transaction details as reported by `printTransaction`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub txid: String,
    /// Owner of the transaction's output.
    pub address: String,
    #[serde(deserialize_with = "string_or_number")]
    pub timestamp: String,
}

/// Reference to a transaction output, as listed by `listMempool` and
/// `listUnspentLinkedToMe`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    pub txid: String,
    pub address: String,
}

/// Entry of the stake pool, as listed by `listStakepool` and `listOldStakepool`.
///
/// Nodes keep one entry per staking address, ordered by address.
/// Position in the listing is what leader selection indexes into.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeEntry {
    pub address: String,
}

/// Accepts timestamps encoded either as JSON strings or as JSON numbers.
///
/// Timestamps are only ever relayed verbatim, so they are kept as strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Num(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_blockchain() {
        let json = r#"[
            {"prevBlockHash": "0", "transactions": ["a"]},
            {"prevBlockHash": "1", "transactions": ["b", "c"], "extra": 5}
        ]"#;
        let chain: Vec<BlockInfo> = serde_json::from_str(json).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].coinbase(), Some("b"));
        assert_eq!(chain[1].transactions, ["b", "c"]);
    }

    #[test]
    fn timestamp_string_or_number() {
        let tx: TransactionInfo =
            serde_json::from_str(r#"{"txid": "t", "address": "a", "timestamp": "17"}"#).unwrap();
        assert_eq!(tx.timestamp, "17");
        let tx: TransactionInfo =
            serde_json::from_str(r#"{"txid": "t", "address": "a", "timestamp": 17}"#).unwrap();
        assert_eq!(tx.timestamp, "17");
    }

    #[test]
    fn stake_entries_ignore_extra_fields() {
        let entries: Vec<StakeEntry> =
            serde_json::from_str(r#"[{"address": "ab"}, {"address": "cd", "stakes": 2}]"#)
                .unwrap();
        assert_eq!(entries[0].address, "ab");
        assert_eq!(entries[1].address, "cd");
    }

    #[test]
    fn block_hash_matches_crypto() {
        let block = BlockInfo {
            prev_block_hash: "00".into(),
            transactions: vec!["x".into(), "y".into()],
        };
        assert_eq!(block.hash(), crate::crypto::block_hash("00", &["x", "y"]));
    }
}
