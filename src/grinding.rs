// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Grinding search over block contents.
//!
//! Nodes select the next block proposer from the stake pool as follows:
//! every address of the previous stake pool snapshot contributes its hex
//! prefix modulo the pool size to a creator accumulator, then the hex prefix
//! of the newest block hash modulo the pool size is added, and the sum modulo
//! the pool size indexes into the (address-ordered) stake pool.
//!
//! Because the newest block hash depends on the order of its transactions,
//! a proposer can try different orderings until the hash selects itself
//! again. This module implements that search, and [`grind`] runs it against
//! a live fleet.

use log::{info, trace, warn};

use crate::HarnessError;
use crate::crypto::block_hash;
use crate::fleet::Fleet;
use crate::network::{Command, NodeChannel, fit_proposal};
use crate::propagation::Timestamps;
use crate::types::{BlockInfo, OutputRef, StakeEntry};

/// Integer type the nodes use when evaluating the selection formula.
pub type SelectionWord = u32;

/// Number of leading characters of a hex string that are parsed.
const PREFIX_CHARS: usize = 16;

/// Parses the leading hex digits of the first 16 characters of `s`.
///
/// Parsing stops at the first non-hex character, an empty prefix gives 0.
/// The value wraps in 64 bits and is then truncated to a [`SelectionWord`].
#[must_use]
pub fn parse_hex_prefix(s: &str) -> SelectionWord {
    let value = s
        .chars()
        .take(PREFIX_CHARS)
        .map_while(|c| c.to_digit(16))
        .fold(0_u64, |acc, digit| (acc << 4) | u64::from(digit));
    value as SelectionWord
}

/// Computes the creator accumulator from the previous stake pool snapshot.
///
/// # Panics
///
/// Panics if `pool_len` is 0.
#[must_use]
pub fn creator_accumulator<S: AsRef<str>>(old_pool: &[S], pool_len: usize) -> SelectionWord {
    old_pool.iter().fold(0, |creator: SelectionWord, address| {
        let share = u64::from(parse_hex_prefix(address.as_ref())) % pool_len as u64;
        creator.wrapping_add(share as SelectionWord)
    })
}

/// Gives the contribution of a block hash to the selection formula.
///
/// # Panics
///
/// Panics if `pool_len` is 0.
#[must_use]
pub fn candidate_index(block_hash: &str, pool_len: usize) -> u64 {
    u64::from(parse_hex_prefix(block_hash)) % pool_len as u64
}

/// Gives the stake pool position selected after a block with hash `block_hash`.
///
/// # Panics
///
/// Panics if `pool_len` is 0.
#[must_use]
pub fn selected_index(creator: SelectionWord, block_hash: &str, pool_len: usize) -> usize {
    let sum = u64::from(creator) + candidate_index(block_hash, pool_len);
    (sum % pool_len as u64) as usize
}

/// Stake pool position a grinder wants the next selection to land on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SelectionTarget {
    creator: SelectionWord,
    pool_len: usize,
    index: usize,
}

impl SelectionTarget {
    /// Creates a new target position `index` in a pool of `pool_len` entries.
    ///
    /// Returns `None` if the pool is empty or `index` lies outside it.
    #[must_use]
    pub fn new<S: AsRef<str>>(old_pool: &[S], pool_len: usize, index: usize) -> Option<Self> {
        if index >= pool_len {
            return None;
        }
        Some(Self {
            creator: creator_accumulator(old_pool, pool_len),
            pool_len,
            index,
        })
    }

    /// Returns `true` iff a block with hash `block_hash` selects the target.
    #[must_use]
    pub fn is_hit(&self, block_hash: &str) -> bool {
        selected_index(self.creator, block_hash, self.pool_len) == self.index
    }
}

/// Rearranges `items` into the lexicographically next permutation.
///
/// Returns `false` and leaves `items` sorted ascending if it already was the
/// last permutation. Equal items are never swapped, so starting from a sorted
/// slice visits every distinct ordering exactly once.
pub fn next_permutation<T: Ord>(items: &mut [T]) -> bool {
    let Some(pivot) = items.windows(2).rposition(|w| w[0] < w[1]) else {
        items.reverse();
        return false;
    };
    // some element after the pivot is larger, so this always finds one
    let Some(successor) = items.iter().rposition(|x| *x > items[pivot]) else {
        return false;
    };
    items.swap(pivot, successor);
    items[pivot + 1..].reverse();
    true
}

/// Lazy iterator over all distinct orderings of a list, in lexicographic order.
#[derive(Clone, Debug)]
pub struct Permutations<T> {
    current: Vec<T>,
    exhausted: bool,
}

impl<T: Ord + Clone> Permutations<T> {
    /// Creates an iterator starting at the sorted ordering of `items`.
    #[must_use]
    pub fn new(mut items: Vec<T>) -> Self {
        items.sort();
        Self {
            current: items,
            exhausted: false,
        }
    }
}

impl<T: Ord + Clone> Iterator for Permutations<T> {
    type Item = Vec<T>;

    fn next(&mut self) -> Option<Vec<T>> {
        if self.exhausted {
            return None;
        }
        let item = self.current.clone();
        self.exhausted = !next_permutation(&mut self.current);
        Some(item)
    }
}

/// Result of a grinding search.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrindOutcome {
    /// Transaction order to propose.
    pub order: Vec<String>,
    /// Whether `order` makes the next selection hit the target.
    pub found: bool,
    /// Number of orderings hashed.
    pub tried: usize,
}

/// Searches orderings of `candidates` for a block that hits `target`.
///
/// Orderings are tried in lexicographic order, starting from the sorted one.
/// Returns the first hit, or the last ordering tried if there is none.
#[must_use]
pub fn search(last_hash: &str, candidates: Vec<String>, target: &SelectionTarget) -> GrindOutcome {
    let mut outcome = GrindOutcome {
        order: Vec::new(),
        found: false,
        tried: 0,
    };
    for order in Permutations::new(candidates) {
        outcome.tried += 1;
        let hash = block_hash(last_hash, &order);
        trace!("permutation {} hashes to {hash}", outcome.tried);
        outcome.order = order;
        if target.is_hit(&hash) {
            outcome.found = true;
            break;
        }
    }
    outcome
}

/// Builds and broadcasts a block of the attacker that selects the attacker again.
///
/// Reads the stake pools, chain and mempool from node 0, loads a fresh
/// coinbase for `attacker` on all nodes, searches orderings of the coinbase
/// plus the whole mempool and proposes the result to every node.
/// A block is proposed even if no ordering hits.
///
/// # Errors
///
/// Returns [`HarnessError::EmptyStakePool`] if nobody staked,
/// [`HarnessError::UnknownValidator`] if `attacker` is not in the stake pool,
/// and other [`HarnessError`]s if a node is unreachable or answers unusably.
#[fastrace::trace(short_name = true)]
pub async fn grind<C: NodeChannel>(
    fleet: &Fleet<C>,
    attacker: &str,
    timestamps: &mut Timestamps,
) -> Result<GrindOutcome, HarnessError> {
    let pool: Vec<StakeEntry> = fleet.send_json(0, &Command::ListStakepool).await?;
    let old_pool: Vec<StakeEntry> = fleet.send_json(0, &Command::ListOldStakepool).await?;
    let chain: Vec<BlockInfo> = fleet.send_json(0, &Command::PrintBlockchain).await?;
    let mempool: Vec<OutputRef> = fleet.send_json(0, &Command::ListMempool).await?;

    if pool.is_empty() {
        return Err(HarnessError::EmptyStakePool);
    }
    let index = pool
        .iter()
        .position(|entry| entry.address == attacker)
        .ok_or_else(|| HarnessError::UnknownValidator(attacker.to_owned()))?;
    let last_hash = chain.last().ok_or(HarnessError::EmptyBlockchain)?.hash();
    let old_addresses: Vec<&str> = old_pool.iter().map(|e| e.address.as_str()).collect();
    let target = SelectionTarget::new(&old_addresses, pool.len(), index)
        .ok_or(HarnessError::EmptyStakePool)?;

    let load = Command::LoadCoinbaseTransaction {
        address: attacker.to_owned(),
        timestamp: timestamps.next_timestamp(),
    };
    let coinbase = fleet.send_nonempty(0, &load).await?;
    fleet.broadcast_except(0, &load).await?;

    let mut candidates = Vec::with_capacity(mempool.len() + 1);
    candidates.push(coinbase);
    candidates.extend(mempool.into_iter().map(|tx| tx.txid));
    let cut = fit_proposal(&mut candidates, fleet.max_command_bytes());
    if cut > 0 {
        warn!(
            "{cut} mempool transactions do not fit into a block proposal, grinding without them"
        );
    }
    info!(
        "attacker grinds through up to {}! orderings of {} transactions",
        candidates.len(),
        candidates.len()
    );

    let outcome = search(&last_hash, candidates, &target);
    if outcome.found {
        info!(
            "found a winning block after {} orderings, attacker wins the next round",
            outcome.tried
        );
    } else {
        warn!("grinding unsuccessful after {} orderings", outcome.tried);
    }

    let propose = Command::ProposeBlock {
        txids: outcome.order.clone(),
    };
    fleet.broadcast(&propose).await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::crypto::sha256_hex;

    #[test]
    fn hex_prefix() {
        assert_eq!(parse_hex_prefix(""), 0);
        assert_eq!(parse_hex_prefix("zz"), 0);
        assert_eq!(parse_hex_prefix("ff"), 255);
        assert_eq!(parse_hex_prefix("1g5"), 1);
        assert_eq!(parse_hex_prefix("ABCDEF"), 0xab_cdef);
        // only the lowest 32 bits of the 64-bit prefix survive
        assert_eq!(parse_hex_prefix("123456789abcdef0"), 0x9abc_def0);
        // characters beyond the prefix are ignored
        assert_eq!(
            parse_hex_prefix("00000000000000071"),
            parse_hex_prefix("0000000000000007")
        );
    }

    #[test]
    fn single_entry_pool_always_selects() {
        // with one staker every selection lands on position 0
        let old = [sha256_hex(b"x")];
        let target = SelectionTarget::new(&old, 1, 0).unwrap();
        for i in 0..16_u8 {
            assert!(target.is_hit(&sha256_hex(&[i])));
        }
        let outcome = search("prev", vec!["c".into(), "a".into(), "b".into()], &target);
        assert!(outcome.found);
        assert_eq!(outcome.tried, 1);
        assert_eq!(outcome.order, ["a", "b", "c"]);
    }

    #[test]
    fn accumulator() {
        let old = ["00000005", "00000007", "0000000a"];
        // 5 % 3 + 7 % 3 + 10 % 3
        assert_eq!(creator_accumulator(&old, 3), 2 + 1 + 1);
        assert_eq!(creator_accumulator::<&str>(&[], 3), 0);

        // shares are added with 32-bit wraparound
        let old = ["ffffffff"; 3];
        assert_eq!(creator_accumulator(&old, 0x8000_0000), 0x7fff_fffd);
    }

    #[test]
    fn selection_formula() {
        // creator 4, hash prefix 0x1f = 31, pool of 5: (4 + 31 % 5) % 5 = 0
        assert_eq!(selected_index(4, "1f", 5), 0);
        assert_eq!(selected_index(4, "20", 5), 1);
        let target = SelectionTarget::new(&["00000004"], 5, 1).unwrap();
        assert!(target.is_hit("20"));
        assert!(!target.is_hit("1f"));
        assert!(SelectionTarget::new(&["00"], 3, 3).is_none());
        assert!(SelectionTarget::new(&["00"], 0, 0).is_none());
    }

    #[test]
    fn permutations_in_order() {
        let all: Vec<_> = Permutations::new(vec![3, 1, 2]).collect();
        assert_eq!(
            all,
            [
                [1, 2, 3],
                [1, 3, 2],
                [2, 1, 3],
                [2, 3, 1],
                [3, 1, 2],
                [3, 2, 1]
            ]
        );
        assert_eq!(Permutations::<u8>::new(vec![]).count(), 1);
    }

    #[test]
    fn permutations_distinct_and_finite() {
        let all: Vec<_> = Permutations::new(vec!['a', 'b', 'b', 'c', 'd']).collect();
        // 5! / 2!
        assert_eq!(all.len(), 60);
        let distinct: HashSet<_> = all.iter().collect();
        assert_eq!(distinct.len(), 60);
    }

    #[test]
    fn next_permutation_wraps_around() {
        let mut items = [3, 2, 1];
        assert!(!next_permutation(&mut items));
        assert_eq!(items, [1, 2, 3]);
    }

    #[test]
    fn search_finds_first_hit() {
        let candidates: Vec<String> = (0..5).map(|i| sha256_hex(&[i])).collect();
        let old = [sha256_hex(b"old")];
        for index in 0..4 {
            let target = SelectionTarget::new(&old, 4, index).unwrap();
            let outcome = search("parent", candidates.clone(), &target);
            let expected = Permutations::new(candidates.clone())
                .position(|order| target.is_hit(&block_hash("parent", &order)));
            match expected {
                Some(position) => {
                    assert!(outcome.found);
                    assert_eq!(outcome.tried, position + 1);
                    assert!(target.is_hit(&block_hash("parent", &outcome.order)));
                }
                None => {
                    assert!(!outcome.found);
                    assert_eq!(outcome.tried, 120);
                }
            }
        }
    }

    #[test]
    fn search_exhausts_without_hit() {
        // a target index that no hash can reach
        let target = SelectionTarget {
            creator: 0,
            pool_len: 2,
            index: 5,
        };
        let candidates: Vec<String> = vec!["b".into(), "a".into(), "c".into(), "d".into()];
        let outcome = search("parent", candidates, &target);
        assert!(!outcome.found);
        assert_eq!(outcome.tried, 24);
        assert_eq!(outcome.order, ["d", "c", "b", "a"]);
    }
}
