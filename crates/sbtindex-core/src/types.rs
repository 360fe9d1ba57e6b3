//! Shared types for the indexing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── BlockRange ───────────────────────────────────────────────────────────────

/// An inclusive range of block numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    /// First block (inclusive).
    pub from: u64,
    /// Last block (inclusive).
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    /// Number of blocks covered (0 when `to < from`).
    pub fn len(&self) -> u64 {
        if self.to < self.from {
            0
        } else {
            self.to - self.from + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split into consecutive sub-ranges of at most `width` blocks.
    pub fn batches(&self, width: u64) -> Batches {
        Batches {
            next: self.from,
            end: self.to,
            width: width.max(1),
            done: self.is_empty(),
        }
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Iterator over the batches of a [`BlockRange`].
#[derive(Debug, Clone)]
pub struct Batches {
    next: u64,
    end: u64,
    width: u64,
    done: bool,
}

impl Iterator for Batches {
    type Item = BlockRange;

    fn next(&mut self) -> Option<BlockRange> {
        if self.done {
            return None;
        }
        let to = self.next.saturating_add(self.width - 1).min(self.end);
        let batch = BlockRange::new(self.next, to);
        if to >= self.end {
            self.done = true;
        } else {
            self.next = to + 1;
        }
        Some(batch)
    }
}

// ─── Reference data ───────────────────────────────────────────────────────────

/// Accrual constants for one rank, read once from the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankConstant {
    pub rank_id: u8,
    /// Points accrued over the full lifetime (`S`).
    pub total_points: u64,
    /// Lifetime in seconds (`T`).
    pub lifetime_seconds: i64,
}

impl RankConstant {
    /// Points per second, or zero when the rank has no lifetime.
    pub fn score_per_second(&self) -> f64 {
        if self.lifetime_seconds <= 0 {
            0.0
        } else {
            self.total_points as f64 / self.lifetime_seconds as f64
        }
    }
}

// ─── Tokens & users ───────────────────────────────────────────────────────────

/// Primary key of a [`Token`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenKey {
    /// Lowercase `0x…` contract address.
    pub contract_address: String,
    /// Decimal token id.
    pub token_id: String,
}

impl TokenKey {
    pub fn new(contract_address: impl Into<String>, token_id: impl Into<String>) -> Self {
        Self {
            contract_address: contract_address.into().to_ascii_lowercase(),
            token_id: token_id.into(),
        }
    }
}

impl std::fmt::Display for TokenKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.contract_address, self.token_id)
    }
}

/// Numeric order of decimal token ids (shorter ids sort first).
pub fn cmp_token_ids(a: &str, b: &str) -> std::cmp::Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// One minted token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub contract_address: String,
    pub token_id: String,
    /// Lowercase `0x…` owner address.
    pub owner_address: String,
    pub rank: u8,
    pub mint_timestamp: DateTime<Utc>,
    pub metadata_uri: String,
    /// Equals `mint_timestamp` when rank constants were unknown at mint time.
    pub expiration_timestamp: DateTime<Utc>,
    pub score_per_second: f64,
    pub last_collected_score: f64,
    pub last_collected_timestamp: Option<DateTime<Utc>>,
}

impl Token {
    pub fn key(&self) -> TokenKey {
        TokenKey::new(&self.contract_address, &self.token_id)
    }

    /// `true` when the expiration was computed without a known lifetime.
    pub fn has_stale_expiration(&self) -> bool {
        self.expiration_timestamp <= self.mint_timestamp
    }
}

/// A wallet referenced as owner or actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    /// Lowercase `0x…` address.
    pub address: String,
}

impl User {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into().to_ascii_lowercase(),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_cover_range_without_gaps() {
        let range = BlockRange::new(100, 350);
        let batches: Vec<_> = range.batches(90).collect();
        assert_eq!(
            batches,
            vec![
                BlockRange::new(100, 189),
                BlockRange::new(190, 279),
                BlockRange::new(280, 350),
            ]
        );
    }

    #[test]
    fn token_ids_sort_numerically() {
        let mut ids = vec!["10", "9", "100", "11"];
        ids.sort_by(|a, b| cmp_token_ids(a, b));
        assert_eq!(ids, vec!["9", "10", "11", "100"]);
    }

    #[test]
    fn single_block_range_yields_one_batch() {
        let batches: Vec<_> = BlockRange::new(7, 7).batches(90).collect();
        assert_eq!(batches, vec![BlockRange::new(7, 7)]);
    }

    #[test]
    fn inverted_range_is_empty() {
        let range = BlockRange::new(10, 9);
        assert!(range.is_empty());
        assert_eq!(range.batches(5).count(), 0);
    }

    #[test]
    fn batches_near_u64_max_terminate() {
        let range = BlockRange::new(u64::MAX - 3, u64::MAX);
        assert_eq!(range.batches(2).count(), 2);
    }

    #[test]
    fn rank_rate_zero_lifetime() {
        let rc = RankConstant {
            rank_id: 4,
            total_points: 1000,
            lifetime_seconds: 0,
        };
        assert_eq!(rc.score_per_second(), 0.0);
    }

    #[test]
    fn token_key_lowercases_contract() {
        let key = TokenKey::new("0xAbCd", "42");
        assert_eq!(key.contract_address, "0xabcd");
        assert_eq!(key.to_string(), "0xabcd#42");
    }
}
