//! Live score calculation.
//!
//! A token accrues `S / T` points per second from its mint time until its
//! expiration (`mint + T`), after which the score is frozen. Collected
//! amounts are a separate ledger and are not subtracted here.

use std::collections::HashMap;

use serde::Serialize;

use crate::cache::RankTable;
use crate::types::{cmp_token_ids, Token};

/// Effective expiration (unix seconds) of a token, if its rank is known.
///
/// A stored expiration equal to the mint time means the rank constants were
/// missing when the token was projected, so it is recomputed from the table.
pub fn expiration(token: &Token, ranks: &RankTable) -> Option<i64> {
    let rank = ranks.get(token.rank)?;
    let mint = token.mint_timestamp.timestamp();
    if token.has_stale_expiration() {
        Some(mint.saturating_add(rank.lifetime_seconds))
    } else {
        Some(token.expiration_timestamp.timestamp())
    }
}

/// `true` once `now` has reached the token's expiration.
pub fn is_expired(token: &Token, now: i64, ranks: &RankTable) -> bool {
    match ranks.get(token.rank) {
        Some(rank) if rank.lifetime_seconds > 0 => {
            expiration(token, ranks).is_some_and(|exp| now >= exp)
        }
        _ => false,
    }
}

/// Live accumulated score of `token` at `now` (unix seconds).
pub fn score(token: &Token, now: i64, ranks: &RankTable) -> f64 {
    let Some(rank) = ranks.get(token.rank) else {
        return 0.0;
    };
    if rank.lifetime_seconds <= 0 {
        return 0.0;
    }
    let Some(expires_at) = expiration(token, ranks) else {
        return 0.0;
    };
    let mint = token.mint_timestamp.timestamp();
    let active = (now.min(expires_at) - mint).max(0);
    rank.total_points as f64 * active as f64 / rank.lifetime_seconds as f64
}

/// A token with its score at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredToken {
    pub token_id: String,
    pub owner_address: String,
    pub rank: u8,
    pub score: f64,
    pub expired: bool,
}

/// Score every token and sort by score, highest first (ties by numeric token id).
pub fn rank_tokens(tokens: &[Token], now: i64, ranks: &RankTable) -> Vec<ScoredToken> {
    let mut scored: Vec<_> = tokens
        .iter()
        .map(|t| ScoredToken {
            token_id: t.token_id.clone(),
            owner_address: t.owner_address.clone(),
            rank: t.rank,
            score: score(t, now, ranks),
            expired: is_expired(t, now, ranks),
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| cmp_token_ids(&a.token_id, &b.token_id))
    });
    scored
}

/// One leaderboard row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub owner_address: String,
    pub tokens: usize,
    /// Sum of live scores across the owner's tokens.
    pub live_score: f64,
    /// Sum of amounts recorded by collect events.
    pub collected: f64,
}

impl LeaderboardEntry {
    pub fn total(&self) -> f64 {
        self.live_score + self.collected
    }
}

/// Per-owner totals, highest `total()` first, truncated to `limit`.
pub fn leaderboard(
    tokens: &[Token],
    now: i64,
    ranks: &RankTable,
    limit: usize,
) -> Vec<LeaderboardEntry> {
    let mut by_owner: HashMap<&str, LeaderboardEntry> = HashMap::new();
    for token in tokens {
        let entry = by_owner
            .entry(token.owner_address.as_str())
            .or_insert_with(|| LeaderboardEntry {
                owner_address: token.owner_address.clone(),
                tokens: 0,
                live_score: 0.0,
                collected: 0.0,
            });
        entry.tokens += 1;
        entry.live_score += score(token, now, ranks);
        entry.collected += token.last_collected_score;
    }
    let mut rows: Vec<_> = by_owner.into_values().collect();
    rows.sort_by(|a, b| {
        b.total()
            .total_cmp(&a.total())
            .then_with(|| a.owner_address.cmp(&b.owner_address))
    });
    rows.truncate(limit);
    rows
}
