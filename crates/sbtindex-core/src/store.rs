//! The persisted read-model interface.
//!
//! Every mutation is a keyed upsert or a keyed conditional update, so
//! replaying a log converges to the same state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::IndexerError;
use crate::types::{Token, TokenKey, User};

/// Storage for tokens and users.
///
/// Implementations include `InMemoryStorage` and `SqliteStorage`
/// (`sbtindex-storage`).
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Create the user if it does not exist.
    async fn upsert_user(&self, address: &str) -> Result<(), IndexerError>;

    async fn get_user(&self, address: &str) -> Result<Option<User>, IndexerError>;

    /// Insert a token, or overwrite its mint-derived fields (owner, rank,
    /// timestamps, uri, rate). Collect fields of an existing row are kept.
    async fn upsert_token(&self, token: &Token) -> Result<(), IndexerError>;

    /// Set the owner of an existing token. Returns `false` if the token is
    /// unknown (nothing is created).
    async fn update_owner(&self, key: &TokenKey, owner: &str) -> Result<bool, IndexerError>;

    /// Record a collect, only if `owner` currently owns the token.
    /// Returns `false` when the token is unknown or owned by someone else.
    async fn record_collect(
        &self,
        key: &TokenKey,
        owner: &str,
        score: f64,
        at: DateTime<Utc>,
    ) -> Result<bool, IndexerError>;

    /// Recompute lifetime-derived fields of an existing token.
    async fn update_lifetime(
        &self,
        key: &TokenKey,
        expiration: DateTime<Utc>,
        score_per_second: f64,
    ) -> Result<bool, IndexerError>;

    async fn get_token(&self, key: &TokenKey) -> Result<Option<Token>, IndexerError>;

    /// Tokens of `contract` owned by `owner` (collection view).
    async fn tokens_by_owner(&self, contract: &str, owner: &str)
        -> Result<Vec<Token>, IndexerError>;

    /// All tokens of `contract`, ordered by token id.
    async fn tokens(&self, contract: &str) -> Result<Vec<Token>, IndexerError>;

    /// Tokens whose expiration was computed without a known lifetime.
    async fn stale_tokens(&self, contract: &str) -> Result<Vec<Token>, IndexerError> {
        Ok(self
            .tokens(contract)
            .await?
            .into_iter()
            .filter(Token::has_stale_expiration)
            .collect())
    }
}
