//! SQLite storage backend.
//!
//! Persists users, tokens and checkpoints to a single SQLite file.
//! Uses `sqlx` with WAL mode for concurrent read performance. Timestamps are
//! stored as unix seconds.
//!
//! # Usage
//! ```rust,no_run
//! use sbtindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./sbtindex.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use sbtindex_core::checkpoint::{Checkpoint, CheckpointStore};
use sbtindex_core::error::IndexerError;
use sbtindex_core::store::TokenStore;
use sbtindex_core::types::{Token, TokenKey, User};

const TOKEN_COLUMNS: &str = "contract_address, token_id, owner_address, rank, mint_timestamp,
     metadata_uri, expiration_timestamp, score_per_second, last_collected_score,
     last_collected_timestamp";

fn storage_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite-backed token store and checkpoint store.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./sbtindex.db"`) or a full
    /// SQLite URL (`"sqlite:./sbtindex.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Uses a single connection so every query sees the same database. All
    /// data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                chain_id     TEXT    NOT NULL,
                indexer_id   TEXT    NOT NULL,
                block_number INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL,
                PRIMARY KEY (chain_id, indexer_id)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("CREATE TABLE IF NOT EXISTS users (address TEXT PRIMARY KEY NOT NULL);")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tokens (
                contract_address         TEXT    NOT NULL,
                token_id                 TEXT    NOT NULL,
                owner_address            TEXT    NOT NULL,
                rank                     INTEGER NOT NULL,
                mint_timestamp           INTEGER NOT NULL,
                metadata_uri             TEXT    NOT NULL,
                expiration_timestamp     INTEGER NOT NULL,
                score_per_second         REAL    NOT NULL,
                last_collected_score     REAL    NOT NULL DEFAULT 0,
                last_collected_timestamp INTEGER,
                PRIMARY KEY (contract_address, token_id)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tokens_owner ON tokens (contract_address, owner_address);",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn select_tokens(&self, filter: &str, binds: &[&str]) -> Result<Vec<Token>, IndexerError> {
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE {filter}
             ORDER BY LENGTH(token_id), token_id"
        );
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(storage_err)?;
        rows.iter().map(token_from_row).collect()
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, IndexerError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| IndexerError::Storage(format!("timestamp {secs} out of range")))
}

fn token_from_row(row: &SqliteRow) -> Result<Token, IndexerError> {
    let rank: i64 = row.try_get("rank").map_err(storage_err)?;
    let collected_at: Option<i64> = row.try_get("last_collected_timestamp").map_err(storage_err)?;
    Ok(Token {
        contract_address: row.try_get("contract_address").map_err(storage_err)?,
        token_id: row.try_get("token_id").map_err(storage_err)?,
        owner_address: row.try_get("owner_address").map_err(storage_err)?,
        rank: u8::try_from(rank)
            .map_err(|_| IndexerError::Storage(format!("rank {rank} out of range")))?,
        mint_timestamp: timestamp(row.try_get("mint_timestamp").map_err(storage_err)?)?,
        metadata_uri: row.try_get("metadata_uri").map_err(storage_err)?,
        expiration_timestamp: timestamp(row.try_get("expiration_timestamp").map_err(storage_err)?)?,
        score_per_second: row.try_get("score_per_second").map_err(storage_err)?,
        last_collected_score: row.try_get("last_collected_score").map_err(storage_err)?,
        last_collected_timestamp: collected_at.map(timestamp).transpose()?,
    })
}

// ─── TokenStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl TokenStore for SqliteStorage {
    async fn upsert_user(&self, address: &str) -> Result<(), IndexerError> {
        sqlx::query("INSERT INTO users (address) VALUES (?) ON CONFLICT (address) DO NOTHING")
            .bind(address.to_ascii_lowercase())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_user(&self, address: &str) -> Result<Option<User>, IndexerError> {
        let row = sqlx::query("SELECT address FROM users WHERE address = ?")
            .bind(address.to_ascii_lowercase())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|r| User::new(r.get::<String, _>("address"))))
    }

    async fn upsert_token(&self, token: &Token) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO tokens
             (contract_address, token_id, owner_address, rank, mint_timestamp,
              metadata_uri, expiration_timestamp, score_per_second)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (contract_address, token_id) DO UPDATE SET
                owner_address        = excluded.owner_address,
                rank                 = excluded.rank,
                mint_timestamp       = excluded.mint_timestamp,
                metadata_uri         = excluded.metadata_uri,
                expiration_timestamp = excluded.expiration_timestamp,
                score_per_second     = excluded.score_per_second",
        )
        .bind(token.contract_address.to_ascii_lowercase())
        .bind(&token.token_id)
        .bind(token.owner_address.to_ascii_lowercase())
        .bind(token.rank as i64)
        .bind(token.mint_timestamp.timestamp())
        .bind(&token.metadata_uri)
        .bind(token.expiration_timestamp.timestamp())
        .bind(token.score_per_second)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(token = %token.key(), owner = %token.owner_address, "token upserted");
        Ok(())
    }

    async fn update_owner(&self, key: &TokenKey, owner: &str) -> Result<bool, IndexerError> {
        let result = sqlx::query(
            "UPDATE tokens SET owner_address = ? WHERE contract_address = ? AND token_id = ?",
        )
        .bind(owner.to_ascii_lowercase())
        .bind(&key.contract_address)
        .bind(&key.token_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_collect(
        &self,
        key: &TokenKey,
        owner: &str,
        score: f64,
        at: DateTime<Utc>,
    ) -> Result<bool, IndexerError> {
        let result = sqlx::query(
            "UPDATE tokens SET last_collected_score = ?, last_collected_timestamp = ?
             WHERE contract_address = ? AND token_id = ? AND owner_address = ?",
        )
        .bind(score)
        .bind(at.timestamp())
        .bind(&key.contract_address)
        .bind(&key.token_id)
        .bind(owner.to_ascii_lowercase())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_lifetime(
        &self,
        key: &TokenKey,
        expiration: DateTime<Utc>,
        score_per_second: f64,
    ) -> Result<bool, IndexerError> {
        let result = sqlx::query(
            "UPDATE tokens SET expiration_timestamp = ?, score_per_second = ?
             WHERE contract_address = ? AND token_id = ?",
        )
        .bind(expiration.timestamp())
        .bind(score_per_second)
        .bind(&key.contract_address)
        .bind(&key.token_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_token(&self, key: &TokenKey) -> Result<Option<Token>, IndexerError> {
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE contract_address = ? AND token_id = ?"
        );
        let row = sqlx::query(&sql)
            .bind(&key.contract_address)
            .bind(&key.token_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(token_from_row).transpose()
    }

    async fn tokens_by_owner(
        &self,
        contract: &str,
        owner: &str,
    ) -> Result<Vec<Token>, IndexerError> {
        let (contract, owner) = (contract.to_ascii_lowercase(), owner.to_ascii_lowercase());
        self.select_tokens(
            "contract_address = ? AND owner_address = ?",
            &[contract.as_str(), owner.as_str()],
        )
        .await
    }

    async fn tokens(&self, contract: &str) -> Result<Vec<Token>, IndexerError> {
        let contract = contract.to_ascii_lowercase();
        self.select_tokens("contract_address = ?", &[contract.as_str()])
            .await
    }

    async fn stale_tokens(&self, contract: &str) -> Result<Vec<Token>, IndexerError> {
        let contract = contract.to_ascii_lowercase();
        self.select_tokens(
            "contract_address = ? AND expiration_timestamp <= mint_timestamp",
            &[contract.as_str()],
        )
        .await
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load(
        &self,
        chain_id: &str,
        indexer_id: &str,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT chain_id, indexer_id, block_number, updated_at
             FROM checkpoints WHERE chain_id = ? AND indexer_id = ?",
        )
        .bind(chain_id)
        .bind(indexer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| Checkpoint {
            chain_id: r.get("chain_id"),
            indexer_id: r.get("indexer_id"),
            block_number: r.get::<i64, _>("block_number") as u64,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints
             (chain_id, indexer_id, block_number, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&checkpoint.chain_id)
        .bind(&checkpoint.indexer_id)
        .bind(checkpoint.block_number as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(
            chain_id = %checkpoint.chain_id,
            indexer_id = %checkpoint.indexer_id,
            block = checkpoint.block_number,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn delete(&self, chain_id: &str, indexer_id: &str) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM checkpoints WHERE chain_id = ? AND indexer_id = ?")
            .bind(chain_id)
            .bind(indexer_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
