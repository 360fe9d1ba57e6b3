//! In-memory storage backend.
//!
//! Stores tokens, users and checkpoints in RAM.
//! Useful for testing and short-lived indexers that don't need persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use sbtindex_core::checkpoint::{Checkpoint, CheckpointStore};
use sbtindex_core::error::IndexerError;
use sbtindex_core::store::TokenStore;
use sbtindex_core::types::{cmp_token_ids, Token, TokenKey, User};

/// In-memory token store.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    users: Mutex<HashMap<String, User>>,
    tokens: Mutex<HashMap<TokenKey, Token>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    fn sorted(mut tokens: Vec<Token>) -> Vec<Token> {
        tokens.sort_by(|a, b| cmp_token_ids(&a.token_id, &b.token_id));
        tokens
    }
}

#[async_trait]
impl TokenStore for InMemoryStorage {
    async fn upsert_user(&self, address: &str) -> Result<(), IndexerError> {
        let user = User::new(address);
        self.users
            .lock()
            .unwrap()
            .entry(user.address.clone())
            .or_insert(user);
        Ok(())
    }

    async fn get_user(&self, address: &str) -> Result<Option<User>, IndexerError> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .get(&address.to_ascii_lowercase())
            .cloned())
    }

    async fn upsert_token(&self, token: &Token) -> Result<(), IndexerError> {
        let mut tokens = self.tokens.lock().unwrap();
        match tokens.get_mut(&token.key()) {
            Some(existing) => {
                existing.owner_address = token.owner_address.clone();
                existing.rank = token.rank;
                existing.mint_timestamp = token.mint_timestamp;
                existing.metadata_uri = token.metadata_uri.clone();
                existing.expiration_timestamp = token.expiration_timestamp;
                existing.score_per_second = token.score_per_second;
            }
            None => {
                tokens.insert(token.key(), token.clone());
            }
        }
        Ok(())
    }

    async fn update_owner(&self, key: &TokenKey, owner: &str) -> Result<bool, IndexerError> {
        Ok(match self.tokens.lock().unwrap().get_mut(key) {
            Some(token) => {
                token.owner_address = owner.to_ascii_lowercase();
                true
            }
            None => false,
        })
    }

    async fn record_collect(
        &self,
        key: &TokenKey,
        owner: &str,
        score: f64,
        at: DateTime<Utc>,
    ) -> Result<bool, IndexerError> {
        let owner = owner.to_ascii_lowercase();
        Ok(match self.tokens.lock().unwrap().get_mut(key) {
            Some(token) if token.owner_address == owner => {
                token.last_collected_score = score;
                token.last_collected_timestamp = Some(at);
                true
            }
            _ => false,
        })
    }

    async fn update_lifetime(
        &self,
        key: &TokenKey,
        expiration: DateTime<Utc>,
        score_per_second: f64,
    ) -> Result<bool, IndexerError> {
        Ok(match self.tokens.lock().unwrap().get_mut(key) {
            Some(token) => {
                token.expiration_timestamp = expiration;
                token.score_per_second = score_per_second;
                true
            }
            None => false,
        })
    }

    async fn get_token(&self, key: &TokenKey) -> Result<Option<Token>, IndexerError> {
        Ok(self.tokens.lock().unwrap().get(key).cloned())
    }

    async fn tokens_by_owner(
        &self,
        contract: &str,
        owner: &str,
    ) -> Result<Vec<Token>, IndexerError> {
        let contract = contract.to_ascii_lowercase();
        let owner = owner.to_ascii_lowercase();
        let tokens = self
            .tokens
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.contract_address == contract && t.owner_address == owner)
            .cloned()
            .collect();
        Ok(Self::sorted(tokens))
    }

    async fn tokens(&self, contract: &str) -> Result<Vec<Token>, IndexerError> {
        let contract = contract.to_ascii_lowercase();
        let tokens = self
            .tokens
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.contract_address == contract)
            .cloned()
            .collect();
        Ok(Self::sorted(tokens))
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn load(
        &self,
        chain_id: &str,
        indexer_id: &str,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        let key = format!("{chain_id}:{indexer_id}");
        Ok(self.checkpoints.lock().unwrap().get(&key).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        let key = format!("{}:{}", checkpoint.chain_id, checkpoint.indexer_id);
        self.checkpoints.lock().unwrap().insert(key, checkpoint);
        Ok(())
    }

    async fn delete(&self, chain_id: &str, indexer_id: &str) -> Result<(), IndexerError> {
        let key = format!("{chain_id}:{indexer_id}");
        self.checkpoints.lock().unwrap().remove(&key);
        Ok(())
    }
}
