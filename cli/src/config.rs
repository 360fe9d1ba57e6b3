//! Binary configuration file.
//!
//! ```json
//! {
//!   "rpc_url": "https://mainnet.base.org",
//!   "database": "sbtindex.db",
//!   "log": { "level": "info", "json": false },
//!   "indexer": { "chain": "base", "contract_address": "0x…", "start_block": 19000000 }
//! }
//! ```

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use sbtindex_core::config::IndexerConfig;

use crate::logging::LogConfig;

pub const ENV_RPC_URL: &str = "SBTINDEX_RPC_URL";
pub const ENV_DATABASE: &str = "SBTINDEX_DATABASE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// JSON-RPC endpoint.
    #[serde(default)]
    pub rpc_url: String,
    /// SQLite database file.
    #[serde(default = "default_database")]
    pub database: String,
    /// Per-request HTTP timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
}

fn default_database() -> String {
    "sbtindex.db".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl AppConfig {
    /// Read `path`, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file '{}'", path.display()))?;
        let mut config = Self::parse(&raw)
            .with_context(|| format!("parse config file '{}'", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Replace file values with non-empty values from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_RPC_URL).filter(|v| !v.is_empty()) {
            self.rpc_url = url;
        }
        if let Some(db) = lookup(ENV_DATABASE).filter(|v| !v.is_empty()) {
            self.database = db;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc_url.is_empty() {
            return Err(anyhow!("rpc_url is not set (config file or {ENV_RPC_URL})"));
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be > 0"));
        }
        self.indexer.validate().context("invalid indexer config")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const CONFIG: &str = r#"{
        "rpc_url": "http://localhost:8545",
        "log": { "level": "debug", "components": { "sbtindex-rpc": "trace" } },
        "indexer": {
            "chain": "base",
            "contract_address": "0x5FbDB2315678afecb367f032d93F642f64180aa3",
            "start_block": 19000000,
            "batch_size": 50
        }
    }"#;

    #[test]
    fn parses_with_defaults() {
        let config = AppConfig::parse(CONFIG).unwrap();
        assert_eq!(config.rpc_url, "http://localhost:8545");
        assert_eq!(config.database, "sbtindex.db");
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.indexer.chain, "base");
        assert_eq!(config.indexer.batch_size, 50);
        assert_eq!(config.indexer.poll_interval_ms, 15_000);
        assert_eq!(config.indexer.rank_ids, vec![0, 1, 2, 3, 4]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = AppConfig::parse(CONFIG).unwrap();
        let env: HashMap<&str, &str> = [
            (ENV_RPC_URL, "https://rpc.example"),
            (ENV_DATABASE, "/var/lib/sbt.db"),
        ]
        .into();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.rpc_url, "https://rpc.example");
        assert_eq!(config.database, "/var/lib/sbt.db");
    }

    #[test]
    fn empty_override_is_ignored() {
        let mut config = AppConfig::parse(CONFIG).unwrap();
        config.apply_overrides(|_| Some(String::new()));
        assert_eq!(config.rpc_url, "http://localhost:8545");
    }

    #[test]
    fn missing_rpc_url_is_rejected() {
        let mut config = AppConfig::parse(CONFIG).unwrap();
        config.rpc_url.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_indexer_is_rejected() {
        let mut config = AppConfig::parse(CONFIG).unwrap();
        config.indexer.batch_size = 101;
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("batch_size"));
    }
}
