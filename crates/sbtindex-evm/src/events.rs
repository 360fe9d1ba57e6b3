//! Event kinds, signature table and typed decoding.
//!
//! The kind of a log is chosen by looking its topic0 up in a table built from
//! keccak256 of the contract's canonical event signatures:
//!   keccak256("Transfer(address,address,uint256)")
//!   → 0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef
//!
//! Signatures come from configuration so they can follow the deployed ABI;
//! each kind still requires a fixed parameter layout, checked at startup.

use std::collections::HashMap;
use std::str::FromStr;

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{Address, B256, U256};
use tiny_keccak::{Hasher, Keccak};

use sbtindex_core::config::EventAbi;
use sbtindex_core::error::IndexerError;

use crate::fetcher::RawLog;

/// The closed set of events the indexer projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Mint/reveal, the only event that creates a token.
    Reveal,
    Transfer,
    Collect,
}

impl EventKind {
    /// Processing order within a batch.
    pub const ALL: [EventKind; 3] = [EventKind::Reveal, EventKind::Transfer, EventKind::Collect];

    /// Parameter layout `(type, indexed)` every configured signature must have.
    fn layout(self) -> &'static [(&'static str, bool)] {
        match self {
            Self::Reveal => &[
                ("address", true),
                ("uint256", true),
                ("uint8", false),
                ("string", false),
            ],
            Self::Transfer => &[("address", true), ("address", true), ("uint256", true)],
            Self::Collect => &[("address", true), ("uint256", true), ("uint256", false)],
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Reveal => 0,
            Self::Transfer => 1,
            Self::Collect => 2,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reveal => write!(f, "reveal"),
            Self::Transfer => write!(f, "transfer"),
            Self::Collect => write!(f, "collect"),
        }
    }
}

/// Decoded `Revealed` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealEvent {
    pub owner: String,
    pub token_id: String,
    pub rank: u8,
    pub token_uri: String,
}

/// Decoded `Transfer` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub from: String,
    pub to: String,
    pub token_id: String,
}

/// Decoded `Collected` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectEvent {
    pub owner: String,
    pub token_id: String,
    pub amount: U256,
}

/// A typed contract event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractEvent {
    Reveal(RevealEvent),
    Transfer(TransferEvent),
    Collect(CollectEvent),
}

impl ContractEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Reveal(_) => EventKind::Reveal,
            Self::Transfer(_) => EventKind::Transfer,
            Self::Collect(_) => EventKind::Collect,
        }
    }
}

/// topic0 → [`EventKind`] lookup, built from canonical signatures.
#[derive(Debug, Clone)]
pub struct SignatureTable {
    by_topic: HashMap<String, EventKind>,
    topics: [String; 3],
}

impl SignatureTable {
    /// Build the table, checking each signature against its kind's layout.
    pub fn from_abi(abi: &EventAbi) -> Result<Self, IndexerError> {
        let mut topics: [String; 3] = Default::default();
        let mut by_topic = HashMap::new();
        for (kind, sig) in [
            (EventKind::Reveal, &abi.reveal),
            (EventKind::Transfer, &abi.transfer),
            (EventKind::Collect, &abi.collect),
        ] {
            let parsed = parse_signature(sig)?;
            let layout: Vec<(&str, bool)> = parsed
                .params
                .iter()
                .map(|(ty, indexed)| (ty.as_str(), *indexed))
                .collect();
            if layout != kind.layout() {
                return Err(IndexerError::Config(format!(
                    "{kind} signature '{sig}' does not match the expected parameter layout {:?}",
                    kind.layout()
                )));
            }
            let topic = keccak256_signature(&parsed.canonical());
            if by_topic.insert(topic.clone(), kind).is_some() {
                return Err(IndexerError::Config(format!(
                    "{kind} signature '{sig}' collides with another event"
                )));
            }
            topics[kind.index()] = topic;
        }
        Ok(Self { by_topic, topics })
    }

    /// topic0 of `kind`, as `0x…` lowercase hex.
    pub fn topic0(&self, kind: EventKind) -> &str {
        &self.topics[kind.index()]
    }

    /// Kind of a log, or `None` for an unrecognized signature.
    pub fn kind_of(&self, log: &RawLog) -> Option<EventKind> {
        let topic0 = log.topics.first()?;
        self.by_topic.get(&topic0.to_ascii_lowercase()).copied()
    }

    /// Decode a log. `Ok(None)` for unrecognized signatures.
    pub fn decode(&self, log: &RawLog) -> Result<Option<ContractEvent>, IndexerError> {
        let Some(kind) = self.kind_of(log) else {
            return Ok(None);
        };
        let expected_topics = 1 + kind.layout().iter().filter(|(_, indexed)| *indexed).count();
        if log.topics.len() != expected_topics {
            return Err(IndexerError::Decode(format!(
                "{kind} log has {} topics, expected {expected_topics}",
                log.topics.len()
            )));
        }

        let event = match kind {
            EventKind::Reveal => {
                let data = decode_data(&log.data, vec![DynSolType::Uint(8), DynSolType::String])?;
                let rank = data[0]
                    .as_uint()
                    .and_then(|(v, _)| u8::try_from(v).ok())
                    .ok_or_else(|| IndexerError::Decode("reveal rank is not a uint8".into()))?;
                let token_uri = data[1]
                    .as_str()
                    .ok_or_else(|| IndexerError::Decode("reveal tokenURI is not a string".into()))?
                    .to_string();
                ContractEvent::Reveal(RevealEvent {
                    owner: topic_address(&log.topics[1])?,
                    token_id: topic_uint(&log.topics[2])?.to_string(),
                    rank,
                    token_uri,
                })
            }
            EventKind::Transfer => ContractEvent::Transfer(TransferEvent {
                from: topic_address(&log.topics[1])?,
                to: topic_address(&log.topics[2])?,
                token_id: topic_uint(&log.topics[3])?.to_string(),
            }),
            EventKind::Collect => {
                let data = decode_data(&log.data, vec![DynSolType::Uint(256)])?;
                let amount = data[0]
                    .as_uint()
                    .map(|(v, _)| v)
                    .ok_or_else(|| IndexerError::Decode("collect amount is not a uint".into()))?;
                ContractEvent::Collect(CollectEvent {
                    owner: topic_address(&log.topics[1])?,
                    token_id: topic_uint(&log.topics[2])?.to_string(),
                    amount,
                })
            }
        };
        Ok(Some(event))
    }
}

// ─── Signatures ───────────────────────────────────────────────────────────────

/// A parsed `Name(type [indexed] [name], …)` signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    pub name: String,
    pub params: Vec<(String, bool)>,
}

impl ParsedSignature {
    /// The canonical form hashed for topic0 / selectors: `Name(t1,t2)`.
    pub fn canonical(&self) -> String {
        let types: Vec<&str> = self.params.iter().map(|(t, _)| t.as_str()).collect();
        format!("{}({})", self.name, types.join(","))
    }
}

/// Parse a human-readable signature. Parameter names are optional.
pub fn parse_signature(sig: &str) -> Result<ParsedSignature, IndexerError> {
    let bad = || IndexerError::Config(format!("malformed signature '{sig}'"));
    let sig = sig.trim();
    let open = sig.find('(').ok_or_else(bad)?;
    let inner = sig[open + 1..].strip_suffix(')').ok_or_else(bad)?;
    let name = sig[..open].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(bad());
    }

    let mut params = Vec::new();
    if !inner.trim().is_empty() {
        for param in inner.split(',') {
            let mut words = param.split_whitespace();
            let ty = words.next().ok_or_else(bad)?;
            let indexed = words.next() == Some("indexed");
            params.push((normalize_type(ty), indexed));
        }
    }
    Ok(ParsedSignature {
        name: name.to_string(),
        params,
    })
}

fn normalize_type(ty: &str) -> String {
    match ty {
        "uint" => "uint256".into(),
        "int" => "int256".into(),
        other => other.to_string(),
    }
}

/// keccak256 of a canonical signature, as `0x…` lowercase hex.
pub fn keccak256_signature(canonical: &str) -> String {
    format!("0x{}", hex::encode(keccak256(canonical.as_bytes())))
}

/// First four bytes of keccak256 of a function signature.
pub fn function_selector(sig: &str) -> Result<[u8; 4], IndexerError> {
    let canonical = parse_signature(sig)?.canonical();
    let hash = keccak256(canonical.as_bytes());
    Ok([hash[0], hash[1], hash[2], hash[3]])
}

fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(bytes);
    hasher.finalize(&mut output);
    output
}

// ─── Word decoding ────────────────────────────────────────────────────────────

fn topic_word(topic: &str) -> Result<B256, IndexerError> {
    B256::from_str(topic).map_err(|e| IndexerError::Decode(format!("invalid topic '{topic}': {e}")))
}

fn topic_address(topic: &str) -> Result<String, IndexerError> {
    Ok(format_address(&Address::from_word(topic_word(topic)?)))
}

fn topic_uint(topic: &str) -> Result<U256, IndexerError> {
    Ok(U256::from_be_bytes(topic_word(topic)?.0))
}

/// Lowercase `0x…` form used for every stored address.
pub fn format_address(addr: &Address) -> String {
    format!("0x{}", hex::encode(addr.as_slice()))
}

pub(crate) fn decode_hex(data: &str) -> Result<Vec<u8>, IndexerError> {
    hex::decode(data.strip_prefix("0x").unwrap_or(data))
        .map_err(|e| IndexerError::Decode(format!("invalid hex payload: {e}")))
}

pub(crate) fn decode_data(
    data: &str,
    types: Vec<DynSolType>,
) -> Result<Vec<DynSolValue>, IndexerError> {
    let bytes = decode_hex(data)?;
    let expected = types.len();
    match DynSolType::Tuple(types).abi_decode_params(&bytes) {
        Ok(DynSolValue::Tuple(values)) if values.len() == expected => Ok(values),
        Ok(other) => Err(IndexerError::Decode(format!("unexpected data shape: {other:?}"))),
        Err(e) => Err(IndexerError::Decode(format!("abi decode failed: {e}"))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn word_address(addr: &str) -> String {
        format!("0x{:0>64}", addr.trim_start_matches("0x"))
    }

    pub(crate) fn word_uint(v: u64) -> String {
        format!("0x{v:064x}")
    }

    pub(crate) fn encode_reveal_data(rank: u8, uri: &str) -> String {
        let value = DynSolValue::Tuple(vec![
            DynSolValue::Uint(U256::from(rank), 8),
            DynSolValue::String(uri.to_string()),
        ]);
        format!("0x{}", hex::encode(value.abi_encode_params()))
    }

    fn log(topics: Vec<String>, data: String) -> RawLog {
        RawLog {
            address: "0x5fbdb2315678afecb367f032d93f642f64180aa3".into(),
            topics,
            data,
            block_number: "0x10".into(),
            block_hash: "0xb1".into(),
            tx_hash: "0x01".into(),
            log_index: "0x0".into(),
            removed: None,
        }
    }

    #[test]
    fn transfer_topic_matches_erc721() {
        let table = SignatureTable::from_abi(&EventAbi::default()).unwrap();
        assert_eq!(
            table.topic0(EventKind::Transfer),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn parse_strips_names_and_indexed() {
        let parsed = parse_signature("Collected(address indexed owner, uint indexed id, uint256 amount)")
            .unwrap();
        assert_eq!(parsed.canonical(), "Collected(address,uint256,uint256)");
        assert_eq!(parsed.params[0], ("address".to_string(), true));
        assert_eq!(parsed.params[2], ("uint256".to_string(), false));
    }

    #[test]
    fn renamed_event_with_same_layout_accepted() {
        let abi = EventAbi {
            reveal: "Reveal(address indexed to, uint256 indexed id, uint8 tier, string uri)".into(),
            ..Default::default()
        };
        let table = SignatureTable::from_abi(&abi).unwrap();
        assert_eq!(
            table.topic0(EventKind::Reveal),
            keccak256_signature("Reveal(address,uint256,uint8,string)")
        );
    }

    #[test]
    fn wrong_layout_rejected() {
        let abi = EventAbi {
            collect: "Collected(address indexed owner, uint256 amount)".into(),
            ..Default::default()
        };
        assert!(matches!(SignatureTable::from_abi(&abi), Err(IndexerError::Config(_))));
    }

    #[test]
    fn balance_of_selector() {
        assert_eq!(function_selector("balanceOf(address)").unwrap(), [0x70, 0xa0, 0x82, 0x31]);
    }

    #[test]
    fn decode_reveal() {
        let table = SignatureTable::from_abi(&EventAbi::default()).unwrap();
        let l = log(
            vec![
                table.topic0(EventKind::Reveal).to_string(),
                word_address("0xAB5801a7D398351b8bE11C439e05C5B3259aeC9B"),
                word_uint(42),
            ],
            encode_reveal_data(3, "ipfs://token/42"),
        );
        let event = table.decode(&l).unwrap().unwrap();
        assert_eq!(
            event,
            ContractEvent::Reveal(RevealEvent {
                owner: "0xab5801a7d398351b8be11c439e05c5b3259aec9b".into(),
                token_id: "42".into(),
                rank: 3,
                token_uri: "ipfs://token/42".into(),
            })
        );
    }

    #[test]
    fn decode_collect_amount() {
        let table = SignatureTable::from_abi(&EventAbi::default()).unwrap();
        let l = log(
            vec![
                table.topic0(EventKind::Collect).to_string(),
                word_address("0x01"),
                word_uint(7),
            ],
            word_uint(160_000),
        );
        match table.decode(&l).unwrap().unwrap() {
            ContractEvent::Collect(c) => {
                assert_eq!(c.amount, U256::from(160_000u64));
                assert_eq!(c.token_id, "7");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_signature_is_skipped() {
        let table = SignatureTable::from_abi(&EventAbi::default()).unwrap();
        let l = log(vec![word_uint(1)], "0x".into());
        assert!(table.decode(&l).unwrap().is_none());
    }

    #[test]
    fn missing_topic_is_decode_error() {
        let table = SignatureTable::from_abi(&EventAbi::default()).unwrap();
        let l = log(
            vec![table.topic0(EventKind::Transfer).to_string(), word_address("0x01")],
            "0x".into(),
        );
        assert!(matches!(table.decode(&l), Err(IndexerError::Decode(_))));
    }

    #[test]
    fn truncated_data_is_decode_error() {
        let table = SignatureTable::from_abi(&EventAbi::default()).unwrap();
        let l = log(
            vec![
                table.topic0(EventKind::Reveal).to_string(),
                word_address("0x01"),
                word_uint(1),
            ],
            "0x00".into(),
        );
        assert!(matches!(table.decode(&l), Err(IndexerError::Decode(_))));
    }
}
