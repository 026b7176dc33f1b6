// Copyright (c) Veil, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::time::Duration;

use ethers::types::Address as EthAddress;
use serde::{Deserialize, Serialize};

use crate::error::{IndexerError, IndexerResult};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TokenConfig {
    // Stable identifier used for trace rows and cursor categories, e.g. "usdc"
    pub token_id: String,
    // Deployed ERC-20 contract address
    pub address: String,
    // First block worth scanning for this token
    #[serde(default)]
    pub start_block: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    // Numeric chain id, also used as the storage key
    pub chain_id: u64,
    // Rpc url for the chain's fullnode
    pub rpc_url: String,
    // First block the indexer cares about on this chain
    #[serde(default)]
    pub start_block: u64,
    // Fallback finality distance for chains that do not serve the `finalized` tag
    #[serde(default = "default_finality_blocks")]
    pub finality_blocks: u64,
    // Tokens tracked on this chain
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
    // ERC-4337 entry point, if account-abstraction ops are indexed on this chain
    #[serde(default)]
    pub entry_point_address: Option<String>,
    // ERC-5564 announcer contract, if stealth announcements are indexed
    #[serde(default)]
    pub announcer_address: Option<String>,
    #[serde(default = "default_head_poll_interval_ms")]
    pub head_poll_interval_ms: u64,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_backfill_batch_size")]
    pub backfill_batch_size: usize,
    #[serde(default = "default_address_batch_size")]
    pub address_batch_size: usize,
    #[serde(default = "default_log_chunk_size")]
    pub log_chunk_size: u64,
    #[serde(default = "default_max_retry_duration_secs")]
    pub max_retry_duration_secs: u64,
}

fn default_finality_blocks() -> u64 {
    64
}

fn default_head_poll_interval_ms() -> u64 {
    2_000
}

fn default_sync_interval_ms() -> u64 {
    10_000
}

fn default_backfill_batch_size() -> usize {
    16
}

fn default_address_batch_size() -> usize {
    100
}

fn default_log_chunk_size() -> u64 {
    10_000
}

fn default_max_retry_duration_secs() -> u64 {
    600
}

impl ChainConfig {
    pub fn head_poll_interval(&self) -> Duration {
        Duration::from_millis(self.head_poll_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn max_retry_duration(&self) -> Duration {
        Duration::from_secs(self.max_retry_duration_secs)
    }

    pub fn entry_point(&self) -> IndexerResult<Option<EthAddress>> {
        self.entry_point_address
            .as_deref()
            .map(parse_address)
            .transpose()
    }

    pub fn announcer(&self) -> IndexerResult<Option<EthAddress>> {
        self.announcer_address
            .as_deref()
            .map(parse_address)
            .transpose()
    }

    pub fn token_addresses(&self) -> IndexerResult<Vec<(String, EthAddress)>> {
        self.tokens
            .iter()
            .map(|t| Ok((t.token_id.clone(), parse_address(&t.address)?)))
            .collect()
    }

    /// Contract addresses whose native calls are excluded from trace indexing
    /// to avoid double counting with the token and user-op sources.
    pub fn known_contract_addresses(&self) -> IndexerResult<Vec<EthAddress>> {
        let mut out = Vec::new();
        for t in &self.tokens {
            out.push(parse_address(&t.address)?);
        }
        if let Some(ep) = self.entry_point()? {
            out.push(ep);
        }
        if let Some(ann) = self.announcer()? {
            out.push(ann);
        }
        Ok(out)
    }

    pub fn validate(&self) -> IndexerResult<()> {
        if self.rpc_url.is_empty() {
            return Err(IndexerError::ConfigError(format!(
                "chain {} has no rpc url",
                self.chain_id
            )));
        }
        if self.address_batch_size == 0 || self.backfill_batch_size == 0 {
            return Err(IndexerError::ConfigError(format!(
                "chain {} has a zero batch size",
                self.chain_id
            )));
        }
        if self.log_chunk_size == 0 {
            return Err(IndexerError::ConfigError(format!(
                "chain {} has a zero log chunk size",
                self.chain_id
            )));
        }
        self.known_contract_addresses()?;
        Ok(())
    }
}

fn parse_address(s: &str) -> IndexerResult<EthAddress> {
    s.parse::<EthAddress>()
        .map_err(|e| IndexerError::ConfigError(format!("invalid address {}: {}", s, e)))
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScannerConfig {
    #[serde(default = "default_scanner_interval_secs")]
    pub interval_secs: u64,
    // Upper bound on announcements examined per pass
    #[serde(default = "default_scanner_page_size")]
    pub page_size: i64,
}

fn default_scanner_interval_secs() -> u64 {
    5
}

fn default_scanner_page_size() -> i64 {
    500
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scanner_interval_secs(),
            page_size: default_scanner_page_size(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AggregatorConfig {
    #[serde(default = "default_aggregator_interval_secs")]
    pub interval_secs: u64,
}

fn default_aggregator_interval_secs() -> u64 {
    10
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_aggregator_interval_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct IndexerConfig {
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
}

impl IndexerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        // Support both YAML and JSON formats
        let config: Self = if matches!(
            path.extension().and_then(|s| s.to_str()),
            Some("yaml") | Some("yml")
        ) {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(config)
    }

    pub fn validate(&self) -> IndexerResult<()> {
        if self.chains.is_empty() {
            return Err(IndexerError::ConfigError("no chains configured".into()));
        }
        for chain in &self.chains {
            chain.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_chain() -> ChainConfig {
        ChainConfig {
            chain_id: 1,
            rpc_url: "http://localhost:8545".to_string(),
            start_block: 0,
            finality_blocks: 64,
            tokens: vec![TokenConfig {
                token_id: "usdc".to_string(),
                address: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".to_string(),
                start_block: 0,
            }],
            entry_point_address: Some("0x5ff137d4b0fdcd49dca30c7cf57e578a026d2789".to_string()),
            announcer_address: Some("0x55649e01b5df198d18d95b5cc5051630cfd45564".to_string()),
            head_poll_interval_ms: default_head_poll_interval_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            backfill_batch_size: default_backfill_batch_size(),
            address_batch_size: default_address_batch_size(),
            log_chunk_size: default_log_chunk_size(),
            max_retry_duration_secs: default_max_retry_duration_secs(),
        }
    }

    #[test]
    fn test_validate_ok() {
        let config = IndexerConfig {
            chains: vec![test_chain()],
            scanner: ScannerConfig::default(),
            aggregator: AggregatorConfig::default(),
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_address() {
        let mut chain = test_chain();
        chain.tokens[0].address = "not-an-address".to_string();
        chain.validate().unwrap_err();
    }

    #[test]
    fn test_known_contracts_cover_all_sources() {
        let chain = test_chain();
        let known = chain.known_contract_addresses().unwrap();
        // token + entry point + announcer
        assert_eq!(known.len(), 3);
    }

    #[test]
    fn test_defaults_from_minimal_yaml() {
        let yaml = r#"
chains:
  - chain-id: 8453
    rpc-url: "http://localhost:8545"
"#;
        let config: IndexerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.chains[0].chain_id, 8453);
        assert_eq!(config.chains[0].address_batch_size, 100);
        assert_eq!(config.chains[0].log_chunk_size, 10_000);
        assert_eq!(config.scanner.interval_secs, 5);
    }
}
