// src/config.rs

//! # Modular Configuration System
//!
//! Settings load from a directory of specialized JSON files (`chains.json`,
//! `importer.json`), with environment variables overriding secrets and the
//! database URL. The `Config` struct is the single source of truth for all
//! importer parameters.

use eyre::{Context, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};

//================================================================================================//
//                                       Top-Level Config                                         //
//================================================================================================//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub chain_config: ChainConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    pub database_url: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chains: HashMap<String, PerChainConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerChainConfig {
    pub chain_id: u64,
    pub chain_name: String,
    /// Candidate RPC URLs; one is sampled uniformly at startup per chain.
    pub rpc_urls: Vec<String>,
    /// Hard cap on blocks per eth_getLogs / sampling query for this chain.
    pub max_blocks_per_query: u64,
    /// Rough block time, used to size the recent tail window and to
    /// extrapolate sampling block lists past the last known block.
    pub ms_per_block_estimate: u64,
    pub etherscan_api_url: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    /// Overrides the min delay derived from known-provider limitations.
    pub min_delay_between_rpc_calls_ms: Option<u64>,
}

impl PerChainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rpc_urls.is_empty() {
            return Err(eyre::eyre!("No RPC URLs configured for chain {}", self.chain_name));
        }
        if self.max_blocks_per_query == 0 {
            return Err(eyre::eyre!(
                "max_blocks_per_query must be positive for chain {}",
                self.chain_name
            ));
        }
        Ok(())
    }

    /// Pick one RPC URL uniformly at random. Called once per chain at startup
    /// so a process sticks with its endpoint for its whole lifetime.
    pub fn sample_rpc_url(&self) -> Result<String> {
        self.rpc_urls
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| eyre::eyre!("No RPC URLs configured for chain {}", self.chain_name))
    }
}

//================================================================================================//
//                                       Sub-Configurations                                       //
//================================================================================================//

/// Knobs for the stream operators. The db-flavored pair applies to operators
/// that end in a database write and favor bigger, slower batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub max_input_take: usize,
    pub max_input_wait_ms: u64,
    pub db_max_input_take: usize,
    pub db_max_input_wait_ms: u64,
    pub work_concurrency: usize,
    pub max_total_retry_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_input_take: 500,
            max_input_wait_ms: 5_000,
            db_max_input_take: 2_000,
            db_max_input_wait_ms: 10_000,
            work_concurrency: 10,
            max_total_retry_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Base URL of the off-chain price data API.
    pub data_api_base_url: String,
    /// Widest date window a single price API query may cover, in ms.
    pub price_max_query_range_ms: i64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            data_api_base_url: "https://data.beefy.finance".to_string(),
            price_max_query_range_ms: 90 * 24 * 3_600 * 1_000,
        }
    }
}

impl Config {
    pub async fn load_from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let chain_config: ChainConfig = Self::load_file(dir.join("chains.json")).await?;
        let importer: ImporterFileConfig =
            Self::load_optional_file(dir.join("importer.json")).await?.unwrap_or_default();

        for chain in chain_config.chains.values() {
            chain.validate()?;
        }

        Ok(Self {
            log_level: importer.log_level.unwrap_or_else(default_log_level),
            chain_config,
            stream: importer.stream.unwrap_or_default(),
            oracle: importer.oracle.unwrap_or_default(),
            database_url: importer.database_url,
        })
    }

    async fn load_file<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from JSON: {}", path.as_ref().display()))
    }

    async fn load_optional_file<T: for<'de> Deserialize<'de>>(
        path: impl AsRef<Path>,
    ) -> Result<Option<T>> {
        if !path.as_ref().exists() {
            return Ok(None);
        }
        Self::load_file(path).await.map(Some)
    }

    pub fn get_chain_config(&self, name: &str) -> Result<&PerChainConfig> {
        self.chain_config
            .chains
            .get(name)
            .ok_or_else(|| eyre::eyre!("Chain config not found: {}", name))
    }

    /// Chains the orchestrator should run, in stable order.
    pub fn enabled_chains(&self) -> Vec<&PerChainConfig> {
        let mut chains: Vec<&PerChainConfig> =
            self.chain_config.chains.values().filter(|c| c.enabled).collect();
        chains.sort_by(|a, b| a.chain_name.cmp(&b.chain_name));
        chains
    }

    /// Database URL from config, overridden by the `DATABASE_URL` env var.
    pub fn database_url(&self) -> Option<String> {
        std::env::var("DATABASE_URL").ok().or_else(|| self.database_url.clone())
    }

    /// Etherscan-style API key for a chain, from `ETHERSCAN_API_KEY_<CHAIN>`.
    pub fn etherscan_api_key(&self, chain_name: &str) -> Option<String> {
        std::env::var(format!("ETHERSCAN_API_KEY_{}", chain_name.to_uppercase())).ok()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ImporterFileConfig {
    log_level: Option<String>,
    database_url: Option<String>,
    stream: Option<StreamConfig>,
    oracle: Option<OracleConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_config_parses_and_validates() {
        let json = serde_json::json!({
            "chains": {
                "bsc": {
                    "chain_id": 56,
                    "chain_name": "bsc",
                    "rpc_urls": ["https://rpc.ankr.com/bsc"],
                    "max_blocks_per_query": 3000,
                    "ms_per_block_estimate": 3000,
                    "etherscan_api_url": "https://api.bscscan.com/api",
                    "enabled": true
                }
            }
        });
        let cfg: ChainConfig = serde_json::from_value(json).unwrap();
        let bsc = cfg.chains.get("bsc").unwrap();
        bsc.validate().unwrap();
        assert_eq!(bsc.sample_rpc_url().unwrap(), "https://rpc.ankr.com/bsc");
    }

    #[test]
    fn stream_defaults_are_bounded() {
        let s = StreamConfig::default();
        assert!(s.max_input_take > 0);
        assert!(s.work_concurrency > 0);
        assert!(s.db_max_input_take >= s.max_input_take);
    }
}
