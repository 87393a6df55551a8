//! Import pipelines: recurring per-chain product imports (historical and
//! recent) and the global oracle price import, composed from the planner,
//! the stream operators and the fetchers.

mod investments;
mod orchestrator;
mod prices;
mod share_rates;

pub use investments::*;
pub use orchestrator::*;
pub use prices::*;
pub use share_rates::*;

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::config::{Config, PerChainConfig, StreamConfig};
use crate::errors::ImporterError;
use crate::fetchers::{
    fetch_contract_creation, BlockDatetimeFetcher, ContractCreation, LatestBlockFetcher,
};
use crate::import_state::{
    product_investment_import_key, product_share_rate_import_key, ImportData, ImportRanges,
    ImportState, ImportStateStore, ProductInvestmentImport, ProductShareRateImport,
};
use crate::planner::BlockPlannerConfig;
use crate::rpc::ChainRpc;
use crate::storage::Store;
use crate::types::Product;

/// Everything the per-chain pipelines share.
pub struct ChainContext {
    pub chain_cfg: PerChainConfig,
    pub rpc: Arc<ChainRpc>,
    pub store: Store,
    pub import_states: ImportStateStore,
    pub stream_cfg: StreamConfig,
    pub latest_blocks: Arc<LatestBlockFetcher>,
    pub block_times: Arc<BlockDatetimeFetcher>,
    http: reqwest::Client,
    etherscan_api_key: Option<String>,
}

impl ChainContext {
    pub fn new(config: &Config, chain_cfg: PerChainConfig, store: Store) -> eyre::Result<Self> {
        let rpc = Arc::new(ChainRpc::connect(&chain_cfg)?);
        let import_states = ImportStateStore::new(store.pool());
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("beefy-importer/0.3")
            .build()?;
        let etherscan_api_key = config.etherscan_api_key(&chain_cfg.chain_name);
        Ok(Self {
            chain_cfg,
            rpc,
            store,
            import_states,
            stream_cfg: config.stream.clone(),
            latest_blocks: Arc::new(LatestBlockFetcher::new()),
            block_times: Arc::new(BlockDatetimeFetcher::new()),
            http,
            etherscan_api_key,
        })
    }

    pub fn chain(&self) -> &str {
        &self.chain_cfg.chain_name
    }

    pub fn planner_cfg(&self) -> BlockPlannerConfig {
        BlockPlannerConfig {
            max_blocks_per_query: self.chain_cfg.max_blocks_per_query,
            ms_per_block_estimate: self.chain_cfg.ms_per_block_estimate,
        }
    }

    /// Load the import state of a product's investment import, creating it on
    /// first sight. Creation needs the contract birth block, resolved once
    /// through the chain explorer.
    pub async fn ensure_investment_state(
        &self,
        product: &Product,
        head: u64,
    ) -> Result<ProductInvestmentImport, ImporterError> {
        let key = product_investment_import_key(product.product_id);
        if let Some(state) = self.import_states.fetch(&[key.clone()]).await?.remove(&key) {
            match state.import_data {
                ImportData::ProductInvestment(data) => return Ok(data),
                other => {
                    return Err(ImporterError::Pipeline(format!(
                        "import key {} holds unexpected payload {:?}",
                        key, other
                    )))
                }
            }
        }

        let creation = self.fetch_creation(product).await?;
        let data = ProductInvestmentImport {
            product_id: product.product_id,
            chain: product.chain.clone(),
            contract_created_at_block: creation.block_number,
            contract_creation_date: creation.datetime,
            chain_latest_block_number: head,
            ranges: ImportRanges::empty(Utc::now()),
        };
        info!(
            chain = %self.chain(),
            product = %product.product_key,
            created_at_block = creation.block_number,
            "Created investment import state"
        );
        self.import_states
            .upsert(&ImportState {
                import_key: key,
                import_data: ImportData::ProductInvestment(data.clone()),
            })
            .await?;
        Ok(data)
    }

    /// Same for the share-rate import of a standard vault. Creation info is
    /// borrowed from the investment import when it already exists.
    pub async fn ensure_share_rate_state(
        &self,
        product: &Product,
        head: u64,
    ) -> Result<ProductShareRateImport, ImporterError> {
        let key = product_share_rate_import_key(product.product_id);
        if let Some(state) = self.import_states.fetch(&[key.clone()]).await?.remove(&key) {
            match state.import_data {
                ImportData::ProductShareRate(data) => return Ok(data),
                other => {
                    return Err(ImporterError::Pipeline(format!(
                        "import key {} holds unexpected payload {:?}",
                        key, other
                    )))
                }
            }
        }

        let investment = self.ensure_investment_state(product, head).await?;
        let data = ProductShareRateImport {
            price_feed_id: product.price_feed_id,
            product_id: product.product_id,
            chain: product.chain.clone(),
            contract_created_at_block: investment.contract_created_at_block,
            contract_creation_date: investment.contract_creation_date,
            chain_latest_block_number: head,
            ranges: ImportRanges::empty(Utc::now()),
        };
        self.import_states
            .upsert(&ImportState {
                import_key: key,
                import_data: ImportData::ProductShareRate(data.clone()),
            })
            .await?;
        Ok(data)
    }

    async fn fetch_creation(&self, product: &Product) -> Result<ContractCreation, ImporterError> {
        let api_url = self.chain_cfg.etherscan_api_url.as_deref().ok_or_else(|| {
            ImporterError::Config(format!(
                "no explorer API configured for chain {}",
                self.chain()
            ))
        })?;
        fetch_contract_creation(
            &self.http,
            api_url,
            self.etherscan_api_key.as_deref(),
            self.chain(),
            product.contract_address(),
        )
        .await
        .map_err(ImporterError::Loader)
    }
}
