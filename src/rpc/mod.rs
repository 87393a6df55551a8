//! RPC boundary: endpoint limitations, chain quirk adapters, the linear and
//! batch transports, and the per-endpoint gate.

mod endpoint;
mod gate;
mod quirks;
mod transport;

pub use endpoint::*;
pub use gate::*;
pub use quirks::*;
pub use transport::*;

use std::sync::Arc;
use std::time::Duration;

use ethers::providers::Provider;
use eyre::Context;
use url::Url;

use crate::config::PerChainConfig;

/// Everything the loaders need to talk to one chain: the two providers, the
/// endpoint's declared limitations, and its gate.
#[derive(Debug, Clone)]
pub struct ChainRpc {
    pub chain: String,
    pub chain_id: u64,
    pub public_url: String,
    pub limitations: RpcLimitations,
    pub gate: Arc<EndpointGate>,
    linear: Arc<Provider<CoalescingTransport>>,
    batch: Arc<Provider<CoalescingTransport>>,
}

impl ChainRpc {
    /// Sample one RPC URL for the chain and build both providers against it.
    pub fn connect(chain_cfg: &PerChainConfig) -> eyre::Result<Self> {
        let url_str = chain_cfg.sample_rpc_url()?;
        let url = Url::parse(&url_str)
            .with_context(|| format!("Invalid RPC URL for chain {}", chain_cfg.chain_name))?;

        let mut limitations = RpcLimitations::for_url(&url_str);
        if let Some(ms) = chain_cfg.min_delay_between_rpc_calls_ms {
            limitations.min_delay_between_calls = Some(Duration::from_millis(ms));
        }

        let adapter = adapter_for_chain(&chain_cfg.chain_name);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("beefy-importer/0.3")
            .build()
            .wrap_err("Failed to build HTTP client")?;

        let linear = Provider::new(CoalescingTransport::linear(
            url.clone(),
            client.clone(),
            adapter.clone(),
        ));
        let batch = Provider::new(CoalescingTransport::batching(
            url,
            client,
            adapter.clone(),
            BATCH_AGGREGATION_WINDOW,
        ));
        let gate = endpoint_gate(&url_str, &limitations, adapter);

        tracing::info!(
            chain = %chain_cfg.chain_name,
            endpoint = %gate.public_url(),
            archive = limitations.is_archive_node,
            "Connected chain RPC"
        );

        Ok(Self {
            chain: chain_cfg.chain_name.clone(),
            chain_id: chain_cfg.chain_id,
            public_url: gate.public_url().to_string(),
            limitations,
            gate,
            linear: Arc::new(linear),
            batch: Arc::new(batch),
        })
    }

    /// Pick the provider flavor the batch-RPC operator decided on.
    pub fn provider(&self, use_batch: bool) -> Arc<Provider<CoalescingTransport>> {
        if use_batch {
            self.batch.clone()
        } else {
            self.linear.clone()
        }
    }
}
