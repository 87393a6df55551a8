//! Block metadata fetchers: the chain head and per-block timestamps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use ethers::providers::{Middleware, Provider};
use futures::future::join_all;

use crate::errors::RpcCallError;
use crate::rpc::{ChainRpc, CoalescingTransport};
use crate::stream::SharedCache;

const LATEST_BLOCK_TTL: Duration = Duration::from_secs(60);

/// `eth_blockNumber` with a 60 s cache and at most one in-flight call per
/// chain. A forced head (backtests, replays) bypasses the lookup entirely.
pub struct LatestBlockFetcher {
    cache: SharedCache<String, u64>,
}

impl Default for LatestBlockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestBlockFetcher {
    pub fn new() -> Self {
        Self {
            cache: SharedCache::new(100, LATEST_BLOCK_TTL),
        }
    }

    pub async fn fetch(
        &self,
        rpc: &ChainRpc,
        max_total_retry_ms: u64,
        force: Option<u64>,
    ) -> Result<u64, RpcCallError> {
        if let Some(forced) = force {
            return Ok(forced);
        }
        let chain = rpc.chain.clone();
        let gate = rpc.gate.clone();
        let provider = rpc.provider(false);
        self.cache
            .get_or_fetch(chain, || async move {
                gate.call("eth_blockNumber", max_total_retry_ms, || {
                    let provider = provider.clone();
                    async move {
                        provider
                            .get_block_number()
                            .await
                            .map(|n| n.as_u64())
                            .map_err(|e| e.to_string())
                    }
                })
                .await
            })
            .await
    }
}

/// `eth_getBlockByNumber` timestamps, cached per `(chain, block)`.
pub struct BlockDatetimeFetcher {
    cache: SharedCache<(String, u64), DateTime<Utc>>,
}

impl Default for BlockDatetimeFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDatetimeFetcher {
    pub fn new() -> Self {
        Self {
            cache: SharedCache::new(1_000_000, Duration::from_secs(24 * 3_600)),
        }
    }

    pub async fn fetch(
        &self,
        rpc: &ChainRpc,
        block_number: u64,
        max_total_retry_ms: u64,
    ) -> Result<DateTime<Utc>, RpcCallError> {
        let gate = rpc.gate.clone();
        // batch provider: concurrent lookups of nearby blocks coalesce
        let provider = rpc.provider(true);
        self.cache
            .get_or_fetch((rpc.chain.clone(), block_number), || async move {
                gate.call("eth_getBlockByNumber", max_total_retry_ms, || {
                    let provider = provider.clone();
                    async move { fetch_block_datetime(provider, block_number).await }
                })
                .await
            })
            .await
    }

    /// Resolve many blocks at once, deduplicating through the cache.
    pub async fn fetch_many(
        &self,
        rpc: &ChainRpc,
        blocks: &[u64],
        max_total_retry_ms: u64,
    ) -> Result<HashMap<u64, DateTime<Utc>>, RpcCallError> {
        let fetches = blocks
            .iter()
            .map(|b| async move { (*b, self.fetch(rpc, *b, max_total_retry_ms).await) });
        let mut out = HashMap::with_capacity(blocks.len());
        for (block, result) in join_all(fetches).await {
            out.insert(block, result?);
        }
        Ok(out)
    }
}

async fn fetch_block_datetime(
    provider: Arc<Provider<CoalescingTransport>>,
    block_number: u64,
) -> Result<DateTime<Utc>, String> {
    let block = provider
        .get_block(block_number)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("could not find block {}", block_number))?;
    let ts = block.timestamp.as_u64() as i64;
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| format!("block {} has out-of-range timestamp {}", block_number, ts))
}
