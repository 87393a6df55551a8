//! Price-per-full-share sampling.
//!
//! Only standard vaults expose `getPricePerFullShare()`; the pipeline guards
//! boosts and gov vaults out before this operator, and a slip-through is a
//! planner bug surfaced as a domain invariant.

use std::collections::HashMap;
use std::sync::Arc;

use ethers::providers::{Middleware, Provider};
use ethers::types::{Address, BlockId, Bytes, TransactionRequest, U256};
use futures::future::try_join_all;
use once_cell::sync::Lazy;
use rust_decimal::Decimal;

use crate::rpc::CoalescingTransport;
use crate::types::{scale_down, Product};

static PPFS_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| {
    let id = ethers::utils::id("getPricePerFullShare()");
    [id[0], id[1], id[2], id[3]]
});

/// One share-rate sample request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PpfsQuery {
    pub vault_address: Address,
    pub vault_decimals: u8,
    pub block_number: u64,
}

impl PpfsQuery {
    /// Build a query for a product, rejecting products that have no share
    /// rate at the type level of the data.
    pub fn for_product(
        product: &Product,
        block_number: u64,
    ) -> Result<Self, crate::errors::LoaderError> {
        match &product.product_data {
            crate::types::ProductData::BeefyVault { vault } if !vault.is_gov_vault => Ok(Self {
                vault_address: vault.contract_address,
                vault_decimals: vault.token_decimals,
                block_number,
            }),
            _ => Err(crate::errors::LoaderError::DomainInvariant(format!(
                "share rate requested for product {} which has no price per full share",
                product.product_key
            ))),
        }
    }
}

/// Fetch `getPricePerFullShare()` for each query at its block, scaled by the
/// vault decimals. Concurrent `eth_call`s coalesce in the batch transport.
pub async fn fetch_ppfs(
    provider: Arc<Provider<CoalescingTransport>>,
    queries: Vec<PpfsQuery>,
) -> Result<HashMap<PpfsQuery, Decimal>, String> {
    let calls = queries.into_iter().map(|query| {
        let provider = provider.clone();
        async move {
            let tx = TransactionRequest::new()
                .to(query.vault_address)
                .data(Bytes::from(PPFS_SELECTOR.to_vec()));
            let raw = provider
                .call(&tx.into(), Some(BlockId::from(query.block_number)))
                .await
                .map_err(|e| e.to_string())?;
            if raw.is_empty() {
                return Err(format!(
                    "empty getPricePerFullShare result for {:?} at block {}",
                    query.vault_address, query.block_number
                ));
            }
            let value = U256::from_big_endian(raw.as_ref());
            let rate = scale_down(value, query.vault_decimals);
            Ok::<_, String>((query, rate))
        }
    });
    Ok(try_join_all(calls).await?.into_iter().collect())
}
