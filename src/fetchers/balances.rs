//! Post-hoc investor balance lookups: `balanceOf(owner)` at a given block.

use std::collections::HashMap;
use std::sync::Arc;

use ethers::abi::Token;
use ethers::providers::{Middleware, Provider};
use ethers::types::{Address, BlockId, Bytes, TransactionRequest, U256};
use futures::future::try_join_all;
use once_cell::sync::Lazy;
use rust_decimal::Decimal;

use crate::rpc::CoalescingTransport;
use crate::types::scale_down;

static BALANCE_OF_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| {
    let id = ethers::utils::id("balanceOf(address)");
    [id[0], id[1], id[2], id[3]]
});

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BalanceQuery {
    pub contract_address: Address,
    pub decimals: u8,
    pub owner_address: Address,
    pub block_number: u64,
}

/// Fetch each owner's balance at its block, scaled to a decimal amount.
pub async fn fetch_owner_balances(
    provider: Arc<Provider<CoalescingTransport>>,
    queries: Vec<BalanceQuery>,
) -> Result<HashMap<BalanceQuery, Decimal>, String> {
    let calls = queries.into_iter().map(|query| {
        let provider = provider.clone();
        async move {
            let mut data = BALANCE_OF_SELECTOR.to_vec();
            data.extend(ethers::abi::encode(&[Token::Address(query.owner_address)]));
            let tx = TransactionRequest::new()
                .to(query.contract_address)
                .data(Bytes::from(data));
            let raw = provider
                .call(&tx.into(), Some(BlockId::from(query.block_number)))
                .await
                .map_err(|e| e.to_string())?;
            let value = if raw.is_empty() {
                U256::zero()
            } else {
                U256::from_big_endian(raw.as_ref())
            };
            let balance = scale_down(value, query.decimals);
            Ok::<_, String>((query, balance))
        }
    });
    Ok(try_join_all(calls).await?.into_iter().collect())
}
