//! Contract creation lookup via the chain's Etherscan-style explorer API.
//!
//! The first transaction of a contract address pins both the creation block
//! and its date; the result is written into the import state once and never
//! fetched again for that product.

use chrono::{DateTime, TimeZone, Utc};
use ethers::types::Address;
use serde::Deserialize;

use crate::errors::LoaderError;

#[derive(Debug, Clone, Copy)]
pub struct ContractCreation {
    pub block_number: u64,
    pub datetime: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ExplorerTx {
    #[serde(rename = "blockNumber")]
    block_number: String,
    #[serde(rename = "timeStamp")]
    time_stamp: String,
}

/// Look up the first transaction of `address`.
pub async fn fetch_contract_creation(
    client: &reqwest::Client,
    api_url: &str,
    api_key: Option<&str>,
    chain: &str,
    address: Address,
) -> Result<ContractCreation, LoaderError> {
    let mut url = format!(
        "{}?module=account&action=txlist&address={:#x}&startblock=0&page=1&offset=1&sort=asc",
        api_url, address
    );
    if let Some(key) = api_key {
        url.push_str(&format!("&apikey={}", key));
    }

    let err = |detail: String| LoaderError::CreationLookup {
        chain: chain.to_string(),
        address: format!("{:#x}", address),
        detail,
    };

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| err(e.to_string()))?;
    let payload: ExplorerResponse = response
        .json()
        .await
        .map_err(|e| err(format!("malformed explorer payload: {}", e)))?;

    if payload.status != "1" {
        return Err(err(format!("explorer status {}: {}", payload.status, payload.result)));
    }
    let txs: Vec<ExplorerTx> = serde_json::from_value(payload.result)
        .map_err(|e| err(format!("malformed tx list: {}", e)))?;
    let first = txs
        .into_iter()
        .next()
        .ok_or_else(|| err("no transactions found".to_string()))?;

    let block_number = first
        .block_number
        .parse::<u64>()
        .map_err(|e| err(format!("bad block number '{}': {}", first.block_number, e)))?;
    let ts = first
        .time_stamp
        .parse::<i64>()
        .map_err(|e| err(format!("bad timestamp '{}': {}", first.time_stamp, e)))?;
    let datetime = Utc
        .timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| err(format!("out-of-range timestamp {}", ts)))?;

    Ok(ContractCreation {
        block_number,
        datetime,
    })
}
