//! ERC-20 transfer fetching and decoding.
//!
//! One query covers one `(contract, optional tracked address, block range)`
//! tuple. Tracked queries (gov vaults, boosts) watch transfers where the
//! tracked contract is sender or receiver and attribute the position change
//! to the counterparty; untracked queries (standard vault shares) attribute
//! both legs of every transfer to their respective owners.

use std::collections::HashMap;
use std::sync::Arc;

use ethers::providers::{Middleware, Provider};
use ethers::types::{Address, Filter, Log, H256, U256};
use futures::future::try_join_all;
use once_cell::sync::Lazy;

use crate::ranges::Range;
use crate::rpc::CoalescingTransport;
use crate::types::{scale_down, Erc20Transfer};

/// keccak256("Transfer(address,address,uint256)")
pub static TRANSFER_TOPIC: Lazy<H256> = Lazy::new(|| {
    H256::from(ethers::utils::keccak256(
        "Transfer(address,address,uint256)".as_bytes(),
    ))
});

/// One transfer import query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferQuery {
    pub token_address: Address,
    pub token_decimals: u8,
    pub track_address: Option<Address>,
    pub range: Range<u64>,
}

/// Fetch and decode every query of a batch. Concurrent `eth_getLogs`
/// requests coalesce in the batch transport.
pub async fn fetch_erc20_transfers(
    provider: Arc<Provider<CoalescingTransport>>,
    chain: String,
    queries: Vec<TransferQuery>,
) -> Result<HashMap<TransferQuery, Vec<Erc20Transfer>>, String> {
    let fetches = queries.into_iter().map(|query| {
        let provider = provider.clone();
        let chain = chain.clone();
        async move {
            let logs = fetch_transfer_logs(&provider, &query).await?;
            let transfers = decode_transfer_logs(&chain, &query, logs)?;
            Ok::<_, String>((query, transfers))
        }
    });
    Ok(try_join_all(fetches).await?.into_iter().collect())
}

async fn fetch_transfer_logs(
    provider: &Provider<CoalescingTransport>,
    query: &TransferQuery,
) -> Result<Vec<Log>, String> {
    let base = Filter::new()
        .address(query.token_address)
        .topic0(*TRANSFER_TOPIC)
        .from_block(query.range.from)
        .to_block(query.range.to);

    match query.track_address {
        None => provider.get_logs(&base).await.map_err(|e| e.to_string()),
        Some(tracked) => {
            // sender-side and receiver-side filters, combined and deduplicated
            let from_filter = base.clone().topic1(H256::from(tracked));
            let to_filter = base.topic2(H256::from(tracked));
            let (mut from_logs, to_logs) = tokio::try_join!(
                async { provider.get_logs(&from_filter).await.map_err(|e| e.to_string()) },
                async { provider.get_logs(&to_filter).await.map_err(|e| e.to_string()) },
            )?;
            from_logs.extend(to_logs);
            from_logs.sort_by_key(|log| (log.block_number, log.log_index));
            from_logs.dedup_by_key(|log| (log.transaction_hash, log.log_index));
            Ok(from_logs)
        }
    }
}

fn decode_transfer_logs(
    chain: &str,
    query: &TransferQuery,
    logs: Vec<Log>,
) -> Result<Vec<Erc20Transfer>, String> {
    let mut legs: Vec<Erc20Transfer> = Vec::with_capacity(logs.len() * 2);

    for log in logs {
        if log.topics.len() < 3 {
            return Err(format!(
                "transfer log of {:?} has {} topics, expected 3",
                query.token_address,
                log.topics.len()
            ));
        }
        let from = Address::from(log.topics[1]);
        let to = Address::from(log.topics[2]);
        let raw_amount = U256::from_big_endian(log.data.as_ref());
        let amount = scale_down(raw_amount, query.token_decimals);
        let block_number = log
            .block_number
            .ok_or_else(|| "transfer log without block number".to_string())?
            .as_u64();
        let transaction_hash = log
            .transaction_hash
            .ok_or_else(|| "transfer log without transaction hash".to_string())?;
        let log_index = log.log_index.unwrap_or_default().as_u64();

        let mut push = |owner: Address, signed_amount| {
            legs.push(Erc20Transfer {
                chain: chain.to_string(),
                token_address: query.token_address,
                token_decimals: query.token_decimals,
                owner_address: owner,
                block_number,
                transaction_hash,
                amount_transferred: signed_amount,
                log_index,
            });
        };

        match query.track_address {
            // position = balance of the token itself: sender down, receiver up
            None => {
                push(from, -amount);
                push(to, amount);
            }
            // position = stake in the tracked contract: deposits up,
            // withdrawals down, attributed to the counterparty
            Some(tracked) => {
                if to == tracked {
                    push(from, amount);
                } else if from == tracked {
                    push(to, -amount);
                }
            }
        }
    }

    Ok(merge_same_block_legs(query, legs))
}

/// Net out every `(token, owner, block)` group into a single record; the
/// transaction hash comes from the leg with the highest log index.
fn merge_same_block_legs(query: &TransferQuery, legs: Vec<Erc20Transfer>) -> Vec<Erc20Transfer> {
    let mut merged: HashMap<(Address, u64), Erc20Transfer> = HashMap::new();
    for leg in legs {
        if leg.owner_address == Address::zero() || Some(leg.owner_address) == query.track_address {
            continue;
        }
        match merged.entry((leg.owner_address, leg.block_number)) {
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(leg);
            }
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                existing.amount_transferred += leg.amount_transferred;
                if leg.log_index > existing.log_index {
                    existing.transaction_hash = leg.transaction_hash;
                    existing.log_index = leg.log_index;
                }
            }
        }
    }
    let mut out: Vec<Erc20Transfer> = merged.into_values().collect();
    out.sort_by_key(|t| (t.block_number, t.owner_address));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Bytes, U64};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn addr(n: u8) -> Address {
        Address::from([n; 20])
    }

    fn transfer_log(from: Address, to: Address, value: u64, block: u64, log_index: u64) -> Log {
        let mut data = [0u8; 32];
        U256::from(value).to_big_endian(&mut data);
        Log {
            address: addr(0xEE),
            topics: vec![*TRANSFER_TOPIC, H256::from(from), H256::from(to)],
            data: Bytes::from(data.to_vec()),
            block_number: Some(U64::from(block)),
            transaction_hash: Some(H256::from_low_u64_be(block * 1_000 + log_index)),
            log_index: Some(U256::from(log_index)),
            ..Default::default()
        }
    }

    fn query(track: Option<Address>) -> TransferQuery {
        TransferQuery {
            token_address: addr(0xEE),
            token_decimals: 6,
            track_address: track,
            range: Range::new(100, 200),
        }
    }

    #[test]
    fn untracked_transfers_emit_signed_legs_for_both_owners() {
        let logs = vec![transfer_log(addr(1), addr(2), 1_500_000, 120, 3)];
        let transfers = decode_transfer_logs("bsc", &query(None), logs).unwrap();

        assert_eq!(transfers.len(), 2);
        let by_owner: HashMap<Address, Decimal> = transfers
            .iter()
            .map(|t| (t.owner_address, t.amount_transferred))
            .collect();
        assert_eq!(by_owner[&addr(1)], Decimal::from_str("-1.5").unwrap());
        assert_eq!(by_owner[&addr(2)], Decimal::from_str("1.5").unwrap());
    }

    #[test]
    fn same_block_in_and_out_merge_into_one_net_record() {
        // owner 1 sends 100 then receives 30 in the same block
        let logs = vec![
            transfer_log(addr(1), addr(2), 100_000_000, 120, 3),
            transfer_log(addr(2), addr(1), 30_000_000, 120, 7),
        ];
        let transfers = decode_transfer_logs("bsc", &query(None), logs).unwrap();

        let owner1: Vec<&Erc20Transfer> = transfers
            .iter()
            .filter(|t| t.owner_address == addr(1))
            .collect();
        assert_eq!(owner1.len(), 1);
        assert_eq!(owner1[0].amount_transferred, Decimal::from(-70));
        // hash comes from the higher log index
        assert_eq!(owner1[0].transaction_hash, H256::from_low_u64_be(120_007));
    }

    #[test]
    fn tracked_transfers_attribute_the_counterparty() {
        let tracked = addr(0xAA);
        let logs = vec![
            transfer_log(addr(1), tracked, 5_000_000, 130, 1), // deposit
            transfer_log(tracked, addr(2), 2_000_000, 131, 2), // withdrawal
        ];
        let transfers = decode_transfer_logs("bsc", &query(Some(tracked)), logs).unwrap();

        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers[0].owner_address, addr(1));
        assert_eq!(transfers[0].amount_transferred, Decimal::from(5));
        assert_eq!(transfers[1].owner_address, addr(2));
        assert_eq!(transfers[1].amount_transferred, Decimal::from(-2));
    }

    #[test]
    fn zero_address_and_tracked_contract_are_not_investors() {
        let logs = vec![transfer_log(Address::zero(), addr(2), 1_000_000, 140, 1)];
        let transfers = decode_transfer_logs("bsc", &query(None), logs).unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].owner_address, addr(2));
    }
}
