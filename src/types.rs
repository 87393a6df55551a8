//! Core domain records shared across the importer.
//!
//! Products and price feeds mirror their relational rows (serial ids plus a
//! jsonb payload); transfers, price points and investments are the value rows
//! the loaders upsert in bulk.

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A yield-bearing contract tracked by the importer: a vault or a boost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub product_id: i32,
    pub product_key: String,
    pub chain: String,
    pub price_feed_id: i32,
    pub product_data: ProductData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProductData {
    #[serde(rename = "beefy:vault")]
    BeefyVault { vault: BeefyVault },
    #[serde(rename = "beefy:boost")]
    BeefyBoost { boost: BeefyBoost },
}

/// A vault contract. Gov vaults have no share token of their own; investor
/// balances are derived from underlying-token transfers to the contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeefyVault {
    pub id: String,
    pub chain: String,
    pub contract_address: Address,
    pub token_decimals: u8,
    pub want_address: Address,
    pub want_decimals: u8,
    pub is_gov_vault: bool,
    pub eol: bool,
}

/// A staking contract that stakes the share token of a vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeefyBoost {
    pub id: String,
    pub chain: String,
    pub contract_address: Address,
    pub staked_token_address: Address,
    pub staked_token_decimals: u8,
    pub vault_id: String,
    pub eol: bool,
}

impl Product {
    /// The contract whose transfer events define investor positions.
    pub fn contract_address(&self) -> Address {
        match &self.product_data {
            ProductData::BeefyVault { vault } => vault.contract_address,
            ProductData::BeefyBoost { boost } => boost.contract_address,
        }
    }

    /// Decimals of the token whose transfers are imported.
    pub fn token_decimals(&self) -> u8 {
        match &self.product_data {
            ProductData::BeefyVault { vault } => {
                if vault.is_gov_vault {
                    vault.want_decimals
                } else {
                    vault.token_decimals
                }
            }
            ProductData::BeefyBoost { boost } => boost.staked_token_decimals,
        }
    }

    /// Only standard vaults expose `getPricePerFullShare`.
    pub fn is_standard_vault(&self) -> bool {
        matches!(&self.product_data, ProductData::BeefyVault { vault } if !vault.is_gov_vault)
    }

    /// The token whose `Transfer` events are imported. Standard vaults emit
    /// their own share token; gov vaults move the underlying; boosts move
    /// the staked vault share.
    pub fn transfer_token_address(&self) -> Address {
        match &self.product_data {
            ProductData::BeefyVault { vault } => {
                if vault.is_gov_vault {
                    vault.want_address
                } else {
                    vault.contract_address
                }
            }
            ProductData::BeefyBoost { boost } => boost.staked_token_address,
        }
    }

    /// When set, only transfers where this address is sender or receiver
    /// count, attributed to the counterparty.
    pub fn transfer_track_address(&self) -> Option<Address> {
        match &self.product_data {
            ProductData::BeefyVault { vault } => {
                if vault.is_gov_vault {
                    Some(vault.contract_address)
                } else {
                    None
                }
            }
            ProductData::BeefyBoost { boost } => Some(boost.contract_address),
        }
    }

    /// The contract answering `balanceOf(owner)` for this product's
    /// position. Gov vaults and boosts track staked balances themselves.
    pub fn balance_contract_address(&self) -> Address {
        self.contract_address()
    }
}

/// Descriptor of one asset price time series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceFeed {
    pub price_feed_id: i32,
    pub feed_key: String,
    pub from_asset_key: String,
    pub to_asset_key: String,
    pub price_feed_data: PriceFeedData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceFeedData {
    pub active: bool,
}

/// One decoded ERC-20 transfer leg, signed from the owner's perspective:
/// negative when the owner sent, positive when the owner received.
#[derive(Debug, Clone)]
pub struct Erc20Transfer {
    pub chain: String,
    pub token_address: Address,
    pub token_decimals: u8,
    pub owner_address: Address,
    pub block_number: u64,
    pub transaction_hash: H256,
    pub amount_transferred: Decimal,
    pub log_index: u64,
}

/// One point of a price time series.
#[derive(Debug, Clone)]
pub struct PricePoint {
    pub datetime: DateTime<Utc>,
    pub price_feed_id: i32,
    pub block_number: u64,
    pub price: Decimal,
    pub price_data: serde_json::Value,
}

/// One investor balance snapshot.
#[derive(Debug, Clone)]
pub struct Investment {
    pub datetime: DateTime<Utc>,
    pub product_id: i32,
    pub investor_id: i32,
    pub balance: Decimal,
    pub investment_data: serde_json::Value,
}

/// Scale a raw on-chain integer amount down by `10^decimals`.
///
/// Amounts beyond `Decimal` precision saturate rather than panic; the token
/// supply that triggers this is already nonsense upstream.
pub fn scale_down(value: U256, decimals: u8) -> Decimal {
    let mut d = Decimal::from_str(&value.to_string()).unwrap_or(Decimal::MAX);
    let mut remaining = decimals as u32;
    while remaining > 0 {
        let step = remaining.min(28);
        let divisor = Decimal::from_i128_with_scale(10i128.pow(step), 0);
        d /= divisor;
        remaining -= step;
    }
    d.normalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_down_shifts_the_point() {
        assert_eq!(
            scale_down(U256::from(1_234_567u64), 6),
            Decimal::from_str("1.234567").unwrap()
        );
        assert_eq!(scale_down(U256::from(5u64), 0), Decimal::from(5));
    }

    #[test]
    fn scale_down_handles_18_decimals() {
        let one_token = U256::exp10(18);
        assert_eq!(scale_down(one_token, 18), Decimal::from(1));
    }

    #[test]
    fn product_data_round_trips_its_tag() {
        let json = serde_json::json!({
            "type": "beefy:vault",
            "vault": {
                "id": "bifi-maxi",
                "chain": "bsc",
                "contract_address": "0x5b96bbaca98d777cb736dd89a519015315e00d02",
                "token_decimals": 18,
                "want_address": "0xca3f508b8e4dd382ee878a314789373d80a5190a",
                "want_decimals": 18,
                "is_gov_vault": false,
                "eol": false
            }
        });
        let data: ProductData = serde_json::from_value(json).unwrap();
        assert!(matches!(&data, ProductData::BeefyVault { vault } if vault.id == "bifi-maxi"));
    }
}
