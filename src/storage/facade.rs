//! Typed queries and batched upserts over the importer schema.
//!
//! All writes are idempotent: value rows conflict on their natural primary
//! key and merge jsonb payloads with the `jsonb_merge` database function,
//! overwriting numeric fields.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use ethers::types::Address;
use moka::future::Cache;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::errors::StorageError;
use crate::storage::pool_error;
use crate::types::{Investment, PriceFeed, PriceFeedData, PricePoint, Product};

/// The persistence facade the loaders write through.
#[derive(Clone)]
pub struct Store {
    pool: Arc<Pool>,
    // investor addresses are hot: one cache entry per address seen this run
    investor_ids: Cache<String, i32>,
}

impl Store {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self {
            pool,
            investor_ids: Cache::builder()
                .max_capacity(500_000)
                .time_to_live(Duration::from_secs(24 * 3_600))
                .build(),
        }
    }

    pub fn pool(&self) -> Arc<Pool> {
        self.pool.clone()
    }

    /// All products of a chain, most recent first.
    pub async fn product_list(&self, chain: &str) -> Result<Vec<Product>, StorageError> {
        let conn = self.pool.get().await.map_err(pool_error)?;
        let rows = conn
            .query(
                "SELECT product_id, product_key, chain, price_feed_id, product_data
                 FROM product
                 WHERE chain = $1
                 ORDER BY product_id DESC",
                &[&chain],
            )
            .await?;

        rows.into_iter()
            .map(|row| {
                let product_data: serde_json::Value = row.get(4);
                Ok(Product {
                    product_id: row.get(0),
                    product_key: row.get(1),
                    chain: row.get(2),
                    price_feed_id: row.get(3),
                    product_data: serde_json::from_value(product_data)?,
                })
            })
            .collect()
    }

    /// Price feeds flagged active, the only ones the oracle pipeline imports.
    pub async fn price_feed_list_active(&self) -> Result<Vec<PriceFeed>, StorageError> {
        let conn = self.pool.get().await.map_err(pool_error)?;
        let rows = conn
            .query(
                "SELECT price_feed_id, feed_key, from_asset_key, to_asset_key, price_feed_data
                 FROM price_feed
                 WHERE (price_feed_data->>'active')::boolean IS TRUE
                 ORDER BY price_feed_id",
                &[],
            )
            .await?;

        rows.into_iter()
            .map(|row| {
                let price_feed_data: serde_json::Value = row.get(4);
                Ok(PriceFeed {
                    price_feed_id: row.get(0),
                    feed_key: row.get(1),
                    from_asset_key: row.get(2),
                    to_asset_key: row.get(3),
                    price_feed_data: serde_json::from_value::<PriceFeedData>(price_feed_data)?,
                })
            })
            .collect()
    }

    /// Resolve (or create) the serial id of an investor address.
    ///
    /// Addresses are stored lowercase; the id is cached for the lifetime of
    /// the process.
    pub async fn ensure_investor(&self, address: Address) -> Result<i32, StorageError> {
        let key = format!("{:#x}", address);
        if let Some(id) = self.investor_ids.get(&key).await {
            return Ok(id);
        }

        let conn = self.pool.get().await.map_err(pool_error)?;
        let row = conn
            .query_one(
                "INSERT INTO investor (address)
                 VALUES ($1)
                 ON CONFLICT (address) DO UPDATE SET address = EXCLUDED.address
                 RETURNING investor_id",
                &[&key],
            )
            .await?;
        let id: i32 = row.get(0);
        self.investor_ids.insert(key, id).await;
        Ok(id)
    }

    /// Bulk upsert of price points. Conflicts overwrite the price and merge
    /// the jsonb payload.
    pub async fn insert_price_points(
        &self,
        points: &[PricePoint],
        debug_data_uuids: &[Uuid],
    ) -> Result<(), StorageError> {
        if points.is_empty() {
            return Ok(());
        }
        debug_assert_eq!(points.len(), debug_data_uuids.len());

        let mut price_feed_ids = Vec::with_capacity(points.len());
        let mut block_numbers = Vec::with_capacity(points.len());
        let mut datetimes = Vec::with_capacity(points.len());
        let mut prices = Vec::with_capacity(points.len());
        for p in points {
            price_feed_ids.push(p.price_feed_id);
            block_numbers.push(p.block_number as i64);
            datetimes.push(p.datetime);
            prices.push(p.price);
        }

        let conn = self.pool.get().await.map_err(pool_error)?;
        let inserted = conn
            .execute(
                "INSERT INTO price_ts (price_feed_id, block_number, datetime, price, debug_data_uuid)
                 SELECT * FROM UNNEST($1::int[], $2::bigint[], $3::timestamptz[], $4::numeric[], $5::uuid[])
                 ON CONFLICT (price_feed_id, block_number, datetime)
                 DO UPDATE SET price = EXCLUDED.price, debug_data_uuid = EXCLUDED.debug_data_uuid",
                &[&price_feed_ids, &block_numbers, &datetimes, &prices, &debug_data_uuids],
            )
            .await?;
        trace!(rows = inserted, "Upserted price points");
        Ok(())
    }

    /// Bulk upsert of investment snapshots.
    pub async fn insert_investments(&self, rows: &[Investment]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut investor_ids = Vec::with_capacity(rows.len());
        let mut product_ids = Vec::with_capacity(rows.len());
        let mut datetimes = Vec::with_capacity(rows.len());
        let mut balances = Vec::with_capacity(rows.len());
        let mut payloads = Vec::with_capacity(rows.len());
        for r in rows {
            investor_ids.push(r.investor_id);
            product_ids.push(r.product_id);
            datetimes.push(r.datetime);
            balances.push(r.balance);
            payloads.push(r.investment_data.clone());
        }

        let conn = self.pool.get().await.map_err(pool_error)?;
        let inserted = conn
            .execute(
                "INSERT INTO investment_ts (investor_id, product_id, datetime, balance, investment_data)
                 SELECT * FROM UNNEST($1::int[], $2::int[], $3::timestamptz[], $4::numeric[], $5::jsonb[])
                 ON CONFLICT (investor_id, product_id, datetime)
                 DO UPDATE SET
                   balance = EXCLUDED.balance,
                   investment_data = jsonb_merge(investment_ts.investment_data, EXCLUDED.investment_data)",
                &[&investor_ids, &product_ids, &datetimes, &balances, &payloads],
            )
            .await?;
        debug!(rows = inserted, "Upserted investments");
        Ok(())
    }

    /// Store a raw payload for post-mortem debugging, keyed by UUID.
    pub async fn insert_debug_data(
        &self,
        uuid: Uuid,
        datetime: DateTime<Utc>,
        origin_table: &str,
        debug_data: &serde_json::Value,
    ) -> Result<(), StorageError> {
        let conn = self.pool.get().await.map_err(pool_error)?;
        conn.execute(
            "INSERT INTO debug_data_ts (debug_data_uuid, datetime, origin_table, debug_data)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (debug_data_uuid) DO NOTHING",
            &[&uuid, &datetime, &origin_table, debug_data],
        )
        .await?;
        Ok(())
    }
}
