//! Durable import progress, one record per import key.
//!
//! The record tracks which ranges are fully imported, which failed and are
//! queued for retry, and auxiliary cursors (contract creation, last seen
//! chain head). Range evolution happens exclusively through
//! [`ImportStateStore::update`], under a row lock, so concurrent pipelines
//! touching the same key serialize and ranges never regress.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::StorageError;
use crate::ranges::{range_exclude, range_merge, Range, RangePoint};
use crate::storage::pool_error;

pub fn product_investment_import_key(product_id: i32) -> String {
    format!("product:investment:{}", product_id)
}

pub fn product_share_rate_import_key(product_id: i32) -> String {
    format!("product:share-rate:{}", product_id)
}

pub fn oracle_price_import_key(price_feed_id: i32) -> String {
    format!("oracle:price:{}", price_feed_id)
}

/// Which ranges of an import key are done, and which failed and wait behind
/// new work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportRanges<T> {
    pub covered_ranges: Vec<Range<T>>,
    pub to_retry: Vec<Range<T>>,
    pub last_import_date: DateTime<Utc>,
}

impl<T: RangePoint> ImportRanges<T> {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            covered_ranges: Vec::new(),
            to_retry: Vec::new(),
            last_import_date: now,
        }
    }

    /// Fold one tick's results in:
    /// `covered' = merge(covered ∪ covered_update)`,
    /// `to_retry' = merge((to_retry ∪ errors) \ successes)`.
    pub fn apply(&self, update: &RangeUpdate<T>, now: DateTime<Utc>) -> Self {
        let mut covered = self.covered_ranges.clone();
        covered.extend_from_slice(&update.covered);

        let mut retry = self.to_retry.clone();
        retry.extend_from_slice(&update.errors);

        Self {
            covered_ranges: range_merge(&covered),
            to_retry: range_merge(&range_exclude(&retry, &update.successes)),
            last_import_date: now,
        }
    }

    /// Highest covered point, if any. The recent pipeline tails from here.
    pub fn last_covered(&self) -> Option<T> {
        self.covered_ranges.last().map(|r| r.to)
    }
}

/// One tick's worth of range outcomes.
#[derive(Debug, Clone, Default)]
pub struct RangeUpdate<T> {
    pub covered: Vec<Range<T>>,
    pub successes: Vec<Range<T>>,
    pub errors: Vec<Range<T>>,
}

impl<T: RangePoint> RangeUpdate<T> {
    pub fn new() -> Self {
        Self {
            covered: Vec::new(),
            successes: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn record(&mut self, range: Range<T>, success: bool) {
        if success {
            self.covered.push(range);
            self.successes.push(range);
        } else {
            self.errors.push(range);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.covered.is_empty() && self.successes.is_empty() && self.errors.is_empty()
    }
}

/// The polymorphic import-state payload, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ImportData {
    #[serde(rename = "product:investment")]
    ProductInvestment(ProductInvestmentImport),
    #[serde(rename = "product:share-rate")]
    ProductShareRate(ProductShareRateImport),
    #[serde(rename = "oracle:price")]
    OraclePrice(OraclePriceImport),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductInvestmentImport {
    pub product_id: i32,
    pub chain: String,
    pub contract_created_at_block: u64,
    pub contract_creation_date: DateTime<Utc>,
    pub chain_latest_block_number: u64,
    pub ranges: ImportRanges<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductShareRateImport {
    pub price_feed_id: i32,
    pub product_id: i32,
    pub chain: String,
    pub contract_created_at_block: u64,
    pub contract_creation_date: DateTime<Utc>,
    pub chain_latest_block_number: u64,
    pub ranges: ImportRanges<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OraclePriceImport {
    pub price_feed_id: i32,
    pub first_date: DateTime<Utc>,
    pub ranges: ImportRanges<DateTime<Utc>>,
}

/// A durable import-state record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportState {
    pub import_key: String,
    pub import_data: ImportData,
}

/// Storage operations over `import_state`. `update` is the only entry point
/// allowed to evolve ranges.
#[derive(Clone)]
pub struct ImportStateStore {
    pool: Arc<Pool>,
}

const UPDATE_MAX_ATTEMPTS: u32 = 10;
const UPDATE_BACKOFF_BASE_MS: u64 = 500;
const UPDATE_BACKOFF_CAP_MS: u64 = 1_000;

impl ImportStateStore {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }

    /// Batched read; missing keys are simply absent from the result map.
    pub async fn fetch(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, ImportState>, StorageError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.pool.get().await.map_err(pool_error)?;
        let rows = conn
            .query(
                "SELECT import_key, import_data FROM import_state WHERE import_key = ANY($1)",
                &[&keys],
            )
            .await?;

        let mut result = HashMap::with_capacity(rows.len());
        for row in rows {
            let import_key: String = row.get(0);
            let payload: serde_json::Value = row.get(1);
            let import_data = serde_json::from_value(payload).map_err(|source| {
                StorageError::MalformedState {
                    key: import_key.clone(),
                    source,
                }
            })?;
            result.insert(
                import_key.clone(),
                ImportState {
                    import_key,
                    import_data,
                },
            );
        }
        Ok(result)
    }

    /// Insert-or-merge. The jsonb payloads deep-merge at the storage layer;
    /// ranges lists replace wholesale since they arrive fully re-computed.
    pub async fn upsert(&self, state: &ImportState) -> Result<(), StorageError> {
        let payload = serde_json::to_value(&state.import_data)?;
        let conn = self.pool.get().await.map_err(pool_error)?;
        conn.execute(
            "INSERT INTO import_state (import_key, import_data)
             VALUES ($1, $2)
             ON CONFLICT (import_key)
             DO UPDATE SET import_data = jsonb_merge(import_state.import_data, EXCLUDED.import_data)",
            &[&state.import_key, &payload],
        )
        .await?;
        Ok(())
    }

    /// Apply `merge_fn` to every referenced state inside one transaction,
    /// locking the rows in lexicographic key order.
    ///
    /// A batch of items may target multiple import keys; items are grouped by
    /// key before `merge_fn` sees them. Transient connection timeouts retry
    /// with jittered backoff; after exhaustion the error surfaces and no
    /// state changes.
    pub async fn update<I, KF, MF>(
        &self,
        items: &[I],
        key_fn: KF,
        merge_fn: MF,
    ) -> Result<(), StorageError>
    where
        KF: Fn(&I) -> String,
        MF: Fn(&[&I], ImportData) -> ImportData,
    {
        if items.is_empty() {
            return Ok(());
        }

        let mut by_key: HashMap<String, Vec<&I>> = HashMap::new();
        for item in items {
            by_key.entry(key_fn(item)).or_default().push(item);
        }
        // Lock order must be stable across concurrent updaters
        let mut keys: Vec<String> = by_key.keys().cloned().collect();
        keys.sort();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.update_tx(&keys, &by_key, &merge_fn).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_connection_timeout() && attempt < UPDATE_MAX_ATTEMPTS => {
                    let backoff = UPDATE_BACKOFF_BASE_MS
                        .saturating_mul(2u64.saturating_pow(attempt - 1))
                        .min(UPDATE_BACKOFF_CAP_MS);
                    let jitter = rand::thread_rng().gen_range(0..=backoff / 4);
                    warn!(
                        attempt,
                        backoff_ms = backoff + jitter,
                        error = %e,
                        "Import state update hit a connection timeout, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn update_tx<I, MF>(
        &self,
        keys: &[String],
        by_key: &HashMap<String, Vec<&I>>,
        merge_fn: &MF,
    ) -> Result<(), StorageError>
    where
        MF: Fn(&[&I], ImportData) -> ImportData,
    {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let tx = conn.transaction().await?;
        tx.batch_execute("SET LOCAL statement_timeout = 2000").await?;

        let rows = tx
            .query(
                "SELECT import_key, import_data FROM import_state
                 WHERE import_key = ANY($1)
                 ORDER BY import_key
                 FOR UPDATE",
                &[&keys],
            )
            .await?;

        for row in rows {
            let import_key: String = row.get(0);
            let payload: serde_json::Value = row.get(1);
            let current = serde_json::from_value(payload).map_err(|source| {
                StorageError::MalformedState {
                    key: import_key.clone(),
                    source,
                }
            })?;

            let items = match by_key.get(&import_key) {
                Some(items) => items,
                None => continue,
            };
            let next = merge_fn(items, current);
            let next_payload = serde_json::to_value(&next)?;
            tx.execute(
                "UPDATE import_state SET import_data = $2 WHERE import_key = $1",
                &[&import_key, &next_payload],
            )
            .await?;
        }

        tx.commit().await?;
        debug!(keys = keys.len(), "Import state batch updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges::range_list_contains;
    use chrono::TimeZone;

    fn r(from: u64, to: u64) -> Range<u64> {
        Range::new(from, to)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn apply_merges_covered_and_clears_successful_retries() {
        let ranges = ImportRanges {
            covered_ranges: vec![r(100, 200)],
            to_retry: vec![r(150, 160), r(300, 310)],
            last_import_date: now(),
        };
        let update = RangeUpdate {
            covered: vec![r(201, 250)],
            successes: vec![r(150, 160)],
            errors: vec![r(251, 260)],
        };
        let next = ranges.apply(&update, now());

        assert_eq!(next.covered_ranges, vec![r(100, 250)]);
        assert_eq!(next.to_retry, vec![r(251, 260), r(300, 310)]);
    }

    #[test]
    fn apply_keeps_covered_and_retry_disjoint() {
        let mut ranges = ImportRanges::empty(now());
        // successive ticks with overlapping outcomes
        let updates = [
            (r(0, 50), true),
            (r(51, 80), false),
            (r(51, 80), true),
            (r(81, 120), false),
        ];
        for (range, success) in updates {
            let mut update = RangeUpdate::new();
            update.record(range, success);
            ranges = ranges.apply(&update, now());
        }

        assert_eq!(ranges.covered_ranges, vec![r(0, 80)]);
        assert_eq!(ranges.to_retry, vec![r(81, 120)]);
        for probe in [0, 50, 51, 80, 81, 120] {
            let in_covered = range_list_contains(&ranges.covered_ranges, probe);
            let in_retry = range_list_contains(&ranges.to_retry, probe);
            assert!(!(in_covered && in_retry), "block {} in both sets", probe);
        }
    }

    #[test]
    fn import_data_serializes_with_expected_tags() {
        let data = ImportData::OraclePrice(OraclePriceImport {
            price_feed_id: 7,
            first_date: now(),
            ranges: ImportRanges::empty(now()),
        });
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["type"], "oracle:price");

        let round: ImportData = serde_json::from_value(json).unwrap();
        assert!(matches!(round, ImportData::OraclePrice(p) if p.price_feed_id == 7));
    }
}
