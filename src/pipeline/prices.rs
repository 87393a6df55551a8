//! Oracle price import: off-chain price time series per active feed.
//!
//! Chain-independent: one global recurring pipeline over every active price
//! feed, planned with date ranges instead of block ranges.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{Config, OracleConfig, StreamConfig};
use crate::errors::ImporterError;
use crate::fetchers::PriceApiClient;
use crate::import_state::{
    oracle_price_import_key, ImportData, ImportRanges, ImportState, ImportStateStore,
    OraclePriceImport, RangeUpdate,
};
use crate::planner::{historical_date_ranges, MAX_RANGES_PER_PRODUCT_TO_GENERATE};
use crate::ranges::Range;
use crate::storage::Store;
use crate::stream::{catch_error, collect, source, ErrorEmitter};
use crate::types::{PriceFeed, PricePoint};

/// Shared state of the oracle price pipeline.
pub struct OracleContext {
    pub store: Store,
    pub import_states: ImportStateStore,
    pub api: Arc<PriceApiClient>,
    pub oracle_cfg: OracleConfig,
    pub stream_cfg: StreamConfig,
}

impl OracleContext {
    pub fn new(config: &Config, store: Store) -> Result<Self, ImporterError> {
        let api = PriceApiClient::new(config.oracle.data_api_base_url.clone())
            .map_err(ImporterError::Loader)?;
        Ok(Self {
            import_states: ImportStateStore::new(store.pool()),
            store,
            api: Arc::new(api),
            oracle_cfg: config.oracle.clone(),
            stream_cfg: config.stream.clone(),
        })
    }
}

/// Feeds with no recorded history start at the protocol launch.
fn oracle_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

#[derive(Debug, Clone)]
pub struct FeedRange {
    pub feed: Arc<PriceFeed>,
    pub import_key: String,
    pub range: Range<DateTime<Utc>>,
}

/// One oracle import tick over every active feed.
pub async fn import_oracle_prices(ctx: &Arc<OracleContext>) -> Result<(), ImporterError> {
    let feeds = ctx.store.price_feed_list_active().await?;
    if feeds.is_empty() {
        return Ok(());
    }
    let now = Utc::now();

    let mut items = Vec::new();
    for feed in feeds {
        let state = ensure_oracle_state(ctx, &feed).await?;
        let ranges = historical_date_ranges(
            &state.ranges,
            state.first_date,
            now,
            ctx.oracle_cfg.price_max_query_range_ms,
            MAX_RANGES_PER_PRODUCT_TO_GENERATE,
        );
        let import_key = oracle_price_import_key(feed.price_feed_id);
        let feed = Arc::new(feed);
        for range in ranges {
            items.push(FeedRange {
                feed: feed.clone(),
                import_key: import_key.clone(),
                range,
            });
        }
    }
    if items.is_empty() {
        return Ok(());
    }
    debug!(ranges = items.len(), "Processing oracle price ranges");

    let (errors, mut error_rx) = ErrorEmitter::new();
    let tick_ctx = ctx.clone();
    let fetched = catch_error(
        source(items),
        ctx.stream_cfg.work_concurrency,
        errors,
        move |item: FeedRange| {
            let ctx = tick_ctx.clone();
            async move {
                let points = fetch_and_store_prices(&ctx, &item)
                    .await
                    .map_err(|e| format!("price range of feed {}: {}", item.feed.feed_key, e))?;
                debug!(
                    feed = %item.feed.feed_key,
                    points,
                    "Imported oracle price range"
                );
                Ok::<_, String>(item)
            }
        },
    );

    let mut outcomes: Vec<(FeedRange, bool)> = collect(fetched)
        .await
        .into_iter()
        .map(|item| (item, true))
        .collect();
    while let Ok(item) = error_rx.try_recv() {
        outcomes.push((item, false));
    }

    ctx.import_states
        .update(
            &outcomes,
            |(item, _)| item.import_key.clone(),
            |items, current| match current {
                ImportData::OraclePrice(mut data) => {
                    let mut update = RangeUpdate::new();
                    for (item, success) in items {
                        update.record(item.range, *success);
                    }
                    data.ranges = data.ranges.apply(&update, Utc::now());
                    ImportData::OraclePrice(data)
                }
                other => {
                    warn!("Unexpected import payload during oracle price update");
                    other
                }
            },
        )
        .await?;
    Ok(())
}

async fn ensure_oracle_state(
    ctx: &OracleContext,
    feed: &PriceFeed,
) -> Result<OraclePriceImport, ImporterError> {
    let key = oracle_price_import_key(feed.price_feed_id);
    if let Some(state) = ctx.import_states.fetch(&[key.clone()]).await?.remove(&key) {
        match state.import_data {
            ImportData::OraclePrice(data) => return Ok(data),
            other => {
                return Err(ImporterError::Pipeline(format!(
                    "import key {} holds unexpected payload {:?}",
                    key, other
                )))
            }
        }
    }

    let data = OraclePriceImport {
        price_feed_id: feed.price_feed_id,
        first_date: oracle_epoch(),
        ranges: ImportRanges::empty(Utc::now()),
    };
    ctx.import_states
        .upsert(&ImportState {
            import_key: key,
            import_data: ImportData::OraclePrice(data.clone()),
        })
        .await?;
    Ok(data)
}

async fn fetch_and_store_prices(
    ctx: &OracleContext,
    item: &FeedRange,
) -> Result<usize, ImporterError> {
    let samples = ctx
        .api
        .fetch_price_range(&item.feed.feed_key, &item.range)
        .await
        .map_err(ImporterError::Loader)?;
    if samples.is_empty() {
        return Ok(0);
    }

    let debug_uuid = Uuid::new_v4();
    ctx.store
        .insert_debug_data(
            debug_uuid,
            item.range.to,
            "price_ts",
            &json!({
                "kind": "oracle_price",
                "feed_key": item.feed.feed_key,
                "from": item.range.from,
                "to": item.range.to,
                "samples": samples.len(),
            }),
        )
        .await?;

    let points: Vec<PricePoint> = samples
        .iter()
        .map(|s| PricePoint {
            datetime: s.datetime,
            price_feed_id: item.feed.price_feed_id,
            // oracle prices have no on-chain anchor
            block_number: 0,
            price: s.price,
            price_data: json!({ "from": "data-api" }),
        })
        .collect();
    let uuids = vec![debug_uuid; points.len()];
    ctx.store.insert_price_points(&points, &uuids).await?;
    Ok(points.len())
}
