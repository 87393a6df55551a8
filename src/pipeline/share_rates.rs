//! Share-rate (PPFS) sampling import for standard vaults.
//!
//! Sample blocks come from an interpolated timestep block list restricted to
//! what the investment import has already covered, extrapolated to the
//! current head. Each planned range yields one sample at its upper bound.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::ImporterError;
use crate::fetchers::{fetch_ppfs, PpfsQuery};
use crate::import_state::{
    product_share_rate_import_key, ImportData, RangeUpdate,
};
use crate::planner::{
    interpolate_block_samples, latest_block_query, regular_interval_ranges,
    MAX_RANGES_PER_PRODUCT_TO_GENERATE,
};
use crate::ranges::Range;
use crate::stream::{batch_rpc, catch_error, collect, source, BatchRpcOptions, ErrorEmitter};
use crate::types::{PricePoint, Product};

use super::ChainContext;

/// Sampling granularity of the share-rate series.
const SHARE_RATE_TIME_STEP_MINUTES: i64 = 15;

/// One planned share-rate sample: the range it covers and the query at its
/// upper bound.
#[derive(Debug, Clone)]
pub struct ShareRateRange {
    pub product: Arc<Product>,
    pub import_key: String,
    pub price_feed_id: i32,
    pub range: Range<u64>,
    pub query: PpfsQuery,
}

/// Historical share-rate catch-up for every standard vault of the chain.
pub async fn import_share_rates_historical(ctx: &Arc<ChainContext>) -> Result<(), ImporterError> {
    let products = ctx.store.product_list(ctx.chain()).await?;
    let vaults: Vec<Product> = products.into_iter().filter(|p| p.is_standard_vault()).collect();
    if vaults.is_empty() {
        return Ok(());
    }
    let head = ctx
        .latest_blocks
        .fetch(&ctx.rpc, ctx.stream_cfg.max_total_retry_ms, None)
        .await?;
    let now = Utc::now();

    let mut items = Vec::new();
    for product in vaults {
        let (share_state, parent) = match tokio::try_join!(
            ctx.ensure_share_rate_state(&product, head),
            ctx.ensure_investment_state(&product, head),
        ) {
            Ok(states) => states,
            Err(e) => {
                warn!(
                    chain = %ctx.chain(),
                    product = %product.product_key,
                    error = %e,
                    "Skipping vault this tick"
                );
                continue;
            }
        };

        let samples = interpolate_block_samples(
            share_state.contract_created_at_block,
            share_state.contract_creation_date,
            head,
            now,
            ChronoDuration::minutes(SHARE_RATE_TIME_STEP_MINUTES),
        );
        let ranges = regular_interval_ranges(
            &samples,
            &parent.ranges.covered_ranges,
            &share_state.ranges,
            head,
            ctx.planner_cfg(),
            MAX_RANGES_PER_PRODUCT_TO_GENERATE,
        );
        push_share_rate_ranges(&mut items, product, ranges)?;
    }

    run_share_rate_tick(ctx, items, head).await
}

/// Recent share-rate tick: one head-adjacent sample per vault.
pub async fn import_share_rates_recent(
    ctx: &Arc<ChainContext>,
    force_head: Option<u64>,
) -> Result<(), ImporterError> {
    let products = ctx.store.product_list(ctx.chain()).await?;
    let vaults: Vec<Product> = products.into_iter().filter(|p| p.is_standard_vault()).collect();
    if vaults.is_empty() {
        return Ok(());
    }
    let head = ctx
        .latest_blocks
        .fetch(&ctx.rpc, ctx.stream_cfg.max_total_retry_ms, force_head)
        .await?;

    let mut items = Vec::new();
    for product in vaults {
        let state = match ctx.ensure_share_rate_state(&product, head).await {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    chain = %ctx.chain(),
                    product = %product.product_key,
                    error = %e,
                    "Skipping vault this tick"
                );
                continue;
            }
        };
        let query = latest_block_query(
            state.contract_created_at_block,
            state.ranges.last_covered(),
            head,
            ctx.planner_cfg(),
        );
        push_share_rate_ranges(&mut items, product, query.into_iter().collect())?;
    }

    run_share_rate_tick(ctx, items, head).await
}

fn push_share_rate_ranges(
    items: &mut Vec<ShareRateRange>,
    product: Product,
    ranges: Vec<Range<u64>>,
) -> Result<(), ImporterError> {
    let import_key = product_share_rate_import_key(product.product_id);
    let price_feed_id = product.price_feed_id;
    let product = Arc::new(product);
    for range in ranges {
        // sampling point is the range's upper bound
        let query = PpfsQuery::for_product(&product, range.to)?;
        items.push(ShareRateRange {
            product: product.clone(),
            import_key: import_key.clone(),
            price_feed_id,
            range,
            query,
        });
    }
    Ok(())
}

async fn run_share_rate_tick(
    ctx: &Arc<ChainContext>,
    items: Vec<ShareRateRange>,
    head: u64,
) -> Result<(), ImporterError> {
    if items.is_empty() {
        return Ok(());
    }
    debug!(chain = %ctx.chain(), samples = items.len(), "Processing share-rate ranges");

    let (fetch_errors, mut fetch_error_rx) = ErrorEmitter::new();
    let (store_errors, mut store_error_rx) = ErrorEmitter::new();

    let rates = batch_rpc(
        source(items),
        ctx.rpc.clone(),
        BatchRpcOptions {
            label: "eth_call",
            rpc_calls_per_input: HashMap::from([("eth_call".to_string(), 1)]),
            max_input_wait: std::time::Duration::from_millis(ctx.stream_cfg.max_input_wait_ms),
            max_input_take: ctx.stream_cfg.max_input_take,
            work_concurrency: ctx.stream_cfg.work_concurrency,
            max_total_retry_ms: ctx.stream_cfg.max_total_retry_ms,
        },
        fetch_errors,
        |item: &ShareRateRange| item.query.clone(),
        fetch_ppfs,
    );

    let tick_ctx = ctx.clone();
    let stored = catch_error(
        rates,
        ctx.stream_cfg.work_concurrency,
        store_errors,
        move |(item, rate): (ShareRateRange, Decimal)| {
            let ctx = tick_ctx.clone();
            async move {
                store_share_rate(&ctx, &item, rate).await.map_err(|e| {
                    format!(
                        "share-rate sample of {} at block {}: {}",
                        item.product.product_key, item.query.block_number, e
                    )
                })?;
                Ok::<_, String>(item)
            }
        },
    );

    let mut outcomes: Vec<(ShareRateRange, bool)> = collect(stored)
        .await
        .into_iter()
        .map(|item| (item, true))
        .collect();
    while let Ok(item) = fetch_error_rx.try_recv() {
        outcomes.push((item, false));
    }
    while let Ok((item, _)) = store_error_rx.try_recv() {
        outcomes.push((item, false));
    }

    apply_share_rate_outcomes(ctx, outcomes, head).await
}

async fn store_share_rate(
    ctx: &ChainContext,
    item: &ShareRateRange,
    rate: Decimal,
) -> Result<(), ImporterError> {
    let datetime = ctx
        .block_times
        .fetch(&ctx.rpc, item.query.block_number, ctx.stream_cfg.max_total_retry_ms)
        .await?;

    let debug_uuid = Uuid::new_v4();
    ctx.store
        .insert_debug_data(
            debug_uuid,
            datetime,
            "price_ts",
            &json!({
                "kind": "share_rate",
                "product_key": item.product.product_key,
                "block_number": item.query.block_number,
                "ppfs": rate,
            }),
        )
        .await?;
    ctx.store
        .insert_price_points(
            &[PricePoint {
                datetime,
                price_feed_id: item.price_feed_id,
                block_number: item.query.block_number,
                price: rate,
                price_data: json!({ "from": "ppfs-snapshots" }),
            }],
            &[debug_uuid],
        )
        .await?;
    Ok(())
}

async fn apply_share_rate_outcomes(
    ctx: &Arc<ChainContext>,
    outcomes: Vec<(ShareRateRange, bool)>,
    head: u64,
) -> Result<(), ImporterError> {
    if outcomes.is_empty() {
        return Ok(());
    }
    ctx.import_states
        .update(
            &outcomes,
            |(item, _)| item.import_key.clone(),
            |items, current| match current {
                ImportData::ProductShareRate(mut data) => {
                    let mut update = RangeUpdate::new();
                    for (item, success) in items {
                        update.record(item.range, *success);
                    }
                    data.ranges = data.ranges.apply(&update, Utc::now());
                    data.chain_latest_block_number = data.chain_latest_block_number.max(head);
                    ImportData::ProductShareRate(data)
                }
                other => {
                    warn!("Unexpected import payload during share-rate update");
                    other
                }
            },
        )
        .await?;
    Ok(())
}
