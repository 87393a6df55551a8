//! Investor position import: transfers, block times, post-hoc balances.
//!
//! Historical ticks catch up from contract creation; recent ticks tail the
//! head. Both share the same downstream: fetch transfers per planned range,
//! resolve block timestamps, read each investor's balance at the transfer
//! block, upsert the investment rows, and fold per-range outcomes back into
//! the import state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use crate::errors::ImporterError;
use crate::fetchers::{fetch_erc20_transfers, fetch_owner_balances, BalanceQuery, TransferQuery};
use crate::import_state::{ImportData, RangeUpdate};
use crate::planner::{
    historical_block_ranges, latest_block_query, MAX_RANGES_PER_PRODUCT_TO_GENERATE,
};
use crate::ranges::Range;
use crate::stream::{batch_rpc, catch_error, collect, source, BatchRpcOptions, ErrorEmitter};
use crate::types::{Erc20Transfer, Investment, Product};

use super::ChainContext;

/// One planned unit of work: a block range of one product.
#[derive(Debug, Clone)]
pub struct ProductRange {
    pub product: Arc<Product>,
    pub import_key: String,
    pub range: Range<u64>,
}

/// One historical catch-up tick for every product of the chain.
pub async fn import_investments_historical(ctx: &Arc<ChainContext>) -> Result<(), ImporterError> {
    let products = ctx.store.product_list(ctx.chain()).await?;
    if products.is_empty() {
        return Ok(());
    }
    let head = ctx
        .latest_blocks
        .fetch(&ctx.rpc, ctx.stream_cfg.max_total_retry_ms, None)
        .await?;

    let mut items = Vec::new();
    for product in products {
        let state = match ctx.ensure_investment_state(&product, head).await {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    chain = %ctx.chain(),
                    product = %product.product_key,
                    error = %e,
                    "Skipping product this tick"
                );
                continue;
            }
        };
        let ranges = historical_block_ranges(
            &state.ranges,
            state.contract_created_at_block,
            head,
            ctx.planner_cfg(),
            MAX_RANGES_PER_PRODUCT_TO_GENERATE,
        );
        push_product_ranges(&mut items, product, ranges);
    }

    run_investment_tick(ctx, items, head).await
}

/// One recent-tail tick: a single head-adjacent range per product.
pub async fn import_investments_recent(
    ctx: &Arc<ChainContext>,
    force_head: Option<u64>,
) -> Result<(), ImporterError> {
    let products = ctx.store.product_list(ctx.chain()).await?;
    if products.is_empty() {
        return Ok(());
    }
    let head = ctx
        .latest_blocks
        .fetch(&ctx.rpc, ctx.stream_cfg.max_total_retry_ms, force_head)
        .await?;

    let mut items = Vec::new();
    for product in products {
        let state = match ctx.ensure_investment_state(&product, head).await {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    chain = %ctx.chain(),
                    product = %product.product_key,
                    error = %e,
                    "Skipping product this tick"
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
        push_product_ranges(&mut items, product, query.into_iter().collect());
    }

    run_investment_tick(ctx, items, head).await
}

fn push_product_ranges(items: &mut Vec<ProductRange>, product: Product, ranges: Vec<Range<u64>>) {
    let import_key =
        crate::import_state::product_investment_import_key(product.product_id);
    let product = Arc::new(product);
    for range in ranges {
        items.push(ProductRange {
            product: product.clone(),
            import_key: import_key.clone(),
            range,
        });
    }
}

async fn run_investment_tick(
    ctx: &Arc<ChainContext>,
    items: Vec<ProductRange>,
    head: u64,
) -> Result<(), ImporterError> {
    if items.is_empty() {
        return Ok(());
    }
    debug!(chain = %ctx.chain(), ranges = items.len(), "Processing investment ranges");

    let outcomes = process_investment_ranges(ctx, items).await;
    apply_investment_outcomes(ctx, outcomes, head).await
}

/// Run the range items through transfer fetch and ingestion, producing a
/// per-range success flag. Every input item comes back exactly once.
async fn process_investment_ranges(
    ctx: &Arc<ChainContext>,
    items: Vec<ProductRange>,
) -> Vec<(ProductRange, bool)> {
    let (fetch_errors, mut fetch_error_rx) = ErrorEmitter::new();
    let (ingest_errors, mut ingest_error_rx) = ErrorEmitter::new();
    let chain = ctx.chain().to_string();

    let transfers = batch_rpc(
        source(items),
        ctx.rpc.clone(),
        BatchRpcOptions {
            label: "eth_getLogs",
            // tracked products fan one range into two filters
            rpc_calls_per_input: HashMap::from([("eth_getLogs".to_string(), 2)]),
            max_input_wait: std::time::Duration::from_millis(ctx.stream_cfg.max_input_wait_ms),
            max_input_take: ctx.stream_cfg.max_input_take,
            work_concurrency: ctx.stream_cfg.work_concurrency,
            max_total_retry_ms: ctx.stream_cfg.max_total_retry_ms,
        },
        fetch_errors,
        |item: &ProductRange| TransferQuery {
            token_address: item.product.transfer_token_address(),
            token_decimals: item.product.token_decimals(),
            track_address: item.product.transfer_track_address(),
            range: item.range,
        },
        move |provider, queries| fetch_erc20_transfers(provider, chain.clone(), queries),
    );

    let tick_ctx = ctx.clone();
    let ingested = catch_error(
        transfers,
        ctx.stream_cfg.work_concurrency,
        ingest_errors,
        move |(item, transfers): (ProductRange, Vec<Erc20Transfer>)| {
            let ctx = tick_ctx.clone();
            async move {
                let rows = ingest_transfers(&ctx, &item, transfers).await.map_err(|e| {
                    format!(
                        "investment range [{}, {}] of {}: {}",
                        item.range.from, item.range.to, item.product.product_key, e
                    )
                })?;
                debug!(
                    chain = %ctx.chain(),
                    product = %item.product.product_key,
                    from = item.range.from,
                    to = item.range.to,
                    rows,
                    "Imported investment range"
                );
                Ok::<_, String>(item)
            }
        },
    );

    let mut outcomes: Vec<(ProductRange, bool)> = collect(ingested)
        .await
        .into_iter()
        .map(|item| (item, true))
        .collect();
    while let Ok(item) = fetch_error_rx.try_recv() {
        outcomes.push((item, false));
    }
    while let Ok((item, _)) = ingest_error_rx.try_recv() {
        outcomes.push((item, false));
    }
    outcomes
}

/// Join one range's transfers with block times and balances, then upsert.
async fn ingest_transfers(
    ctx: &ChainContext,
    item: &ProductRange,
    transfers: Vec<Erc20Transfer>,
) -> Result<usize, ImporterError> {
    if transfers.is_empty() {
        return Ok(0);
    }
    let retry_ms = ctx.stream_cfg.max_total_retry_ms;

    let mut blocks: Vec<u64> = transfers.iter().map(|t| t.block_number).collect();
    blocks.sort_unstable();
    blocks.dedup();
    let block_times = ctx.block_times.fetch_many(&ctx.rpc, &blocks, retry_ms).await?;

    let balance_queries: Vec<BalanceQuery> = transfers
        .iter()
        .map(|t| BalanceQuery {
            contract_address: item.product.balance_contract_address(),
            decimals: item.product.token_decimals(),
            owner_address: t.owner_address,
            block_number: t.block_number,
        })
        .collect();
    let provider = ctx.rpc.provider(true);
    let balances = ctx
        .rpc
        .gate
        .call("eth_call", retry_ms, || {
            fetch_owner_balances(provider.clone(), balance_queries.clone())
        })
        .await?;

    let mut rows = Vec::with_capacity(transfers.len());
    for (transfer, query) in transfers.iter().zip(&balance_queries) {
        let investor_id = ctx.store.ensure_investor(transfer.owner_address).await?;
        let datetime = *block_times.get(&transfer.block_number).ok_or_else(|| {
            ImporterError::Pipeline(format!(
                "no timestamp for block {}",
                transfer.block_number
            ))
        })?;
        let balance = *balances.get(query).ok_or_else(|| {
            ImporterError::Pipeline(format!(
                "no balance for owner {:#x} at block {}",
                transfer.owner_address, transfer.block_number
            ))
        })?;
        rows.push(Investment {
            datetime,
            product_id: item.product.product_id,
            investor_id,
            balance,
            investment_data: json!({
                "balance": balance,
                "balance_diff": transfer.amount_transferred,
                "trx_hash": format!("{:#x}", transfer.transaction_hash),
                "block_number": transfer.block_number,
            }),
        });
    }
    ctx.store.insert_investments(&rows).await?;
    Ok(rows.len())
}

/// Fold the tick's outcomes into the import states, one row lock per key.
async fn apply_investment_outcomes(
    ctx: &Arc<ChainContext>,
    outcomes: Vec<(ProductRange, bool)>,
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
                ImportData::ProductInvestment(mut data) => {
                    let mut update = RangeUpdate::new();
                    for (item, success) in items {
                        update.record(item.range, *success);
                    }
                    data.ranges = data.ranges.apply(&update, Utc::now());
                    data.chain_latest_block_number = data.chain_latest_block_number.max(head);
                    ImportData::ProductInvestment(data)
                }
                other => {
                    warn!("Unexpected import payload during investment update");
                    other
                }
            },
        )
        .await?;
    Ok(())
}
