// End-to-end planning scenarios: planner output against known import states,
// and the failure path from a batch terminal error into the retry set.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use beefy_importer::config::PerChainConfig;
use beefy_importer::import_state::{ImportRanges, RangeUpdate};
use beefy_importer::planner::{historical_block_ranges, BlockPlannerConfig};
use beefy_importer::ranges::{range_list_contains, Range};
use beefy_importer::rpc::ChainRpc;
use beefy_importer::stream::{batch_rpc, collect, source, BatchRpcOptions, ErrorEmitter};

fn r(from: u64, to: u64) -> Range<u64> {
    Range::new(from, to)
}

fn planner_cfg(max_blocks: u64) -> BlockPlannerConfig {
    BlockPlannerConfig {
        max_blocks_per_query: max_blocks,
        ms_per_block_estimate: 3_000,
    }
}

fn state(covered: Vec<Range<u64>>, retry: Vec<Range<u64>>) -> ImportRanges<u64> {
    ImportRanges {
        covered_ranges: covered,
        to_retry: retry,
        last_import_date: Utc.with_ymd_and_hms(2022, 6, 1, 0, 0, 0).unwrap(),
    }
}

#[test]
fn fresh_product_is_planned_newest_first_up_to_the_safety_margin() {
    let planned = historical_block_ranges(&state(vec![], vec![]), 900, 1_000, planner_cfg(40), 100);
    assert_eq!(planned, vec![r(956, 995), r(916, 955), r(900, 915)]);
}

#[test]
fn partially_covered_product_only_plans_the_gap() {
    let planned = historical_block_ranges(
        &state(vec![r(900, 950)], vec![]),
        900,
        1_000,
        planner_cfg(40),
        100,
    );
    assert_eq!(planned, vec![r(956, 995), r(951, 955)]);
}

#[test]
fn fully_attempted_product_replans_only_its_retries() {
    let planned = historical_block_ranges(
        &state(vec![r(900, 909), r(916, 995)], vec![r(910, 915)]),
        900,
        1_000,
        planner_cfg(40),
        100,
    );
    assert_eq!(planned, vec![r(910, 915)]);
}

#[tokio::test]
async fn archive_node_failure_lands_every_range_in_the_retry_set() {
    // ankr defaults allow eth_getLogs batches of 10
    let chain_cfg = PerChainConfig {
        chain_id: 56,
        chain_name: "bsc".to_string(),
        rpc_urls: vec!["https://rpc.ankr.com/bsc/scenario-test".to_string()],
        max_blocks_per_query: 3_000,
        ms_per_block_estimate: 3_000,
        etherscan_api_url: None,
        enabled: true,
        min_delay_between_rpc_calls_ms: None,
    };
    let rpc = Arc::new(ChainRpc::connect(&chain_cfg).unwrap());
    let (errors, mut error_rx) = ErrorEmitter::new();

    let ranges = vec![r(100, 139), r(140, 179), r(180, 219), r(220, 259), r(260, 299)];
    let out = batch_rpc(
        source(ranges.clone()),
        rpc,
        BatchRpcOptions {
            label: "eth_getLogs",
            rpc_calls_per_input: HashMap::from([("eth_getLogs".to_string(), 1)]),
            max_input_wait: std::time::Duration::from_millis(10),
            max_input_take: 500,
            work_concurrency: 2,
            max_total_retry_ms: 1_000,
        },
        errors,
        |range: &Range<u64>| *range,
        |_provider, _queries: Vec<Range<u64>>| async {
            Err::<HashMap<Range<u64>, ()>, _>("missing trie node deadbeef".to_string())
        },
    );

    // no range produces output, every range fans out to the error emitter
    let emitted = collect(out).await;
    assert!(emitted.is_empty());

    let mut failed = Vec::new();
    while let Ok(range) = error_rx.try_recv() {
        failed.push(range);
    }
    assert_eq!(failed.len(), 5);

    // the next update tick folds the failures into to_retry
    let mut update = RangeUpdate::new();
    for range in failed {
        update.record(range, false);
    }
    let next = state(vec![], vec![]).apply(&update, Utc::now());
    assert!(next.covered_ranges.is_empty());
    for range in &ranges {
        assert!(range_list_contains(&next.to_retry, range.from));
        assert!(range_list_contains(&next.to_retry, range.to));
    }
}

#[test]
fn repeated_ticks_keep_covered_and_retry_disjoint_and_merged() {
    let mut ranges = state(vec![], vec![]);
    let now = Utc.with_ymd_and_hms(2022, 6, 1, 0, 0, 0).unwrap();

    let ticks: Vec<Vec<(Range<u64>, bool)>> = vec![
        vec![(r(0, 99), true), (r(100, 199), false)],
        vec![(r(200, 299), true)],
        vec![(r(100, 199), true)],
        vec![(r(300, 399), false), (r(400, 499), true)],
    ];
    for tick in ticks {
        let mut update = RangeUpdate::new();
        for (range, success) in tick {
            update.record(range, success);
        }
        ranges = ranges.apply(&update, now);

        // covered stays merged and sorted
        for w in ranges.covered_ranges.windows(2) {
            assert!(w[0].to < w[1].from);
        }
        // disjointness of covered and retry
        for probe in (0..600).step_by(7) {
            assert!(
                !(range_list_contains(&ranges.covered_ranges, probe)
                    && range_list_contains(&ranges.to_retry, probe))
            );
        }
    }

    assert_eq!(ranges.covered_ranges, vec![r(0, 299), r(400, 499)]);
    assert_eq!(ranges.to_retry, vec![r(300, 399)]);
}
