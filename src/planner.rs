//! Query planning: which ranges to fetch next.
//!
//! Pure transformations of `(import state, chain head)` into a bounded,
//! prioritized range list. New work is planned newest-first because RPC
//! providers pruning history are far more likely to answer near the head;
//! previously failed ranges re-enter behind new work, oldest-first. Output
//! never includes blocks above `head - PROPAGATION_SAFETY_MARGIN`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::import_state::ImportRanges;
use crate::ranges::{
    range_exclude, range_list_split_to_max_length, range_split_to_max_length_from_end, Range,
    RangePoint,
};

/// Blocks the importer stays behind the head so every queried block has
/// propagated to whatever node answers.
pub const PROPAGATION_SAFETY_MARGIN: u64 = 5;

/// Ceiling on the ranges one planner invocation emits per import key.
pub const MAX_RANGES_PER_PRODUCT_TO_GENERATE: usize = 100;

/// How many trailing timesteps feed the head extrapolation of a sampling
/// block list.
pub const EXTRAPOLATION_LOOKBACK_TIMESTEPS: usize = 40;

/// Per-chain planning knobs, pulled from the chain config.
#[derive(Debug, Clone, Copy)]
pub struct BlockPlannerConfig {
    pub max_blocks_per_query: u64,
    pub ms_per_block_estimate: u64,
}

impl BlockPlannerConfig {
    fn blocks_in_one_hour(&self) -> u64 {
        (3_600_000 / self.ms_per_block_estimate.max(1)).max(1)
    }
}

/// The recent-tail query: one range ending at `head - P`, sized to at most
/// an hour of blocks, never reaching below the contract creation block or
/// below what is already imported.
pub fn latest_block_query(
    contract_created_at_block: u64,
    last_imported: Option<u64>,
    head: u64,
    cfg: BlockPlannerConfig,
) -> Option<Range<u64>> {
    let last = last_imported.unwrap_or(contract_created_at_block);
    let headroom = head.saturating_sub(last).saturating_sub(1);
    let target = cfg
        .max_blocks_per_query
        .min(cfg.blocks_in_one_hour())
        .min(headroom);
    if target == 0 {
        return None;
    }

    let to = head.saturating_sub(PROPAGATION_SAFETY_MARGIN);
    let from = head
        .saturating_sub(target)
        .saturating_sub(PROPAGATION_SAFETY_MARGIN)
        .max(contract_created_at_block);
    if from > to {
        return None;
    }
    Some(Range::new(from, to))
}

/// The shared restriction pipeline: subtract what is covered and what waits
/// in retry, split, order newest-first, append retries oldest-first, truncate.
pub fn restrict_ranges<T: RangePoint>(
    source: &[Range<T>],
    state: &ImportRanges<T>,
    max_len: T::Len,
    max_count: usize,
) -> Vec<Range<T>> {
    let fresh = range_exclude(
        &range_exclude(source, &state.covered_ranges),
        &state.to_retry,
    );

    // newest gap first, each gap chunked from its own end
    let mut gaps = fresh;
    gaps.sort_by(|a, b| b.from.cmp(&a.from));
    let mut planned: Vec<Range<T>> = gaps
        .iter()
        .flat_map(|r| range_split_to_max_length_from_end(r, max_len))
        .collect();

    let mut retries = range_list_split_to_max_length(&state.to_retry, max_len);
    retries.sort_by_key(|r| r.from);
    planned.extend(retries);

    planned.truncate(max_count);
    planned
}

/// Historical block ranges for one product: everything between contract
/// creation and `head - P` not yet covered, then retries.
pub fn historical_block_ranges(
    state: &ImportRanges<u64>,
    contract_created_at_block: u64,
    head: u64,
    cfg: BlockPlannerConfig,
    max_count: usize,
) -> Vec<Range<u64>> {
    let ceiling = head.saturating_sub(PROPAGATION_SAFETY_MARGIN);
    if ceiling < contract_created_at_block {
        return restrict_ranges(&[], state, cfg.max_blocks_per_query, max_count);
    }
    let full = Range::new(contract_created_at_block, ceiling);
    restrict_ranges(&[full], state, cfg.max_blocks_per_query, max_count)
}

/// Historical date ranges for one oracle feed, same algorithm with date
/// arithmetic.
pub fn historical_date_ranges(
    state: &ImportRanges<DateTime<Utc>>,
    first_date: DateTime<Utc>,
    now: DateTime<Utc>,
    max_range_ms: i64,
    max_count: usize,
) -> Vec<Range<DateTime<Utc>>> {
    if now < first_date {
        return Vec::new();
    }
    let full = Range::new(first_date, now);
    restrict_ranges(
        &[full],
        state,
        ChronoDuration::milliseconds(max_range_ms.max(1)),
        max_count,
    )
}

/// One entry of the share-rate sampling block list: a timestep boundary and
/// the interpolated block at it.
#[derive(Debug, Clone, Copy)]
pub struct BlockSample {
    pub datetime: DateTime<Utc>,
    pub block_number: u64,
}

/// Interpolate a block list at `time_step` granularity between contract
/// creation and the current head.
pub fn interpolate_block_samples(
    creation_block: u64,
    creation_date: DateTime<Utc>,
    head: u64,
    head_date: DateTime<Utc>,
    time_step: ChronoDuration,
) -> Vec<BlockSample> {
    if head <= creation_block || head_date <= creation_date {
        return Vec::new();
    }
    let total_ms = (head_date - creation_date).num_milliseconds().max(1) as f64;
    let total_blocks = (head - creation_block) as f64;

    let mut samples = Vec::new();
    let mut at = creation_date;
    while at <= head_date {
        let progress = (at - creation_date).num_milliseconds() as f64 / total_ms;
        let block = creation_block + (progress * total_blocks).round() as u64;
        samples.push(BlockSample {
            datetime: at,
            block_number: block.min(head),
        });
        at += time_step;
    }
    samples
}

/// Regular-interval ranges for share-rate sampling.
///
/// Only timesteps whose block falls inside the parent (investment) covered
/// ranges are considered; the list is extrapolated to the current head using
/// the average block delta of the trailing timesteps, turned into
/// consecutive per-timestep ranges, then run through the shared restriction
/// pipeline with a chunk length of `min(avg_delta, max_blocks_per_query)`.
pub fn regular_interval_ranges(
    samples: &[BlockSample],
    parent_covered: &[Range<u64>],
    state: &ImportRanges<u64>,
    head: u64,
    cfg: BlockPlannerConfig,
    max_count: usize,
) -> Vec<Range<u64>> {
    let ceiling = head.saturating_sub(PROPAGATION_SAFETY_MARGIN);
    let mut blocks: Vec<u64> = samples
        .iter()
        .map(|s| s.block_number)
        .filter(|b| crate::ranges::range_list_contains(parent_covered, *b) && *b <= ceiling)
        .collect();
    blocks.sort_unstable();
    blocks.dedup();
    if blocks.len() < 2 {
        // nothing to sample yet; pending retries still get their turn
        return restrict_ranges(&[], state, cfg.max_blocks_per_query, max_count);
    }

    let lookback = blocks.len().min(EXTRAPOLATION_LOOKBACK_TIMESTEPS + 1);
    let tail = &blocks[blocks.len() - lookback..];
    let avg_delta = (tail
        .windows(2)
        .map(|w| w[1] - w[0])
        .sum::<u64>()
        / (tail.len() as u64 - 1).max(1))
    .max(1);

    let mut cursor = match blocks.last() {
        Some(last) => *last,
        None => return Vec::new(),
    };
    while cursor + avg_delta <= ceiling {
        cursor += avg_delta;
        blocks.push(cursor);
    }

    let mut ranges: Vec<Range<u64>> = blocks
        .windows(2)
        .map(|w| Range::new(w[0], w[1] - 1))
        .collect();
    if let Some(last) = blocks.last() {
        if *last <= ceiling {
            ranges.push(Range::new(*last, ceiling.max(*last)));
        }
    }

    let max_len = avg_delta.min(cfg.max_blocks_per_query);
    restrict_ranges(&ranges, state, max_len, max_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import_state::ImportRanges;
    use chrono::TimeZone;

    fn r(from: u64, to: u64) -> Range<u64> {
        Range::new(from, to)
    }

    fn empty_state() -> ImportRanges<u64> {
        ImportRanges::empty(Utc.with_ymd_and_hms(2022, 6, 1, 0, 0, 0).unwrap())
    }

    fn state(covered: Vec<Range<u64>>, retry: Vec<Range<u64>>) -> ImportRanges<u64> {
        ImportRanges {
            covered_ranges: covered,
            to_retry: retry,
            last_import_date: Utc.with_ymd_and_hms(2022, 6, 1, 0, 0, 0).unwrap(),
        }
    }

    fn cfg(max_blocks: u64) -> BlockPlannerConfig {
        BlockPlannerConfig {
            max_blocks_per_query: max_blocks,
            ms_per_block_estimate: 3_000,
        }
    }

    #[test]
    fn empty_state_plans_newest_first_from_creation() {
        // head 1000, creation 900, P=5: plannable window is [900, 995]
        let planned = historical_block_ranges(&empty_state(), 900, 1_000, cfg(40), 100);
        assert_eq!(planned, vec![r(956, 995), r(916, 955), r(900, 915)]);
    }

    #[test]
    fn covered_prefix_leaves_only_the_gap() {
        let planned =
            historical_block_ranges(&state(vec![r(900, 950)], vec![]), 900, 1_000, cfg(40), 100);
        assert_eq!(planned, vec![r(956, 995), r(951, 955)]);
    }

    #[test]
    fn retries_come_after_primary_work_oldest_first() {
        // all of [900, 995] either covered or waiting in retry
        let planned = historical_block_ranges(
            &state(vec![r(900, 909), r(916, 995)], vec![r(910, 915)]),
            900,
            1_000,
            cfg(40),
            100,
        );
        assert_eq!(planned, vec![r(910, 915)]);

        // with a fresh gap at the head, the gap is planned first
        let planned = historical_block_ranges(
            &state(vec![r(900, 909), r(916, 980)], vec![r(910, 915)]),
            900,
            1_000,
            cfg(40),
            100,
        );
        assert_eq!(planned, vec![r(981, 995), r(910, 915)]);
    }

    #[test]
    fn output_never_exceeds_head_minus_safety_margin() {
        let planned = historical_block_ranges(&empty_state(), 0, 1_000, cfg(40), 100);
        for range in &planned {
            assert!(range.to <= 995);
        }
    }

    #[test]
    fn output_is_truncated_to_max_count() {
        let planned = historical_block_ranges(&empty_state(), 0, 100_000, cfg(10), 7);
        assert_eq!(planned.len(), 7);
    }

    #[test]
    fn planner_is_deterministic() {
        let st = state(vec![r(100, 5_000), r(6_000, 9_000)], vec![r(5_500, 5_600)]);
        let a = historical_block_ranges(&st, 100, 10_000, cfg(64), 50);
        let b = historical_block_ranges(&st, 100, 10_000, cfg(64), 50);
        assert_eq!(a, b);
    }

    #[test]
    fn latest_query_tails_the_head() {
        // head 1000, last imported 900: headroom 99, hour cap 1200, query cap 40
        let range = latest_block_query(500, Some(900), 1_000, cfg(40)).unwrap();
        assert_eq!(range, r(955, 995));
    }

    #[test]
    fn latest_query_clamps_at_contract_creation() {
        let range = latest_block_query(980, None, 1_000, cfg(40)).unwrap();
        assert_eq!(range.from, 980);
        assert_eq!(range.to, 995);
    }

    #[test]
    fn latest_query_is_empty_when_caught_up() {
        assert!(latest_block_query(900, Some(999), 1_000, cfg(40)).is_none());
        assert!(latest_block_query(900, Some(1_000), 1_000, cfg(40)).is_none());
    }

    #[test]
    fn date_ranges_split_and_skip_covered() {
        let d = |day: u32| Utc.with_ymd_and_hms(2022, 1, day, 0, 0, 0).unwrap();
        let st = ImportRanges {
            covered_ranges: vec![Range::new(d(1), d(10))],
            to_retry: vec![],
            last_import_date: d(20),
        };
        let planned = historical_date_ranges(&st, d(1), d(20), 5 * 24 * 3_600 * 1_000, 100);
        assert!(!planned.is_empty());
        // newest-first, nothing before the covered prefix ends
        assert_eq!(planned[0].to, d(20));
        assert!(planned.iter().all(|r| r.to > d(10)));
        for range in &planned {
            assert!(range.to - range.from <= ChronoDuration::days(5));
        }
    }

    #[test]
    fn interval_ranges_extrapolate_to_the_head() {
        let d = |h: u32| Utc.with_ymd_and_hms(2022, 1, 1, h, 0, 0).unwrap();
        // one sample per hour, 100 blocks apart, parent covered through block 500
        let samples: Vec<BlockSample> = (0..=5)
            .map(|i| BlockSample {
                datetime: d(i),
                block_number: 100 * i as u64,
            })
            .collect();
        let planned = regular_interval_ranges(
            &samples,
            &[r(0, 500)],
            &empty_state(),
            1_105,
            cfg(1_000),
            100,
        );
        assert!(!planned.is_empty());
        // extrapolated past the last sample using the 100-block average delta
        let newest = planned[0];
        assert_eq!(newest.to, 1_100);
        for range in &planned {
            assert!(range.length() <= 100);
        }
    }

    #[test]
    fn interpolated_samples_are_monotonic() {
        let d0 = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        let d1 = Utc.with_ymd_and_hms(2022, 1, 2, 0, 0, 0).unwrap();
        let samples =
            interpolate_block_samples(1_000, d0, 29_800, d1, ChronoDuration::minutes(15));
        assert_eq!(samples.first().unwrap().block_number, 1_000);
        assert!(samples.windows(2).all(|w| w[0].block_number <= w[1].block_number));
        assert!(samples.last().unwrap().block_number <= 29_800);
    }
}
