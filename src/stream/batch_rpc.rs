//! The batch-RPC operator.
//!
//! Groups upstream items, decides linear-vs-batch transport from the
//! endpoint's declared per-method limits, executes each group under the
//! endpoint gate, and re-associates results with items through the map the
//! batch processor returns. For every input item, either exactly one output
//! is emitted or the error emitter is invoked exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ethers::providers::Provider;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::rpc::{ChainRpc, CoalescingTransport, RpcLimitations};
use crate::stream::{buffer_time, map_concurrent, ErrorEmitter, CHANNEL_CAPACITY};

/// How a batch-RPC operator will talk to the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchStrategy {
    pub can_use_batch_provider: bool,
    pub max_inputs_per_batch: usize,
}

/// Compute the per-batch input capacity from the endpoint's declared method
/// limits and the operator's declared calls-per-input.
///
/// Any method with a null limit disables batching outright; the group size
/// then falls back to 1, or to a tenth of the configured take when the
/// endpoint imposes no inter-call delay.
pub fn batch_strategy(
    limits: &RpcLimitations,
    rpc_calls_per_input: &HashMap<String, u32>,
    max_input_take: usize,
) -> BatchStrategy {
    let mut capacity: Option<u32> = None;
    let mut can_batch = true;

    for (method, calls) in rpc_calls_per_input {
        if *calls == 0 {
            continue;
        }
        match limits.method_limit(method) {
            Some(limit) => {
                let per_method = (limit / calls).max(1);
                capacity = Some(capacity.map_or(per_method, |c| c.min(per_method)));
            }
            None => can_batch = false,
        }
    }

    if !can_batch {
        let fallback = if limits.min_delay_between_calls.is_none() {
            (max_input_take / 10).max(1)
        } else {
            1
        };
        return BatchStrategy {
            can_use_batch_provider: false,
            max_inputs_per_batch: fallback,
        };
    }

    BatchStrategy {
        can_use_batch_provider: true,
        max_inputs_per_batch: capacity
            .map(|c| c as usize)
            .unwrap_or(max_input_take)
            .min(max_input_take)
            .max(1),
    }
}

/// Tuning of one batch-RPC operator instance.
#[derive(Debug, Clone)]
pub struct BatchRpcOptions {
    /// Gate label, the dominant JSON-RPC method of the processor.
    pub label: &'static str,
    /// RPC calls issued per input item, by method.
    pub rpc_calls_per_input: HashMap<String, u32>,
    pub max_input_wait: Duration,
    pub max_input_take: usize,
    pub work_concurrency: usize,
    pub max_total_retry_ms: u64,
}

/// Run `process_batch` over grouped inputs and emit `(item, result)` pairs.
///
/// Terminal failures fan out to the error emitter for every item of the
/// group. A successful batch that lacks a result for one of its queries is a
/// programming error in the processor and panics the pipeline task.
pub fn batch_rpc<TObj, Q, R, GQ, PB, Fut, E>(
    input: mpsc::Receiver<TObj>,
    rpc: Arc<ChainRpc>,
    opts: BatchRpcOptions,
    errors: ErrorEmitter<TObj>,
    get_query: GQ,
    process_batch: PB,
) -> mpsc::Receiver<(TObj, R)>
where
    TObj: Send + 'static,
    Q: std::hash::Hash + Eq + Clone + std::fmt::Debug + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    GQ: Fn(&TObj) -> Q + Send + Sync + 'static,
    PB: Fn(Arc<Provider<CoalescingTransport>>, Vec<Q>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HashMap<Q, R>, E>> + Send,
    E: std::fmt::Display + Send,
{
    let strategy = batch_strategy(&rpc.limitations, &opts.rpc_calls_per_input, opts.max_input_take);
    debug!(
        chain = %rpc.chain,
        label = opts.label,
        batch = strategy.can_use_batch_provider,
        group_size = strategy.max_inputs_per_batch,
        "Batch RPC operator configured"
    );

    let groups = buffer_time(input, opts.max_input_wait, strategy.max_inputs_per_batch);
    let get_query = Arc::new(get_query);
    let process_batch = Arc::new(process_batch);
    let label = opts.label;
    let max_total_retry_ms = opts.max_total_retry_ms;

    let batched = map_concurrent(groups, opts.work_concurrency, move |group: Vec<TObj>| {
        let rpc = rpc.clone();
        let get_query = get_query.clone();
        let process_batch = process_batch.clone();
        let errors = errors.clone();
        async move {
            let queries: Vec<Q> = group.iter().map(|obj| (*get_query)(obj)).collect();
            let provider = rpc.provider(strategy.can_use_batch_provider);

            let outcome = rpc
                .gate
                .call(label, max_total_retry_ms, || {
                    (*process_batch)(provider.clone(), queries.clone())
                })
                .await;

            match outcome {
                Ok(results) => group
                    .into_iter()
                    .map(|obj| {
                        let query = (*get_query)(&obj);
                        match results.get(&query) {
                            Some(result) => (obj, result.clone()),
                            None => {
                                // a processor must answer every query it was
                                // given; a hole here corrupts range accounting
                                tracing::error!(
                                    label,
                                    ?query,
                                    "batch processor returned no result for query"
                                );
                                panic!(
                                    "batch processor for {} returned no result for {:?}",
                                    label, query
                                );
                            }
                        }
                    })
                    .collect::<Vec<_>>(),
                Err(e) => {
                    warn!(
                        chain = %rpc.chain,
                        label,
                        group_size = queries.len(),
                        error = %e,
                        "Batch failed terminally, reporting every item"
                    );
                    for obj in group {
                        errors.emit(obj);
                    }
                    Vec::new()
                }
            }
        }
    });

    // flatten group outputs into a per-item stream
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let mut batched = batched;
    tokio::spawn(async move {
        while let Some(pairs) = batched.recv().await {
            for pair in pairs {
                if tx.send(pair).await.is_err() {
                    return;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerChainConfig;
    use crate::stream::{collect, source};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn limits(get_logs: Option<u32>, min_delay: Option<Duration>) -> RpcLimitations {
        let mut methods = HashMap::new();
        methods.insert("eth_getLogs".to_string(), get_logs);
        RpcLimitations {
            methods,
            min_delay_between_calls: min_delay,
            is_archive_node: false,
        }
    }

    fn calls(n: u32) -> HashMap<String, u32> {
        let mut m = HashMap::new();
        m.insert("eth_getLogs".to_string(), n);
        m
    }

    #[test]
    fn capacity_divides_method_limit_by_calls_per_input() {
        let strategy = batch_strategy(&limits(Some(10), None), &calls(2), 500);
        assert_eq!(
            strategy,
            BatchStrategy {
                can_use_batch_provider: true,
                max_inputs_per_batch: 5
            }
        );
    }

    #[test]
    fn null_limit_disables_batching() {
        let strategy = batch_strategy(&limits(None, Some(Duration::from_millis(100))), &calls(1), 500);
        assert_eq!(
            strategy,
            BatchStrategy {
                can_use_batch_provider: false,
                max_inputs_per_batch: 1
            }
        );

        // with no inter-call delay, fall back to a tenth of the take
        let strategy = batch_strategy(&limits(None, None), &calls(1), 500);
        assert_eq!(
            strategy,
            BatchStrategy {
                can_use_batch_provider: false,
                max_inputs_per_batch: 50
            }
        );
    }

    fn test_rpc() -> Arc<ChainRpc> {
        // ankr defaults: no min delay, eth_getLogs batch cap 10
        let cfg = PerChainConfig {
            chain_id: 56,
            chain_name: "bsc".to_string(),
            rpc_urls: vec!["https://rpc.ankr.com/bsc/testkey".to_string()],
            max_blocks_per_query: 3_000,
            ms_per_block_estimate: 3_000,
            etherscan_api_url: None,
            enabled: true,
            min_delay_between_rpc_calls_ms: None,
        };
        Arc::new(ChainRpc::connect(&cfg).unwrap())
    }

    fn opts(calls_per_input: HashMap<String, u32>) -> BatchRpcOptions {
        BatchRpcOptions {
            label: "eth_getLogs",
            rpc_calls_per_input: calls_per_input,
            max_input_wait: Duration::from_millis(10),
            max_input_take: 500,
            work_concurrency: 1,
            max_total_retry_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn groups_of_ten_split_in_two_batches_of_five() {
        let rpc = test_rpc();
        let (errors, _error_rx) = ErrorEmitter::new();
        let batches = Arc::new(AtomicU32::new(0));
        let batches_seen = batches.clone();

        let out = batch_rpc(
            source((0u64..10).collect()),
            rpc,
            opts(calls(2)), // cap 10 / 2 calls per item = 5 items per batch
            errors,
            |n| *n,
            move |_provider, queries: Vec<u64>| {
                let batches = batches_seen.clone();
                async move {
                    assert!(queries.len() <= 5);
                    batches.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(queries.into_iter().map(|q| (q, q * 2)).collect())
                }
            },
        );

        let mut results = collect(out).await;
        results.sort_unstable();
        assert_eq!(results.len(), 10);
        assert_eq!(results[0], (0, 0));
        assert_eq!(results[9], (9, 18));
        assert_eq!(batches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn terminal_failure_reports_every_item_exactly_once() {
        let rpc = test_rpc();
        let (errors, mut error_rx) = ErrorEmitter::new();

        let out = batch_rpc(
            source((0u64..5).collect()),
            rpc,
            opts(calls(1)),
            errors,
            |n| *n,
            |_provider, _queries: Vec<u64>| async {
                Err::<HashMap<u64, u64>, _>("execution reverted".to_string())
            },
        );

        let results = collect(out).await;
        assert!(results.is_empty());

        let mut failed = Vec::new();
        while let Ok(item) = error_rx.try_recv() {
            failed.push(item);
        }
        failed.sort_unstable();
        assert_eq!(failed, vec![0, 1, 2, 3, 4]);
    }
}
