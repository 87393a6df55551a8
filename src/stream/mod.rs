//! Channel-based stream operators.
//!
//! Pipelines are chains of bounded mpsc channels with a worker task per
//! operator. Backpressure is the channel bound: a slow downstream stalls
//! `send`, which stalls the upstream worker. Failed items never flow
//! downstream; operators report them through their [`ErrorEmitter`] exactly
//! once, which is how transient failures find their way into `to_retry`.

mod batch_rpc;

pub use batch_rpc::*;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use moka::future::Cache;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use crate::errors::RpcCallError;

/// Channel bound between operators. Small on purpose: buffering lives in
/// `buffer_time` groups, not in the pipes.
pub const CHANNEL_CAPACITY: usize = 64;

/// Feed a finite batch of items into a stream.
pub fn source<T: Send + 'static>(items: Vec<T>) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY.max(1));
    tokio::spawn(async move {
        for item in items {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Group items: a group is emitted when it reaches `max_count` items or when
/// `max_wait` has elapsed since its first item, whichever happens first.
/// Empty groups are never emitted.
pub fn buffer_time<T: Send + 'static>(
    mut input: mpsc::Receiver<T>,
    max_wait: Duration,
    max_count: usize,
) -> mpsc::Receiver<Vec<T>> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let max_count = max_count.max(1);

    tokio::spawn(async move {
        let mut group: Vec<T> = Vec::with_capacity(max_count);
        let mut deadline: Option<Instant> = None;

        loop {
            match deadline {
                None => match input.recv().await {
                    Some(item) => {
                        group.push(item);
                        if group.len() >= max_count {
                            if tx.send(std::mem::take(&mut group)).await.is_err() {
                                return;
                            }
                        } else {
                            deadline = Some(Instant::now() + max_wait);
                        }
                    }
                    None => break,
                },
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {
                            deadline = None;
                            if !group.is_empty()
                                && tx.send(std::mem::take(&mut group)).await.is_err()
                            {
                                return;
                            }
                        }
                        item = input.recv() => match item {
                            Some(item) => {
                                group.push(item);
                                if group.len() >= max_count {
                                    deadline = None;
                                    if tx.send(std::mem::take(&mut group)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        }

        if !group.is_empty() {
            let _ = tx.send(group).await;
        }
    });

    rx
}

/// Apply an async function with at most `concurrency` calls in flight.
/// Output order is not guaranteed.
pub fn map_concurrent<T, U, F, Fut>(
    mut input: mpsc::Receiver<T>,
    concurrency: usize,
    f: F,
) -> mpsc::Receiver<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = U> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let stream = futures::stream::poll_fn(move |cx| input.poll_recv(cx));
        let mut mapped = stream.map(f).buffer_unordered(concurrency.max(1));
        while let Some(out) = mapped.next().await {
            if tx.send(out).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Sequential map: output order equals input order.
pub fn map_ordered<T, U, F, Fut>(mut input: mpsc::Receiver<T>, mut f: F) -> mpsc::Receiver<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = U> + Send,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(item) = input.recv().await {
            let out = f(item).await;
            if tx.send(out).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Apply a fallible async stage with at most `concurrency` calls in flight.
/// A failure becomes a downstream-empty result: the failed item goes to the
/// error emitter exactly once and is never forwarded.
pub fn catch_error<T, U, F, Fut, E>(
    input: mpsc::Receiver<T>,
    concurrency: usize,
    errors: ErrorEmitter<T>,
    handler: F,
) -> mpsc::Receiver<U>
where
    T: Clone + Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<U, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let handler = Arc::new(handler);
    let mut attempted = map_concurrent(input, concurrency, move |item: T| {
        let handler = handler.clone();
        let errors = errors.clone();
        async move {
            let fallback = item.clone();
            match (*handler)(item).await {
                Ok(out) => Some(out),
                Err(e) => {
                    warn!(error = %e, "Stage failed, reporting item");
                    errors.emit(fallback);
                    None
                }
            }
        }
    });

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(slot) = attempted.recv().await {
            if let Some(out) = slot {
                if tx.send(out).await.is_err() {
                    return;
                }
            }
        }
    });
    rx
}

/// Split one stream into (matching, non-matching) by predicate.
pub fn partition<T, P>(
    mut input: mpsc::Receiver<T>,
    pred: P,
) -> (mpsc::Receiver<T>, mpsc::Receiver<T>)
where
    T: Send + 'static,
    P: Fn(&T) -> bool + Send + 'static,
{
    let (tx_yes, rx_yes) = mpsc::channel(CHANNEL_CAPACITY);
    let (tx_no, rx_no) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(item) = input.recv().await {
            let target = if pred(&item) { &tx_yes } else { &tx_no };
            if target.send(item).await.is_err() {
                break;
            }
        }
    });
    (rx_yes, rx_no)
}

/// Collect a whole stream. Pipelines end with this at each tick boundary.
pub async fn collect<T>(mut input: mpsc::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Some(item) = input.recv().await {
        out.push(item);
    }
    out
}

/// The per-operator failure channel. Every item an operator cannot process
/// must be emitted here exactly once and excluded from downstream emission.
pub struct ErrorEmitter<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for ErrorEmitter<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T: Send + 'static> ErrorEmitter<T> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, item: T) {
        // the receiver living shorter than the pipeline is a shutdown race,
        // not an error
        let _ = self.tx.send(item);
    }
}

/// Memoizing operator cache: concurrent callers with the same key share one
/// in-flight fetch, and results live for the configured TTL.
pub struct SharedCache<K, V> {
    cache: Cache<K, V>,
}

impl<K, V> SharedCache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync + Clone + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Get the cached value or run `fetch`, deduplicating concurrent fetches
    /// of the same key.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V, RpcCallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, RpcCallError>>,
    {
        self.cache
            .try_get_with(key, fetch())
            .await
            .map_err(|shared: Arc<RpcCallError>| {
                RpcCallError::Transport(format!("shared fetch failed: {}", shared))
            })
    }

    pub async fn invalidate(&self, key: &K) {
        self.cache.invalidate(key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffer_time_flushes_on_count() {
        let input = source((0..10).collect::<Vec<u32>>());
        let groups = collect(buffer_time(input, Duration::from_secs(60), 4)).await;
        assert_eq!(groups, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_time_flushes_on_deadline() {
        let (tx, rx) = mpsc::channel(8);
        let mut groups = buffer_time(rx, Duration::from_millis(100), 100);

        tx.send(1u32).await.unwrap();
        tx.send(2u32).await.unwrap();
        let group = groups.recv().await.unwrap();
        assert_eq!(group, vec![1, 2]);
        drop(tx);
        assert!(groups.recv().await.is_none());
    }

    #[tokio::test]
    async fn map_concurrent_processes_everything() {
        let input = source((0..50).collect::<Vec<u64>>());
        let mut out = collect(map_concurrent(input, 8, |n| async move { n * 2 })).await;
        out.sort_unstable();
        assert_eq!(out, (0..50).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn map_ordered_preserves_order() {
        let input = source(vec![3u64, 1, 2]);
        let out = collect(map_ordered(input, |n| async move { n + 10 })).await;
        assert_eq!(out, vec![13, 11, 12]);
    }

    #[tokio::test]
    async fn catch_error_forwards_successes_and_reports_failures_once() {
        let (errors, mut error_rx) = ErrorEmitter::new();
        let input = source((0u32..10).collect::<Vec<_>>());

        let out = catch_error(input, 4, errors, |n| async move {
            if n % 2 == 0 {
                Ok(n * 10)
            } else {
                Err(format!("odd item {}", n))
            }
        });

        let mut forwarded = collect(out).await;
        forwarded.sort_unstable();
        assert_eq!(forwarded, vec![0, 20, 40, 60, 80]);

        let mut failed = Vec::new();
        while let Ok(item) = error_rx.try_recv() {
            failed.push(item);
        }
        failed.sort_unstable();
        assert_eq!(failed, vec![1, 3, 5, 7, 9]);
    }

    #[tokio::test]
    async fn partition_splits_by_predicate() {
        let input = source((0..10).collect::<Vec<u32>>());
        let (even, odd) = partition(input, |n| n % 2 == 0);
        let (even, odd) = tokio::join!(collect(even), collect(odd));
        assert_eq!(even, vec![0, 2, 4, 6, 8]);
        assert_eq!(odd, vec![1, 3, 5, 7, 9]);
    }

    #[tokio::test]
    async fn shared_cache_deduplicates_in_flight_fetches() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let cache: Arc<SharedCache<&'static str, u64>> =
            Arc::new(SharedCache::new(100, Duration::from_secs(60)));
        let fetches = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("head", || async {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(42u64)
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }
}
