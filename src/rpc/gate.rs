//! Process-wide per-endpoint call gate.
//!
//! Every RPC call in the process funnels through the gate of its endpoint
//! URL. The gate enforces at-most-one in-flight call plus a minimum spacing
//! between call admissions whenever the endpoint declares a min delay, and
//! wraps the work in classified exponential-backoff retries. Batch calls go
//! through the same gate, serialized at the batch level.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use once_cell::sync::Lazy;
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::errors::{classify_rpc_error, RpcCallError, RpcErrorClass};
use crate::rpc::endpoint::{public_rpc_url, RpcLimitations};
use crate::rpc::quirks::ChainAdapter;

const RETRY_INITIAL_BACKOFF_MS: u64 = 100;
const RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;
const RETRY_MAX_BACKOFF_MS: u64 = 5_000;
const RETRY_JITTER_FACTOR: f64 = 0.1;
const NETWORK_CHANGED_DELAY_MS: u64 = 500;

static GATE_REGISTRY: Lazy<DashMap<String, Arc<EndpointGate>>> = Lazy::new(DashMap::new);

/// Get or create the gate for an endpoint URL. Gates are process-wide: two
/// pipelines hitting the same endpoint share one serializer.
pub fn endpoint_gate(
    url: &str,
    limitations: &RpcLimitations,
    adapter: Arc<dyn ChainAdapter>,
) -> Arc<EndpointGate> {
    if let Some(gate) = GATE_REGISTRY.get(url) {
        return gate.clone();
    }
    GATE_REGISTRY
        .entry(url.to_string())
        .or_insert_with(|| Arc::new(EndpointGate::new(url, limitations, adapter)))
        .clone()
}

/// The serializing primitive of one endpoint.
pub struct EndpointGate {
    public_url: String,
    /// Present iff the endpoint declares a min delay between calls.
    exclusive: Option<Semaphore>,
    pacer: Option<DefaultDirectRateLimiter>,
    adapter: Arc<dyn ChainAdapter>,
}

impl std::fmt::Debug for EndpointGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointGate")
            .field("public_url", &self.public_url)
            .field("exclusive", &self.exclusive.is_some())
            .finish()
    }
}

impl EndpointGate {
    fn new(url: &str, limitations: &RpcLimitations, adapter: Arc<dyn ChainAdapter>) -> Self {
        let pacer = limitations.min_delay_between_calls.and_then(|delay| {
            let quota = Quota::with_period(delay)?.allow_burst(NonZeroU32::new(1).expect("1 > 0"));
            Some(RateLimiter::direct(quota))
        });
        Self {
            public_url: public_rpc_url(url),
            exclusive: limitations
                .min_delay_between_calls
                .map(|_| Semaphore::new(1)),
            pacer,
            adapter,
        }
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    /// Run `work` under the gate with classified retries.
    ///
    /// Retries stop when the error is `fatal`, when it needs an archive node,
    /// or when the cumulative time would exceed `max_total_retry_ms`; the
    /// terminal error carries its classification for the caller's range
    /// bookkeeping.
    pub async fn call<T, E, F, Fut>(
        &self,
        method: &str,
        max_total_retry_ms: u64,
        work: F,
    ) -> Result<T, RpcCallError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let permit = match &self.exclusive {
                Some(sem) => Some(sem.acquire().await.map_err(|_| {
                    RpcCallError::Transport("endpoint gate semaphore closed".to_string())
                })?),
                None => None,
            };
            if let Some(pacer) = &self.pacer {
                pacer.until_ready().await;
            }

            let result = work().await;
            drop(permit);

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            endpoint = %self.public_url,
                            method,
                            attempt,
                            "RPC call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let message = error.to_string();
            let class = self
                .adapter
                .classify_error(method, &message)
                .unwrap_or_else(|| classify_rpc_error(&message));

            if !class.is_retryable() {
                debug!(
                    endpoint = %self.public_url,
                    method,
                    ?class,
                    error = %message,
                    "Terminal RPC error, not retrying"
                );
                return Err(RpcCallError::Classified { class, message });
            }

            let backoff = match class {
                RpcErrorClass::NetworkChanged => Duration::from_millis(NETWORK_CHANGED_DELAY_MS),
                _ => backoff_with_jitter(attempt),
            };

            if started.elapsed() + backoff > Duration::from_millis(max_total_retry_ms) {
                warn!(
                    endpoint = %self.public_url,
                    method,
                    attempts = attempt,
                    budget_ms = max_total_retry_ms,
                    error = %message,
                    "RPC retry budget exhausted"
                );
                return Err(RpcCallError::RetryBudgetExhausted {
                    budget_ms: max_total_retry_ms,
                    attempts: attempt,
                    last_error: message,
                });
            }

            warn!(
                endpoint = %self.public_url,
                method,
                attempt,
                ?class,
                backoff_ms = backoff.as_millis() as u64,
                error = %message,
                "Retryable RPC error, backing off"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = (RETRY_INITIAL_BACKOFF_MS as f64
        * RETRY_BACKOFF_MULTIPLIER.powi(attempt.saturating_sub(1) as i32))
    .min(RETRY_MAX_BACKOFF_MS as f64);
    let jitter = rand::thread_rng().gen_range(0.0..=RETRY_JITTER_FACTOR) * base;
    Duration::from_millis((base + jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::quirks::DefaultAdapter;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn open_gate() -> EndpointGate {
        let limitations = RpcLimitations {
            methods: Default::default(),
            min_delay_between_calls: None,
            is_archive_node: false,
        };
        EndpointGate::new("https://rpc.test", &limitations, Arc::new(DefaultAdapter))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let gate = open_gate();
        let attempts = AtomicU32::new(0);

        let result: Result<u32, RpcCallError> = gate
            .call("eth_getLogs", 60_000, || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err("429 too many requests".to_string())
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn archive_node_errors_abort_immediately() {
        let gate = open_gate();
        let attempts = AtomicU32::new(0);

        let result: Result<(), RpcCallError> = gate
            .call("eth_getLogs", 60_000, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("missing trie node abc".to_string())
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        match result {
            Err(RpcCallError::Classified { class, .. }) => {
                assert_eq!(class, RpcErrorClass::ArchiveNodeNeeded)
            }
            other => panic!("expected classified error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_bounds_total_time() {
        let gate = open_gate();

        let result: Result<(), RpcCallError> = gate
            .call("eth_call", 300, || async {
                Err::<(), _>("connection reset by peer".to_string())
            })
            .await;

        match result {
            Err(RpcCallError::RetryBudgetExhausted { budget_ms, attempts, .. }) => {
                assert_eq!(budget_ms, 300);
                assert!(attempts >= 1);
            }
            other => panic!("expected budget exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fatal_errors_surface_without_retry() {
        let gate = open_gate();
        let result: Result<(), RpcCallError> = gate
            .call("eth_call", 60_000, || async {
                Err::<(), _>("execution reverted".to_string())
            })
            .await;
        assert!(matches!(
            result,
            Err(RpcCallError::Classified { class: RpcErrorClass::Fatal, .. })
        ));
    }
}
