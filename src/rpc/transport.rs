//! JSON-RPC 2.0 transport with optional timed batch aggregation.
//!
//! One transport type serves both modes the import engine needs:
//!
//! - **linear**: each call is its own HTTP POST, sent immediately;
//! - **batch**: calls arriving within the aggregation window are queued and
//!   flushed as a single JSON array POST by a debounced flusher task.
//!
//! Every response element routes back to exactly the caller that enqueued it
//! (matched by JSON-RPC id); a non-array payload on a batch POST is a
//! whole-batch failure fanned out to every pending caller. Chain adapter
//! hooks normalize malformed results before deserialization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{JsonRpcClient, JsonRpcError, ProviderError, RpcError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::trace;
use url::Url;

use crate::rpc::quirks::ChainAdapter;

/// How long the batch provider waits for more calls before flushing.
pub const BATCH_AGGREGATION_WINDOW: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("JSON-RPC error: {0}")]
    JsonRpc(JsonRpcError),
    #[error("HTTP transport error: {0}")]
    Http(String),
    #[error("Failed to serialize request: {0}")]
    SerializeRequest(#[source] serde_json::Error),
    #[error("Failed to deserialize response: {err}; body: {text}")]
    Deserialize {
        #[source]
        err: serde_json::Error,
        text: String,
    },
    #[error("Batch response missing entry for request id {0}")]
    MissingBatchResponse(u64),
    #[error("Batch request failed: {0}")]
    Batch(String),
    #[error("Transport channel closed before a response arrived")]
    ChannelClosed,
}

impl RpcError for TransportError {
    fn as_error_response(&self) -> Option<&JsonRpcError> {
        match self {
            TransportError::JsonRpc(e) => Some(e),
            _ => None,
        }
    }

    fn as_serde_error(&self) -> Option<&serde_json::Error> {
        match self {
            TransportError::SerializeRequest(e) => Some(e),
            TransportError::Deserialize { err, .. } => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for ProviderError {
    fn from(e: TransportError) -> Self {
        ProviderError::JsonRpcClientError(Box::new(e))
    }
}

/// A JSON-RPC transport in linear or coalescing mode.
#[derive(Debug, Clone)]
pub struct CoalescingTransport {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    url: Url,
    client: reqwest::Client,
    next_id: AtomicU64,
    /// `None` sends each call immediately; `Some(window)` coalesces.
    batch_window: Option<Duration>,
    pending: Mutex<Vec<PendingCall>>,
    adapter: Arc<dyn ChainAdapter>,
}

#[derive(Debug)]
struct PendingCall {
    id: u64,
    request: Value,
    respond: oneshot::Sender<Result<Value, TransportError>>,
}

impl CoalescingTransport {
    pub fn linear(url: Url, client: reqwest::Client, adapter: Arc<dyn ChainAdapter>) -> Self {
        Self::build(url, client, adapter, None)
    }

    pub fn batching(
        url: Url,
        client: reqwest::Client,
        adapter: Arc<dyn ChainAdapter>,
        window: Duration,
    ) -> Self {
        Self::build(url, client, adapter, Some(window))
    }

    fn build(
        url: Url,
        client: reqwest::Client,
        adapter: Arc<dyn ChainAdapter>,
        batch_window: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                url,
                client,
                next_id: AtomicU64::new(1),
                batch_window,
                pending: Mutex::new(Vec::new()),
                adapter,
            }),
        }
    }

    async fn enqueue(
        &self,
        id: u64,
        request: Value,
        window: Duration,
    ) -> Result<Value, TransportError> {
        let (tx, rx) = oneshot::channel();
        let arm_flusher = {
            let mut pending = self.inner.pending.lock().await;
            pending.push(PendingCall {
                id,
                request,
                respond: tx,
            });
            pending.len() == 1
        };

        // The first call of a window arms the flusher; later calls ride along
        if arm_flusher {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                flush(inner).await;
            });
        }

        rx.await.map_err(|_| TransportError::ChannelClosed)?
    }

    async fn send_single(&self, request: Value) -> Result<Value, TransportError> {
        let response = self
            .inner
            .client
            .post(self.inner.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        extract_result(body)
    }
}

async fn flush(inner: Arc<Inner>) {
    let calls: Vec<PendingCall> = {
        let mut pending = inner.pending.lock().await;
        pending.drain(..).collect()
    };
    if calls.is_empty() {
        return;
    }
    trace!(calls = calls.len(), "Flushing JSON-RPC batch");

    let body = Value::Array(calls.iter().map(|c| c.request.clone()).collect());
    let outcome = async {
        let response = inner
            .client
            .post(inner.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        response.json::<Value>().await.map_err(|e| e.to_string())
    }
    .await;

    match outcome {
        Err(msg) => {
            for call in calls {
                let _ = call.respond.send(Err(TransportError::Http(msg.clone())));
            }
        }
        Ok(Value::Array(entries)) => {
            let mut by_id: HashMap<u64, Value> = entries
                .into_iter()
                .filter_map(|entry| {
                    let id = entry.get("id").and_then(Value::as_u64)?;
                    Some((id, entry))
                })
                .collect();
            for call in calls {
                let result = match by_id.remove(&call.id) {
                    Some(entry) => extract_result(entry),
                    None => Err(TransportError::MissingBatchResponse(call.id)),
                };
                let _ = call.respond.send(result);
            }
        }
        Ok(other) => {
            // A single error object (or junk) in place of the array: the
            // whole batch failed as one
            let msg = match other.get("error") {
                Some(err) => err.to_string(),
                None => other.to_string(),
            };
            for call in calls {
                let _ = call.respond.send(Err(TransportError::Batch(msg.clone())));
            }
        }
    }
}

fn extract_result(mut body: Value) -> Result<Value, TransportError> {
    if let Some(err) = body.get("error") {
        let rpc_err: JsonRpcError =
            serde_json::from_value(err.clone()).unwrap_or_else(|_| JsonRpcError {
                code: -32000,
                message: err.to_string(),
                data: None,
            });
        return Err(TransportError::JsonRpc(rpc_err));
    }
    match body.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(TransportError::Http(format!(
            "malformed JSON-RPC response: {}",
            body
        ))),
    }
}

#[async_trait]
impl JsonRpcClient for CoalescingTransport {
    type Error = TransportError;

    async fn request<T, R>(&self, method: &str, params: T) -> Result<R, TransportError>
    where
        T: std::fmt::Debug + Serialize + Send + Sync,
        R: DeserializeOwned + Send,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut params_value =
            serde_json::to_value(&params).map_err(TransportError::SerializeRequest)?;
        if params_value.is_null() {
            params_value = Value::Array(Vec::new());
        }
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params_value,
        });

        let raw = match self.inner.batch_window {
            None => self.send_single(request).await?,
            Some(window) => self.enqueue(id, request, window).await?,
        };

        let normalized = self.inner.adapter.normalize_response(method, raw);
        serde_json::from_value(normalized.clone()).map_err(|err| TransportError::Deserialize {
            err,
            text: normalized.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_result_takes_the_result_field() {
        let body = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": "0x10"});
        assert_eq!(extract_result(body).unwrap(), serde_json::json!("0x10"));
    }

    #[test]
    fn extract_result_surfaces_rpc_errors() {
        let body = serde_json::json!({
            "jsonrpc": "2.0", "id": 1,
            "error": {"code": -32005, "message": "rate limited"}
        });
        match extract_result(body) {
            Err(TransportError::JsonRpc(e)) => {
                assert_eq!(e.code, -32005);
                assert_eq!(e.message, "rate limited");
            }
            other => panic!("expected JsonRpc error, got {:?}", other),
        }
    }

    #[test]
    fn extract_result_rejects_bodies_without_result() {
        let body = serde_json::json!({"jsonrpc": "2.0", "id": 1});
        assert!(matches!(extract_result(body), Err(TransportError::Http(_))));
    }

    #[test]
    fn null_result_is_a_valid_result() {
        let body = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": null});
        assert_eq!(extract_result(body).unwrap(), Value::Null);
    }
}
