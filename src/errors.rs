//! # Centralized Error Handling
//!
//! Hierarchical, typed errors for the whole importer. Each subsystem owns its
//! own error enum; `ImporterError` is the top-level type the orchestrator and
//! the binary deal with. RPC failures additionally carry a classification
//! (`RpcErrorClass`) that drives retry behavior in the gate and range retry
//! bookkeeping in the import state.

use thiserror::Error;

/// The top-level error type for a pipeline run.
#[derive(Error, Debug)]
pub enum ImporterError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcCallError),
    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Pipeline task failed: {0}")]
    Pipeline(String),
    #[error("System shut down")]
    Shutdown,
}

/// Classification of an RPC failure, decided by string patterns plus
/// chain-adapter overrides. The class determines whether the gate retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorClass {
    /// The queried state has been pruned; only an archive node can answer.
    /// Never retried on the same endpoint; the range goes to `to_retry`.
    ArchiveNodeNeeded,
    /// Provider-side throttling. Retried after exponential backoff.
    RateLimited,
    /// The provider switched networks mid-connection. Retried after a short
    /// fixed delay.
    NetworkChanged,
    /// Timeouts, resets, 5xx. Retried with backoff.
    Transient,
    /// Anything else. Surfaced without retry.
    Fatal,
}

impl RpcErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcErrorClass::RateLimited | RpcErrorClass::NetworkChanged | RpcErrorClass::Transient
        )
    }
}

/// A terminal RPC failure as returned by the gate.
#[derive(Error, Debug)]
pub enum RpcCallError {
    #[error("RPC call failed ({class:?}): {message}")]
    Classified { class: RpcErrorClass, message: String },
    #[error("Retry budget of {budget_ms}ms exhausted after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted {
        budget_ms: u64,
        attempts: u32,
        last_error: String,
    },
    #[error("Transport error: {0}")]
    Transport(String),
}

impl RpcCallError {
    /// The classification of this terminal error, if any.
    pub fn class(&self) -> Option<RpcErrorClass> {
        match self {
            RpcCallError::Classified { class, .. } => Some(*class),
            _ => None,
        }
    }
}

/// Errors from the persistence layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to acquire database connection: {0}")]
    Pool(String),
    #[error("Database query failed: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("Database connection timed out: {0}")]
    ConnectionTimeout(String),
    #[error("Import state payload is malformed for key {key}: {source}")]
    MalformedState {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StorageError {
    /// Connection-level timeouts are retried by the import-state update path;
    /// everything else surfaces immediately.
    pub fn is_connection_timeout(&self) -> bool {
        match self {
            StorageError::ConnectionTimeout(_) => true,
            StorageError::Pool(msg) => msg.contains("timed out") || msg.contains("timeout"),
            StorageError::Postgres(e) => {
                let msg = e.to_string();
                msg.contains("timed out") || msg.contains("connection closed")
            }
            _ => false,
        }
    }
}

/// Errors from the domain loaders (decode failures, invariants, off-chain APIs).
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Failed to decode {what}: {detail}")]
    Decode { what: String, detail: String },
    /// A planner bug: an operator received a product kind it must never see
    /// (e.g. a boost routed into the share-rate fetcher). Fatal.
    #[error("Domain invariant violated: {0}")]
    DomainInvariant(String),
    #[error("Price feed API error: {0}")]
    PriceApi(String),
    #[error("Contract creation lookup failed for {address} on {chain}: {detail}")]
    CreationLookup {
        chain: String,
        address: String,
        detail: String,
    },
}

const ARCHIVE_NODE_ERRORS: &[&str] = &[
    "missing trie node",
    "header not found",
    "required historical state unavailable",
    "Block with such an ID cannot be found",
    "could not find block",
    "state is not available",
    "ancient block",
];

const RATE_LIMIT_ERRORS: &[&str] = &[
    "rate limit",
    "too many requests",
    "exceeded",
    "429",
    "RateLimitError",
    "-32005",
    "You've exceeded the RPS limit",
    "capacity exceeded",
];

const NETWORK_CHANGED_ERRORS: &[&str] = &["underlying network changed", "network changed"];

const TRANSIENT_ERRORS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection closed",
    "broken pipe",
    "502",
    "503",
    "504",
    "ECONNREFUSED",
    "ECONNRESET",
    "error sending request",
    "no response",
];

/// Classify a raw RPC error message. Chain adapters may pre-empt this with
/// endpoint-specific knowledge; this is the shared fallback.
pub fn classify_rpc_error(message: &str) -> RpcErrorClass {
    if ARCHIVE_NODE_ERRORS.iter().any(|p| message.contains(p)) {
        return RpcErrorClass::ArchiveNodeNeeded;
    }
    if NETWORK_CHANGED_ERRORS.iter().any(|p| message.contains(p)) {
        return RpcErrorClass::NetworkChanged;
    }
    if RATE_LIMIT_ERRORS.iter().any(|p| message.contains(p)) {
        return RpcErrorClass::RateLimited;
    }
    if TRANSIENT_ERRORS.iter().any(|p| message.contains(p)) {
        return RpcErrorClass::Transient;
    }
    RpcErrorClass::Fatal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_archive_node_errors() {
        assert_eq!(
            classify_rpc_error("missing trie node 0xdeadbeef"),
            RpcErrorClass::ArchiveNodeNeeded
        );
        assert_eq!(
            classify_rpc_error("header not found"),
            RpcErrorClass::ArchiveNodeNeeded
        );
    }

    #[test]
    fn classifies_rate_limits() {
        assert_eq!(
            classify_rpc_error("429 Too Many Requests: You've exceeded the RPS limit"),
            RpcErrorClass::RateLimited
        );
        assert_eq!(classify_rpc_error("code -32005"), RpcErrorClass::RateLimited);
    }

    #[test]
    fn classifies_network_change_before_rate_limit() {
        // "network changed" messages often also contain "exceeded"-adjacent
        // text; the network-changed class must win
        assert_eq!(
            classify_rpc_error("underlying network changed: chain id 137 != 1"),
            RpcErrorClass::NetworkChanged
        );
    }

    #[test]
    fn unknown_errors_are_fatal() {
        assert_eq!(
            classify_rpc_error("execution reverted: BAL#401"),
            RpcErrorClass::Fatal
        );
    }
}
