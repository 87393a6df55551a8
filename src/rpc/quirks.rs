//! Per-chain response normalization and error classification hooks.
//!
//! Some chains return responses that do not match the canonical Ethereum
//! wire format, or signal pruned state with non-standard error strings. The
//! `ChainAdapter` seam fixes both at endpoint construction time; no runtime
//! provider mutation.

use std::sync::Arc;

use serde_json::Value;

use crate::errors::RpcErrorClass;

/// Chain-specific normalization of raw JSON-RPC results and errors.
///
/// `normalize_response` runs on every successful result before
/// deserialization; `classify_error` may pre-empt the shared string-pattern
/// classifier with endpoint-specific knowledge.
pub trait ChainAdapter: Send + Sync + std::fmt::Debug {
    fn normalize_response(&self, _method: &str, value: Value) -> Value {
        value
    }

    fn classify_error(&self, _method: &str, _message: &str) -> Option<RpcErrorClass> {
        None
    }
}

#[derive(Debug, Default)]
pub struct DefaultAdapter;

impl ChainAdapter for DefaultAdapter {}

/// Celo block headers omit `gasLimit`, `difficulty` and the sha3 uncles
/// field; fill the holes so the canonical block type deserializes.
#[derive(Debug, Default)]
pub struct CeloAdapter;

impl ChainAdapter for CeloAdapter {
    fn normalize_response(&self, method: &str, mut value: Value) -> Value {
        if method == "eth_getBlockByNumber" || method == "eth_getBlockByHash" {
            if let Some(block) = value.as_object_mut() {
                for (field, default) in [
                    ("gasLimit", "0x0"),
                    ("difficulty", "0x0"),
                    ("mixHash", "0x0000000000000000000000000000000000000000000000000000000000000000"),
                    ("nonce", "0x0000000000000000"),
                    (
                        "sha3Uncles",
                        "0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347",
                    ),
                ] {
                    block.entry(field).or_insert_with(|| Value::String(default.to_string()));
                }
            }
        }
        value
    }
}

/// Harmony reports pruned state with its own wording.
#[derive(Debug, Default)]
pub struct HarmonyAdapter;

impl ChainAdapter for HarmonyAdapter {
    fn classify_error(&self, _method: &str, message: &str) -> Option<RpcErrorClass> {
        if message.contains("rpc method is not whitelisted") {
            return Some(RpcErrorClass::Fatal);
        }
        if message.contains("Could not find block") || message.contains("epoch out of range") {
            return Some(RpcErrorClass::ArchiveNodeNeeded);
        }
        None
    }
}

/// The adapter composed into every endpoint of a chain.
pub fn adapter_for_chain(chain: &str) -> Arc<dyn ChainAdapter> {
    match chain {
        "celo" => Arc::new(CeloAdapter),
        "harmony" => Arc::new(HarmonyAdapter),
        _ => Arc::new(DefaultAdapter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn celo_blocks_gain_missing_fields() {
        let adapter = CeloAdapter;
        let raw = serde_json::json!({"number": "0x10", "timestamp": "0x61f2f4a0"});
        let fixed = adapter.normalize_response("eth_getBlockByNumber", raw);
        assert_eq!(fixed["gasLimit"], "0x0");
        assert_eq!(fixed["number"], "0x10");
    }

    #[test]
    fn celo_leaves_present_fields_alone() {
        let adapter = CeloAdapter;
        let raw = serde_json::json!({"gasLimit": "0x1c9c380"});
        let fixed = adapter.normalize_response("eth_getBlockByNumber", raw);
        assert_eq!(fixed["gasLimit"], "0x1c9c380");
    }

    #[test]
    fn harmony_classifies_pruned_blocks_as_archive_needed() {
        let adapter = HarmonyAdapter;
        assert_eq!(
            adapter.classify_error("eth_getLogs", "Could not find block 123"),
            Some(RpcErrorClass::ArchiveNodeNeeded)
        );
        assert_eq!(adapter.classify_error("eth_getLogs", "some other error"), None);
    }
}
