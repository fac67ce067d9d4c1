//! JSON-RPC request shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One JSON-RPC call. Only the fields the gateway inspects are typed; the
/// original payload bytes are what gets forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcCall {
    #[serde(default)]
    pub jsonrpc: String,
    /// Opaque; echoed back unmodified in synthesized responses
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcCall {
    /// Positional parameters; empty for by-name or missing params.
    pub fn positional_params(&self) -> &[Value] {
        match &self.params {
            Value::Array(items) => items,
            _ => &[],
        }
    }
}

/// A decoded payload: a single call object or a batch array.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcRequest {
    Single(JsonRpcCall),
    Batch(Vec<JsonRpcCall>),
}

impl RpcRequest {
    pub fn calls(&self) -> &[JsonRpcCall] {
        match self {
            RpcRequest::Single(call) => std::slice::from_ref(call),
            RpcRequest::Batch(calls) => calls,
        }
    }

    /// Number of calls carried.
    pub fn len(&self) -> usize {
        self.calls().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls().is_empty()
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, RpcRequest::Batch(_))
    }
}
