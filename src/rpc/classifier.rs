//! Request classification: cost, routing and local answers.

use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use super::methods::{LocalAnswer, RpcMethod, StatQuery};
use super::tx::raw_transactions;
use super::types::{JsonRpcCall, RpcRequest};
use crate::config::LocalAnswersConfig;
use crate::error::Rejection;

/// Why a payload could not be classified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("payload is neither a JSON object nor a JSON array")]
    NotJsonRpc,

    #[error("invalid JSON-RPC payload: {0}")]
    Malformed(String),

    #[error("empty batch")]
    EmptyBatch,

    #[error("batch cost {cost} exceeds ceiling {ceiling}")]
    TooExpensive { cost: u64, ceiling: u64 },
}

impl From<ClassifyError> for Rejection {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::TooExpensive { cost, ceiling } => {
                Rejection::BatchTooExpensive { cost, ceiling }
            }
            other => Rejection::MalformedRequest(other.to_string()),
        }
    }
}

/// Value of a locally answered call. Statistics are resolved by the caller
/// against the transaction log.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalValue {
    Ready(Value),
    Stats(StatQuery),
}

/// A response the gateway synthesizes instead of forwarding.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalReply {
    pub value: LocalValue,
    pub jsonrpc: String,
    pub id: Value,
    /// The request was a one-element batch; the reply is wrapped likewise
    pub batched: bool,
}

impl LocalReply {
    /// Render the response envelope around `result`.
    pub fn render(&self, result: Value) -> Value {
        let jsonrpc = if self.jsonrpc.is_empty() {
            "2.0"
        } else {
            self.jsonrpc.as_str()
        };
        let body = json!({
            "jsonrpc": jsonrpc,
            "id": self.id,
            "result": result,
        });
        if self.batched {
            Value::Array(vec![body])
        } else {
            body
        }
    }
}

/// Everything the router needs to know about one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub request: RpcRequest,
    /// 1 for a single call, N for a batch of N
    pub cost: u64,
    /// Units charged against the limiters
    pub charged_cost: u64,
    pub must_route_to_sentry: bool,
    pub local_reply: Option<LocalReply>,
    /// Raw signed transactions carried by submission calls, still undecoded
    pub raw_transactions: Vec<String>,
    pub eth_calls: usize,
}

/// Units charged for a request of `calls` calls: 1 for a single call,
/// 2N-1 for a batch of N.
pub fn batch_cost(calls: u64) -> u64 {
    calls.saturating_mul(2).saturating_sub(1).max(1)
}

/// Decodes payloads against the method table.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    answers: LocalAnswersConfig,
    max_batch_cost: u64,
}

impl RequestClassifier {
    pub fn new(answers: LocalAnswersConfig, max_batch_cost: u64) -> Self {
        Self {
            answers,
            max_batch_cost,
        }
    }

    pub fn max_batch_cost(&self) -> u64 {
        self.max_batch_cost
    }

    /// Classify one payload received on `host`.
    pub fn decode(
        &self,
        is_rpc_host: bool,
        host: &str,
        body: &[u8],
    ) -> Result<Classification, ClassifyError> {
        let request = match body.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => RpcRequest::Single(parse(body)?),
            Some(b'[') => RpcRequest::Batch(parse(body)?),
            _ => return Err(ClassifyError::NotJsonRpc),
        };
        if request.is_empty() {
            return Err(ClassifyError::EmptyBatch);
        }

        let cost = request.len() as u64;
        let charged_cost = batch_cost(cost);
        if charged_cost > self.max_batch_cost {
            return Err(ClassifyError::TooExpensive {
                cost: charged_cost,
                ceiling: self.max_batch_cost,
            });
        }

        let mut must_route_to_sentry = false;
        let mut raw_txs = Vec::new();
        let mut eth_calls = 0;
        for call in request.calls() {
            let Some(method) = RpcMethod::from_name(&call.method) else {
                continue;
            };
            let spec = method.spec();
            must_route_to_sentry |= spec.forces_sentry;
            if spec.counts_as_eth_call {
                eth_calls += 1;
            }
            if method.submits_transactions() {
                raw_txs.extend(raw_transactions(call.positional_params()));
            }
        }

        let local_reply = if is_rpc_host && cost == 1 && !must_route_to_sentry {
            request
                .calls()
                .first()
                .and_then(|call| self.local_reply(call, request.is_batch()))
        } else {
            None
        };

        debug!(
            host,
            cost,
            sentry = must_route_to_sentry,
            local = local_reply.is_some(),
            txs = raw_txs.len(),
            eth_calls,
            "Classified JSON-RPC request"
        );

        Ok(Classification {
            request,
            cost,
            charged_cost,
            must_route_to_sentry,
            local_reply,
            raw_transactions: raw_txs,
            eth_calls,
        })
    }

    fn local_reply(&self, call: &JsonRpcCall, batched: bool) -> Option<LocalReply> {
        let spec = RpcMethod::from_name(&call.method)?.spec();

        // the probe is checked ahead of the answer table
        let value = if spec.counts_as_eth_call {
            LocalValue::Ready(self.probe_answer(call)?)
        } else {
            match spec.local? {
                LocalAnswer::GasPrice => LocalValue::Ready(json!(self.answers.gas_price)),
                LocalAnswer::ChainId => LocalValue::Ready(json!(self.answers.chain_id)),
                LocalAnswer::ClientVersion => {
                    LocalValue::Ready(json!(self.answers.client_version))
                }
                LocalAnswer::Stats(query) => LocalValue::Stats(query),
            }
        };

        Some(LocalReply {
            value,
            jsonrpc: call.jsonrpc.clone(),
            id: call.id.clone(),
            batched,
        })
    }

    /// An `eth_call` to the probe address carrying the probe value is
    /// answered with that value.
    fn probe_answer(&self, call: &JsonRpcCall) -> Option<Value> {
        let object = call.positional_params().first()?.as_object()?;
        let to = object.get("to")?.as_str()?;
        let value = object.get("value")?.as_str()?;
        if to.eq_ignore_ascii_case(&self.answers.probe_to)
            && value.eq_ignore_ascii_case(&self.answers.probe_value)
        {
            Some(Value::String(value.to_string()))
        } else {
            None
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ClassifyError> {
    serde_json::from_slice(body).map_err(|e| ClassifyError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::tx::SAMPLE_RAW_TX;

    fn classifier() -> RequestClassifier {
        RequestClassifier::new(LocalAnswersConfig::default(), 199)
    }

    fn decode(body: &str) -> Result<Classification, ClassifyError> {
        classifier().decode(true, "rpc.example", body.as_bytes())
    }

    #[test]
    fn test_batch_cost() {
        assert_eq!(batch_cost(1), 1);
        assert_eq!(batch_cost(2), 3);
        assert_eq!(batch_cost(10), 19);
        assert_eq!(batch_cost(0), 1);
    }

    #[test]
    fn test_single_call_costs_one() {
        let c = decode(r#"{"jsonrpc":"2.0","id":1,"method":"eth_blockNumber"}"#).unwrap();
        assert_eq!(c.cost, 1);
        assert_eq!(c.charged_cost, 1);
        assert!(!c.must_route_to_sentry);
        assert!(c.local_reply.is_none());
    }

    #[test]
    fn test_batch_charged_cost() {
        let c = decode(
            r#"[{"id":1,"method":"eth_blockNumber"},{"id":2,"method":"eth_blockNumber"},{"id":3,"method":"eth_getBalance"}]"#,
        )
        .unwrap();
        assert_eq!(c.cost, 3);
        assert_eq!(c.charged_cost, 5);
    }

    #[test]
    fn test_leading_whitespace_is_skipped() {
        let c = decode("  \n\t{\"id\":1,\"method\":\"eth_chainId\"}").unwrap();
        assert_eq!(c.cost, 1);
    }

    #[test]
    fn test_non_json_rpc_payloads() {
        assert_eq!(decode("hello").unwrap_err(), ClassifyError::NotJsonRpc);
        assert_eq!(decode("").unwrap_err(), ClassifyError::NotJsonRpc);
        assert_eq!(decode("   ").unwrap_err(), ClassifyError::NotJsonRpc);
        assert!(matches!(
            decode(r#"{"id":1,"method":"#).unwrap_err(),
            ClassifyError::Malformed(_)
        ));
        assert!(matches!(
            decode("[1, 2]").unwrap_err(),
            ClassifyError::Malformed(_)
        ));
        assert_eq!(decode("[]").unwrap_err(), ClassifyError::EmptyBatch);
    }

    #[test]
    fn test_ceiling_applies_to_charged_cost() {
        let classifier = RequestClassifier::new(LocalAnswersConfig::default(), 4);
        // three calls charge five units
        let body = r#"[{"method":"a"},{"method":"b"},{"method":"c"}]"#;
        assert_eq!(
            classifier.decode(true, "h", body.as_bytes()).unwrap_err(),
            ClassifyError::TooExpensive { cost: 5, ceiling: 4 }
        );
        let ok = r#"[{"method":"a"},{"method":"b"}]"#;
        assert_eq!(classifier.decode(true, "h", ok.as_bytes()).unwrap().charged_cost, 3);
    }

    #[test]
    fn test_mixed_batch_cost_and_routing() {
        let c = decode(r#"[{"method":"eth_call"},{"method":"eth_sendRawTransaction"}]"#).unwrap();
        assert_eq!(c.cost, 2);
        assert_eq!(c.charged_cost, 3);
        assert!(c.must_route_to_sentry);
        assert!(c.local_reply.is_none());
        assert!(c.raw_transactions.is_empty());
    }

    #[test]
    fn test_too_expensive_maps_to_rejection() {
        let rejection: Rejection = ClassifyError::TooExpensive { cost: 3, ceiling: 2 }.into();
        assert_eq!(rejection, Rejection::BatchTooExpensive { cost: 3, ceiling: 2 });
        let rejection: Rejection = ClassifyError::EmptyBatch.into();
        assert!(matches!(rejection, Rejection::MalformedRequest(_)));
    }

    #[test]
    fn test_sentry_method_anywhere_in_batch() {
        let body = format!(
            r#"[{{"id":1,"method":"eth_chainId"}},{{"id":2,"method":"eth_sendRawTransaction","params":["{}"]}}]"#,
            SAMPLE_RAW_TX
        );
        let c = decode(&body).unwrap();
        assert!(c.must_route_to_sentry);
        assert!(c.local_reply.is_none());
        assert_eq!(c.raw_transactions, vec![SAMPLE_RAW_TX.to_string()]);
    }

    #[test]
    fn test_undecodable_transaction_still_routes_to_sentry() {
        let c = decode(r#"{"id":1,"method":"eth_sendRawTransaction","params":["0xbeef"]}"#)
            .unwrap();
        assert!(c.must_route_to_sentry);
        assert_eq!(c.raw_transactions, vec!["0xbeef".to_string()]);
    }

    #[test]
    fn test_nested_submission_is_collected_undecoded() {
        // one call carrying many transactions is charged as one call
        let raw: Vec<String> = (0..500).map(|_| SAMPLE_RAW_TX.to_string()).collect();
        let body = json!({
            "id": 1,
            "method": "eth_sendBatchRawTransaction",
            "params": [raw],
        })
        .to_string();
        let c = decode(&body).unwrap();
        assert_eq!(c.charged_cost, 1);
        assert!(c.must_route_to_sentry);
        assert_eq!(c.raw_transactions, raw);
    }

    #[test]
    fn test_gas_remaining_routes_to_sentry() {
        let c = decode(r#"{"id":1,"method":"eth_get0GweiGasRemaining","params":[]}"#).unwrap();
        assert!(c.must_route_to_sentry);
    }

    #[test]
    fn test_local_answers() {
        let c = decode(r#"{"jsonrpc":"2.0","id":7,"method":"eth_chainId"}"#).unwrap();
        let reply = c.local_reply.unwrap();
        assert_eq!(reply.value, LocalValue::Ready(json!("0x38")));
        assert_eq!(
            reply.render(json!("0x38")),
            json!({"jsonrpc":"2.0","id":7,"result":"0x38"})
        );

        let c = decode(r#"{"id":"a","method":"eth_gasPrice"}"#).unwrap();
        assert_eq!(
            c.local_reply.unwrap().value,
            LocalValue::Ready(json!("0x3b9aca00"))
        );

        let c = decode(r#"{"id":"a","method":"web3_clientVersion"}"#).unwrap();
        assert_eq!(
            c.local_reply.unwrap().value,
            LocalValue::Ready(json!("Geth/v1.4.11/linux-amd64/go1.22.4"))
        );
    }

    #[test]
    fn test_stats_answers_are_deferred() {
        let c = decode(r#"{"id":1,"method":"gate_walletList"}"#).unwrap();
        assert_eq!(
            c.local_reply.unwrap().value,
            LocalValue::Stats(StatQuery::WalletList)
        );
    }

    #[test]
    fn test_singleton_batch_reply_is_wrapped() {
        let c = decode(r#"[{"jsonrpc":"2.0","id":3,"method":"eth_chainId"}]"#).unwrap();
        let reply = c.local_reply.unwrap();
        assert!(reply.batched);
        assert_eq!(
            reply.render(json!("0x38")),
            json!([{"jsonrpc":"2.0","id":3,"result":"0x38"}])
        );
    }

    #[test]
    fn test_larger_batches_are_never_answered_locally() {
        let c = decode(r#"[{"id":1,"method":"eth_chainId"},{"id":2,"method":"eth_chainId"}]"#)
            .unwrap();
        assert!(c.local_reply.is_none());
    }

    #[test]
    fn test_no_local_answers_off_rpc_hosts() {
        let c = classifier()
            .decode(false, "other.example", br#"{"id":1,"method":"eth_chainId"}"#)
            .unwrap();
        assert!(c.local_reply.is_none());
    }

    #[test]
    fn test_eth_call_probe() {
        let probe = r#"{"jsonrpc":"2.0","method":"eth_call","params":[{"to":"0x0000000000000000000000000000000000000048","value":"0x30"}],"id":83}"#;
        let c = decode(probe).unwrap();
        assert_eq!(c.eth_calls, 1);
        let reply = c.local_reply.unwrap();
        assert_eq!(reply.value, LocalValue::Ready(json!("0x30")));
        assert_eq!(reply.id, json!(83));

        let other = r#"{"jsonrpc":"2.0","method":"eth_call","params":[{"to":"0x0000000000000000000000000000000000000049","value":"0x30"}],"id":84}"#;
        let c = decode(other).unwrap();
        assert_eq!(c.eth_calls, 1);
        assert!(c.local_reply.is_none());
    }

    #[test]
    fn test_null_id_is_echoed() {
        let c = decode(r#"{"method":"eth_chainId"}"#).unwrap();
        assert_eq!(
            c.local_reply.unwrap().render(json!("0x38")),
            json!({"jsonrpc":"2.0","id":null,"result":"0x38"})
        );
    }
}
