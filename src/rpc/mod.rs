//! JSON-RPC decoding and request classification.

mod classifier;
mod methods;
mod tx;
mod types;

pub use classifier::{
    batch_cost, Classification, ClassifyError, LocalReply, LocalValue, RequestClassifier,
};
pub use methods::{LocalAnswer, MethodSpec, RpcMethod, StatQuery};
pub use tx::{decode_raw_transaction, decode_transactions, raw_transactions, TxRecord};
pub use types::{JsonRpcCall, RpcRequest};

#[cfg(test)]
pub(crate) use tx::SAMPLE_RAW_TX;
