//! Signed transaction decoding for submission bookkeeping.

use alloy_consensus::{transaction::SignerRecoverable, Transaction, TxEnvelope};
use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::{Address, B256};
use serde_json::Value;
use tracing::trace;

/// A submitted transaction as recorded by the transaction log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub hash: B256,
    /// `None` when the signature does not recover
    pub sender: Option<Address>,
    pub nonce: u64,
    /// `None` for contract creation
    pub to: Option<Address>,
    /// Host the transaction was submitted through
    pub host: String,
}

/// Decode one hex-encoded EIP-2718 transaction. Undecodable input yields `None`.
pub fn decode_raw_transaction(raw_hex: &str, host: &str) -> Option<TxRecord> {
    let stripped = raw_hex.trim_start_matches("0x");
    let bytes = match hex::decode(stripped) {
        Ok(bytes) => bytes,
        Err(e) => {
            trace!(error = %e, "Dropping raw transaction with invalid hex");
            return None;
        }
    };

    let envelope = match TxEnvelope::decode_2718(&mut bytes.as_slice()) {
        Ok(envelope) => envelope,
        Err(e) => {
            trace!(error = %e, "Dropping undecodable raw transaction");
            return None;
        }
    };

    Some(TxRecord {
        hash: *envelope.tx_hash(),
        sender: envelope.recover_signer().ok(),
        nonce: envelope.nonce(),
        to: envelope.to(),
        host: host.to_string(),
    })
}

/// Collect the raw transaction strings out of submission params without
/// decoding them. Accepts both a flat list and a nested array of strings.
pub fn raw_transactions(params: &[Value]) -> Vec<String> {
    let mut raw = Vec::new();
    for param in params {
        match param {
            Value::String(tx) => raw.push(tx.clone()),
            Value::Array(items) => raw.extend(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string),
            ),
            _ => {}
        }
    }
    raw
}

/// Decode and recover every raw transaction, dropping what does not decode.
/// Signature recovery is CPU bound; run this off the request path.
pub fn decode_transactions(raw: &[String], host: &str) -> Vec<TxRecord> {
    raw.iter()
        .filter_map(|tx| decode_raw_transaction(tx, host))
        .collect()
}

/// A BSC type-2 transfer used across tests.
#[cfg(test)]
pub(crate) const SAMPLE_RAW_TX: &str = "0x02f8a9388223d88080829f3a9455d398326f99059ff775485246999027b319795580b844a9059cbb000000000000000000000000c37ac5194e1fb34a0935ed42ecb861991755913e0000000000000000000000000000000000000000000000000000000000000000c080a056d20e26818edbe771e1278ecfb1563f758e4ac439ffd7b62149bd2a31435004a04a6df5516d0e20e9471ea4a08bf8c32471ab85ba09134bc1002acb22d1b9036b";
