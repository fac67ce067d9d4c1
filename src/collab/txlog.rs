//! In-memory transaction log with a background batch writer.

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::TxLog;
use crate::error::{GatewayError, Result};
use crate::rpc::{StatQuery, TxRecord};

/// Durable destination of persisted batches.
#[async_trait]
pub trait TxSink: Send + Sync {
    async fn write(&self, batch: &[TxRecord]) -> Result<()>;
}

/// Sink that only logs each record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTxSink;

#[async_trait]
impl TxSink for LogTxSink {
    async fn write(&self, batch: &[TxRecord]) -> Result<()> {
        for record in batch {
            info!(
                hash = %record.hash,
                sender = ?record.sender,
                nonce = record.nonce,
                to = ?record.to,
                host = %record.host,
                "Transaction submitted"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct HostStats {
    tx_count: u64,
    wallets: BTreeSet<Address>,
}

/// Dedup cache plus per-host statistics. Batches handed to
/// [`TxLog::persist_transactions`] are written by a background task so the
/// request path never waits on the sink.
pub struct MemoryTxLog {
    seen: DashMap<B256, ()>,
    hosts: DashMap<String, HostStats>,
    writer: mpsc::Sender<Vec<TxRecord>>,
}

impl MemoryTxLog {
    /// Start the writer task. It drains pending batches and exits once
    /// `cancel` fires.
    pub fn spawn(
        sink: Arc<dyn TxSink>,
        queue_size: usize,
        cancel: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let log = Arc::new(Self {
            seen: DashMap::new(),
            hosts: DashMap::new(),
            writer: tx,
        });
        let handle = tokio::spawn(run_writer(sink, rx, cancel));
        (log, handle)
    }

    /// Number of hashes in the dedup cache.
    pub fn cached(&self) -> usize {
        self.seen.len()
    }

    fn record_stats(&self, batch: &[TxRecord]) {
        for record in batch {
            let mut stats = self.hosts.entry(record.host.clone()).or_default();
            stats.tx_count += 1;
            if let Some(sender) = record.sender {
                stats.wallets.insert(sender);
            }
        }
    }
}

async fn run_writer(
    sink: Arc<dyn TxSink>,
    mut rx: mpsc::Receiver<Vec<TxRecord>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            batch = rx.recv() => match batch {
                Some(batch) => write_batch(sink.as_ref(), &batch).await,
                None => break,
            },
        }
    }

    rx.close();
    while let Some(batch) = rx.recv().await {
        write_batch(sink.as_ref(), &batch).await;
    }
    debug!("Transaction writer stopped");
}

async fn write_batch(sink: &dyn TxSink, batch: &[TxRecord]) {
    if let Err(e) = sink.write(batch).await {
        error!(error = %e, count = batch.len(), "Failed to persist transactions");
    }
}

#[async_trait]
impl TxLog for MemoryTxLog {
    fn is_tx_exist(&self, hash: &B256) -> bool {
        self.seen.contains_key(hash)
    }

    fn add_cache(&self, hash: B256) {
        self.seen.insert(hash, ());
    }

    fn remove_cache(&self, hash: &B256) {
        self.seen.remove(hash);
    }

    async fn persist_transactions(&self, batch: Vec<TxRecord>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.record_stats(&batch);
        self.writer.try_send(batch).map_err(|e| {
            warn!("Transaction writer queue rejected a batch");
            GatewayError::TxLog(e.to_string())
        })
    }

    async fn stats(&self, host: &str, query: StatQuery) -> Result<Value> {
        let Some(stats) = self.hosts.get(host) else {
            return Ok(match query {
                StatQuery::WalletList => json!([]),
                _ => json!(0),
            });
        };
        Ok(match query {
            StatQuery::TxCount => json!(stats.tx_count),
            StatQuery::WalletCount => json!(stats.wallets.len()),
            StatQuery::WalletList => json!(stats
                .wallets
                .iter()
                .map(|w| w.to_string())
                .collect::<Vec<_>>()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        written: Mutex<Vec<TxRecord>>,
    }

    #[async_trait]
    impl TxSink for RecordingSink {
        async fn write(&self, batch: &[TxRecord]) -> Result<()> {
            self.written.lock().extend_from_slice(batch);
            Ok(())
        }
    }

    fn record(byte: u8, sender: u8, host: &str) -> TxRecord {
        TxRecord {
            hash: B256::repeat_byte(byte),
            sender: Some(Address::repeat_byte(sender)),
            nonce: byte as u64,
            to: None,
            host: host.to_string(),
        }
    }

    #[tokio::test]
    async fn test_dedup_cache() {
        let (log, _handle) =
            MemoryTxLog::spawn(Arc::new(LogTxSink), 8, CancellationToken::new());
        let hash = B256::repeat_byte(7);

        assert!(!log.is_tx_exist(&hash));
        log.add_cache(hash);
        assert!(log.is_tx_exist(&hash));
        assert_eq!(log.cached(), 1);
        log.remove_cache(&hash);
        assert!(!log.is_tx_exist(&hash));
    }

    #[tokio::test]
    async fn test_batches_reach_the_sink() {
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let (log, handle) = MemoryTxLog::spawn(sink.clone(), 8, cancel.clone());

        log.persist_transactions(vec![record(1, 1, "a"), record(2, 1, "a")])
            .await
            .unwrap();
        log.persist_transactions(vec![record(3, 2, "b")]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(sink.written.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_stats_per_host() {
        let (log, _handle) =
            MemoryTxLog::spawn(Arc::new(LogTxSink), 8, CancellationToken::new());
        log.persist_transactions(vec![
            record(1, 1, "a"),
            record(2, 1, "a"),
            record(3, 2, "a"),
            record(4, 3, "b"),
        ])
        .await
        .unwrap();

        assert_eq!(log.stats("a", StatQuery::TxCount).await.unwrap(), json!(3));
        assert_eq!(log.stats("a", StatQuery::WalletCount).await.unwrap(), json!(2));
        assert_eq!(
            log.stats("b", StatQuery::WalletList).await.unwrap(),
            json!([Address::repeat_byte(3).to_string()])
        );
        assert_eq!(log.stats("c", StatQuery::TxCount).await.unwrap(), json!(0));
        assert_eq!(log.stats("c", StatQuery::WalletList).await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn test_closed_writer_is_reported() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (log, handle) = MemoryTxLog::spawn(Arc::new(LogTxSink), 1, cancel);
        handle.await.unwrap();

        // the writer is gone, so the channel is closed
        let result = log.persist_transactions(vec![record(1, 1, "a")]).await;
        assert!(matches!(result, Err(GatewayError::TxLog(_))));
    }
}
