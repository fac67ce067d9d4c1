//! Shared request-handling context.

use alloy_primitives::B256;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

use super::upstream::UpstreamPool;
use crate::collab::{AbuseReporter, CdnMembership, TxLog};
use crate::config::{GatewayConfig, UpstreamsConfig};
use crate::error::Result;
use crate::ratelimit::{AggregateLimiter, RateLimiterSet};
use crate::rpc::{decode_transactions, LocalReply, LocalValue, RequestClassifier, TxRecord};

/// The collaborators a context is wired with.
pub struct Collaborators {
    pub cdn: Arc<dyn CdnMembership>,
    pub tx_log: Arc<dyn TxLog>,
    pub abuse: Arc<dyn AbuseReporter>,
}

/// Everything a handler needs, built once at startup and shared by `Arc`.
pub struct GatewayContext {
    pub config: Arc<GatewayConfig>,
    pub limiters: RateLimiterSet,
    pub aggregate: Option<AggregateLimiter>,
    pub classifier: RequestClassifier,
    pub origins: UpstreamPool,
    pub http: reqwest::Client,
    pub cdn: Arc<dyn CdnMembership>,
    pub tx_log: Arc<dyn TxLog>,
    pub abuse: Arc<dyn AbuseReporter>,
}

impl GatewayContext {
    pub fn new(
        config: GatewayConfig,
        limiters: RateLimiterSet,
        http: reqwest::Client,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let aggregate = config
            .rate_limits
            .aggregate
            .as_ref()
            .map(|a| AggregateLimiter::new(a.capacity, Duration::from_millis(a.window_ms)));
        let classifier =
            RequestClassifier::new(config.local_answers.clone(), config.rpc.max_batch_cost);
        let origins = UpstreamPool::new(&config.upstreams.origins, config.upstreams.max_fails)?;

        Ok(Self {
            config: Arc::new(config),
            limiters,
            aggregate,
            classifier,
            origins,
            http,
            cdn: collaborators.cdn,
            tx_log: collaborators.tx_log,
            abuse: collaborators.abuse,
        })
    }

    /// Hand submitted transactions to the tx log. Decoding, signer recovery
    /// and persistence all run in the background after admission; the
    /// returned handle resolves to the hashes newly added to the cache.
    pub fn record_transactions(&self, raw: Vec<String>, host: &str) -> PendingTransactions {
        if raw.is_empty() {
            return PendingTransactions(None);
        }
        let tx_log = self.tx_log.clone();
        let host = host.to_string();
        PendingTransactions(Some(tokio::spawn(async move {
            let decoded =
                match tokio::task::spawn_blocking(move || decode_transactions(&raw, &host)).await {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!(error = %e, "Transaction decoding task failed");
                        return Vec::new();
                    }
                };

            let mut seen = HashSet::new();
            let fresh: Vec<TxRecord> = decoded
                .into_iter()
                .filter(|tx| !tx_log.is_tx_exist(&tx.hash) && seen.insert(tx.hash))
                .collect();
            if fresh.is_empty() {
                return Vec::new();
            }

            let hashes: Vec<B256> = fresh.iter().map(|tx| tx.hash).collect();
            for hash in &hashes {
                tx_log.add_cache(*hash);
            }
            if let Err(e) = tx_log.persist_transactions(fresh).await {
                warn!(error = %e, "Failed to queue transactions for persistence");
            }
            hashes
        })))
    }

    /// Undo [`Self::record_transactions`] for a submission that never
    /// reached the sentry, so a retry is recorded again.
    pub async fn forget_transactions(&self, pending: PendingTransactions) {
        for hash in pending.hashes().await {
            self.tx_log.remove_cache(&hash);
        }
    }

    /// Produce the response body of a locally answered call.
    pub async fn resolve_local(&self, host: &str, reply: &LocalReply) -> Result<Value> {
        let result = match &reply.value {
            LocalValue::Ready(value) => value.clone(),
            LocalValue::Stats(query) => self.tx_log.stats(host, *query).await?,
        };
        Ok(reply.render(result))
    }
}

/// Background recording of one submission's transactions. Dropping it
/// leaves the recording running.
#[derive(Debug)]
pub struct PendingTransactions(Option<JoinHandle<Vec<B256>>>);

impl PendingTransactions {
    /// Wait for the recording and return the hashes it cached.
    pub async fn hashes(self) -> Vec<B256> {
        match self.0 {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                warn!(error = %e, "Transaction recording task failed");
                Vec::new()
            }),
            None => Vec::new(),
        }
    }
}

/// Pooled client shared by every outbound HTTP exchange.
pub fn build_http_client(config: &UpstreamsConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    Ok(client)
}

/// Host header without its port, as used for per-host statistics.
pub fn host_label(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split_once(']').map(|(h, _)| &h[1..]).unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}
