//! Collaborators the gateway consumes through narrow interfaces.
//!
//! Each trait has at least one concrete adapter here; the router only ever
//! sees the trait objects held by [`crate::proxy::GatewayContext`].

mod cdn;
mod store;
mod txlog;
mod waf;

use alloy_primitives::B256;
use async_trait::async_trait;
use serde_json::Value;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::identity::ClientIdentity;
use crate::rpc::{StatQuery, TxRecord};

pub use cdn::{CidrCdnMembership, CLOUDFLARE_RANGES};
pub use store::{MemorySnapshotStore, RedisSnapshotStore};
pub use txlog::{LogTxSink, MemoryTxLog, TxSink};
pub use waf::WafReporter;

/// Tells CDN edge nodes apart from direct clients.
pub trait CdnMembership: Send + Sync {
    /// True when `ip` belongs to the CDN, i.e. the real client address is
    /// carried in a forwarded header.
    fn is_real_client_ip(&self, ip: IpAddr) -> bool;
}

/// Key/value store for limiter snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get_cache(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn save_cache(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Deduplicating transaction log.
#[async_trait]
pub trait TxLog: Send + Sync {
    fn is_tx_exist(&self, hash: &B256) -> bool;

    fn add_cache(&self, hash: B256);

    fn remove_cache(&self, hash: &B256);

    /// Queue a batch for durable storage.
    async fn persist_transactions(&self, batch: Vec<TxRecord>) -> Result<()>;

    /// Answer one of the statistics methods for `host`.
    async fn stats(&self, host: &str, query: StatQuery) -> Result<Value>;
}

/// Escalates abusive clients to a network-level ban. Never blocks.
pub trait AbuseReporter: Send + Sync {
    fn report_abuse_ip(&self, ip: &ClientIdentity);
}

/// Reporter used when no WAF endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAbuseReporter;

impl AbuseReporter for NoopAbuseReporter {
    fn report_abuse_ip(&self, ip: &ClientIdentity) {
        debug!(client = %ip, "Abuse reporting disabled; ignoring report");
    }
}
