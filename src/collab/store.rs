//! Snapshot stores: in-process and Redis.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::SnapshotStore;
use crate::error::Result;
use crate::ratelimit::{Clock, SystemClock};

/// In-process store honouring TTLs. Suitable for tests and single-node
/// deployments that accept losing snapshots with the process.
pub struct MemorySnapshotStore {
    entries: DashMap<String, (Vec<u8>, DateTime<Utc>)>,
    clock: Arc<dyn Clock>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get_cache(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(key) {
            if entry.1 > now {
                return Ok(Some(entry.0.clone()));
            }
        } else {
            return Ok(None);
        }
        self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        Ok(None)
    }

    async fn save_cache(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Redis-backed store. Keys expire through Redis TTLs.
#[derive(Clone)]
pub struct RedisSnapshotStore {
    connection: ConnectionManager,
}

impl RedisSnapshotStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected to Redis snapshot store");
        Ok(Self { connection })
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn get_cache(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        let bytes: Option<Vec<u8>> = conn.get(key).await?;
        Ok(bytes)
    }

    async fn save_cache(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        // SETEX refuses a zero TTL
        let ttl_secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
