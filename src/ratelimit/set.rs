//! Ordered collection of per-identity limiters.

use axum::http::{HeaderMap, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{Allowance, SnapshotEntry, WindowLimiter};
use super::clock::{Clock, SystemClock};
use super::counter::WindowSpec;
use super::limiter::FixedWindowLimiter;
use crate::collab::SnapshotStore;
use crate::config::WindowConfig;
use crate::error::{GatewayError, Result};
use crate::identity::ClientIdentity;

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Outcome of evaluating every limiter in the set for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDecision {
    pub allowances: Vec<Allowance>,
}

impl SetDecision {
    /// A request is admitted only if every window admits it.
    pub fn allowed(&self) -> bool {
        self.allowances.iter().all(|a| a.allowed)
    }

    /// Label of the first window that refused the request.
    pub fn denied_window(&self) -> Option<&str> {
        self.allowances
            .iter()
            .find(|a| !a.allowed)
            .map(|a| a.window_label.as_str())
    }

    /// `X-RateLimit-Limit` value: JSON array of `"<limit>/<label>"`.
    pub fn limit_header(&self) -> String {
        let parts: Vec<String> = self
            .allowances
            .iter()
            .map(|a| format!("{}/{}", a.limit, a.window_label))
            .collect();
        serde_json::to_string(&parts).unwrap_or_else(|_| "[]".to_string())
    }

    /// `X-RateLimit-Remaining` value: JSON array of `"<limit - used>/<label>"`.
    pub fn remaining_header(&self) -> String {
        let parts: Vec<String> = self
            .allowances
            .iter()
            .map(|a| format!("{}/{}", a.remaining(), a.window_label))
            .collect();
        serde_json::to_string(&parts).unwrap_or_else(|_| "[]".to_string())
    }

    /// Both rate-limit headers, ready to attach to a response.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in [
            (X_RATELIMIT_LIMIT, self.limit_header()),
            (X_RATELIMIT_REMAINING, self.remaining_header()),
        ] {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }
        headers
    }
}

/// Storage key of a limiter's snapshot.
pub fn snapshot_key(label: &str) -> String {
    format!("rl_{}", label)
}

/// Ordered per-identity limiters, e.g. 5s / 1m / 1h / 24h.
///
/// The set holds no lock of its own. Each limiter is evaluated independently,
/// so a commit is not atomic across windows: a request charged by one window
/// and refused by another keeps the first charge. That only ever makes future
/// quota stricter.
#[derive(Clone)]
pub struct RateLimiterSet {
    limiters: Vec<Arc<dyn WindowLimiter>>,
}

impl RateLimiterSet {
    pub fn new(limiters: Vec<Arc<dyn WindowLimiter>>) -> Self {
        Self { limiters }
    }

    /// Build fixed-window limiters from configuration.
    pub fn from_config(windows: &[WindowConfig], clock: Arc<dyn Clock>) -> Result<Self> {
        let limiters = windows
            .iter()
            .map(|w| {
                let spec = WindowSpec::from_label(&w.label, w.capacity).ok_or_else(|| {
                    GatewayError::Config(format!("invalid window label '{}'", w.label))
                })?;
                Ok(Arc::new(FixedWindowLimiter::with_clock(spec, clock.clone()))
                    as Arc<dyn WindowLimiter>)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(limiters))
    }

    /// Build with the system clock.
    pub fn from_windows(windows: &[WindowConfig]) -> Result<Self> {
        Self::from_config(windows, Arc::new(SystemClock))
    }

    /// Check-only pass over every window; never mutates state.
    pub fn check(&self, id: &ClientIdentity, cost: u64) -> SetDecision {
        SetDecision {
            allowances: self.limiters.iter().map(|l| l.allow(id, false, cost)).collect(),
        }
    }

    /// Charge `cost` in every window that admits it.
    pub fn commit(&self, id: &ClientIdentity, cost: u64) -> SetDecision {
        SetDecision {
            allowances: self.limiters.iter().map(|l| l.allow(id, true, cost)).collect(),
        }
    }

    /// Record one request admitted through another path, in every window.
    pub fn allow_pass_check(&self, id: &ClientIdentity) {
        for limiter in &self.limiters {
            limiter.allow_pass(id);
        }
    }

    /// Remove every trace of `id`.
    pub fn prune(&self, id: &ClientIdentity) {
        let removed = self.limiters.iter().filter(|l| l.prune(id)).count();
        debug!(client = %id, windows = removed, "Pruned client from limiters");
    }

    /// Drop counters whose window elapsed, across all windows.
    pub fn sweep_expired(&self) -> usize {
        self.limiters.iter().map(|l| l.sweep_expired()).sum()
    }

    /// Current usage of `id` per window label.
    pub fn usage(&self, id: &ClientIdentity) -> Vec<(String, u64)> {
        self.limiters
            .iter()
            .map(|l| (l.spec().label.clone(), l.usage(id)))
            .collect()
    }

    /// Sweep elapsed counters every `interval` until `cancel` fires. A zero
    /// interval disables the sweep and spawns nothing.
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if interval.is_zero() {
            info!("Rate limit counter sweep disabled");
            return None;
        }
        let limiters = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiters.sweep_expired();
                        if removed > 0 {
                            debug!(removed, "Swept expired rate limit counters");
                        }
                    }
                }
            }
        }))
    }

    pub fn labels(&self) -> Vec<&str> {
        self.limiters.iter().map(|l| l.spec().label.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Persist every window's live counters, each with a TTL of its window.
    pub async fn save_cache(&self, store: &dyn SnapshotStore) -> Result<()> {
        for limiter in &self.limiters {
            let spec = limiter.spec();
            let entries = limiter.snapshot();
            let bytes = serde_json::to_vec(&entries)?;
            store
                .save_cache(&snapshot_key(&spec.label), bytes, spec.window)
                .await?;
            info!(window = %spec.label, entries = entries.len(), "Saved limiter snapshot");
        }
        Ok(())
    }

    /// Restore persisted counters, dropping entries whose window elapsed,
    /// then delete the snapshot so it is never applied twice.
    pub async fn load_from_cache(&self, store: &dyn SnapshotStore) -> Result<usize> {
        let mut total = 0;
        for limiter in &self.limiters {
            let key = snapshot_key(&limiter.spec().label);
            let Some(bytes) = store.get_cache(&key).await? else {
                continue;
            };

            let entries: Vec<SnapshotEntry> = serde_json::from_slice(&bytes)
                .map_err(|e| GatewayError::Snapshot(format!("{}: {}", key, e)))?;
            let restored = limiter.restore(entries);
            total += restored;

            if let Err(e) = store.delete(&key).await {
                warn!(key = %key, error = %e, "Failed to delete restored snapshot");
            }
            info!(window = %limiter.spec().label, restored, "Loaded limiter snapshot");
        }
        Ok(total)
    }
}

impl std::fmt::Debug for RateLimiterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterSet")
            .field("windows", &self.labels())
            .finish()
    }
}
