//! Origin selection.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

/// One origin and its live bookkeeping.
#[derive(Debug)]
pub struct UpstreamTarget {
    url: String,
    active: AtomicUsize,
    fail_count: AtomicU32,
    last_alive_at: AtomicI64,
}

impl UpstreamTarget {
    fn new(url: String) -> Self {
        Self {
            url,
            active: AtomicUsize::new(0),
            fail_count: AtomicU32::new(0),
            last_alive_at: AtomicI64::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count.load(Ordering::Acquire)
    }

    /// Unix seconds of the last successful exchange, 0 if none yet.
    pub fn last_alive_at(&self) -> i64 {
        self.last_alive_at.load(Ordering::Acquire)
    }
}

/// A picked target. Holds one active connection until released or dropped.
#[derive(Debug)]
pub struct UpstreamLease {
    target: Arc<UpstreamTarget>,
    released: bool,
}

impl UpstreamLease {
    pub fn url(&self) -> &str {
        self.target.url()
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }
}

impl Drop for UpstreamLease {
    fn drop(&mut self) {
        if !self.released {
            self.target.active.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Least-connection pool over the configured origins.
///
/// Targets whose failure count exceeds `max_fails` are skipped until a
/// success or [`UpstreamPool::reset_failures`] clears them. With a single
/// origin the pool always returns it.
#[derive(Debug, Clone)]
pub struct UpstreamPool {
    targets: Arc<[Arc<UpstreamTarget>]>,
    max_fails: u32,
}

impl UpstreamPool {
    pub fn new(urls: &[String], max_fails: u32) -> Result<Self> {
        if urls.is_empty() {
            return Err(GatewayError::Config(
                "at least one origin is required".to_string(),
            ));
        }
        let targets: Vec<_> = urls
            .iter()
            .map(|url| Arc::new(UpstreamTarget::new(url.trim_end_matches('/').to_string())))
            .collect();
        Ok(Self {
            targets: targets.into(),
            max_fails,
        })
    }

    /// Lease the eligible target with the fewest active connections. When
    /// every target is excluded, fall back to the one with the fewest failures.
    pub fn pick(&self) -> UpstreamLease {
        let eligible = self
            .targets
            .iter()
            .filter(|t| t.fail_count() <= self.max_fails)
            .min_by_key(|t| t.active());

        let target = match eligible {
            Some(target) => target,
            None => {
                // targets is never empty
                let fallback = self
                    .targets
                    .iter()
                    .min_by_key(|t| t.fail_count())
                    .unwrap_or(&self.targets[0]);
                warn!(upstream = %fallback.url, "Every origin is failing, using the least failed");
                fallback
            }
        };

        target.active.fetch_add(1, Ordering::AcqRel);
        UpstreamLease {
            target: target.clone(),
            released: false,
        }
    }

    /// Return the lease's connection slot.
    pub fn release(&self, mut lease: UpstreamLease) {
        lease.target.active.fetch_sub(1, Ordering::AcqRel);
        lease.released = true;
    }

    pub fn record_failure(&self, lease: &UpstreamLease) {
        let fails = lease.target.fail_count.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(upstream = %lease.url(), fails, "Origin request failed");
    }

    pub fn record_success(&self, lease: &UpstreamLease) {
        let previous = lease.target.fail_count.swap(0, Ordering::AcqRel);
        lease
            .target
            .last_alive_at
            .store(Utc::now().timestamp(), Ordering::Release);
        if previous > 0 {
            debug!(upstream = %lease.url(), previous, "Origin recovered");
        }
    }

    /// Clear every failure count.
    pub fn reset_failures(&self) {
        for target in self.targets.iter() {
            target.fail_count.store(0, Ordering::Release);
        }
    }

    pub fn targets(&self) -> &[Arc<UpstreamTarget>] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
