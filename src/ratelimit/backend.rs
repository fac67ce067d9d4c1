//! Per-identity limiter trait.

use serde::{Deserialize, Serialize};

use super::counter::WindowSpec;
use crate::identity::ClientIdentity;

/// Result of asking one limiter about one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowance {
    /// Whether the request fits
    pub allowed: bool,
    /// Usage in the current window (after the charge when committed)
    pub used: u64,
    /// Window capacity
    pub limit: u64,
    /// Window label, e.g. `5s`
    pub window_label: String,
}

impl Allowance {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

/// Persisted form of one identity's counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Identity key
    pub ip: String,
    /// Window start, unix milliseconds
    pub window_start_ms: i64,
    /// Usage charged in that window
    pub count: u64,
}

/// A single-window limiter keyed by client identity.
///
/// This trait is the seam for swapping the accounting strategy; the gateway
/// ships the fixed-window counter (`FixedWindowLimiter`).
pub trait WindowLimiter: Send + Sync {
    /// Window this limiter enforces.
    fn spec(&self) -> &WindowSpec;

    /// Check (`commit = false`) or charge (`commit = true`) `cost` for `id`.
    fn allow(&self, id: &ClientIdentity, commit: bool, cost: u64) -> Allowance;

    /// Charge one unit for a request admitted elsewhere, without checking.
    fn allow_pass(&self, id: &ClientIdentity);

    /// Forget `id` entirely. Returns whether it was tracked.
    fn prune(&self, id: &ClientIdentity) -> bool;

    /// Drop counters whose window has elapsed. Returns how many were removed.
    fn sweep_expired(&self) -> usize;

    /// Current usage of `id` (zero when untracked), after any lazy reset.
    fn usage(&self, id: &ClientIdentity) -> u64;

    /// Live counters, skipping those whose window already elapsed.
    fn snapshot(&self) -> Vec<SnapshotEntry>;

    /// Reinsert persisted counters, dropping those whose window elapsed.
    /// Returns how many were restored.
    fn restore(&self, entries: Vec<SnapshotEntry>) -> usize;

    /// Number of tracked identities.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
