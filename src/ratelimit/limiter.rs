//! Fixed-window per-identity limiter.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::{Allowance, SnapshotEntry, WindowLimiter};
use super::clock::{Clock, SystemClock};
use super::counter::{WindowCounter, WindowSpec};
use crate::identity::ClientIdentity;

/// One window-width tracker keyed by client identity.
///
/// A single lock guards the identity map; it is held only for the O(1) map
/// operation of each call. Counters reset lazily on the first access after
/// their window elapsed.
pub struct FixedWindowLimiter {
    spec: WindowSpec,
    counters: Mutex<HashMap<ClientIdentity, WindowCounter>>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    /// Create a limiter driven by the system clock.
    pub fn new(spec: WindowSpec) -> Self {
        Self::with_clock(spec, Arc::new(SystemClock))
    }

    pub fn with_clock(spec: WindowSpec, clock: Arc<dyn Clock>) -> Self {
        Self {
            spec,
            counters: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn alive(&self, counter: &WindowCounter, now: DateTime<Utc>) -> bool {
        !counter.is_expired(now, self.spec.window)
    }
}

impl WindowLimiter for FixedWindowLimiter {
    fn spec(&self) -> &WindowSpec {
        &self.spec
    }

    fn allow(&self, id: &ClientIdentity, commit: bool, cost: u64) -> Allowance {
        let now = self.clock.now();
        let capacity = self.spec.capacity;

        let (allowed, used) = {
            let mut counters = self.counters.lock();
            let counter = counters
                .entry(id.clone())
                .or_insert_with(|| WindowCounter::new(now));
            counter.refresh(now, self.spec.window);

            let fits = counter.count.saturating_add(cost) < capacity;
            if commit && fits {
                counter.count += cost;
            }
            (fits, counter.count)
        };

        if allowed {
            trace!(client = %id, window = %self.spec.label, used, commit, "Allowance granted");
        } else {
            debug!(
                client = %id,
                window = %self.spec.label,
                used,
                cost,
                limit = capacity,
                "Rate limit exceeded"
            );
        }

        Allowance {
            allowed,
            used,
            limit: capacity,
            window_label: self.spec.label.clone(),
        }
    }

    fn allow_pass(&self, id: &ClientIdentity) {
        let now = self.clock.now();
        let mut counters = self.counters.lock();
        let counter = counters
            .entry(id.clone())
            .or_insert_with(|| WindowCounter::new(now));
        counter.refresh(now, self.spec.window);
        counter.count = counter.count.saturating_add(1);
    }

    fn prune(&self, id: &ClientIdentity) -> bool {
        self.counters.lock().remove(id).is_some()
    }

    fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut counters = self.counters.lock();
        let before = counters.len();
        counters.retain(|_, counter| !counter.is_expired(now, self.spec.window));
        before - counters.len()
    }

    fn usage(&self, id: &ClientIdentity) -> u64 {
        let now = self.clock.now();
        let mut counters = self.counters.lock();
        match counters.get_mut(id) {
            Some(counter) => {
                counter.refresh(now, self.spec.window);
                counter.count
            }
            None => 0,
        }
    }

    fn snapshot(&self) -> Vec<SnapshotEntry> {
        let now = self.clock.now();
        let counters = self.counters.lock();
        counters
            .iter()
            .filter(|(_, counter)| self.alive(counter, now))
            .map(|(id, counter)| SnapshotEntry {
                ip: id.as_str().to_string(),
                window_start_ms: counter.window_start.timestamp_millis(),
                count: counter.count,
            })
            .collect()
    }

    fn restore(&self, entries: Vec<SnapshotEntry>) -> usize {
        let now = self.clock.now();
        let mut restored = 0;
        let mut counters = self.counters.lock();

        for entry in entries {
            let Some(window_start) = DateTime::<Utc>::from_timestamp_millis(entry.window_start_ms)
            else {
                continue;
            };
            let counter = WindowCounter {
                count: entry.count,
                window_start,
            };
            if !self.alive(&counter, now) {
                continue;
            }
            counters.insert(ClientIdentity::from_key(&entry.ip), counter);
            restored += 1;
        }

        debug!(window = %self.spec.label, restored, "Restored limiter counters");
        restored
    }

    fn len(&self) -> usize {
        self.counters.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::MockClock;
    use std::time::Duration;

    fn limiter(capacity: u64, secs: u64) -> (FixedWindowLimiter, MockClock) {
        let clock = MockClock::default();
        let spec = WindowSpec::new(capacity, Duration::from_secs(secs), format!("{secs}s"));
        (
            FixedWindowLimiter::with_clock(spec, Arc::new(clock.clone())),
            clock,
        )
    }

    fn id(ip: &str) -> ClientIdentity {
        ClientIdentity::from_ip(ip.parse().unwrap())
    }

    #[test]
    fn test_limiter_creation() {
        let (limiter, _) = limiter(10, 5);
        assert_eq!(limiter.len(), 0);
        assert_eq!(limiter.spec().label, "5s");
    }

    #[test]
    fn test_commit_charges_cost() {
        let (limiter, _) = limiter(10, 5);
        let client = id("192.0.2.1");

        let a = limiter.allow(&client, true, 3);
        assert!(a.allowed);
        assert_eq!(a.used, 3);
        assert_eq!(a.remaining(), 7);
        assert_eq!(limiter.usage(&client), 3);
    }

    #[test]
    fn test_commit_is_rejected_at_capacity() {
        let (limiter, _) = limiter(5, 5);
        let client = id("192.0.2.1");

        // used + cost must stay strictly below capacity
        for _ in 0..4 {
            assert!(limiter.allow(&client, true, 1).allowed);
        }
        let denied = limiter.allow(&client, true, 1);
        assert!(!denied.allowed);
        assert_eq!(denied.used, 4);
        assert_eq!(limiter.usage(&client), 4);
    }

    #[test]
    fn test_check_only_never_mutates() {
        let (limiter, _) = limiter(10, 5);
        let client = id("192.0.2.1");
        limiter.allow(&client, true, 2);

        for _ in 0..20 {
            let a = limiter.allow(&client, false, 5);
            assert!(a.allowed);
            assert_eq!(a.used, 2);
        }
        assert_eq!(limiter.usage(&client), 2);
    }

    #[test]
    fn test_window_resets_after_elapsing() {
        let (limiter, clock) = limiter(5, 5);
        let client = id("192.0.2.1");
        for _ in 0..4 {
            limiter.allow(&client, true, 1);
        }
        assert!(!limiter.allow(&client, true, 1).allowed);

        clock.advance(Duration::from_secs(5));
        let check = limiter.allow(&client, false, 1);
        assert_eq!(check.used, 0);
        assert!(check.allowed);
    }

    #[test]
    fn test_identities_are_independent() {
        let (limiter, _) = limiter(10, 5);
        limiter.allow(&id("192.0.2.1"), true, 5);
        limiter.allow(&id("192.0.2.2"), true, 3);

        assert_eq!(limiter.usage(&id("192.0.2.1")), 5);
        assert_eq!(limiter.usage(&id("192.0.2.2")), 3);
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_allow_pass_increments_unconditionally() {
        let (limiter, _) = limiter(2, 5);
        let client = id("192.0.2.1");
        limiter.allow_pass(&client);
        limiter.allow_pass(&client);
        limiter.allow_pass(&client);
        assert_eq!(limiter.usage(&client), 3);
    }

    #[test]
    fn test_prune_forgets_identity() {
        let (limiter, clock) = limiter(10, 5);
        let client = id("192.0.2.1");
        limiter.allow(&client, true, 4);
        clock.advance(Duration::from_secs(3));

        assert!(limiter.prune(&client));
        assert!(!limiter.prune(&client));
        assert_eq!(limiter.len(), 0);

        // Next access starts a brand new window at the current time.
        limiter.allow(&client, true, 1);
        clock.advance(Duration::from_secs(3));
        assert_eq!(limiter.usage(&client), 1);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (limiter, clock) = limiter(10, 5);
        limiter.allow(&id("192.0.2.1"), true, 1);
        clock.advance(Duration::from_secs(3));
        limiter.allow(&id("192.0.2.2"), true, 1);
        clock.advance(Duration::from_secs(3));

        assert_eq!(limiter.sweep_expired(), 1);
        assert_eq!(limiter.len(), 1);
        assert_eq!(limiter.usage(&id("192.0.2.2")), 1);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let (source, clock) = limiter(10, 60);
        source.allow(&id("192.0.2.1"), true, 4);
        source.allow(&id("192.0.2.2"), true, 7);
        let entries = source.snapshot();
        assert_eq!(entries.len(), 2);

        let target = FixedWindowLimiter::with_clock(
            source.spec().clone(),
            Arc::new(clock.clone()),
        );
        assert_eq!(target.restore(entries), 2);
        assert_eq!(target.usage(&id("192.0.2.1")), 4);
        assert_eq!(target.usage(&id("192.0.2.2")), 7);
    }

    #[test]
    fn test_restore_drops_elapsed_entries() {
        let (limiter, clock) = limiter(10, 60);
        let now = clock.now();
        let entries = vec![
            SnapshotEntry {
                ip: "192.0.2.1".to_string(),
                window_start_ms: (now - chrono::Duration::seconds(61)).timestamp_millis(),
                count: 5,
            },
            SnapshotEntry {
                ip: "192.0.2.2".to_string(),
                window_start_ms: (now - chrono::Duration::seconds(10)).timestamp_millis(),
                count: 5,
            },
        ];

        assert_eq!(limiter.restore(entries), 1);
        assert_eq!(limiter.len(), 1);
        assert_eq!(limiter.usage(&id("192.0.2.2")), 5);
    }
}
