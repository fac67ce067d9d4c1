//! Global admission limiter shared by all clients.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::clock::{Clock, SystemClock};

/// Bounds total admissions across every client within a sliding window.
///
/// The fast path takes tokens from an atomic counter with a compare-and-swap.
/// When that fails the slow path locks the admission queue, expires entries
/// older than the window, returns their tokens and retries.
pub struct AggregateLimiter {
    capacity: u64,
    window: Duration,
    available: AtomicU64,
    admitted: Mutex<VecDeque<DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl AggregateLimiter {
    pub fn new(capacity: u64, window: Duration) -> Self {
        Self::with_clock(capacity, window, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: u64, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity,
            window,
            available: AtomicU64::new(capacity),
            admitted: Mutex::new(VecDeque::with_capacity(capacity.min(1 << 16) as usize)),
            clock,
        }
    }

    /// Try to admit `cost` units.
    pub fn acquire(&self, cost: u64) -> bool {
        if cost == 0 {
            return true;
        }
        if cost > self.capacity {
            return false;
        }

        let available = self.available.load(Ordering::Acquire);
        if available >= cost
            && self
                .available
                .compare_exchange(available, available - cost, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let mut admitted = self.admitted.lock();
            let now = self.clock.now();
            admitted.extend(std::iter::repeat(now).take(cost as usize));
            return true;
        }

        let mut admitted = self.admitted.lock();
        let now = self.clock.now();
        self.expire(&mut admitted, now);

        if !self.take(cost) {
            debug!(
                in_flight = admitted.len(),
                cost,
                capacity = self.capacity,
                "Aggregate limiter saturated"
            );
            return false;
        }
        admitted.extend(std::iter::repeat(now).take(cost as usize));
        true
    }

    /// Admissions still inside the window.
    pub fn in_flight(&self) -> usize {
        let mut admitted = self.admitted.lock();
        let now = self.clock.now();
        self.expire(&mut admitted, now);
        admitted.len()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn take(&self, cost: u64) -> bool {
        let mut available = self.available.load(Ordering::Acquire);
        loop {
            if available < cost {
                return false;
            }
            match self.available.compare_exchange_weak(
                available,
                available - cost,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => available = actual,
            }
        }
    }

    /// Pop admissions older than the window and hand their tokens back.
    /// Tokens are conserved: available + queued + reserved == capacity.
    fn expire(&self, admitted: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
        let mut expired = 0u64;
        while let Some(front) = admitted.front() {
            let age = now
                .signed_duration_since(*front)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age < self.window {
                break;
            }
            admitted.pop_front();
            expired += 1;
        }
        if expired > 0 {
            self.available.fetch_add(expired, Ordering::AcqRel);
        }
    }
}
