//! Fixed-window counter and window specification.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Parse a window label such as `5s`, `1m`, `1h` or `24h` into its duration.
///
/// Supported units are `s`, `m`, `h` and `d`. Zero-width windows are rejected.
pub fn parse_window_label(label: &str) -> Option<Duration> {
    let label = label.trim();
    let split = label.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = label.split_at(split);
    let amount: u64 = amount.parse().ok()?;
    if amount == 0 {
        return None;
    }

    let unit_secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return None,
    };
    amount.checked_mul(unit_secs).map(Duration::from_secs)
}

/// Capacity, width and label of one limiter window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
    /// Maximum usage within one window
    pub capacity: u64,
    /// Window width
    pub window: Duration,
    /// Label used in headers and snapshot keys
    pub label: String,
}

impl WindowSpec {
    pub fn new(capacity: u64, window: Duration, label: impl Into<String>) -> Self {
        Self {
            capacity,
            window,
            label: label.into(),
        }
    }

    /// Build a spec from a label such as `1m`.
    pub fn from_label(label: &str, capacity: u64) -> Option<Self> {
        parse_window_label(label).map(|window| Self::new(capacity, window, label))
    }
}

/// Per-identity occupancy within the current fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    /// Usage charged in the current window
    pub count: u64,
    /// When the current window started
    pub window_start: DateTime<Utc>,
}

impl WindowCounter {
    /// A fresh counter whose window starts at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    /// Whether the window that started at `window_start` has elapsed by `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        // A clock that went backwards counts as no time elapsed.
        let elapsed = now
            .signed_duration_since(self.window_start)
            .to_std()
            .unwrap_or(Duration::ZERO);
        elapsed >= window
    }

    /// Reset lazily if the window elapsed.
    pub fn refresh(&mut self, now: DateTime<Utc>, window: Duration) {
        if self.is_expired(now, window) {
            self.count = 0;
            self.window_start = now;
        }
    }

    /// Time left until the current window resets.
    pub fn duration_until_reset(&self, now: DateTime<Utc>, window: Duration) -> Duration {
        let elapsed = now
            .signed_duration_since(self.window_start)
            .to_std()
            .unwrap_or(Duration::ZERO);
        window.saturating_sub(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_window_label() {
        assert_eq!(parse_window_label("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_window_label("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_window_label("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_window_label("24h"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_window_label("2d"), Some(Duration::from_secs(172_800)));
    }

    #[test]
    fn test_parse_window_label_invalid() {
        assert_eq!(parse_window_label(""), None);
        assert_eq!(parse_window_label("s"), None);
        assert_eq!(parse_window_label("10"), None);
        assert_eq!(parse_window_label("0s"), None);
        assert_eq!(parse_window_label("5w"), None);
        assert_eq!(parse_window_label("5ms"), None);
    }

    #[test]
    fn test_counter_refresh_resets_after_window() {
        let start = Utc::now();
        let window = Duration::from_secs(5);
        let mut counter = WindowCounter::new(start);
        counter.count = 4;

        counter.refresh(start + chrono::Duration::seconds(4), window);
        assert_eq!(counter.count, 4);

        let later = start + chrono::Duration::seconds(5);
        counter.refresh(later, window);
        assert_eq!(counter.count, 0);
        assert_eq!(counter.window_start, later);
    }

    #[test]
    fn test_counter_tolerates_clock_going_backwards() {
        let start = Utc::now();
        let counter = WindowCounter::new(start);
        let earlier = start - chrono::Duration::seconds(30);
        assert!(!counter.is_expired(earlier, Duration::from_secs(5)));
        assert_eq!(
            counter.duration_until_reset(earlier, Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }
}
