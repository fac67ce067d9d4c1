//! Rate limiting logic and state management.

mod aggregate;
mod backend;
pub mod clock;
mod counter;
mod limiter;
mod set;

pub use aggregate::AggregateLimiter;
pub use backend::{Allowance, SnapshotEntry, WindowLimiter};
pub use clock::{Clock, MockClock, SystemClock};
pub use counter::{parse_window_label, WindowCounter, WindowSpec};
pub use limiter::FixedWindowLimiter;
pub use set::{
    snapshot_key, RateLimiterSet, SetDecision, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
};
