use std::fmt::Debug;

use chrono::{DateTime, Utc};

/// Source of "now" for stores and periodic tasks.
///
/// Every timestamp the crate writes (lease start, retry time, heartbeat,
/// recurring last run) comes from a clock so tests can move time forward
/// without sleeping.
pub trait Clock: Send + Sync + Debug + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
