//! Wall-clock timestamps driven by the runtime timer

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// UTC time anchored once and advanced by tokio's monotonic clock
///
/// Persisted deadlines are UTC timestamps, but they are compared against a
/// clock that moves with `tokio::time`, so a paused or auto-advanced runtime
/// sees wait windows expire.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_utc: DateTime<Utc>,
    anchor: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            anchor_utc: Utc::now(),
            anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.anchor.elapsed()).unwrap_or_default();
        self.anchor_utc + elapsed
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
