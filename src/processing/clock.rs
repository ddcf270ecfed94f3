use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock source in epoch milliseconds. Injected so the countdown can be
/// driven deterministically.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
pub(crate) use manual::ManualClock;
