use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::status_sync::{StatusSource, SyncFailureKind};

/// Counters for the status probe chain, printed when a watch loop ends.
pub struct SyncStats {
    started_at: Instant,
    countdown_ok: AtomicU64,
    legacy_ok: AtomicU64,
    degraded: AtomicU64,
    timeouts: AtomicU64,
    rejected: AtomicU64,
    malformed: AtomicU64,
    network: AtomicU64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            countdown_ok: AtomicU64::new(0),
            legacy_ok: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            network: AtomicU64::new(0),
        }
    }

    pub fn bump_answer(&self, source: StatusSource) {
        let counter = match source {
            StatusSource::Countdown => &self.countdown_ok,
            StatusSource::Legacy => &self.legacy_ok,
            StatusSource::LocalEstimate => &self.degraded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_failure(&self, kind: SyncFailureKind) {
        let counter = match kind {
            SyncFailureKind::NetworkTimeout => &self.timeouts,
            SyncFailureKind::ServerRejected => &self.rejected,
            SyncFailureKind::MalformedResponse => &self.malformed,
            SyncFailureKind::Network => &self.network,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn answers(&self) -> u64 {
        self.countdown_ok.load(Ordering::Relaxed)
            + self.legacy_ok.load(Ordering::Relaxed)
            + self.degraded.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> String {
        format!(
            "{:.1}s elapsed | answers={} countdown={} legacy={} degraded={} | timeouts={} rejected={} malformed={} network={}",
            self.started_at.elapsed().as_secs_f64(),
            self.answers(),
            self.countdown_ok.load(Ordering::Relaxed),
            self.legacy_ok.load(Ordering::Relaxed),
            self.degraded.load(Ordering::Relaxed),
            self.timeouts.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
            self.malformed.load(Ordering::Relaxed),
            self.network.load(Ordering::Relaxed),
        )
    }

    pub fn print(&self) {
        println!("[sync] {}", self.summary());
    }
}

impl Default for SyncStats {
    fn default() -> Self {
        Self::new()
    }
}

/// `hh:mm:ss`; hours are not wrapped at 24.
pub fn format_countdown(remaining_seconds: i64) -> String {
    let secs = remaining_seconds.max(0);
    format!("{:02}:{:02}:{:02}", secs / 3_600, (secs % 3_600) / 60, secs % 60)
}

pub fn format_reward(reward: f64) -> String {
    format!("{reward:.8}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_formats_hours_minutes_seconds() {
        assert_eq!(format_countdown(86_400), "24:00:00");
        assert_eq!(format_countdown(3_661), "01:01:01");
        assert_eq!(format_countdown(59), "00:00:59");
        assert_eq!(format_countdown(-5), "00:00:00");
    }

    #[test]
    fn reward_prints_eight_decimals() {
        assert_eq!(format_reward(0.125), "0.12500000");
        assert_eq!(format_reward(0.0), "0.00000000");
    }

    #[test]
    fn stats_count_by_source_and_failure() {
        let stats = SyncStats::new();
        stats.bump_answer(StatusSource::Countdown);
        stats.bump_answer(StatusSource::LocalEstimate);
        stats.bump_failure(SyncFailureKind::NetworkTimeout);
        stats.bump_failure(SyncFailureKind::NetworkTimeout);
        assert_eq!(stats.answers(), 2);
        let summary = stats.summary();
        assert!(summary.contains("answers=2"));
        assert!(summary.contains("countdown=1"));
        assert!(summary.contains("degraded=1"));
        assert!(summary.contains("timeouts=2"));
    }
}
