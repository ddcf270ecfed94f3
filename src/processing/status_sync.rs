use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::api::{api_status_error, is_timeout_error, ApiClient};
use crate::config::StatusEndpoint;
use crate::types::round_reward;

use super::clock::Clock;
use super::display::SyncStats;
use super::estimator::estimate;
use super::state::{ProcessingState, SessionState};
use super::store::SessionStore;
use super::ui::{success, warn};

const OUTAGE_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StatusSource {
    Countdown,
    Legacy,
    LocalEstimate,
}

impl StatusSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Countdown => "countdown",
            Self::Legacy => "legacy",
            Self::LocalEstimate => "local",
        }
    }
}

/// One status answer, whatever endpoint produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusResult {
    pub active: bool,
    pub remaining_seconds: i64,
    pub accumulated_reward: f64,
    pub is_completed: bool,
    /// Set when no server answered and the values are a local estimate.
    pub degraded: bool,
    pub source: StatusSource,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SyncFailureKind {
    NetworkTimeout,
    ServerRejected,
    MalformedResponse,
    Network,
}

impl SyncFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkTimeout => "timeout",
            Self::ServerRejected => "rejected",
            Self::MalformedResponse => "malformed",
            Self::Network => "network",
        }
    }
}

/// A 2xx status reply that parsed but lacks the fields a status needs.
#[derive(Debug)]
struct MalformedStatus(&'static str);

impl fmt::Display for MalformedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed status reply: {}", self.0)
    }
}

impl std::error::Error for MalformedStatus {}

pub fn classify_failure(err: &anyhow::Error) -> SyncFailureKind {
    if is_timeout_error(err) {
        return SyncFailureKind::NetworkTimeout;
    }
    if api_status_error(err).is_some() {
        return SyncFailureKind::ServerRejected;
    }
    let malformed = err
        .chain()
        .any(|cause| cause.is::<serde_json::Error>() || cause.is::<MalformedStatus>());
    if malformed {
        SyncFailureKind::MalformedResponse
    } else {
        SyncFailureKind::Network
    }
}

#[derive(Default)]
struct OutageTracker {
    failures: u64,
    last_log_at: Option<Instant>,
    logged: bool,
}

impl OutageTracker {
    fn note_failure(&mut self, detail: &str) {
        let now = Instant::now();
        self.failures = self.failures.saturating_add(1);
        let should_log = self.failures == 1
            || self
                .last_log_at
                .is_none_or(|last| now.saturating_duration_since(last) >= OUTAGE_LOG_INTERVAL);
        if !should_log {
            return;
        }
        if self.failures == 1 {
            warn("SYNC", format!("status unavailable, using local estimate | {detail}"));
        } else {
            warn(
                "SYNC",
                format!("status still unavailable | failures={} {detail}", self.failures),
            );
        }
        self.last_log_at = Some(now);
        self.logged = true;
    }

    fn note_recovered(&mut self, source: StatusSource) {
        if self.failures > 0 && self.logged {
            success(
                "SYNC",
                format!(
                    "status recovered | source={} after failures={}",
                    source.as_str(),
                    self.failures
                ),
            );
        }
        *self = Self::default();
    }
}

/// Runs the status probe chain. Remote endpoints are tried in the configured
/// order; a local estimate answers when none of them does.
pub struct StatusSyncClient {
    api: ApiClient,
    candidates: Vec<StatusEndpoint>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    stats: Arc<SyncStats>,
    outage: Mutex<OutageTracker>,
}

impl StatusSyncClient {
    pub fn new(
        api: ApiClient,
        candidates: Vec<StatusEndpoint>,
        timeout: Duration,
        clock: Arc<dyn Clock>,
        stats: Arc<SyncStats>,
    ) -> Self {
        Self {
            api,
            candidates,
            timeout,
            clock,
            stats,
            outage: Mutex::new(OutageTracker::default()),
        }
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Probes without touching the session. Safe to run off the engine thread.
    pub fn probe(&self, session: &SessionState) -> StatusResult {
        let mut failures = Vec::with_capacity(self.candidates.len());
        for endpoint in &self.candidates {
            match self.probe_remote(*endpoint, session) {
                Ok(result) => {
                    self.stats.bump_answer(result.source);
                    lock(&self.outage).note_recovered(result.source);
                    return result;
                }
                Err(err) => {
                    let kind = classify_failure(&err);
                    self.stats.bump_failure(kind);
                    failures.push(failure_detail(*endpoint, kind, &err));
                }
            }
        }

        if !failures.is_empty() {
            lock(&self.outage).note_failure(&failures.join(" "));
        }
        let result = self.local_estimate(session);
        self.stats.bump_answer(result.source);
        result
    }

    /// Probes, folds the answer into `session` and persists it.
    pub fn fetch_status(&self, session: &mut SessionState, store: &SessionStore) -> StatusResult {
        let result = self.probe(session);
        self.commit(session, store, &result);
        result
    }

    pub fn commit(&self, session: &mut SessionState, store: &SessionStore, result: &StatusResult) {
        session.apply_status(result, self.clock.now_ms());
        if let Err(err) = store.save(session.user_id(), &session.to_persisted()) {
            warn("STORE", format!("failed to persist status | {err:#}"));
        }
    }

    /// Estimator-backed answer built from what the session already knows.
    pub fn local_estimate(&self, session: &SessionState) -> StatusResult {
        let now_ms = self.clock.now_ms();
        let active = session.state() == ProcessingState::Active;
        let accumulated = if active {
            session.estimate_at(now_ms).max(session.accumulated_reward())
        } else {
            session.accumulated_reward()
        };
        StatusResult {
            active,
            remaining_seconds: session.remaining_seconds(now_ms),
            accumulated_reward: round_reward(accumulated.clamp(0.0, session.total_reward())),
            is_completed: session.state() == ProcessingState::Completed,
            degraded: true,
            source: StatusSource::LocalEstimate,
        }
    }

    fn probe_remote(&self, endpoint: StatusEndpoint, session: &SessionState) -> Result<StatusResult> {
        let user_id = session.user_id();
        let (source, active, remaining, accumulated, is_completed) = match endpoint {
            StatusEndpoint::Countdown => {
                let resp = self.api.countdown_status(user_id, self.timeout)?;
                (
                    StatusSource::Countdown,
                    resp.processing_active,
                    resp.remaining_seconds,
                    resp.accumulated_reward,
                    resp.is_completed,
                )
            }
            StatusEndpoint::Legacy => {
                let resp = self.api.legacy_status(user_id, self.timeout)?;
                (
                    StatusSource::Legacy,
                    resp.processing_active,
                    resp.remaining_seconds,
                    resp.accumulated_reward,
                    None,
                )
            }
        };

        let active = active.ok_or_else(|| anyhow!(MalformedStatus("processing_active missing")))?;
        let remaining_seconds = match remaining {
            Some(secs) => secs.max(0.0).ceil() as i64,
            None if active => {
                return Err(anyhow!(MalformedStatus("remaining_seconds missing")));
            }
            None => 0,
        };
        let accumulated = match accumulated {
            Some(reward) => reward,
            None => self.fill_accumulated(session, active, remaining_seconds),
        };
        let known_cycle = session.start_time_ms().is_some();
        let is_completed =
            is_completed.unwrap_or(!active && remaining_seconds == 0 && known_cycle);

        Ok(StatusResult {
            active,
            remaining_seconds,
            accumulated_reward: round_reward(accumulated.clamp(0.0, session.total_reward())),
            is_completed,
            degraded: false,
            source,
        })
    }

    /// Server-side accumulated reward from `/processing/accumulated`.
    pub fn fetch_accumulated(&self, user_id: &str) -> Result<f64> {
        self.api
            .accumulated(user_id, self.timeout)?
            .accumulated_reward
            .ok_or_else(|| anyhow!(MalformedStatus("accumulatedReward missing")))
    }

    /// Reward for replies that do not carry one: the accumulated endpoint
    /// first, then an estimate over the window the server just reported.
    fn fill_accumulated(&self, session: &SessionState, active: bool, remaining_seconds: i64) -> f64 {
        if let Ok(reward) = self.fetch_accumulated(session.user_id()) {
            return reward;
        }

        let now_ms = self.clock.now_ms();
        if active && remaining_seconds > 0 {
            let end_ms = now_ms.saturating_add(remaining_seconds.saturating_mul(1_000));
            let start_ms = end_ms.saturating_sub(session.duration_secs().saturating_mul(1_000));
            return estimate(start_ms, end_ms, session.total_reward(), now_ms);
        }
        session.estimate_at(now_ms)
    }
}

fn failure_detail(endpoint: StatusEndpoint, kind: SyncFailureKind, err: &anyhow::Error) -> String {
    match api_status_error(err) {
        Some(status_err) => format!(
            "{}={}({})",
            endpoint.as_str(),
            kind.as_str(),
            status_err.status().as_u16()
        ),
        None => format!("{}={}", endpoint.as_str(), kind.as_str()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
