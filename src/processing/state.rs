use serde::{Deserialize, Serialize};

use crate::types::round_reward;

use super::estimator::{estimate, extrapolate};
use super::status_sync::StatusResult;
use super::store::{PersistedSession, PERSISTED_SCHEMA_VERSION};

/// Length of one processing cycle.
pub const CYCLE_DURATION_SECS: i64 = 86_400;

/// Reward cap for a full cycle.
pub const CYCLE_TOTAL_REWARD: f64 = 0.25;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Idle,
    Active,
    Cooldown,
    Completed,
}

impl ProcessingState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Cooldown => "cooldown",
            Self::Completed => "completed",
        }
    }
}

/// The one live processing session for a user. Only the engine mutates it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    user_id: String,
    state: ProcessingState,
    start_time_ms: Option<i64>,
    end_time_ms: Option<i64>,
    cooldown_end_ms: Option<i64>,
    duration_secs: i64,
    total_reward: f64,
    accumulated_reward: f64,
    synced_reward: Option<f64>,
    last_synced_at_ms: Option<i64>,
    pending_credit: f64,
    finalized: bool,
    completion_saved: bool,
}

impl SessionState {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            state: ProcessingState::Idle,
            start_time_ms: None,
            end_time_ms: None,
            cooldown_end_ms: None,
            duration_secs: CYCLE_DURATION_SECS,
            total_reward: CYCLE_TOTAL_REWARD,
            accumulated_reward: 0.0,
            synced_reward: None,
            last_synced_at_ms: None,
            pending_credit: 0.0,
            finalized: false,
            completion_saved: false,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> ProcessingState {
        self.state
    }

    pub fn start_time_ms(&self) -> Option<i64> {
        self.start_time_ms
    }

    #[cfg(test)]
    pub fn end_time_ms(&self) -> Option<i64> {
        self.end_time_ms
    }

    pub fn cooldown_end_ms(&self) -> Option<i64> {
        self.cooldown_end_ms
    }

    pub fn duration_secs(&self) -> i64 {
        self.duration_secs
    }

    pub fn total_reward(&self) -> f64 {
        self.total_reward
    }

    pub fn accumulated_reward(&self) -> f64 {
        self.accumulated_reward
    }

    #[cfg(test)]
    pub fn last_synced_at_ms(&self) -> Option<i64> {
        self.last_synced_at_ms
    }

    pub fn pending_credit(&self) -> f64 {
        self.pending_credit
    }

    #[cfg(test)]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn completion_saved(&self) -> bool {
        self.completion_saved
    }

    fn duration_ms(&self) -> i64 {
        self.duration_secs.saturating_mul(1_000)
    }

    /// Whole seconds left in the active cycle, rounded up. Zero outside one.
    pub fn remaining_seconds(&self, now_ms: i64) -> i64 {
        if self.state != ProcessingState::Active {
            return 0;
        }
        let Some(end_ms) = self.end_time_ms else {
            return 0;
        };
        ceil_seconds(end_ms.saturating_sub(now_ms))
    }

    pub fn cooldown_remaining_seconds(&self, now_ms: i64) -> i64 {
        match (self.state, self.cooldown_end_ms) {
            (ProcessingState::Cooldown, Some(end_ms)) => ceil_seconds(end_ms.saturating_sub(now_ms)),
            _ => 0,
        }
    }

    pub fn is_cooling_down(&self, now_ms: i64) -> bool {
        self.cooldown_remaining_seconds(now_ms) > 0
    }

    /// Local view of the reward at `now_ms`: extrapolated from the last server
    /// value when there is one, otherwise proportional to elapsed time.
    pub fn estimate_at(&self, now_ms: i64) -> f64 {
        if self.state != ProcessingState::Active {
            return self.accumulated_reward;
        }
        let (Some(start_ms), Some(end_ms)) = (self.start_time_ms, self.end_time_ms) else {
            return self.accumulated_reward;
        };
        match (self.synced_reward, self.last_synced_at_ms) {
            (Some(anchor), Some(anchor_at)) => {
                extrapolate(anchor, anchor_at, start_ms, end_ms, self.total_reward, now_ms)
            }
            _ => estimate(start_ms, end_ms, self.total_reward, now_ms),
        }
    }

    /// Moves the displayed reward forward to the local estimate. Never lowers it.
    pub fn refresh_estimate(&mut self, now_ms: i64) {
        if self.state != ProcessingState::Active {
            return;
        }
        let estimated = self.estimate_at(now_ms);
        if estimated > self.accumulated_reward {
            self.accumulated_reward = estimated.min(self.total_reward);
        }
    }

    /// Opens a fresh cycle starting at `now_ms`. Any credit still owed from an
    /// earlier cycle is kept in `pending_credit`.
    pub fn begin_cycle(&mut self, now_ms: i64) {
        if self.state == ProcessingState::Completed {
            self.pending_credit = round_reward(self.pending_credit + self.accumulated_reward);
        }
        self.state = ProcessingState::Active;
        self.start_time_ms = Some(now_ms);
        self.end_time_ms = Some(now_ms.saturating_add(self.duration_ms()));
        self.cooldown_end_ms = None;
        self.accumulated_reward = 0.0;
        self.synced_reward = None;
        self.last_synced_at_ms = None;
        self.finalized = false;
        self.completion_saved = false;
    }

    /// Re-anchors the cycle window on a server-reported remaining time.
    pub fn anchor_remaining(&mut self, now_ms: i64, remaining_seconds: i64) {
        let end_ms = now_ms.saturating_add(remaining_seconds.max(0).saturating_mul(1_000));
        self.end_time_ms = Some(end_ms);
        self.start_time_ms = Some(end_ms.saturating_sub(self.duration_ms()));
    }

    /// Folds a normalized status result into the session.
    ///
    /// Authoritative results replace any local estimate; a server value lower
    /// than an earlier server value of the same cycle is ignored. Degraded
    /// results are estimates and only move the value forward.
    pub fn apply_status(&mut self, status: &StatusResult, now_ms: i64) {
        if status.degraded {
            if self.state == ProcessingState::Active {
                self.raise_accumulated(status.accumulated_reward);
            }
            return;
        }

        match self.state {
            ProcessingState::Completed => return,
            ProcessingState::Idle | ProcessingState::Cooldown => {
                if !status.active || status.remaining_seconds <= 0 {
                    return;
                }
                // The server knows about a cycle this client lost track of.
                self.state = ProcessingState::Active;
                self.cooldown_end_ms = None;
                self.finalized = false;
                self.completion_saved = false;
                self.accumulated_reward = 0.0;
                self.synced_reward = None;
            }
            ProcessingState::Active => {}
        }

        if status.active && status.remaining_seconds > 0 {
            self.anchor_remaining(now_ms, status.remaining_seconds);
        } else if status.is_completed || !status.active {
            let end_ms = self.end_time_ms.map_or(now_ms, |end_ms| end_ms.min(now_ms));
            self.end_time_ms = Some(end_ms);
            if self.start_time_ms.is_none_or(|start_ms| start_ms >= end_ms) {
                self.start_time_ms = Some(end_ms.saturating_sub(self.duration_ms()));
            }
        }

        let server_reward = clamp_reward(status.accumulated_reward, self.total_reward);
        let confirmed = match self.synced_reward {
            Some(previous) if server_reward < previous => previous,
            _ => server_reward,
        };
        self.accumulated_reward = confirmed;
        self.synced_reward = Some(confirmed);
        self.last_synced_at_ms = Some(now_ms);
    }

    /// Server-side refresh of the reward alone (`/processing/accumulated`).
    pub fn apply_accumulated(&mut self, reward: f64, now_ms: i64) {
        if self.state != ProcessingState::Active {
            return;
        }
        let reward = clamp_reward(reward, self.total_reward);
        if self.synced_reward.is_some_and(|previous| reward < previous) {
            return;
        }
        self.accumulated_reward = reward;
        self.synced_reward = Some(reward);
        self.last_synced_at_ms = Some(now_ms);
    }

    fn raise_accumulated(&mut self, reward: f64) {
        let reward = clamp_reward(reward, self.total_reward);
        if reward > self.accumulated_reward {
            self.accumulated_reward = reward;
        }
    }

    /// Freezes the cycle at `final_reward`. Returns `false` when this cycle was
    /// already finalized, in which case nothing changes.
    pub fn mark_completed(&mut self, final_reward: f64) -> bool {
        if self.finalized {
            return false;
        }
        self.finalized = true;
        self.state = ProcessingState::Completed;
        self.accumulated_reward = round_reward(clamp_reward(final_reward, self.total_reward));
        self.completion_saved = false;
        true
    }

    pub fn set_completion_saved(&mut self, saved: bool) {
        self.completion_saved = saved;
    }

    /// Reward waiting to be credited: the finalized cycle plus anything
    /// deferred from earlier launches.
    pub fn creditable_reward(&self) -> f64 {
        let completed = if self.state == ProcessingState::Completed {
            self.accumulated_reward
        } else {
            0.0
        };
        round_reward(completed + self.pending_credit)
    }

    /// Called once the server confirmed the credit transfer.
    pub fn clear_credited(&mut self) {
        self.pending_credit = 0.0;
        if self.state == ProcessingState::Completed {
            self.accumulated_reward = 0.0;
            self.state = ProcessingState::Idle;
        }
    }

    pub fn enter_cooldown(&mut self, cooldown_end_ms: i64) {
        if self.state == ProcessingState::Completed {
            self.pending_credit = round_reward(self.pending_credit + self.accumulated_reward);
            self.accumulated_reward = 0.0;
        }
        self.state = ProcessingState::Cooldown;
        self.cooldown_end_ms = Some(cooldown_end_ms);
    }

    /// Leaves an elapsed cooldown window.
    pub fn expire_cooldown(&mut self, now_ms: i64) -> bool {
        if self.state != ProcessingState::Cooldown || self.is_cooling_down(now_ms) {
            return false;
        }
        self.state = ProcessingState::Idle;
        self.cooldown_end_ms = None;
        true
    }

    pub fn to_persisted(&self) -> PersistedSession {
        PersistedSession {
            schema_version: PERSISTED_SCHEMA_VERSION,
            user_id: self.user_id.clone(),
            processing_active: self.state == ProcessingState::Active,
            processing_start_time: self.start_time_ms,
            processing_end_time: self.end_time_ms,
            processing_accumulated: self.accumulated_reward,
            processing_completed: self.state == ProcessingState::Completed,
            processing_cooldown_end_time: self.cooldown_end_ms,
            processing_pending_credit: self.pending_credit,
            processing_completion_saved: self.completion_saved,
            processing_last_synced_at: self.last_synced_at_ms,
            processing_synced_reward: self.synced_reward,
        }
    }

    /// Rebuilds a session from its persisted record. Records that break the
    /// session invariants fall back to `idle`, keeping only owed credit.
    pub fn from_persisted(user_id: impl Into<String>, record: &PersistedSession) -> Self {
        let mut session = Self::new(user_id);
        session.pending_credit = clamp_credit(record.processing_pending_credit);

        let window = match (record.processing_start_time, record.processing_end_time) {
            (Some(start_ms), Some(end_ms)) if end_ms > start_ms => Some((start_ms, end_ms)),
            _ => None,
        };

        if record.processing_completed {
            session.state = ProcessingState::Completed;
            session.finalized = true;
            session.completion_saved = record.processing_completion_saved;
            session.accumulated_reward =
                clamp_reward(record.processing_accumulated, session.total_reward);
            if let Some((start_ms, end_ms)) = window {
                session.start_time_ms = Some(start_ms);
                session.end_time_ms = Some(end_ms);
            }
        } else if record.processing_active {
            let Some((start_ms, end_ms)) = window else {
                return session;
            };
            session.state = ProcessingState::Active;
            session.start_time_ms = Some(start_ms);
            session.end_time_ms = Some(end_ms);
            session.accumulated_reward =
                clamp_reward(record.processing_accumulated, session.total_reward);
            if let (Some(reward), Some(at)) = (
                record.processing_synced_reward,
                record.processing_last_synced_at,
            ) {
                session.synced_reward = Some(clamp_reward(reward, session.total_reward));
                session.last_synced_at_ms = Some(at);
            }
        } else if let Some(cooldown_end_ms) = record.processing_cooldown_end_time {
            session.state = ProcessingState::Cooldown;
            session.cooldown_end_ms = Some(cooldown_end_ms);
        }

        session
    }
}

fn ceil_seconds(ms: i64) -> i64 {
    if ms <= 0 {
        return 0;
    }
    ms.saturating_add(999) / 1_000
}

fn clamp_reward(reward: f64, total: f64) -> f64 {
    if reward.is_finite() {
        reward.clamp(0.0, total)
    } else {
        0.0
    }
}

fn clamp_credit(reward: f64) -> f64 {
    if reward.is_finite() && reward > 0.0 {
        round_reward(reward)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::status_sync::StatusSource;

    const T0: i64 = 1_700_000_000_000;
    const DAY_MS: i64 = 86_400_000;

    fn server_status(active: bool, remaining_seconds: i64, reward: f64) -> StatusResult {
        StatusResult {
            active,
            remaining_seconds,
            accumulated_reward: reward,
            is_completed: !active && remaining_seconds == 0,
            degraded: false,
            source: StatusSource::Countdown,
        }
    }

    fn active_session() -> SessionState {
        let mut session = SessionState::new("42");
        session.begin_cycle(T0);
        session
    }

    #[test]
    fn begin_cycle_opens_a_full_window() {
        let session = active_session();
        assert_eq!(session.state(), ProcessingState::Active);
        assert_eq!(session.start_time_ms(), Some(T0));
        assert_eq!(session.end_time_ms(), Some(T0 + DAY_MS));
        assert_eq!(session.remaining_seconds(T0), 86_400);
        assert_eq!(session.remaining_seconds(T0 + 500), 86_400);
        assert_eq!(session.remaining_seconds(T0 + DAY_MS + 1), 0);
        assert_eq!(session.accumulated_reward(), 0.0);
    }

    #[test]
    fn server_value_replaces_estimate_and_is_not_reverted() {
        let mut session = active_session();
        let half = T0 + DAY_MS / 2;
        session.refresh_estimate(half);
        assert!((session.accumulated_reward() - 0.125).abs() < 1e-12);

        session.apply_status(&server_status(true, 43_200, 0.130), half);
        assert_eq!(session.accumulated_reward(), 0.130);

        session.refresh_estimate(half + 1_000);
        assert!(session.accumulated_reward() >= 0.130);
    }

    #[test]
    fn lower_server_value_than_previous_sync_is_ignored() {
        let mut session = active_session();
        session.apply_status(&server_status(true, 40_000, 0.14), T0 + 46_400_000);
        session.apply_status(&server_status(true, 39_000, 0.10), T0 + 47_400_000);
        assert_eq!(session.accumulated_reward(), 0.14);
    }

    #[test]
    fn degraded_status_only_moves_forward() {
        let mut session = active_session();
        session.apply_status(&server_status(true, 43_200, 0.13), T0 + DAY_MS / 2);
        let mut degraded = server_status(true, 43_000, 0.12);
        degraded.degraded = true;
        degraded.source = StatusSource::LocalEstimate;
        session.apply_status(&degraded, T0 + DAY_MS / 2 + 200_000);
        assert_eq!(session.accumulated_reward(), 0.13);
        assert_eq!(session.last_synced_at_ms(), Some(T0 + DAY_MS / 2));
    }

    #[test]
    fn server_remaining_reanchors_window() {
        let mut session = active_session();
        session.apply_status(&server_status(true, 100, 0.2), T0 + 1_000);
        assert_eq!(session.end_time_ms(), Some(T0 + 101_000));
        assert_eq!(session.start_time_ms(), Some(T0 + 101_000 - DAY_MS));
        assert_eq!(session.remaining_seconds(T0 + 1_000), 100);
    }

    #[test]
    fn mark_completed_runs_once() {
        let mut session = active_session();
        assert!(session.mark_completed(0.25));
        assert_eq!(session.state(), ProcessingState::Completed);
        assert!(!session.mark_completed(0.01));
        assert_eq!(session.accumulated_reward(), 0.25);
    }

    #[test]
    fn mark_completed_clamps_to_cap() {
        let mut session = active_session();
        session.mark_completed(3.0);
        assert_eq!(session.accumulated_reward(), CYCLE_TOTAL_REWARD);
    }

    #[test]
    fn completed_session_ignores_server_updates() {
        let mut session = active_session();
        session.mark_completed(0.25);
        session.apply_status(&server_status(true, 500, 0.01), T0 + DAY_MS + 10);
        assert_eq!(session.state(), ProcessingState::Completed);
        assert_eq!(session.accumulated_reward(), 0.25);
    }

    #[test]
    fn begin_cycle_carries_uncredited_reward() {
        let mut session = active_session();
        session.mark_completed(0.25);
        session.begin_cycle(T0 + DAY_MS + 5_000);
        assert_eq!(session.pending_credit(), 0.25);
        assert_eq!(session.accumulated_reward(), 0.0);
        assert!(!session.is_finalized());
        assert_eq!(session.creditable_reward(), 0.25);
    }

    #[test]
    fn clear_credited_resets_completed_session() {
        let mut session = active_session();
        session.mark_completed(0.25);
        assert_eq!(session.creditable_reward(), 0.25);
        session.clear_credited();
        assert_eq!(session.state(), ProcessingState::Idle);
        assert_eq!(session.creditable_reward(), 0.0);
    }

    #[test]
    fn cooldown_expires_into_idle() {
        let mut session = SessionState::new("42");
        session.enter_cooldown(T0 + 60_000);
        assert!(session.is_cooling_down(T0));
        assert_eq!(session.cooldown_remaining_seconds(T0), 60);
        assert!(!session.expire_cooldown(T0 + 59_000));
        assert!(session.expire_cooldown(T0 + 60_000));
        assert_eq!(session.state(), ProcessingState::Idle);
    }

    #[test]
    fn restore_mid_cycle_keeps_countdown() {
        let mut session = active_session();
        session.apply_status(&server_status(true, 50_000, 0.1053), T0 + 36_400_000);
        let record = session.to_persisted();

        let restored = SessionState::from_persisted("42", &record);
        assert_eq!(restored.state(), ProcessingState::Active);
        assert_eq!(restored.end_time_ms(), session.end_time_ms());
        // Two hours after the save the countdown keeps going from the same end time.
        let later = T0 + 36_400_000 + 7_200_000;
        assert_eq!(restored.remaining_seconds(later), 50_000 - 7_200);
        assert!(restored.estimate_at(later) > 0.1053);
    }

    #[test]
    fn restore_rejects_inverted_window() {
        let record = PersistedSession {
            processing_active: true,
            processing_start_time: Some(T0),
            processing_end_time: Some(T0 - 1),
            processing_accumulated: 0.1,
            processing_pending_credit: 0.05,
            ..PersistedSession::default()
        };
        let restored = SessionState::from_persisted("42", &record);
        assert_eq!(restored.state(), ProcessingState::Idle);
        assert_eq!(restored.pending_credit(), 0.05);
    }

    #[test]
    fn restore_completed_keeps_guard_set() {
        let mut session = active_session();
        session.mark_completed(0.2);
        let restored = SessionState::from_persisted("42", &session.to_persisted());
        assert_eq!(restored.state(), ProcessingState::Completed);
        assert!(restored.is_finalized());
        assert_eq!(restored.accumulated_reward(), 0.2);
    }

    #[test]
    fn idle_session_adopts_server_cycle() {
        let mut session = SessionState::new("42");
        session.apply_status(&server_status(true, 86_000, 0.0012), T0);
        assert_eq!(session.state(), ProcessingState::Active);
        assert_eq!(session.remaining_seconds(T0), 86_000);
        assert_eq!(session.accumulated_reward(), 0.0012);
    }

    #[test]
    fn accumulated_refresh_anchors_and_never_regresses() {
        let mut session = active_session();
        let half = T0 + DAY_MS / 2;
        session.apply_accumulated(0.13, half);
        assert_eq!(session.accumulated_reward(), 0.13);
        assert_eq!(session.last_synced_at_ms(), Some(half));
        assert!(session.estimate_at(half + 60_000) > 0.13);

        session.apply_accumulated(0.12, half + 1_000);
        assert_eq!(session.accumulated_reward(), 0.13);
        assert_eq!(session.last_synced_at_ms(), Some(half));

        session.apply_accumulated(3.0, half + 2_000);
        assert_eq!(session.accumulated_reward(), CYCLE_TOTAL_REWARD);
    }

    #[test]
    fn accumulated_refresh_is_ignored_outside_a_cycle() {
        let mut session = SessionState::new("42");
        session.apply_accumulated(0.2, T0);
        assert_eq!(session.state(), ProcessingState::Idle);
        assert_eq!(session.accumulated_reward(), 0.0);
        assert!(!session.is_finalized());
    }
}
