use std::time::Duration;

use super::state::{ProcessingState, SessionState};
use super::status_sync::StatusResult;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TimerState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TimerCadence {
    pub tick: Duration,
    pub sync: Duration,
}

impl Default for TimerCadence {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            sync: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CountdownView {
    pub remaining_seconds: i64,
    pub accumulated_reward: f64,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExpiryReason {
    TimeElapsed,
    ServerCompleted,
    ServerInactive,
}

impl ExpiryReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TimeElapsed => "time elapsed",
            Self::ServerCompleted => "server reported completion",
            Self::ServerInactive => "server reported no active cycle",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Continue {
        view: CountdownView,
        sync_due: bool,
    },
    /// The loop has stopped itself; the caller finalizes with `final_reward`.
    Expired {
        view: CountdownView,
        final_reward: f64,
        reason: ExpiryReason,
    },
    Stopped,
}

/// The single countdown loop. Holds no network handles: the caller feeds in
/// server answers and schedules probes when `sync_due` comes back set.
pub struct TimerController {
    cadence: TimerCadence,
    state: TimerState,
    next_sync_ms: Option<i64>,
    degraded: bool,
}

impl TimerController {
    pub fn new(cadence: TimerCadence) -> Self {
        Self {
            cadence,
            state: TimerState::Stopped,
            next_sync_ms: None,
            degraded: false,
        }
    }

    pub fn cadence(&self) -> TimerCadence {
        self.cadence
    }

    #[cfg(test)]
    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == TimerState::Running
    }

    /// Starts the loop, replacing one that is already running. Returns `true`
    /// when a running loop was replaced. The first sync is due immediately.
    pub fn start(&mut self, initial_remaining_seconds: i64, now_ms: i64) -> bool {
        let replaced = self.is_running();
        self.state = TimerState::Running;
        self.next_sync_ms = Some(now_ms);
        self.degraded = false;
        if initial_remaining_seconds <= 0 {
            // Already over; the first tick expires it.
            self.next_sync_ms = None;
        }
        replaced
    }

    pub fn stop(&mut self) {
        self.state = TimerState::Stopped;
        self.next_sync_ms = None;
    }

    pub fn tick(
        &mut self,
        session: &mut SessionState,
        now_ms: i64,
        fresh: Option<&StatusResult>,
    ) -> TickOutcome {
        if !self.is_running() {
            return TickOutcome::Stopped;
        }

        let mut server_expiry = None;
        if let Some(status) = fresh {
            session.apply_status(status, now_ms);
            self.degraded = status.degraded;
            if !status.degraded {
                if status.is_completed {
                    server_expiry = Some(ExpiryReason::ServerCompleted);
                } else if !status.active {
                    server_expiry = Some(ExpiryReason::ServerInactive);
                }
            }
        }

        if session.state() != ProcessingState::Active {
            self.stop();
            return TickOutcome::Stopped;
        }

        session.refresh_estimate(now_ms);
        let remaining_seconds = session.remaining_seconds(now_ms);
        let view = CountdownView {
            remaining_seconds,
            accumulated_reward: session.accumulated_reward(),
            degraded: self.degraded,
        };

        let reason = server_expiry.or((remaining_seconds <= 0).then_some(ExpiryReason::TimeElapsed));
        if let Some(reason) = reason {
            self.stop();
            return TickOutcome::Expired {
                view,
                final_reward: session.accumulated_reward(),
                reason,
            };
        }

        let sync_due = self.next_sync_ms.is_some_and(|due_ms| now_ms >= due_ms);
        if sync_due {
            let sync_ms = i64::try_from(self.cadence.sync.as_millis()).unwrap_or(i64::MAX);
            self.next_sync_ms = Some(now_ms.saturating_add(sync_ms));
        }
        TickOutcome::Continue { view, sync_due }
    }
}
