use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::api::{api_status_error, ApiClient};
use crate::types::value_as_number;

use super::clock::Clock;
use super::completion::CompletionHandler;
use super::display::{format_countdown, format_reward};
use super::state::{ProcessingState, SessionState};
use super::store::SessionStore;
use super::ui::{info, success, warn};

/// A start request that was refused. Session state is left as it was, except
/// that a server-reported cooldown is recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchRejected {
    AlreadyActive {
        remaining_seconds: i64,
    },
    CooldownActive {
        cooldown_end_ms: i64,
        remaining_seconds: i64,
    },
    ServerRejected {
        message: String,
    },
}

impl fmt::Display for LaunchRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyActive { remaining_seconds } => write!(
                f,
                "a processing cycle is already running ({} left)",
                format_countdown(*remaining_seconds)
            ),
            Self::CooldownActive {
                remaining_seconds, ..
            } => write!(
                f,
                "processing is cooling down ({} left)",
                format_countdown(*remaining_seconds)
            ),
            Self::ServerRejected { message } => write!(f, "server refused to start: {message}"),
        }
    }
}

impl std::error::Error for LaunchRejected {}

pub fn launch_rejection(err: &anyhow::Error) -> Option<&LaunchRejected> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<LaunchRejected>())
}

pub fn is_launch_rejection(err: &anyhow::Error) -> bool {
    launch_rejection(err).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CreditTransfer {
    pub amount: f64,
    pub new_balance: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaunchReport {
    pub credited: Option<CreditTransfer>,
    pub balance: Option<f64>,
    pub remaining_seconds: i64,
}

pub struct SessionLauncher {
    api: ApiClient,
    store: SessionStore,
    clock: Arc<dyn Clock>,
}

impl SessionLauncher {
    pub fn new(api: ApiClient, store: SessionStore, clock: Arc<dyn Clock>) -> Self {
        Self { api, store, clock }
    }

    /// Credits whatever an earlier cycle left behind, then opens a new cycle.
    pub fn start(
        &self,
        session: &mut SessionState,
        completion: &CompletionHandler,
    ) -> Result<LaunchReport> {
        let now_ms = self.clock.now_ms();

        match session.state() {
            ProcessingState::Active if session.remaining_seconds(now_ms) > 0 => {
                let rejection = LaunchRejected::AlreadyActive {
                    remaining_seconds: session.remaining_seconds(now_ms),
                };
                warn("LAUNCH", rejection.to_string());
                return Err(anyhow!(rejection));
            }
            ProcessingState::Active => {
                // The cycle ended while nothing was watching it.
                let final_reward = session.estimate_at(now_ms).max(session.accumulated_reward());
                info(
                    "LAUNCH",
                    format!(
                        "finalizing expired cycle | reward={}",
                        format_reward(final_reward)
                    ),
                );
                completion.finalize(session, final_reward);
            }
            ProcessingState::Cooldown if session.is_cooling_down(now_ms) => {
                let rejection = LaunchRejected::CooldownActive {
                    cooldown_end_ms: session.cooldown_end_ms().unwrap_or(now_ms),
                    remaining_seconds: session.cooldown_remaining_seconds(now_ms),
                };
                warn("LAUNCH", rejection.to_string());
                return Err(anyhow!(rejection));
            }
            ProcessingState::Cooldown => {
                session.expire_cooldown(now_ms);
            }
            ProcessingState::Idle | ProcessingState::Completed => {}
        }

        let credited = self.credit_previous(session, completion);

        let resp = match self.api.start_processing(session.user_id()) {
            Ok(resp) => resp,
            Err(err) => return Err(self.rejected_start(session, err, now_ms)),
        };

        session.begin_cycle(now_ms);
        if let Some(remaining) = resp.remaining_seconds.filter(|secs| *secs > 0.0) {
            session.anchor_remaining(now_ms, remaining.ceil() as i64);
        }
        self.persist(session);

        let remaining_seconds = session.remaining_seconds(now_ms);
        success(
            "LAUNCH",
            format!(
                "cycle started | remaining={}",
                format_countdown(remaining_seconds)
            ),
        );

        Ok(LaunchReport {
            balance: resp
                .new_balance
                .or(credited.and_then(|credit| credit.new_balance)),
            credited,
            remaining_seconds,
        })
    }

    /// Moves a finished cycle's reward, plus anything deferred, into the
    /// balance. Failures are logged and the amount stays owed.
    fn credit_previous(
        &self,
        session: &mut SessionState,
        completion: &CompletionHandler,
    ) -> Option<CreditTransfer> {
        let amount = session.creditable_reward();
        if amount <= 0.0 {
            return None;
        }

        completion.ensure_saved(session);
        match self.api.complete(session.user_id(), amount) {
            Ok(resp) => {
                session.clear_credited();
                self.persist(session);
                success(
                    "LAUNCH",
                    format!(
                        "credited previous cycle | amount={} balance={}",
                        format_reward(amount),
                        resp.new_balance
                            .map(format_reward)
                            .unwrap_or_else(|| "?".to_string())
                    ),
                );
                Some(CreditTransfer {
                    amount,
                    new_balance: resp.new_balance,
                })
            }
            Err(err) => {
                warn(
                    "LAUNCH",
                    format!(
                        "credit deferred to next launch | amount={} {err:#}",
                        format_reward(amount)
                    ),
                );
                None
            }
        }
    }

    fn rejected_start(&self, session: &mut SessionState, err: anyhow::Error, now_ms: i64) -> anyhow::Error {
        let Some(api_err) = api_status_error(&err) else {
            self.persist(session);
            return err.context("failed to start processing");
        };

        if let Some(cooldown_end_ms) = api_err
            .payload()
            .and_then(|payload| cooldown_end_from_payload(payload, now_ms))
        {
            session.enter_cooldown(cooldown_end_ms);
            self.persist(session);
            let rejection = LaunchRejected::CooldownActive {
                cooldown_end_ms,
                remaining_seconds: session.cooldown_remaining_seconds(now_ms),
            };
            warn("LAUNCH", rejection.to_string());
            return anyhow!(rejection);
        }

        self.persist(session);
        let rejection = LaunchRejected::ServerRejected {
            message: api_err.message().to_string(),
        };
        warn("LAUNCH", rejection.to_string());
        anyhow!(rejection)
    }

    fn persist(&self, session: &SessionState) {
        if let Err(err) = self.store.save(session.user_id(), &session.to_persisted()) {
            warn("STORE", format!("failed to persist session | {err:#}"));
        }
    }
}

/// End of a cooldown window carried by a rejected start, either as an
/// absolute time or as seconds left.
fn cooldown_end_from_payload(payload: &Value, now_ms: i64) -> Option<i64> {
    if let Some(end_ms) = payload.get("cooldown_end_time").and_then(value_as_number) {
        return (end_ms > now_ms as f64).then_some(end_ms as i64);
    }
    let remaining = ["cooldown_remaining", "remaining_seconds", "remainingSeconds"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(value_as_number))?;
    if remaining <= 0.0 {
        return None;
    }
    Some(now_ms.saturating_add((remaining.ceil() as i64).saturating_mul(1_000)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::processing::clock::ManualClock;
    use crate::processing::store::tests::temp_store;
    use httpmock::prelude::*;
    use serde_json::json;

    const T0: i64 = 1_700_000_000_000;
    const DAY_MS: i64 = 86_400_000;

    struct Harness {
        launcher: SessionLauncher,
        completion: CompletionHandler,
        store: SessionStore,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new(server: &MockServer) -> Self {
            let base = server.url("").trim_end_matches('/').to_string();
            let api = ApiClient::new(base, None, Duration::from_secs(5))
                .expect("test client should be created");
            let store = temp_store();
            let clock = Arc::new(ManualClock::new(T0));
            Self {
                launcher: SessionLauncher::new(api.clone(), store.clone(), clock.clone()),
                completion: CompletionHandler::new(api, store.clone()),
                store,
                clock,
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(self.store.dir());
        }
    }

    fn start_ok(server: &MockServer) -> httpmock::Mock<'_> {
        server.mock(|when, then| {
            when.method(POST)
                .path("/processing/start")
                .json_body(json!({"userId": "42"}));
            then.status(200).json_body(json!({
                "success": true,
                "remaining_seconds": 86400
            }));
        })
    }

    #[test]
    fn fresh_start_opens_cycle() {
        let server = MockServer::start();
        let start = start_ok(&server);
        let harness = Harness::new(&server);
        let mut session = SessionState::new("42");

        let report = harness
            .launcher
            .start(&mut session, &harness.completion)
            .expect("start should succeed");

        assert_eq!(report.credited, None);
        assert_eq!(report.remaining_seconds, 86_400);
        assert_eq!(session.state(), ProcessingState::Active);
        assert_eq!(session.start_time_ms(), Some(T0));
        assert_eq!(session.end_time_ms(), Some(T0 + DAY_MS));
        let saved = harness.store.load("42").expect("session should be persisted");
        assert!(saved.processing_active);
        start.assert();
    }

    #[test]
    fn duplicate_start_is_rejected_without_server_call() {
        let server = MockServer::start();
        let start = start_ok(&server);
        let harness = Harness::new(&server);
        let mut session = SessionState::new("42");
        session.begin_cycle(T0);
        harness.clock.set(T0 + 600_000);
        let before = session.clone();

        let err = harness
            .launcher
            .start(&mut session, &harness.completion)
            .expect_err("second start should be rejected");

        assert_eq!(
            launch_rejection(&err),
            Some(&LaunchRejected::AlreadyActive {
                remaining_seconds: 85_800
            })
        );
        assert_eq!(session, before);
        start.assert_hits(0);
    }

    #[test]
    fn completed_reward_is_credited_before_new_cycle() {
        let server = MockServer::start();
        let complete = server.mock(|when, then| {
            when.method(POST)
                .path("/processing/complete")
                .json_body(json!({"userId": "42", "finalReward": 0.25}));
            then.status(200)
                .json_body(json!({"success": true, "new_balance": 100.25}));
        });
        let save = server.mock(|when, then| {
            when.method(POST).path("/processing/save-completed");
            then.status(200).json_body(json!({"success": true}));
        });
        let start = start_ok(&server);
        let harness = Harness::new(&server);

        let mut session = SessionState::new("42");
        session.begin_cycle(T0 - DAY_MS);
        session.mark_completed(0.25);
        session.set_completion_saved(true);

        let report = harness
            .launcher
            .start(&mut session, &harness.completion)
            .expect("start should succeed");

        assert_eq!(
            report.credited,
            Some(CreditTransfer {
                amount: 0.25,
                new_balance: Some(100.25)
            })
        );
        assert_eq!(report.balance, Some(100.25));
        assert_eq!(session.state(), ProcessingState::Active);
        assert_eq!(session.accumulated_reward(), 0.0);
        assert_eq!(session.pending_credit(), 0.0);
        complete.assert();
        save.assert_hits(0);
        start.assert();
    }

    #[test]
    fn failed_credit_is_deferred_and_start_proceeds() {
        let server = MockServer::start();
        let complete = server.mock(|when, then| {
            when.method(POST).path("/processing/complete");
            then.status(503).body("maintenance");
        });
        let save = server.mock(|when, then| {
            when.method(POST).path("/processing/save-completed");
            then.status(200).json_body(json!({"success": true}));
        });
        let start = start_ok(&server);
        let harness = Harness::new(&server);

        let mut session = SessionState::new("42");
        session.begin_cycle(T0 - DAY_MS);
        session.mark_completed(0.25);

        let report = harness
            .launcher
            .start(&mut session, &harness.completion)
            .expect("start should still succeed");

        assert_eq!(report.credited, None);
        assert_eq!(session.state(), ProcessingState::Active);
        assert_eq!(session.pending_credit(), 0.25);
        let saved = harness.store.load("42").expect("session should be persisted");
        assert_eq!(saved.processing_pending_credit, 0.25);
        save.assert();
        complete.assert();
        start.assert();
    }

    #[test]
    fn expired_active_cycle_is_finalized_then_credited() {
        let server = MockServer::start();
        let save = server.mock(|when, then| {
            when.method(POST)
                .path("/processing/save-completed")
                .json_body(json!({"userId": "42", "completedReward": 0.25}));
            then.status(200).json_body(json!({"success": true}));
        });
        let complete = server.mock(|when, then| {
            when.method(POST)
                .path("/processing/complete")
                .json_body(json!({"userId": "42", "finalReward": 0.25}));
            then.status(200)
                .json_body(json!({"success": true, "new_balance": "3.25"}));
        });
        let start = start_ok(&server);
        let harness = Harness::new(&server);

        let mut session = SessionState::new("42");
        session.begin_cycle(T0 - DAY_MS - 60_000);

        let report = harness
            .launcher
            .start(&mut session, &harness.completion)
            .expect("start should succeed");
        assert_eq!(report.balance, Some(3.25));
        save.assert_hits(1);
        complete.assert_hits(1);
        start.assert();
    }

    #[test]
    fn server_cooldown_moves_session_to_cooldown() {
        let server = MockServer::start();
        let start = server.mock(|when, then| {
            when.method(POST).path("/processing/start");
            then.status(429).json_body(json!({
                "success": false,
                "error": "Cooldown active",
                "remaining_seconds": 3600
            }));
        });
        let harness = Harness::new(&server);
        let mut session = SessionState::new("42");

        let err = harness
            .launcher
            .start(&mut session, &harness.completion)
            .expect_err("cooldown should reject");
        assert!(is_launch_rejection(&err));
        assert_eq!(
            launch_rejection(&err),
            Some(&LaunchRejected::CooldownActive {
                cooldown_end_ms: T0 + 3_600_000,
                remaining_seconds: 3_600
            })
        );
        assert_eq!(session.state(), ProcessingState::Cooldown);

        // Still cooling down: refused locally.
        harness.clock.set(T0 + 60_000);
        let err = harness
            .launcher
            .start(&mut session, &harness.completion)
            .expect_err("local cooldown should reject");
        assert!(matches!(
            launch_rejection(&err),
            Some(LaunchRejected::CooldownActive { .. })
        ));
        start.assert_hits(1);
    }

    #[test]
    fn rejection_without_window_leaves_state_alone() {
        let server = MockServer::start();
        let _start = server.mock(|when, then| {
            when.method(POST).path("/processing/start");
            then.status(200)
                .json_body(json!({"success": false, "error": "User not found"}));
        });
        let harness = Harness::new(&server);
        let mut session = SessionState::new("42");

        let err = harness
            .launcher
            .start(&mut session, &harness.completion)
            .expect_err("start should be refused");
        assert_eq!(
            launch_rejection(&err),
            Some(&LaunchRejected::ServerRejected {
                message: "User not found".to_string()
            })
        );
        assert_eq!(session.state(), ProcessingState::Idle);
    }

    #[test]
    fn network_failure_is_not_a_rejection() {
        let harness = Harness::new(&MockServer::start());
        let api = ApiClient::new(
            "http://127.0.0.1:9".to_string(),
            None,
            Duration::from_millis(300),
        )
        .expect("client should be created");
        let launcher = SessionLauncher::new(api, harness.store.clone(), harness.clock.clone());
        let mut session = SessionState::new("42");

        let err = launcher
            .start(&mut session, &harness.completion)
            .expect_err("unreachable server should fail");
        assert!(!is_launch_rejection(&err));
        assert!(format!("{err:#}").contains("failed to start processing"));
    }

    #[test]
    fn cooldown_payload_accepts_absolute_end() {
        let payload = json!({"cooldown_end_time": T0 + 5_000});
        assert_eq!(cooldown_end_from_payload(&payload, T0), Some(T0 + 5_000));
        assert_eq!(cooldown_end_from_payload(&json!({}), T0), None);
        assert_eq!(
            cooldown_end_from_payload(&json!({"remaining_seconds": 0}), T0),
            None
        );
    }
}
