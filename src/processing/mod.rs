pub mod clock;
pub mod completion;
pub mod display;
pub mod estimator;
pub mod launcher;
pub mod state;
mod status_poll;
pub mod status_sync;
pub mod store;
pub mod timer;
mod ui;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::api::ApiClient;
use crate::config::{Command, Config, StatusEndpoint};
use crate::version::banner_version;

use clock::{Clock, SystemClock};
use completion::{CompletionHandler, FinalizeOutcome};
use display::{format_countdown, format_reward, SyncStats};
use launcher::{LaunchReport, SessionLauncher};
use state::{ProcessingState, SessionState};
use status_poll::{PollAnswer, PollKind, StatusPoller};
use status_sync::{StatusResult, StatusSyncClient};
use store::SessionStore;
use timer::{CountdownView, TickOutcome, TimerCadence, TimerController};
use ui::{info, success, warn};

const POLLER_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Notifications for whatever renders the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Tick(CountdownView),
    StateChanged {
        from: ProcessingState,
        to: ProcessingState,
    },
    Completed {
        reward: f64,
        saved: bool,
    },
    BalanceCredited {
        amount: f64,
        new_balance: Option<f64>,
    },
}

pub type SessionListener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WatchOutcome {
    Completed { reward: f64 },
    Interrupted,
    NotActive,
}

/// Everything an engine needs besides the user id.
pub struct EngineParts {
    pub api: ApiClient,
    pub store: SessionStore,
    pub clock: Arc<dyn Clock>,
    pub status_sources: Vec<StatusEndpoint>,
    pub sync_timeout: Duration,
    pub cadence: TimerCadence,
    /// How often `watch` refreshes the reward from `/processing/accumulated`
    /// between status syncs. `None` turns the refresh off.
    pub accumulated_every: Option<Duration>,
}

/// Owns the session and is the only place it is mutated.
pub struct Engine {
    session: SessionState,
    store: SessionStore,
    clock: Arc<dyn Clock>,
    sync: Arc<StatusSyncClient>,
    launcher: SessionLauncher,
    completion: CompletionHandler,
    timer: TimerController,
    accumulated_every: Option<Duration>,
    listener: Option<SessionListener>,
}

impl Engine {
    pub fn open(cfg: &Config) -> Result<Self> {
        let api = ApiClient::new(cfg.api_url.clone(), cfg.token.clone(), cfg.request_timeout)?;
        let parts = EngineParts {
            api,
            store: SessionStore::new(cfg.data_dir.clone()),
            clock: Arc::new(SystemClock),
            status_sources: cfg.status_sources.clone(),
            sync_timeout: cfg.sync_timeout,
            cadence: cfg.cadence,
            accumulated_every: cfg.accumulated_every,
        };
        Ok(Self::with_parts(&cfg.user_id, parts))
    }

    /// Builds the engine and rehydrates the user's session from disk.
    pub fn with_parts(user_id: &str, parts: EngineParts) -> Self {
        let session = match parts.store.load(user_id) {
            Some(record) => SessionState::from_persisted(user_id, &record),
            None => SessionState::new(user_id),
        };
        let now_ms = parts.clock.now_ms();
        if session.state() != ProcessingState::Idle {
            info(
                "STORE",
                format!(
                    "restored session | state={} remaining={} reward={}",
                    session.state().as_str(),
                    format_countdown(session.remaining_seconds(now_ms)),
                    format_reward(session.estimate_at(now_ms)),
                ),
            );
        }

        let sync = Arc::new(StatusSyncClient::new(
            parts.api.clone(),
            parts.status_sources,
            parts.sync_timeout,
            Arc::clone(&parts.clock),
            Arc::new(SyncStats::new()),
        ));
        Self {
            session,
            launcher: SessionLauncher::new(
                parts.api.clone(),
                parts.store.clone(),
                Arc::clone(&parts.clock),
            ),
            completion: CompletionHandler::new(parts.api, parts.store.clone()),
            store: parts.store,
            clock: parts.clock,
            sync,
            timer: TimerController::new(parts.cadence),
            accumulated_every: parts.accumulated_every,
            listener: None,
        }
    }

    pub fn set_listener(&mut self, listener: Option<SessionListener>) {
        self.listener = listener;
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn sync_stats(&self) -> &SyncStats {
        self.sync.stats()
    }

    pub fn start(&mut self) -> Result<LaunchReport> {
        let from = self.session.state();
        let result = self.launcher.start(&mut self.session, &self.completion);
        if let Ok(report) = &result {
            if let Some(credit) = report.credited {
                self.emit(&SessionEvent::BalanceCredited {
                    amount: credit.amount,
                    new_balance: credit.new_balance,
                });
            }
        }
        self.emit_transition(from);
        result
    }

    /// One authoritative status round trip, applied and persisted. A cycle the
    /// server reports as over is finalized on the spot.
    pub fn refresh_status(&mut self) -> StatusResult {
        let from = self.session.state();
        let status = self.sync.fetch_status(&mut self.session, &self.store);
        let now_ms = self.clock.now_ms();
        self.session.expire_cooldown(now_ms);
        let ended = !status.degraded && (status.is_completed || !status.active);
        if self.session.state() == ProcessingState::Active
            && (ended || self.session.remaining_seconds(now_ms) == 0)
        {
            let final_reward = self.session.estimate_at(now_ms);
            self.finish_cycle(final_reward);
        }
        self.emit_transition(from);
        status
    }

    /// Refreshes the displayed reward from `/processing/accumulated` alone,
    /// independent of the countdown.
    pub fn refresh_accumulated(&mut self) -> Result<f64> {
        let reward = self.sync.fetch_accumulated(self.session.user_id())?;
        self.apply_accumulated(reward);
        Ok(self.session.accumulated_reward())
    }

    fn apply_accumulated(&mut self, reward: f64) {
        let before = self.session.accumulated_reward();
        self.session.apply_accumulated(reward, self.clock.now_ms());
        if self.session.accumulated_reward() != before {
            self.persist_logged();
        }
    }

    /// Follows the active cycle until it ends or `shutdown` is raised.
    pub fn watch(&mut self, shutdown: &Arc<AtomicBool>) -> Result<WatchOutcome> {
        let now_ms = self.clock.now_ms();
        if self.session.state() != ProcessingState::Active {
            return Ok(WatchOutcome::NotActive);
        }
        if self
            .timer
            .start(self.session.remaining_seconds(now_ms), now_ms)
        {
            warn("TIMER", "replaced a running countdown");
        }

        let tick = self.timer.cadence().tick;
        let mut poller = StatusPoller::spawn(Arc::clone(&self.sync), Arc::clone(shutdown));
        let mut fresh: Option<StatusResult> = None;
        let mut next_accumulated_ms = self
            .accumulated_every
            .map(|every| now_ms.saturating_add(duration_ms(every)));

        let outcome = loop {
            if shutdown.load(Ordering::Relaxed) {
                self.timer.stop();
                self.persist_snapshot()?;
                break WatchOutcome::Interrupted;
            }

            let from = self.session.state();
            let now_ms = self.clock.now_ms();
            let applied = fresh.take();
            let outcome = self.timer.tick(&mut self.session, now_ms, applied.as_ref());
            if applied.is_some() {
                self.persist_logged();
            }

            match outcome {
                TickOutcome::Continue { view, sync_due } => {
                    self.emit(&SessionEvent::Tick(view));
                    if sync_due {
                        poller.request_if_idle(PollKind::Status, &self.session);
                    } else if let (Some(every), Some(due_ms)) =
                        (self.accumulated_every, next_accumulated_ms)
                    {
                        if now_ms >= due_ms
                            && poller.request_if_idle(PollKind::Accumulated, &self.session)
                        {
                            next_accumulated_ms = Some(now_ms.saturating_add(duration_ms(every)));
                        }
                    }
                }
                TickOutcome::Expired {
                    view,
                    final_reward,
                    reason,
                } => {
                    self.emit(&SessionEvent::Tick(view));
                    info(
                        "TIMER",
                        format!(
                            "cycle ended | {} reward={}",
                            reason.as_str(),
                            format_reward(final_reward)
                        ),
                    );
                    self.finish_cycle(final_reward);
                    self.emit_transition(from);
                    break WatchOutcome::Completed {
                        reward: self.session.accumulated_reward(),
                    };
                }
                TickOutcome::Stopped => {
                    self.emit_transition(from);
                    break WatchOutcome::NotActive;
                }
            }
            self.emit_transition(from);

            if poller.is_pending() {
                match poller.wait_for_result(tick) {
                    Some(PollAnswer::Status(status)) => fresh = Some(status),
                    Some(PollAnswer::Accumulated(Some(reward))) => self.apply_accumulated(reward),
                    Some(PollAnswer::Accumulated(None)) | None => {}
                }
            } else {
                thread::sleep(tick);
            }
        };

        if !poller.shutdown_for(POLLER_SHUTDOWN_GRACE) {
            warn("SYNC", "status poll worker still busy at shutdown");
        }
        Ok(outcome)
    }

    /// Forgets the stored session. The server-side cycle is untouched.
    pub fn logout(&mut self) -> Result<()> {
        self.timer.stop();
        let from = self.session.state();
        self.store.clear(self.session.user_id())?;
        self.session = SessionState::new(self.session.user_id().to_string());
        self.emit_transition(from);
        Ok(())
    }

    pub fn persist_snapshot(&self) -> Result<()> {
        self.store
            .save(self.session.user_id(), &self.session.to_persisted())
            .context("failed to persist session snapshot")
    }

    fn persist_logged(&self) {
        if let Err(err) = self.persist_snapshot() {
            warn("STORE", format!("{err:#}"));
        }
    }

    fn finish_cycle(&mut self, final_reward: f64) {
        match self.completion.finalize(&mut self.session, final_reward) {
            FinalizeOutcome::Saved { reward } => {
                self.emit(&SessionEvent::Completed {
                    reward,
                    saved: true,
                });
            }
            FinalizeOutcome::Deferred { reward } => {
                self.emit(&SessionEvent::Completed {
                    reward,
                    saved: false,
                });
            }
            FinalizeOutcome::AlreadyFinalized => {}
        }
    }

    fn emit_transition(&self, from: ProcessingState) {
        let to = self.session.state();
        if from != to {
            info(
                "CYCLE",
                format!("state {} -> {}", from.as_str(), to.as_str()),
            );
            self.emit(&SessionEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: &SessionEvent) {
        if let Some(listener) = &self.listener {
            listener(event);
        }
    }
}

pub fn run(cfg: &Config, shutdown: Arc<AtomicBool>) -> Result<()> {
    ui::startup_banner(&[
        ("version", banner_version()),
        ("api", cfg.api_url.clone()),
        ("user", cfg.user_id.clone()),
        ("data dir", cfg.data_dir.display().to_string()),
        (
            "status chain",
            status_chain_label(&cfg.status_sources),
        ),
        (
            "cadence",
            format!(
                "tick={}ms sync={}s probe-timeout={}ms",
                cfg.cadence.tick.as_millis(),
                cfg.cadence.sync.as_secs(),
                cfg.sync_timeout.as_millis()
            ),
        ),
    ]);

    let mut engine = Engine::open(cfg)?;
    engine.set_listener(Some(console_listener(cfg.render_interval)));

    match cfg.command {
        Command::Start { detach } => {
            let report = engine.start()?;
            if let Some(balance) = report.balance {
                info("LAUNCH", format!("balance={}", format_reward(balance)));
            }
            if detach {
                return Ok(());
            }
            watch_and_report(&mut engine, &shutdown)
        }
        Command::Watch => {
            if engine.session().state() == ProcessingState::Active {
                // Pick up anything that happened while nothing was watching.
                engine.refresh_status();
            }
            watch_and_report(&mut engine, &shutdown)
        }
        Command::Status => {
            let status = engine.refresh_status();
            if status.degraded && engine.session().state() == ProcessingState::Active {
                // The status chain is down; the reward may still be reachable.
                if let Err(err) = engine.refresh_accumulated() {
                    warn("SYNC", format!("accumulated refresh failed | {err:#}"));
                }
            }
            print_status(&engine, &status);
            Ok(())
        }
        Command::Logout => {
            engine.logout()?;
            success("CYCLE", "local session cleared");
            Ok(())
        }
    }
}

fn watch_and_report(engine: &mut Engine, shutdown: &Arc<AtomicBool>) -> Result<()> {
    match engine.watch(shutdown)? {
        WatchOutcome::Completed { reward } => success(
            "CYCLE",
            format!(
                "reward={} is ready, run `start` to credit it and begin the next cycle",
                format_reward(reward)
            ),
        ),
        WatchOutcome::Interrupted => info("CYCLE", "stopped watching | session saved"),
        WatchOutcome::NotActive => info(
            "CYCLE",
            format!(
                "no active cycle | state={}",
                engine.session().state().as_str()
            ),
        ),
    }
    engine.sync_stats().print();
    Ok(())
}

fn print_status(engine: &Engine, status: &StatusResult) {
    let session = engine.session();
    let line = format!(
        "state={} remaining={} reward={} pending={} | source={} degraded={}",
        session.state().as_str(),
        format_countdown(status.remaining_seconds),
        format_reward(session.accumulated_reward()),
        format_reward(session.pending_credit()),
        status.source.as_str(),
        status.degraded
    );
    if status.degraded {
        warn("CYCLE", line);
    } else {
        info("CYCLE", line);
    }
}

fn duration_ms(every: Duration) -> i64 {
    i64::try_from(every.as_millis()).unwrap_or(i64::MAX)
}

fn status_chain_label(sources: &[StatusEndpoint]) -> String {
    sources
        .iter()
        .map(|source| source.as_str())
        .chain(std::iter::once("local"))
        .collect::<Vec<_>>()
        .join(" > ")
}

/// Prints a countdown line at most once per `every`, plus every state change.
fn console_listener(every: Duration) -> SessionListener {
    let last_render = Mutex::new(None::<Instant>);
    Arc::new(move |event: &SessionEvent| match event {
        SessionEvent::Tick(view) => {
            let mut last = last_render
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if last.is_some_and(|at| at.elapsed() < every) {
                return;
            }
            *last = Some(Instant::now());
            let line = format!(
                "remaining={} reward={}{}",
                format_countdown(view.remaining_seconds),
                format_reward(view.accumulated_reward),
                if view.degraded { " | estimate" } else { "" }
            );
            info("TIMER", line);
        }
        SessionEvent::Completed { reward, saved } => {
            let note = if *saved { "saved" } else { "saved locally" };
            success(
                "CYCLE",
                format!("completed | reward={} {note}", format_reward(*reward)),
            );
        }
        SessionEvent::BalanceCredited {
            amount,
            new_balance,
        } => {
            let balance = new_balance.map_or_else(|| "unknown".to_string(), format_reward);
            info(
                "LAUNCH",
                format!("credited={} new balance={balance}", format_reward(*amount)),
            );
        }
        SessionEvent::StateChanged { .. } => {}
    })
}
