use crate::api::ApiClient;
use crate::types::round_reward;

use super::display::format_reward;
use super::state::{ProcessingState, SessionState};
use super::store::SessionStore;
use super::ui::{success, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FinalizeOutcome {
    /// Completed locally and acknowledged by `save-completed`.
    Saved { reward: f64 },
    /// Completed locally; the server call failed and the next launch retries.
    Deferred { reward: f64 },
    AlreadyFinalized,
}

/// Records the end of a cycle exactly once per cycle.
pub struct CompletionHandler {
    api: ApiClient,
    store: SessionStore,
}

impl CompletionHandler {
    pub fn new(api: ApiClient, store: SessionStore) -> Self {
        Self { api, store }
    }

    pub fn finalize(&self, session: &mut SessionState, final_reward: f64) -> FinalizeOutcome {
        if !session.mark_completed(final_reward) {
            return FinalizeOutcome::AlreadyFinalized;
        }
        self.persist(session);

        let reward = session.accumulated_reward();
        if self.save_completed(session) {
            success(
                "CYCLE",
                format!("cycle completed | reward={}", format_reward(reward)),
            );
            FinalizeOutcome::Saved { reward }
        } else {
            FinalizeOutcome::Deferred { reward }
        }
    }

    /// Re-sends `save-completed` for a finalized cycle the server never
    /// acknowledged. Returns whether the server now has it.
    pub fn ensure_saved(&self, session: &mut SessionState) -> bool {
        if session.state() != ProcessingState::Completed {
            return false;
        }
        if session.completion_saved() {
            return true;
        }
        self.save_completed(session)
    }

    fn save_completed(&self, session: &mut SessionState) -> bool {
        let reward = session.accumulated_reward();
        match self.api.save_completed(session.user_id(), reward) {
            Ok(resp) => {
                if let Some(stored) = stored_reward_mismatch(reward, resp.reward_amount) {
                    warn(
                        "CYCLE",
                        format!(
                            "server stored a different reward | local={} server={}",
                            format_reward(reward),
                            format_reward(stored)
                        ),
                    );
                }
                session.set_completion_saved(true);
                self.persist(session);
                true
            }
            Err(err) => {
                warn(
                    "CYCLE",
                    format!(
                        "save-completed failed, kept locally | reward={} {err:#}",
                        format_reward(reward)
                    ),
                );
                false
            }
        }
    }

    fn persist(&self, session: &SessionState) {
        if let Err(err) = self.store.save(session.user_id(), &session.to_persisted()) {
            warn("STORE", format!("failed to persist completion | {err:#}"));
        }
    }
}

/// The server's stored reward when it disagrees with what was sent.
fn stored_reward_mismatch(sent: f64, stored: Option<f64>) -> Option<f64> {
    stored.filter(|stored| (round_reward(*stored) - round_reward(sent)).abs() >= 1e-8)
}
