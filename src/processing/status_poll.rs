use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use super::state::SessionState;
use super::status_sync::{classify_failure, StatusResult, StatusSyncClient};
use super::ui::{error, warn};

/// Background worker running the status probe chain and the accumulated
/// refresh so a slow endpoint never blocks the countdown. At most one request
/// is queued or in flight.
pub(super) struct StatusPoller {
    handle: Option<JoinHandle<()>>,
    request_tx: Option<Sender<PollRequest>>,
    result_rx: Receiver<PollResult>,
    done_rx: Receiver<()>,
    next_sequence: u64,
    last_sent_sequence: Option<u64>,
    pending_sequence: Option<u64>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(super) enum PollKind {
    Status,
    Accumulated,
}

#[derive(Debug)]
pub(super) enum PollAnswer {
    Status(StatusResult),
    /// `None` when the accumulated endpoint did not answer.
    Accumulated(Option<f64>),
}

struct PollRequest {
    sequence: u64,
    kind: PollKind,
    snapshot: SessionState,
}

#[derive(Debug)]
struct PollResult {
    sequence: u64,
    answer: PollAnswer,
}

fn answer(sync: &StatusSyncClient, request: &PollRequest) -> PollAnswer {
    match request.kind {
        PollKind::Status => PollAnswer::Status(sync.probe(&request.snapshot)),
        PollKind::Accumulated => match sync.fetch_accumulated(request.snapshot.user_id()) {
            Ok(reward) => PollAnswer::Accumulated(Some(reward)),
            Err(err) => {
                warn(
                    "SYNC",
                    format!(
                        "accumulated refresh failed | kind={}",
                        classify_failure(&err).as_str()
                    ),
                );
                PollAnswer::Accumulated(None)
            }
        },
    }
}

impl StatusPoller {
    pub(super) fn spawn(sync: Arc<StatusSyncClient>, shutdown: Arc<AtomicBool>) -> Self {
        let (request_tx, request_rx) = bounded::<PollRequest>(1);
        let (result_tx, result_rx) = bounded::<PollResult>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        let handle = thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                let request = match request_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(request) => request,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let answer = answer(&sync, &request);
                if result_tx
                    .send(PollResult {
                        sequence: request.sequence,
                        answer,
                    })
                    .is_err()
                {
                    break;
                }
            }
            let _ = done_tx.send(());
        });

        Self {
            handle: Some(handle),
            request_tx: Some(request_tx),
            result_rx,
            done_rx,
            next_sequence: 0,
            last_sent_sequence: None,
            pending_sequence: None,
        }
    }

    pub(super) fn is_pending(&self) -> bool {
        self.pending_sequence.is_some()
    }

    /// Queues a request against a snapshot of `session` unless one is already
    /// outstanding. Returns whether a new request was queued.
    pub(super) fn request_if_idle(&mut self, kind: PollKind, session: &SessionState) -> bool {
        if self.pending_sequence.is_some() {
            return false;
        }
        let Some(request_tx) = self.request_tx.as_ref() else {
            return false;
        };
        let sequence = self.next_sequence;
        let request = PollRequest {
            sequence,
            kind,
            snapshot: session.clone(),
        };
        match request_tx.try_send(request) {
            Ok(()) => {
                self.next_sequence = self.next_sequence.wrapping_add(1);
                self.last_sent_sequence = Some(sequence);
                self.pending_sequence = Some(sequence);
                true
            }
            Err(TrySendError::Full(_)) => {
                // The last request is still queued; wait on it again.
                self.pending_sequence = self.last_sent_sequence;
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.request_tx = None;
                self.pending_sequence = None;
                false
            }
        }
    }

    pub(super) fn wait_for_result(&mut self, wait: Duration) -> Option<PollAnswer> {
        let wait = wait.max(Duration::from_millis(1));
        match self.result_rx.recv_timeout(wait) {
            Ok(result) => self.accept(result),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn accept(&mut self, result: PollResult) -> Option<PollAnswer> {
        if self.pending_sequence != Some(result.sequence) {
            // Answer to a request we no longer wait on.
            return None;
        }
        self.pending_sequence = None;
        Some(result.answer)
    }

    pub(super) fn shutdown_for(&mut self, wait: Duration) -> bool {
        self.pending_sequence = None;
        self.request_tx = None;
        let wait = wait.max(Duration::from_millis(1));
        let done = matches!(
            self.done_rx.recv_timeout(wait),
            Ok(()) | Err(RecvTimeoutError::Disconnected)
        );

        if done {
            if let Some(handle) = self.handle.take() {
                if handle.join().is_err() {
                    error("SYNC", "status poll thread panicked");
                }
            }
        } else if let Some(handle) = self.handle.take() {
            drop(handle);
        }

        done
    }
}
