//! Exponential backoff with jitter, serialized by a lock.
//!
//! Only one retry cycle can be in flight per [`Backoff`]: [`Backoff::wait`]
//! hands out a [`Retry`] that holds the lock until it is dropped. This keeps
//! concurrent tasks from reconnecting at the same time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Error, ErrorSender, Result};
use crate::event::Event;

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(300);

pub const DEFAULT_PENDING_LIMIT: usize = 1024;

/// Upper bound (exclusive) of the random jitter added to every wait.
pub const MAX_JITTER: Duration = Duration::from_millis(1000);

/// What the owner does once a retry cycle's delay has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Dial the remote again and reopen the stream.
    Redial,
    /// Resend the events buffered with [`Backoff::add_event`].
    Resend,
}

#[derive(Debug, Default)]
struct State {
    counter: u32,
    wait: Duration,
    action: Option<ActionKind>,
    pending: VecDeque<Event>,
    locked: bool,
    exhausted_reported: bool,
    errors: Option<ErrorSender>,
}

/// Exponential backoff policy shared by the tasks of one client.
#[derive(Debug, Clone)]
pub struct Backoff {
    state: Arc<Mutex<State>>,
    released: Arc<Notify>,
    max_wait: Duration,
    pending_limit: usize,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WAIT)
    }
}

impl Backoff {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            released: Arc::new(Notify::new()),
            max_wait,
            pending_limit: DEFAULT_PENDING_LIMIT,
        }
    }

    /// Cap the resend buffer at `limit` events.
    pub fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = limit.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Bind the retry action and the channel exhaustion is reported on.
    pub fn register_action(&self, kind: ActionKind, errors: ErrorSender) {
        let mut state = self.state();
        state.action = Some(kind);
        state.errors = Some(errors);
    }

    pub fn action(&self) -> Option<ActionKind> {
        self.state().action
    }

    /// Buffer an event for the next [`ActionKind::Resend`] cycle.
    ///
    /// When the buffer is full the oldest event is evicted and returned.
    pub fn add_event(&self, event: Event) -> Option<Event> {
        let mut state = self.state();
        let evicted = if state.pending.len() >= self.pending_limit {
            state.pending.pop_front()
        } else {
            None
        };
        state.pending.push_back(event);
        evicted
    }

    /// Drain the events buffered for resend, oldest first.
    pub fn take_pending(&self) -> Vec<Event> {
        std::mem::take(&mut self.state().pending).into()
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn attempts(&self) -> u32 {
        self.state().counter
    }

    pub fn current_wait(&self) -> Duration {
        self.state().wait
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    /// Grow the wait for the next attempt: `2^attempts` ms plus jitter.
    /// No-op while a retry cycle holds the lock.
    pub fn increment(&self) {
        let mut state = self.state();
        if state.locked {
            return;
        }
        state.counter = state.counter.saturating_add(1);
        state.wait = compute_wait(state.counter);
    }

    /// Forget previous failures after a successful attempt.
    pub fn reset(&self) {
        let mut state = self.state();
        if state.locked {
            return;
        }
        state.counter = 0;
        state.wait = Duration::ZERO;
        state.exhausted_reported = false;
    }

    /// Start a retry cycle.
    ///
    /// Fails with [`Error::FailedRetry`] once the wait exceeds the ceiling,
    /// whether or not another cycle is running, and with
    /// [`Error::BackoffLocked`] while another cycle holds the lock.
    pub fn wait(&self) -> Result<Retry> {
        let mut state = self.state();

        if state.wait > self.max_wait {
            if !state.exhausted_reported {
                state.exhausted_reported = true;
                if let Some(errors) = &state.errors {
                    errors.report(Error::FailedRetry);
                }
            }
            return Err(Error::FailedRetry);
        }
        if state.locked {
            return Err(Error::BackoffLocked);
        }

        state.locked = true;
        debug!(
            attempt = state.counter,
            wait_ms = state.wait.as_millis() as u64,
            "Backoff cycle started"
        );

        Ok(Retry {
            backoff: self.clone(),
            delay: state.wait,
            action: state.action.unwrap_or(ActionKind::Redial),
        })
    }

    /// Resolves once no retry cycle holds the lock.
    pub async fn unlocked(&self) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register before checking so a release in between is not missed.
            released.as_mut().enable();
            if !self.is_locked() {
                return;
            }
            released.await;
        }
    }

    fn unlock(&self) {
        self.state().locked = false;
        self.released.notify_waiters();
    }
}

fn compute_wait(attempts: u32) -> Duration {
    let base_ms = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    let jitter_ms = StdRng::from_entropy().gen_range(0..MAX_JITTER.as_millis() as u64);
    Duration::from_millis(base_ms.saturating_add(jitter_ms))
}

/// One in-flight retry cycle. Holds the backoff lock until dropped.
#[derive(Debug)]
pub struct Retry {
    backoff: Backoff,
    delay: Duration,
    action: ActionKind,
}

impl Retry {
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn action(&self) -> ActionKind {
        self.action
    }

    /// Sleep for the computed delay, then release the lock and return the
    /// action the owner should execute.
    pub async fn run(self) -> ActionKind {
        tokio::time::sleep(self.delay).await;
        self.action
    }
}

impl Drop for Retry {
    fn drop(&mut self) {
        self.backoff.unlock();
    }
}
