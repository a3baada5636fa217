//! Completion barrier for a fixed number of asynchronous units.
//!
//! Units report through [`MultiWait::done`], usually via [`MultiWait::completer`], which also
//! captures the unit's error. The waiter is released once every unit reported and receives the
//! first captured error, if any. "First" means first captured under the barrier's lock, not first
//! scheduled.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Error captured from an asynchronous unit, shared between every waiter that observes it.
///
/// The original `anyhow::Error` is kept intact so callers can still `downcast_ref` to the
/// concrete type that was raised on the worker thread.
#[derive(Clone)]
pub struct TaskError(Arc<anyhow::Error>);

impl TaskError {
    pub fn new(err: anyhow::Error) -> Self {
        TaskError(Arc::new(err))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Recovers the original error when this is the last reference to it.
    pub fn into_error(self) -> anyhow::Error {
        match Arc::try_unwrap(self.0) {
            Ok(err) => err,
            Err(shared) => anyhow::Error::new(TaskError(shared)),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for TaskError {}

#[derive(Debug, Clone, Error)]
pub enum WaitError {
    #[error(transparent)]
    Failed(#[from] TaskError),
    #[error("wait timed out after {timeout:?} with {completed}/{count} units completed")]
    TimedOut {
        timeout: Duration,
        completed: usize,
        count: usize,
    },
}

struct WaitState {
    count: usize,
    completed: usize,
    error: Option<TaskError>,
}

pub struct MultiWait {
    state: Mutex<WaitState>,
    cv: Condvar,
}

impl MultiWait {
    pub fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(WaitState {
                count,
                completed: 0,
                error: None,
            }),
            cv: Condvar::new(),
        }
    }

    /// Reports one finished unit. Wakes waiters once all units reported.
    pub fn done(&self) {
        let notify = {
            let mut state = self.lock();
            if state.completed >= state.count {
                tracing::warn!(
                    count = state.count,
                    "multi-wait received more completions than expected"
                );
                return;
            }
            state.completed += 1;
            state.completed == state.count
        };
        if notify {
            self.cv.notify_all();
        }
    }

    /// Blocks until every unit reported, then returns the first captured error.
    pub fn wait(&self) -> Result<(), TaskError> {
        let state = self.lock();
        let state = self
            .cv
            .wait_while(state, |state| state.completed < state.count)
            .unwrap_or_else(PoisonError::into_inner);
        match &state.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Like [`MultiWait::wait`], but gives up after `timeout`.
    ///
    /// Work that is still running is not cancelled; the barrier stays armed and a later `wait`
    /// can still observe the release.
    pub fn wait_for(&self, timeout: Duration) -> Result<(), WaitError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.completed < state.count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::error!(
                    ?timeout,
                    completed = state.completed,
                    count = state.count,
                    "multi-wait timed out"
                );
                return Err(WaitError::TimedOut {
                    timeout,
                    completed: state.completed,
                    count: state.count,
                });
            }
            state = self
                .cv
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        match &state.error {
            Some(err) => Err(WaitError::Failed(err.clone())),
            None => Ok(()),
        }
    }

    /// Re-arms the barrier for a new round. Must not race with a round still in flight.
    pub fn reset(&self, count: usize) {
        let mut state = self.lock();
        state.count = count;
        state.completed = 0;
        state.error = None;
    }

    /// Records `err` unless an earlier error was already captured.
    pub fn capture(&self, err: anyhow::Error) {
        let mut state = self.lock();
        if state.error.is_none() {
            state.error = Some(TaskError::new(err));
        } else {
            tracing::debug!(error = %format!("{err:#}"), "discarding later multi-wait error");
        }
    }

    /// Wraps `f` so its error is captured and [`MultiWait::done`] runs exactly once afterwards.
    pub fn completer<'a, F>(&'a self, f: F) -> impl FnOnce() + Send + 'a
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'a,
    {
        move || {
            if let Err(err) = f() {
                self.capture(err);
            }
            self.done();
        }
    }

    pub fn count(&self) -> usize {
        self.lock().count
    }

    pub fn completed(&self) -> usize {
        self.lock().completed
    }

    fn lock(&self) -> MutexGuard<'_, WaitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for MultiWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MultiWait")
            .field("count", &state.count)
            .field("completed", &state.completed)
            .field("failed", &state.error.is_some())
            .finish()
    }
}
