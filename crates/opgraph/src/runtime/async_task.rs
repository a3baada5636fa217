//! Single-result asynchronous unit of work.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::anyhow;

use super::multi_wait::{TaskError, WaitError};
use super::pool::WorkerPool;

type TaskFn<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send>;

struct TaskSlot<T> {
    taskfn: Option<TaskFn<T>>,
    scheduled: bool,
    completed: bool,
    result: Option<T>,
    error: Option<TaskError>,
}

struct TaskState<T> {
    slot: Mutex<TaskSlot<T>>,
    cv: Condvar,
}

impl<T> TaskState<T> {
    fn lock(&self) -> MutexGuard<'_, TaskSlot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wraps a closure producing `T` so it can run on a [`WorkerPool`] and be waited on later.
///
/// Cloning the task clones the handle; all clones observe the same result.
pub struct AsyncTask<T> {
    state: Arc<TaskState<T>>,
}

impl<T> Clone for AsyncTask<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> AsyncTask<T> {
    pub fn new<F>(taskfn: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self {
            state: Arc::new(TaskState {
                slot: Mutex::new(TaskSlot {
                    taskfn: Some(Box::new(taskfn)),
                    scheduled: false,
                    completed: false,
                    result: None,
                    error: None,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Submits the task to `pool`.
    ///
    /// # Panics
    /// Scheduling the same task twice is a programming error.
    pub fn schedule(&self, pool: &WorkerPool) -> &Self {
        let taskfn = {
            let mut slot = self.state.lock();
            assert!(!slot.scheduled, "async task scheduled twice");
            slot.scheduled = true;
            slot.taskfn.take()
        };
        let state = Arc::clone(&self.state);
        pool.spawn(move || {
            let outcome = match taskfn {
                Some(taskfn) => taskfn(),
                None => Err(anyhow!("async task body missing")),
            };
            let mut slot = state.lock();
            match outcome {
                Ok(value) => slot.result = Some(value),
                Err(err) => slot.error = Some(TaskError::new(err)),
            }
            slot.completed = true;
            drop(slot);
            state.cv.notify_all();
        });
        self
    }

    pub fn is_scheduled(&self) -> bool {
        self.state.lock().scheduled
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    /// Blocks until the task finished; returns the task's error if it failed.
    pub fn wait(&self) -> Result<&Self, TaskError> {
        let slot = self.state.lock();
        let slot = self
            .state
            .cv
            .wait_while(slot, |slot| !slot.completed)
            .unwrap_or_else(PoisonError::into_inner);
        match &slot.error {
            Some(err) => Err(err.clone()),
            None => Ok(self),
        }
    }

    pub fn wait_for(&self, timeout: Duration) -> Result<&Self, WaitError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.state.lock();
        while !slot.completed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::error!(?timeout, "async task wait timed out");
                return Err(WaitError::TimedOut {
                    timeout,
                    completed: 0,
                    count: 1,
                });
            }
            slot = self
                .state
                .cv
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        match &slot.error {
            Some(err) => Err(WaitError::Failed(err.clone())),
            None => Ok(self),
        }
    }

    /// Waits, then applies `f` to the result without taking it.
    pub fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, TaskError> {
        self.wait()?;
        let slot = self.state.lock();
        slot.result
            .as_ref()
            .map(f)
            .ok_or_else(|| TaskError::new(anyhow!("async task value already consumed")))
    }

    /// Waits, then moves the result out. Later calls report the value as consumed.
    pub fn consume_value(&self) -> Result<T, TaskError> {
        self.wait()?;
        let mut slot = self.state.lock();
        slot.result
            .take()
            .ok_or_else(|| TaskError::new(anyhow!("async task value already consumed")))
    }
}

impl<T> fmt::Debug for AsyncTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.state.lock();
        f.debug_struct("AsyncTask")
            .field("scheduled", &slot.scheduled)
            .field("completed", &slot.completed)
            .field("failed", &slot.error.is_some())
            .finish()
    }
}
