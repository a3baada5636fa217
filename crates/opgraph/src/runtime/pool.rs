use anyhow::{Context, Result};
use rayon::{Scope, ThreadPool, ThreadPoolBuilder};

/// Shared pool of worker threads on which compiles, executions and async tasks run.
pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    /// Builds a pool with `threads` workers, or rayon's default when `None`.
    pub fn new(threads: Option<usize>) -> Result<Self> {
        let mut builder =
            ThreadPoolBuilder::new().thread_name(|index| format!("opgraph-worker-{index}"));
        if let Some(threads) = threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder.build().context("failed to build worker pool")?;
        tracing::debug!(threads = pool.current_num_threads(), "worker pool started");
        Ok(Self { pool })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(crate::env::worker_threads())
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Fire-and-forget execution of `f` on a worker.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(f);
    }

    /// Runs `op` with a scope whose spawned jobs may borrow from the caller.
    ///
    /// Returns once every job spawned in the scope finished. Safe to call from a worker of this
    /// pool: the calling worker keeps executing jobs while it waits.
    pub fn scope<'scope, OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce(&Scope<'scope>) -> R + Send,
        R: Send,
    {
        self.pool.scope(op)
    }
}
