//! Running IR graphs on a computation client, either fused or one program per node.
pub mod chain;
pub mod fused;
pub mod op_by_op;

use std::time::Duration;

use crate::env;

pub use chain::{ChainedOp, OpInput, RootOutput};
pub use fused::{execute_fused, lower_fused};
pub use op_by_op::{ExecutorStats, OpByOpExecutor};

/// Tunables for [`OpByOpExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum number of compiled per-node programs kept.
    pub compile_cache_size: usize,
    /// Worker pool size; `None` uses one worker per core.
    pub worker_threads: Option<usize>,
    /// Upper bound for [`OpByOpExecutor::wait`]; `None` waits indefinitely.
    pub wait_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            compile_cache_size: env::DEFAULT_COMPILE_CACHE_SIZE,
            worker_threads: None,
            wait_timeout: None,
        }
    }
}

impl ExecutorConfig {
    /// Reads `OPGRAPH_COMPILE_CACHE_SIZE`, `OPGRAPH_WORKER_THREADS` and
    /// `OPGRAPH_WAIT_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        Self {
            compile_cache_size: env::compile_cache_size(),
            worker_threads: env::worker_threads(),
            wait_timeout: env::wait_timeout(),
        }
    }

    pub fn with_compile_cache_size(mut self, size: usize) -> Self {
        self.compile_cache_size = size;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }
}
