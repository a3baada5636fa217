//! Concurrency building blocks: the worker pool, asynchronous tasks, the multi-wait completion
//! barrier and the shared LRU cache.
pub mod async_task;
pub mod cache;
pub mod multi_wait;
pub mod pool;

pub use async_task::AsyncTask;
pub use cache::{Cache, CacheStats};
pub use multi_wait::{MultiWait, TaskError, WaitError};
pub use pool::WorkerPool;
