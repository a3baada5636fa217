//! Deferred tensor graphs lowered to backend programs and executed fused or node by node.
//!
//! The crate is organised leaves first:
//!
//! - [`backend`]: structural hashing, the program description backends compile, the computation
//!   client and mesh interfaces.
//! - [`ir`]: the immutable, structurally hashed node graph and the lowering context.
//! - [`runtime`]: worker pool, async tasks, the multi-wait barrier and the LRU cache.
//! - [`exec`]: fused and op-by-op execution over a computation client.
//!
//! Logging goes through `tracing`; the library never installs a subscriber.
pub mod backend;
mod env;
pub mod exec;
pub mod ir;
pub mod profiling;
pub mod runtime;

pub use backend::{ClientError, ComputationClient, DataHandle, Device, DeviceBuffer, DeviceType};
pub use exec::{ExecutorConfig, OpByOpExecutor};
pub use ir::{Node, NodePtr, OpKind, Value};
pub use runtime::{AsyncTask, Cache, MultiWait, TaskError, WaitError, WorkerPool};
