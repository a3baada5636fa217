//! Boundary to the device runtime that compiles and runs programs.
//!
//! The executor and the lowering context consume exactly `compile`, `execute` and `transfer`.
//! Everything about how a backend allocates memory or schedules kernels stays behind this trait.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::backend::device::Device;
use crate::backend::spec::{Program, TensorLiteral, TensorSpec};

/// Device-resident buffer produced by a computation client.
pub trait DeviceBuffer: Send + Sync + 'static {
    fn device(&self) -> &Device;

    fn spec(&self) -> &TensorSpec;

    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a device buffer. Identity is the allocation, not the contents.
pub type DataHandle = Arc<dyn DeviceBuffer>;

impl fmt::Debug for dyn DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceBuffer({} on {})", self.spec(), self.device())
    }
}

/// Stable identity of a buffer allocation, usable as a map key while the handle is alive.
pub fn data_identity(data: &DataHandle) -> usize {
    Arc::as_ptr(data) as *const () as usize
}

/// Errors surfaced by a computation client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("compilation failed on {device}: {message}")]
    Compile { device: String, message: String },
    #[error("execution failed on {device}: {message}")]
    Execution { device: String, message: String },
    #[error("transfer to {device} failed: {message}")]
    Transfer { device: String, message: String },
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
}

impl ClientError {
    pub fn compile(device: &Device, message: impl Into<String>) -> Self {
        ClientError::Compile {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn execution(device: &Device, message: impl Into<String>) -> Self {
        ClientError::Execution {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn transfer(device: &Device, message: impl Into<String>) -> Self {
        ClientError::Transfer {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        ClientError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Device runtime that turns programs into executable computations.
pub trait ComputationClient: Send + Sync + 'static {
    /// Backend-compiled artifact. Immutable once produced and shareable across threads.
    type Computation: Send + Sync + 'static;

    /// Human-readable backend identifier (e.g. `"cpu"`).
    fn name(&self) -> &str;

    /// Compiles `program` for `device`. `devices` lists every device the program may later
    /// be replicated to.
    fn compile(
        &self,
        program: &Program,
        device: &Device,
        devices: &[Device],
    ) -> ClientResult<Self::Computation>;

    /// Runs a compiled computation. Returns one handle per entry-function result.
    fn execute(
        &self,
        computation: &Self::Computation,
        inputs: &[DataHandle],
        device: &Device,
    ) -> ClientResult<Vec<DataHandle>>;

    /// Moves host data onto `device`.
    fn transfer(&self, literal: TensorLiteral, device: &Device) -> ClientResult<DataHandle>;

    /// Reads a buffer back to the host.
    fn to_literal(&self, data: &DataHandle) -> ClientResult<TensorLiteral>;
}
