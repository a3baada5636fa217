//! Reference CPU client: interprets programs directly over host memory.
//!
//! Every `CPU:n` device is served by the same interpreter; buffers remember the device they were
//! placed on so device mismatches still surface.
pub mod cpu;

pub use cpu::{CpuBuffer, CpuClient, CpuComputation, CpuTensor, TensorData};
