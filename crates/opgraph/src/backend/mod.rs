//! Backend-facing contracts: the program description, the computation client boundary, devices,
//! structural hashing and the rendezvous interface.
pub mod client;
pub mod device;
pub mod hashing;
pub mod mesh;
pub mod spec;
pub mod topology;

pub use client::{ClientError, ClientResult, ComputationClient, DataHandle, DeviceBuffer};
pub use device::{Device, DeviceType};
