use thiserror::Error;

use crate::memory::Pid;

/// Errors surfaced to host code through the driver's public API.
///
/// Simulator-internal invariant violations (a response with no matching
/// command, a missing page during migration, workgroup under-coverage) are
/// wiring bugs and abort the simulation instead of returning one of these.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("unknown device id {0}")]
    UnknownDevice(usize),

    #[error("device {0} is not a GPU")]
    NotAGpu(usize),

    #[error("unified device needs at least one member GPU")]
    EmptyUnifiedDevice,

    #[error("out of device memory on device {0}")]
    OutOfDeviceMemory(usize),

    #[error("no allocation at {vaddr:#x} for {pid}")]
    NotMapped { pid: Pid, vaddr: u64 },
}

pub type Result<T> = std::result::Result<T, DriverError>;
