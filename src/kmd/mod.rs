//! Software model of the kernel-mode driver and the GPU behind it.
//!
//! Physical memory, page tables, engines and clocks live here. The runtime
//! only reaches the hardware through this module.

pub mod device;
pub mod engine;
pub mod hw_info;
pub mod interrupt;
pub mod isa;
pub mod page_table;
pub mod program;
pub mod storage;

use thiserror::Error;

/// A fault raised by an engine while executing a command buffer.
///
/// Faults never reach API callers directly; they mark the device lost.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuFault {
    #[error("page fault at 0x{0:x}: address not mapped")]
    NotPresent(u64),

    #[error("protection fault at 0x{va:x} on {access:?} access")]
    Protection { va: u64, access: AccessKind },

    #[error("page fault at 0x{0:x}: backing memory is not resident")]
    NotResident(u64),

    #[error("malformed command stream: {0}")]
    BadCommand(String),

    #[error("kernel fault: {0}")]
    Kernel(String),

    #[error("execution aborted")]
    Aborted,
}

/// The kind of access an engine performs on GPU memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}
