//! A Level-Zero style GPU compute driver core.
//!
//! The crate is split like a real driver stack:
//!
//! * [`kmd`] models the kernel-mode side of an Intel GPU: physical memory,
//!   GPU page tables, the command ISA and hardware contexts that execute
//!   command buffers on engine threads.
//! * [`runtime`] is the user-mode driver on top of it: driver and device
//!   enumeration, contexts with virtual memory and USM allocations,
//!   residency, command lists, events, fences and command queues.

pub mod config;
pub mod error;
pub mod kmd;
pub mod runtime;
pub mod utils;

pub use config::{DefaultQueueMode, DeviceConfig, DriverConfig};
pub use error::{ZeError, ZeResult};
pub use kmd::hw_info::HwFamily;
pub use kmd::interrupt::INFINITE_TIMEOUT;
pub use kmd::page_table::AccessAttribute;
pub use runtime::cmdlist::{CommandList, CommandListDesc, ImmediateCommandList};
pub use runtime::context::Context;
pub use runtime::device::Device;
pub use runtime::driver::Driver;
pub use runtime::event::{Event, EventDesc, EventPool, EventPoolDesc, EventPoolFlags, EventScopeFlags};
pub use runtime::fence::{Fence, FenceDesc};
pub use runtime::queue::{CommandQueue, CommandQueueBuilder, CommandQueueDesc, CommandQueueMode};
