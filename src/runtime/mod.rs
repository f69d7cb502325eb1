pub mod cmdlist;
pub mod context;
pub mod device;
pub mod driver;
pub mod event;
pub mod fence;
pub mod kernel;
pub mod memory;
pub mod queue;
pub mod residency;
