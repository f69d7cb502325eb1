use crate::kmd::GpuFault;
use crate::kmd::page_table::GpuAddressSpace;
use std::fmt::Debug;
use std::sync::Arc;

/// Kind of a kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// A GPU pointer.
    Buffer,
    /// A by-value argument of the given byte size.
    Value(usize),
}

/// A bound kernel argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelArg {
    Unset,
    Buffer(u64),
    Value(Vec<u8>),
}

/// Device code produced by the kernel compiler, executable by compute engines.
pub trait KernelProgram: Debug + Send + Sync {
    fn name(&self) -> &str;

    fn arg_kinds(&self) -> &[ArgKind];

    /// Runs the whole dispatch described by `inv`.
    ///
    /// # Errors
    /// Any `GpuFault`; the engine stops and the device is marked lost.
    fn execute(&self, inv: &mut DispatchInvocation<'_>) -> Result<(), GpuFault>;
}

/// Everything an engine needs to run one dispatch, captured at append time.
#[derive(Debug, Clone)]
pub struct LaunchPayload {
    pub program: Arc<dyn KernelProgram>,
    pub group_size: [u32; 3],
    pub args: Vec<KernelArg>,
}

/// The view a running kernel gets of its launch and of GPU memory.
pub struct DispatchInvocation<'a> {
    pub group_count: [u32; 3],
    pub group_size: [u32; 3],
    args: &'a [KernelArg],
    memory: &'a GpuAddressSpace,
}

impl<'a> DispatchInvocation<'a> {
    pub(crate) fn new(
        payload: &'a LaunchPayload,
        group_count: [u32; 3],
        memory: &'a GpuAddressSpace,
    ) -> Self {
        Self {
            group_count,
            group_size: payload.group_size,
            args: &payload.args,
            memory,
        }
    }

    /// Global work size along each dimension.
    #[must_use]
    pub fn global_size(&self) -> [u64; 3] {
        [0, 1, 2].map(|d| u64::from(self.group_count[d]) * u64::from(self.group_size[d]))
    }

    pub fn buffer_arg(&self, index: usize) -> Result<u64, GpuFault> {
        match self.args.get(index) {
            Some(KernelArg::Buffer(ptr)) => Ok(*ptr),
            other => Err(GpuFault::Kernel(format!(
                "argument {index} is not a buffer: {other:?}"
            ))),
        }
    }

    pub fn value_arg(&self, index: usize) -> Result<&[u8], GpuFault> {
        match self.args.get(index) {
            Some(KernelArg::Value(bytes)) => Ok(bytes),
            other => Err(GpuFault::Kernel(format!(
                "argument {index} is not a value: {other:?}"
            ))),
        }
    }

    pub fn read(&self, va: u64, buf: &mut [u8]) -> Result<(), GpuFault> {
        self.memory.read(va, buf)
    }

    pub fn write(&self, va: u64, data: &[u8]) -> Result<(), GpuFault> {
        self.memory.write(va, data)
    }
}
