#![allow(dead_code)]

use std::sync::Arc;
use ze_rs::kmd::GpuFault;
use ze_rs::kmd::program::{ArgKind, DispatchInvocation, KernelProgram};
use ze_rs::runtime::device::DeviceProperties;
use ze_rs::runtime::kernel::{Kernel, KernelCompiler, Module, ModuleDesc, ModuleFormat};
use ze_rs::runtime::memory::{DeviceMemAllocDesc, HostMemAllocDesc};
use ze_rs::{
    CommandList, CommandListDesc, CommandQueue, CommandQueueBuilder, CommandQueueMode, Context,
    Device, Driver, DriverConfig,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Env {
    pub driver: Arc<Driver>,
    pub context: Arc<Context>,
    pub device: Arc<Device>,
}

pub fn setup() -> Env {
    setup_with(DriverConfig::default())
}

pub fn setup_with(config: DriverConfig) -> Env {
    init_logging();
    let driver = Driver::new(config).unwrap();
    let context = driver.create_context().unwrap();
    let device = driver.devices()[0].clone();
    Env {
        driver,
        context,
        device,
    }
}

impl Env {
    pub fn queue(&self, mode: CommandQueueMode) -> CommandQueue {
        CommandQueueBuilder::new(&self.context, &self.device)
            .with_mode(mode)
            .create()
            .unwrap()
    }

    pub fn copy_queue(&self, mode: CommandQueueMode) -> CommandQueue {
        CommandQueueBuilder::new(&self.context, &self.device)
            .with_ordinal(1)
            .with_mode(mode)
            .create()
            .unwrap()
    }

    pub fn list(&self) -> CommandList {
        CommandList::create(&self.context, &self.device, &CommandListDesc::default()).unwrap()
    }

    pub fn copy_list(&self) -> CommandList {
        CommandList::create(
            &self.context,
            &self.device,
            &CommandListDesc {
                command_queue_group_ordinal: 1,
            },
        )
        .unwrap()
    }

    pub fn device_alloc(&self, size: u64) -> u64 {
        self.context
            .mem_alloc_device(&DeviceMemAllocDesc::default(), size, 0, &self.device)
            .unwrap()
    }

    pub fn host_alloc(&self, size: u64) -> u64 {
        self.context
            .mem_alloc_host(&HostMemAllocDesc::default(), size, 0)
            .unwrap()
    }

    pub fn read(&self, ptr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.context.read_memory(ptr, &mut buf).unwrap();
        buf
    }

    pub fn kernel(&self, name: &str) -> Kernel {
        let desc = ModuleDesc {
            format: ModuleFormat::Native,
            input: b"test kernels".to_vec(),
            build_flags: String::new(),
        };
        let module = Module::create(&self.device, &desc, &TestCompiler).unwrap();
        module.create_kernel(name).unwrap()
    }
}

/// `iota(buf, scale)`: writes `i * scale` as a `u32` at `buf + 4 * i` for
/// every global work item `i` along x.
#[derive(Debug)]
pub struct Iota;

impl KernelProgram for Iota {
    fn name(&self) -> &str {
        "iota"
    }

    fn arg_kinds(&self) -> &[ArgKind] {
        &[ArgKind::Buffer, ArgKind::Value(4)]
    }

    fn execute(&self, inv: &mut DispatchInvocation<'_>) -> Result<(), GpuFault> {
        let buf = inv.buffer_arg(0)?;
        let raw = inv.value_arg(1)?;
        let scale = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        for i in 0..inv.global_size()[0] {
            let value = u32::try_from(i).unwrap_or(u32::MAX) * scale;
            inv.write(buf + 4 * i, &value.to_le_bytes())?;
        }
        Ok(())
    }
}

/// `poke(ptr)`: writes one byte at `ptr`.
#[derive(Debug)]
pub struct Poke;

impl KernelProgram for Poke {
    fn name(&self) -> &str {
        "poke"
    }

    fn arg_kinds(&self) -> &[ArgKind] {
        &[ArgKind::Buffer]
    }

    fn execute(&self, inv: &mut DispatchInvocation<'_>) -> Result<(), GpuFault> {
        let ptr = inv.buffer_arg(0)?;
        inv.write(ptr, &[0xAB])
    }
}

pub struct TestCompiler;

impl KernelCompiler for TestCompiler {
    fn build(
        &self,
        _device: &DeviceProperties,
        _desc: &ModuleDesc,
    ) -> Result<Vec<Arc<dyn KernelProgram>>, String> {
        Ok(vec![Arc::new(Iota), Arc::new(Poke)])
    }
}
