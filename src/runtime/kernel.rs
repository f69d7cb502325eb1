use crate::error::{ZeError, ZeResult};
use crate::kmd::program::{ArgKind, KernelArg, KernelProgram, LaunchPayload};
use crate::runtime::device::{Device, DeviceProperties};
use std::sync::Arc;

/// Input format of a module binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormat {
    IlSpirv,
    Native,
}

#[derive(Debug, Clone)]
pub struct ModuleDesc {
    pub format: ModuleFormat,
    pub input: Vec<u8>,
    pub build_flags: String,
}

/// The kernel compiler: turns a module binary into executable kernels.
pub trait KernelCompiler {
    /// Builds every kernel in `desc` for `device`.
    ///
    /// # Errors
    /// The build log on failure.
    fn build(
        &self,
        device: &DeviceProperties,
        desc: &ModuleDesc,
    ) -> Result<Vec<Arc<dyn KernelProgram>>, String>;
}

/// A built module: the kernels one binary produced for one device.
#[derive(Debug)]
pub struct Module {
    device: Arc<Device>,
    kernels: Vec<Arc<dyn KernelProgram>>,
}

impl Module {
    /// # Errors
    /// `InvalidArgument` for an empty binary, `ModuleBuildFailure` carrying
    /// the compiler log if the build fails.
    pub fn create(
        device: &Arc<Device>,
        desc: &ModuleDesc,
        compiler: &dyn KernelCompiler,
    ) -> ZeResult<Arc<Self>> {
        device.check_alive()?;
        if desc.input.is_empty() {
            return Err(ZeError::invalid_arg("module binary is empty"));
        }

        let kernels = compiler.build(device.properties(), desc).map_err(|log| {
            log::debug!("module build failed on device {}: {log}", device.ordinal());
            ZeError::ModuleBuildFailure { log }
        })?;

        log::debug!(
            "built {:?} module with {} kernel(s) for device {}",
            desc.format,
            kernels.len(),
            device.ordinal()
        );
        Ok(Arc::new(Self {
            device: device.clone(),
            kernels,
        }))
    }

    #[must_use]
    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[must_use]
    pub fn kernel_names(&self) -> Vec<&str> {
        self.kernels.iter().map(|k| k.name()).collect()
    }

    /// # Errors
    /// `InvalidArgument` if the module has no kernel called `name`.
    pub fn create_kernel(self: &Arc<Self>, name: &str) -> ZeResult<Kernel> {
        let program = self
            .kernels
            .iter()
            .find(|k| k.name() == name)
            .cloned()
            .ok_or_else(|| ZeError::invalid_arg(format!("no kernel named {name:?}")))?;

        let args = vec![KernelArg::Unset; program.arg_kinds().len()];
        Ok(Kernel {
            module: self.clone(),
            program,
            group_size: [1, 1, 1],
            args,
        })
    }
}

/// A kernel with its launch state: group size and bound arguments.
#[derive(Debug, Clone)]
pub struct Kernel {
    module: Arc<Module>,
    program: Arc<dyn KernelProgram>,
    group_size: [u32; 3],
    args: Vec<KernelArg>,
}

impl Kernel {
    #[must_use]
    pub fn name(&self) -> &str {
        self.program.name()
    }

    #[must_use]
    pub const fn module(&self) -> &Arc<Module> {
        &self.module
    }

    #[must_use]
    pub const fn group_size(&self) -> [u32; 3] {
        self.group_size
    }

    fn limits(&self) -> (u32, [u32; 3]) {
        let props = self.module.device.properties();
        (props.max_group_size, props.max_group_size_per_dim)
    }

    /// # Errors
    /// `InvalidGroupSizeDimension` if a dimension is zero or exceeds the
    /// device limits.
    pub fn set_group_size(&mut self, x: u32, y: u32, z: u32) -> ZeResult<()> {
        let (max_total, max_dim) = self.limits();
        let size = [x, y, z];
        let total = size.iter().map(|&d| u64::from(d)).product::<u64>();
        if size.iter().zip(max_dim).any(|(&d, m)| d == 0 || d > m) || total > u64::from(max_total) {
            return Err(ZeError::InvalidGroupSizeDimension);
        }
        self.group_size = size;
        Ok(())
    }

    /// Largest group size that evenly divides `global` within device limits,
    /// filled greedily from x to z.
    ///
    /// # Errors
    /// `InvalidGroupSizeDimension` if any global dimension is zero.
    pub fn suggest_group_size(&self, global: [u32; 3]) -> ZeResult<[u32; 3]> {
        if global.contains(&0) {
            return Err(ZeError::InvalidGroupSizeDimension);
        }
        let (mut budget, max_dim) = self.limits();
        let mut out = [1u32; 3];
        for d in 0..3 {
            let cap = max_dim[d].min(budget).min(global[d]);
            let g = (1..=cap).rev().find(|g| global[d] % g == 0).unwrap_or(1);
            out[d] = g;
            budget /= g;
        }
        Ok(out)
    }

    fn arg_kind(&self, index: u32) -> ZeResult<ArgKind> {
        self.program
            .arg_kinds()
            .get(index as usize)
            .copied()
            .ok_or_else(|| {
                ZeError::invalid_arg(format!("{} has no argument {index}", self.name()))
            })
    }

    /// Binds argument `index` from raw bytes. A buffer argument takes the
    /// 8-byte little-endian GPU pointer.
    ///
    /// # Errors
    /// `InvalidArgument` for an unknown index, `InvalidSize` if `value` does
    /// not match the argument size.
    pub fn set_argument_value(&mut self, index: u32, value: &[u8]) -> ZeResult<()> {
        let arg = match self.arg_kind(index)? {
            ArgKind::Buffer => {
                let raw: [u8; 8] = value.try_into().map_err(|_| {
                    ZeError::InvalidSize(format!("buffer argument {index} takes 8 bytes"))
                })?;
                KernelArg::Buffer(u64::from_le_bytes(raw))
            }
            ArgKind::Value(size) if size == value.len() => KernelArg::Value(value.to_vec()),
            ArgKind::Value(size) => {
                return Err(ZeError::InvalidSize(format!(
                    "argument {index} takes {size} bytes, got {}",
                    value.len()
                )));
            }
        };
        self.args[index as usize] = arg;
        Ok(())
    }

    /// # Errors
    /// `InvalidArgument` unless argument `index` is a buffer.
    pub fn set_argument_buffer(&mut self, index: u32, ptr: u64) -> ZeResult<()> {
        match self.arg_kind(index)? {
            ArgKind::Buffer => {
                self.args[index as usize] = KernelArg::Buffer(ptr);
                Ok(())
            }
            ArgKind::Value(_) => Err(ZeError::invalid_arg(format!(
                "argument {index} of {} is not a buffer",
                self.name()
            ))),
        }
    }

    /// GPU pointers bound to buffer arguments; null pointers are skipped.
    #[must_use]
    pub fn buffer_arguments(&self) -> Vec<u64> {
        self.args
            .iter()
            .filter_map(|a| match a {
                KernelArg::Buffer(ptr) if *ptr != 0 => Some(*ptr),
                _ => None,
            })
            .collect()
    }

    /// Snapshot of the launch state for a dispatch.
    ///
    /// # Errors
    /// `InvalidArgument` if an argument was never set.
    pub fn launch_payload(&self) -> ZeResult<LaunchPayload> {
        if let Some(index) = self.args.iter().position(|a| *a == KernelArg::Unset) {
            return Err(ZeError::invalid_arg(format!(
                "argument {index} of {} is not set",
                self.name()
            )));
        }
        Ok(LaunchPayload {
            program: self.program.clone(),
            group_size: self.group_size,
            args: self.args.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::kmd::GpuFault;
    use crate::kmd::program::DispatchInvocation;
    use crate::runtime::driver::Driver;

    #[derive(Debug)]
    struct Nop;

    impl KernelProgram for Nop {
        fn name(&self) -> &str {
            "nop"
        }

        fn arg_kinds(&self) -> &[ArgKind] {
            &[ArgKind::Buffer, ArgKind::Value(4)]
        }

        fn execute(&self, _inv: &mut DispatchInvocation<'_>) -> Result<(), GpuFault> {
            Ok(())
        }
    }

    struct Compiler;

    impl KernelCompiler for Compiler {
        fn build(
            &self,
            _device: &DeviceProperties,
            desc: &ModuleDesc,
        ) -> Result<Vec<Arc<dyn KernelProgram>>, String> {
            if desc.build_flags.contains("-bad") {
                return Err("error: unknown option -bad".into());
            }
            Ok(vec![Arc::new(Nop)])
        }
    }

    fn module(flags: &str) -> ZeResult<Arc<Module>> {
        let driver = Driver::new(DriverConfig::default()).unwrap();
        let desc = ModuleDesc {
            format: ModuleFormat::IlSpirv,
            input: vec![0x07, 0x23, 0x02, 0x03],
            build_flags: flags.into(),
        };
        Module::create(&driver.devices()[0], &desc, &Compiler)
    }

    #[test]
    fn build_failure_carries_log() {
        let err = module("-bad").unwrap_err();
        assert_eq!(
            err,
            ZeError::ModuleBuildFailure {
                log: "error: unknown option -bad".into()
            }
        );
    }

    #[test]
    fn payload_requires_every_argument() {
        let module = module("").unwrap();
        assert_eq!(module.kernel_names(), ["nop"]);
        let mut kernel = module.create_kernel("nop").unwrap();
        assert!(module.create_kernel("missing").is_err());

        kernel.set_argument_buffer(0, 0x1000).unwrap();
        assert!(kernel.launch_payload().is_err());
        assert!(kernel.set_argument_value(1, &[0; 8]).is_err());
        assert!(kernel.set_argument_buffer(1, 0x1000).is_err());
        kernel.set_argument_value(1, &7u32.to_le_bytes()).unwrap();

        let payload = kernel.launch_payload().unwrap();
        assert_eq!(payload.args[0], KernelArg::Buffer(0x1000));
        assert_eq!(kernel.buffer_arguments(), [0x1000]);
    }

    #[test]
    fn group_size_limits() {
        let module = module("").unwrap();
        let mut kernel = module.create_kernel("nop").unwrap();
        assert_eq!(
            kernel.set_group_size(0, 1, 1),
            Err(ZeError::InvalidGroupSizeDimension)
        );
        assert_eq!(
            kernel.set_group_size(512, 2, 1),
            Err(ZeError::InvalidGroupSizeDimension)
        );
        kernel.set_group_size(64, 2, 1).unwrap();
        assert_eq!(kernel.group_size(), [64, 2, 1]);

        assert_eq!(kernel.suggest_group_size([1000, 3, 1]).unwrap(), [500, 1, 1]);
        assert_eq!(kernel.suggest_group_size([16, 16, 4]).unwrap(), [16, 16, 2]);
    }
}
