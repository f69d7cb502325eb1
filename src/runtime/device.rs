use crate::error::{ZeError, ZeResult};
use crate::kmd::device::KmdDevice;
use crate::kmd::hw_info::HwFamily;
use crate::kmd::isa::EngineFamily;
use crate::kmd::storage::PhysicalMemory;
use crate::runtime::memory::GraphicsAllocation;
use crate::runtime::residency::ResidencyTracker;
use crate::utils::lock;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Static description of a device, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub name: String,
    pub family: HwFamily,
    pub ordinal: u32,
    pub local_memory_size: u64,
    /// Largest single allocation the device accepts.
    pub max_mem_alloc_size: u64,
    pub timer_resolution_hz: u64,
    pub kernel_timestamp_valid_bits: u32,
    pub max_group_size: u32,
    pub max_group_size_per_dim: [u32; 3],
    pub page_sizes: Vec<u64>,
}

/// One engine group a command queue or list can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandQueueGroupProperties {
    pub ordinal: u32,
    pub family: EngineFamily,
    pub num_queues: u32,
    pub supports_kernels: bool,
    pub max_memory_fill_pattern_size: u32,
}

/// A GPU as seen by the runtime.
#[derive(Debug)]
pub struct Device {
    kmd: Arc<KmdDevice>,
    properties: DeviceProperties,
    residency: Mutex<ResidencyTracker>,
}

impl Device {
    pub(crate) fn new(kmd: Arc<KmdDevice>, name: Option<&str>) -> Self {
        let hw = kmd.hw_info();
        let properties = DeviceProperties {
            name: name.map_or_else(|| format!("{} GPU {}", hw.name, kmd.ordinal()), str::to_string),
            family: hw.family,
            ordinal: kmd.ordinal(),
            local_memory_size: kmd.local_memory_size(),
            max_mem_alloc_size: kmd.local_memory_size(),
            timer_resolution_hz: hw.timer_frequency_hz,
            kernel_timestamp_valid_bits: hw.kernel_timestamp_valid_bits,
            max_group_size: hw.max_group_size,
            max_group_size_per_dim: hw.max_group_size_per_dim,
            page_sizes: hw.page_sizes.to_vec(),
        };
        let residency = Mutex::new(ResidencyTracker::new(kmd.local_memory_size()));
        Self {
            kmd,
            properties,
            residency,
        }
    }

    #[must_use]
    pub const fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    #[must_use]
    pub const fn ordinal(&self) -> u32 {
        self.properties.ordinal
    }

    #[must_use]
    pub const fn kmd(&self) -> &Arc<KmdDevice> {
        &self.kmd
    }

    /// Engine groups: ordinal 0 is compute, ordinal 1 is copy when present.
    #[must_use]
    pub fn command_queue_groups(&self) -> Vec<CommandQueueGroupProperties> {
        let hw = self.kmd.hw_info();
        let mut groups = vec![CommandQueueGroupProperties {
            ordinal: 0,
            family: EngineFamily::Compute,
            num_queues: hw.compute_engines,
            supports_kernels: true,
            max_memory_fill_pattern_size: hw.max_fill_pattern_size,
        }];
        if hw.copy_engines > 0 {
            groups.push(CommandQueueGroupProperties {
                ordinal: 1,
                family: EngineFamily::Copy,
                num_queues: hw.copy_engines,
                supports_kernels: false,
                max_memory_fill_pattern_size: 4,
            });
        }
        groups
    }

    /// # Errors
    /// `InvalidArgument` if `ordinal` names no engine group.
    pub fn queue_group(&self, ordinal: u32) -> ZeResult<CommandQueueGroupProperties> {
        self.command_queue_groups()
            .into_iter()
            .find(|g| g.ordinal == ordinal)
            .ok_or_else(|| ZeError::invalid_arg(format!("no command queue group {ordinal}")))
    }

    /// Page granularity used for an allocation of `size` bytes.
    #[must_use]
    pub fn query_page_size(&self, size: u64) -> u64 {
        self.kmd.hw_info().page_size_for(size)
    }

    /// Smallest mapping granularity the device supports.
    #[must_use]
    pub fn min_page_size(&self) -> u64 {
        self.kmd.hw_info().min_page_size()
    }

    /// Host time (ns since the Unix epoch) and device ticks sampled together.
    ///
    /// # Errors
    /// `DeviceLost` if the device has faulted.
    pub fn global_timestamps(&self) -> ZeResult<(u64, u64)> {
        self.check_alive()?;
        let device = self.kmd.global_timestamp();
        let host = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
        Ok((host, device))
    }

    #[must_use]
    pub fn kernel_timestamp_mask(&self) -> u64 {
        self.kmd.hw_info().kernel_timestamp_mask()
    }

    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.kmd.is_lost()
    }

    /// # Errors
    /// `DeviceLost` once an engine of this device has faulted.
    pub fn check_alive(&self) -> ZeResult<()> {
        self.kmd.check_alive()
    }

    pub(crate) fn residency(&self) -> MutexGuard<'_, ResidencyTracker> {
        lock(&self.residency)
    }

    /// Whether `allocation` is currently in this device's resident set.
    #[must_use]
    pub fn is_resident(&self, allocation: &GraphicsAllocation) -> bool {
        self.residency().is_resident(allocation.backing())
    }

    #[must_use]
    pub fn is_memory_resident(&self, memory: &PhysicalMemory) -> bool {
        self.residency().is_resident(memory)
    }

    /// Bytes of local memory currently resident.
    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.residency().used()
    }
}
