use crate::kmd::hw_info::HwFamily;
use crate::utils::MIB;
use std::time::Duration;

/// Mode applied to queues created with `CommandQueueMode::Default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultQueueMode {
    Synchronous,
    Asynchronous,
}

/// Configuration of one simulated device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub family: HwFamily,
    /// Device-local memory size; bounds the resident set.
    pub local_memory_size: u64,
    /// Upper bound on device-local physical allocations. `None` means twice
    /// `local_memory_size`.
    pub max_physical_allocation: Option<u64>,
    pub name: Option<String>,
}

impl DeviceConfig {
    #[must_use]
    pub const fn new(family: HwFamily) -> Self {
        Self {
            family,
            local_memory_size: 256 * MIB,
            max_physical_allocation: None,
            name: None,
        }
    }

    #[must_use]
    pub const fn local_memory(mut self, size: u64) -> Self {
        self.local_memory_size = size;
        self
    }

    #[must_use]
    pub const fn max_physical_allocation(mut self, size: u64) -> Self {
        self.max_physical_allocation = Some(size);
        self
    }

    #[must_use]
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn physical_allocation_limit(&self) -> u64 {
        self.max_physical_allocation
            .unwrap_or_else(|| self.local_memory_size.saturating_mul(2))
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new(HwFamily::Gen12Lp)
    }
}

/// Driver-wide configuration, fixed at driver creation.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub devices: Vec<DeviceConfig>,
    /// Busy-poll window of host waits before they sleep on the interrupt line.
    pub host_wait_spin: Duration,
    /// Guard pages placed around driver-chosen allocation addresses.
    pub allocation_guard_pages: u64,
    pub default_queue_mode: DefaultQueueMode,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            devices: vec![DeviceConfig::default()],
            host_wait_spin: Duration::from_micros(20),
            allocation_guard_pages: 1,
            default_queue_mode: DefaultQueueMode::Asynchronous,
        }
    }
}

impl DriverConfig {
    /// A configuration with no devices; add them with `with_device`.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            devices: Vec::new(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.devices.push(device);
        self
    }

    #[must_use]
    pub const fn host_wait_spin(mut self, spin: Duration) -> Self {
        self.host_wait_spin = spin;
        self
    }

    #[must_use]
    pub const fn guard_pages(mut self, pages: u64) -> Self {
        self.allocation_guard_pages = pages;
        self
    }

    #[must_use]
    pub const fn default_queue_mode(mut self, mode: DefaultQueueMode) -> Self {
        self.default_queue_mode = mode;
        self
    }
}
