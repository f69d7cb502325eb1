use crate::config::DriverConfig;
use crate::error::{ZeError, ZeResult};
use crate::kmd::device::KmdDevice;
use crate::kmd::interrupt::InterruptLine;
use crate::runtime::context::Context;
use crate::runtime::device::Device;
use crate::utils::lock;
use std::sync::{Arc, Mutex};

// ===============================================================================================
// Driver
// ===============================================================================================

/// The driver instance: configuration plus the devices it enumerated.
#[derive(Debug)]
pub struct Driver {
    config: DriverConfig,
    devices: Vec<Arc<Device>>,
    interrupt: Arc<InterruptLine>,
}

impl Driver {
    /// Brings up every device listed in `config`.
    ///
    /// # Errors
    /// `InvalidArgument` if a device is configured without local memory.
    pub fn new(config: DriverConfig) -> ZeResult<Arc<Self>> {
        let interrupt = Arc::new(InterruptLine::new());
        let mut devices = Vec::with_capacity(config.devices.len());

        for (ordinal, dev_config) in (0u32..).zip(&config.devices) {
            if dev_config.local_memory_size == 0 {
                return Err(ZeError::invalid_arg(format!(
                    "device {ordinal} configured without local memory"
                )));
            }
            let kmd = KmdDevice::new(ordinal, dev_config, interrupt.clone());
            let device = Device::new(kmd, dev_config.name.as_deref());
            log::debug!(
                "enumerated device {ordinal}: {} ({} MiB local)",
                device.properties().name,
                dev_config.local_memory_size >> 20
            );
            devices.push(Arc::new(device));
        }

        Ok(Arc::new(Self {
            config,
            devices,
            interrupt,
        }))
    }

    #[must_use]
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    #[must_use]
    pub const fn interrupt(&self) -> &Arc<InterruptLine> {
        &self.interrupt
    }

    /// Creates a context spanning every device of the driver.
    ///
    /// # Errors
    /// See [`Context::new`].
    pub fn create_context(self: &Arc<Self>) -> ZeResult<Arc<Context>> {
        Context::new(self, &self.devices)
    }
}

// ===============================================================================================
// Global Singleton Management
// ===============================================================================================

static GLOBAL_DRIVER: Mutex<Option<Arc<Driver>>> = Mutex::new(None);

/// Returns the process-wide driver, creating it with the default
/// configuration on first use.
///
/// # Errors
/// Propagates driver creation failures.
pub fn acquire() -> ZeResult<Arc<Driver>> {
    acquire_with(DriverConfig::default)
}

/// Like [`acquire`], but builds the configuration with `config` if the
/// driver does not exist yet. An existing driver is returned unchanged.
///
/// # Errors
/// Propagates driver creation failures.
pub fn acquire_with(config: impl FnOnce() -> DriverConfig) -> ZeResult<Arc<Driver>> {
    let mut guard = lock(&GLOBAL_DRIVER);

    if let Some(driver) = guard.as_ref() {
        return Ok(driver.clone());
    }

    let driver = Driver::new(config())?;
    *guard = Some(driver.clone());
    drop(guard);

    Ok(driver)
}

/// Drops the process-wide driver. Objects still holding it keep it alive.
pub fn release() {
    lock(&GLOBAL_DRIVER).take();
}
