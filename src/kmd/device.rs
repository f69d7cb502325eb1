#![allow(clippy::cast_possible_truncation)]

use crate::config::DeviceConfig;
use crate::error::{ZeError, ZeResult};
use crate::kmd::GpuFault;
use crate::kmd::engine::HwContext;
use crate::kmd::hw_info::{HwInfo, hw_info};
use crate::kmd::interrupt::InterruptLine;
use crate::kmd::isa::{EngineFamily, encoder_for};
use crate::kmd::storage::{MemoryPool, PhysicalMemory};
use crate::utils::lock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The kernel-mode side of one GPU.
///
/// Owns local-memory accounting, the device clock and the lost state. Cheap
/// to share: every engine thread holds an `Arc` to it.
#[derive(Debug)]
pub struct KmdDevice {
    ordinal: u32,
    hw: &'static HwInfo,
    local_memory_size: u64,
    physical_limit: u64,
    allocated_local: Arc<AtomicU64>,
    lost: AtomicBool,
    fault: Mutex<Option<GpuFault>>,
    interrupt: Arc<InterruptLine>,
    boot: Instant,
    next_context_id: AtomicU32,
}

impl KmdDevice {
    #[must_use]
    pub fn new(ordinal: u32, config: &DeviceConfig, interrupt: Arc<InterruptLine>) -> Arc<Self> {
        Arc::new(Self {
            ordinal,
            hw: hw_info(config.family),
            local_memory_size: config.local_memory_size,
            physical_limit: config.physical_allocation_limit(),
            allocated_local: Arc::new(AtomicU64::new(0)),
            lost: AtomicBool::new(false),
            fault: Mutex::new(None),
            interrupt,
            boot: Instant::now(),
            next_context_id: AtomicU32::new(0),
        })
    }

    #[must_use]
    pub const fn ordinal(&self) -> u32 {
        self.ordinal
    }

    #[must_use]
    pub const fn hw_info(&self) -> &'static HwInfo {
        self.hw
    }

    #[must_use]
    pub const fn local_memory_size(&self) -> u64 {
        self.local_memory_size
    }

    /// Bytes of local memory currently backing physical allocations.
    #[must_use]
    pub fn allocated_local(&self) -> u64 {
        self.allocated_local.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn interrupt(&self) -> &Arc<InterruptLine> {
        &self.interrupt
    }

    // ========================================================================
    // Device loss
    // ========================================================================

    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Fault that lost the device, if any.
    #[must_use]
    pub fn lost_reason(&self) -> Option<GpuFault> {
        lock(&self.fault).clone()
    }

    pub fn mark_lost(&self, fault: &GpuFault) {
        {
            let mut slot = lock(&self.fault);
            if slot.is_none() {
                log::error!("device {} lost: {fault}", self.ordinal);
                *slot = Some(fault.clone());
            }
        }
        self.lost.store(true, Ordering::Release);
        self.interrupt.raise();
    }

    /// # Errors
    /// `DeviceLost` once any engine of this device has faulted.
    pub fn check_alive(&self) -> ZeResult<()> {
        if self.is_lost() {
            Err(ZeError::DeviceLost)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Clocks
    // ========================================================================

    /// Converts a host duration into device timer ticks.
    #[must_use]
    pub fn ticks(&self, elapsed: Duration) -> u64 {
        let ticks = elapsed.as_nanos() * u128::from(self.hw.timer_frequency_hz) / 1_000_000_000;
        ticks.min(u128::from(u64::MAX)) as u64
    }

    /// Device-wide monotonic timestamp in timer ticks.
    #[must_use]
    pub fn global_timestamp(&self) -> u64 {
        self.ticks(self.boot.elapsed())
    }

    // ========================================================================
    // Memory and contexts
    // ========================================================================

    /// Allocates a physical block. Local blocks are charged against the
    /// device's physical allocation limit.
    ///
    /// # Errors
    /// `OutOfDeviceMemory` if the limit would be exceeded, `OutOfHostMemory`
    /// if backing pages cannot be mapped.
    pub fn allocate_physical(&self, size: u64, pool: MemoryPool) -> ZeResult<Arc<PhysicalMemory>> {
        match pool {
            MemoryPool::System => Ok(Arc::new(PhysicalMemory::new(size, pool, None, None)?)),
            MemoryPool::Local => {
                self.allocated_local
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                        used.checked_add(size).filter(|&n| n <= self.physical_limit)
                    })
                    .map_err(|used| {
                        log::debug!(
                            "device {}: local allocation of {size} bytes refused ({used} of {} in use)",
                            self.ordinal,
                            self.physical_limit
                        );
                        ZeError::OutOfDeviceMemory
                    })?;

                // Refund the charge if the pages cannot be mapped.
                PhysicalMemory::new(
                    size,
                    pool,
                    Some(self.ordinal),
                    Some(self.allocated_local.clone()),
                )
                .map(Arc::new)
                .inspect_err(|_| {
                    self.allocated_local.fetch_sub(size, Ordering::AcqRel);
                })
            }
        }
    }

    /// Number of engines of `family`.
    #[must_use]
    pub const fn engine_count(&self, family: EngineFamily) -> u32 {
        match family {
            EngineFamily::Compute => self.hw.compute_engines,
            EngineFamily::Copy => self.hw.copy_engines,
        }
    }

    /// Starts a new hardware context on an engine of `family`.
    ///
    /// # Errors
    /// `UnsupportedFeature` if the device has no engine of that family.
    pub fn create_hw_context(self: &Arc<Self>, family: EngineFamily) -> ZeResult<HwContext> {
        self.check_alive()?;
        if self.engine_count(family) == 0 {
            return Err(ZeError::UnsupportedFeature(format!(
                "{} has no {family:?} engine",
                self.hw.name
            )));
        }
        let id = self.next_context_id.fetch_add(1, Ordering::Relaxed);
        HwContext::spawn(id, encoder_for(family, self.hw), self.clone())
    }
}
