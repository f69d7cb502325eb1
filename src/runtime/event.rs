use crate::error::{ZeError, ZeResult};
use crate::kmd::engine::CompletionCounter;
use crate::runtime::context::Context;
use crate::runtime::memory::{GraphicsAllocation, HostMemAllocDesc};
use crate::utils::lock;
use bitflags::bitflags;
use std::sync::{Arc, Mutex};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventPoolFlags: u32 {
        /// Events may be queried and waited on by the host.
        const HOST_VISIBLE = 1 << 0;
        const IPC = 1 << 1;
        /// Signals capture global and context kernel timestamps.
        const KERNEL_TIMESTAMP = 1 << 2;
    }
}

bitflags! {
    /// Cache coherence domain a signal or wait must reach.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventScopeFlags: u32 {
        const SUBDEVICE = 1 << 0;
        const DEVICE = 1 << 1;
        const HOST = 1 << 2;
    }
}

// Layout of one event slot in the pool allocation.
pub(crate) const EVENT_SLOT_SIZE: u64 = 64;
pub(crate) const STATE_OFFSET: u64 = 0;
pub(crate) const TIMESTAMP_OFFSET: u64 = 8;
pub(crate) const GLOBAL_START_OFFSET: u64 = 8;
pub(crate) const GLOBAL_END_OFFSET: u64 = 16;
pub(crate) const CONTEXT_START_OFFSET: u64 = 24;
pub(crate) const CONTEXT_END_OFFSET: u64 = 32;
/// Bytes of captured timestamps per event, as copied by
/// `append_query_kernel_timestamps`.
pub const KERNEL_TIMESTAMP_RESULT_SIZE: u64 = 32;

pub(crate) const STATE_CLEARED: u64 = 0;
pub(crate) const STATE_SIGNALED: u64 = 1;

#[derive(Debug, Clone, Copy)]
pub struct EventPoolDesc {
    pub count: u32,
    pub flags: EventPoolFlags,
}

/// A batch of events sharing one GPU-visible host allocation.
#[derive(Debug)]
pub struct EventPool {
    context: Arc<Context>,
    flags: EventPoolFlags,
    count: u32,
    storage: Arc<GraphicsAllocation>,
    timestamp_mask: u64,
    in_use: Mutex<Vec<bool>>,
}

impl EventPool {
    /// # Errors
    /// `InvalidArgument` for an empty pool; allocation failures of the
    /// backing host memory.
    pub fn create(context: &Arc<Context>, desc: &EventPoolDesc) -> ZeResult<Arc<Self>> {
        context.check_alive()?;
        if desc.count == 0 {
            return Err(ZeError::invalid_arg("event pool needs at least one event"));
        }

        let size = u64::from(desc.count) * EVENT_SLOT_SIZE;
        let ptr = context.mem_alloc_host(&HostMemAllocDesc::default(), size, EVENT_SLOT_SIZE)?;
        let storage = context
            .get_allocation(ptr)
            .ok_or_else(|| ZeError::invalid_state("event pool storage vanished"))?;

        // The narrowest timestamp width among the context's devices.
        let timestamp_mask = context
            .devices()
            .iter()
            .map(|d| d.kernel_timestamp_mask())
            .min()
            .unwrap_or(u64::MAX);

        log::debug!(
            "event pool of {} at 0x{ptr:x} ({:?})",
            desc.count,
            desc.flags
        );
        Ok(Arc::new(Self {
            context: context.clone(),
            flags: desc.flags,
            count: desc.count,
            storage,
            timestamp_mask,
            in_use: Mutex::new(vec![false; desc.count as usize]),
        }))
    }

    #[must_use]
    pub const fn flags(&self) -> EventPoolFlags {
        self.flags
    }

    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    #[must_use]
    pub const fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub(crate) fn has_timestamps(&self) -> bool {
        self.flags.contains(EventPoolFlags::KERNEL_TIMESTAMP)
    }

    fn slot_offset(index: u32) -> u64 {
        u64::from(index) * EVENT_SLOT_SIZE
    }

    fn read_u64(&self, index: u32, field: u64) -> ZeResult<u64> {
        self.storage
            .backing()
            .read_u64(Self::slot_offset(index) + field)
    }

    fn write_u64(&self, index: u32, field: u64, value: u64) -> ZeResult<()> {
        self.storage
            .backing()
            .write_u64(Self::slot_offset(index) + field, value)
    }

    fn clear_slot(&self, index: u32) -> ZeResult<()> {
        self.storage.backing().write(
            Self::slot_offset(index),
            &[0u8; (TIMESTAMP_OFFSET + KERNEL_TIMESTAMP_RESULT_SIZE) as usize],
        )
    }
}

impl Drop for EventPool {
    fn drop(&mut self) {
        if let Err(e) = self.context.mem_free(self.storage.gpu_va()) {
            log::warn!("failed to free event pool storage: {e}");
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EventDesc {
    pub index: u32,
    pub signal: EventScopeFlags,
    pub wait: EventScopeFlags,
}

/// Start and end ticks of one clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelTimestampData {
    pub kernel_start: u64,
    pub kernel_end: u64,
}

/// Timestamps captured around the operation that signaled an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelTimestampResult {
    /// Device-wide clock.
    pub global: KernelTimestampData,
    /// Clock that only runs while the executing context is scheduled.
    pub context: KernelTimestampData,
    valid_mask: u64,
}

impl KernelTimestampResult {
    /// Execution time in ticks, from the context clock so that time the
    /// context spent switched out is excluded. Wraps within the valid bits.
    #[must_use]
    pub const fn duration(&self) -> u64 {
        self.context
            .kernel_end
            .wrapping_sub(self.context.kernel_start)
            & self.valid_mask
    }
}

#[derive(Debug)]
struct PendingSignal {
    counter: Arc<CompletionCounter>,
    task: u64,
}

/// One slot of an event pool.
///
/// Signaled by the GPU with a store to the slot, or by the host. Both sides
/// observe the same memory.
#[derive(Debug)]
pub struct Event {
    pool: Arc<EventPool>,
    index: u32,
    signal_scope: EventScopeFlags,
    wait_scope: EventScopeFlags,
    /// Latest writing task per completion counter.
    pending: Mutex<Vec<PendingSignal>>,
}

impl Event {
    /// # Errors
    /// `InvalidArgument` if `desc.index` is out of range or already in use.
    pub fn create(pool: &Arc<EventPool>, desc: &EventDesc) -> ZeResult<Arc<Self>> {
        if desc.index >= pool.count {
            return Err(ZeError::invalid_arg(format!(
                "event index {} out of range for pool of {}",
                desc.index, pool.count
            )));
        }
        {
            let mut in_use = lock(&pool.in_use);
            let slot = &mut in_use[desc.index as usize];
            if *slot {
                return Err(ZeError::invalid_arg(format!(
                    "event index {} is already in use",
                    desc.index
                )));
            }
            *slot = true;
        }
        pool.clear_slot(desc.index)?;

        Ok(Arc::new(Self {
            pool: pool.clone(),
            index: desc.index,
            signal_scope: desc.signal,
            wait_scope: desc.wait,
            pending: Mutex::new(Vec::new()),
        }))
    }

    #[must_use]
    pub const fn pool(&self) -> &Arc<EventPool> {
        &self.pool
    }

    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn signal_scope(&self) -> EventScopeFlags {
        self.signal_scope
    }

    #[must_use]
    pub const fn wait_scope(&self) -> EventScopeFlags {
        self.wait_scope
    }

    /// GPU address of the slot's state qword.
    #[must_use]
    pub fn gpu_address(&self) -> u64 {
        self.pool.storage.gpu_va() + EventPool::slot_offset(self.index)
    }

    pub(crate) fn storage(&self) -> &Arc<GraphicsAllocation> {
        &self.pool.storage
    }

    fn is_signaled(&self) -> bool {
        self.pool
            .read_u64(self.index, STATE_OFFSET)
            .is_ok_and(|s| s == STATE_SIGNALED)
    }

    /// Records that task `task` of `counter` will write this event.
    pub(crate) fn mark_pending(&self, counter: &Arc<CompletionCounter>, task: u64) {
        let mut pending = lock(&self.pending);
        pending.retain(|p| !Arc::ptr_eq(&p.counter, counter) && !p.counter.has_passed(p.task));
        pending.push(PendingSignal {
            counter: counter.clone(),
            task,
        });
    }

    fn in_flight(&self) -> bool {
        lock(&self.pending)
            .iter()
            .any(|p| !p.counter.has_passed(p.task))
    }

    /// # Errors
    /// `DeviceLost` if a device of the context has faulted.
    pub fn host_signal(&self) -> ZeResult<()> {
        self.pool.context.check_alive()?;
        self.pool.write_u64(self.index, STATE_OFFSET, STATE_SIGNALED)?;
        self.pool.context.interrupt().raise();
        Ok(())
    }

    /// Non-blocking status check.
    ///
    /// # Errors
    /// `NotReady` while not signaled, `DeviceLost` after a device fault.
    pub fn query_status(&self) -> ZeResult<()> {
        self.pool.context.check_alive()?;
        if self.is_signaled() {
            Ok(())
        } else {
            Err(ZeError::NotReady)
        }
    }

    /// Blocks until the event is signaled or `timeout_ns` elapses.
    ///
    /// # Errors
    /// `NotReady` on timeout, `DeviceLost` after a device fault.
    pub fn host_synchronize(&self, timeout_ns: u64) -> ZeResult<()> {
        self.pool.context.check_alive()?;
        self.pool
            .context
            .host_wait(timeout_ns, || self.is_signaled())
    }

    /// Returns the event to not-signaled and clears captured timestamps.
    ///
    /// # Errors
    /// `InvalidState` while a submission that writes this event has not
    /// retired.
    pub fn host_reset(&self) -> ZeResult<()> {
        self.pool.context.check_alive()?;
        if self.in_flight() {
            return Err(ZeError::invalid_state(
                "event is still referenced by in-flight work",
            ));
        }
        lock(&self.pending).clear();
        self.pool.clear_slot(self.index)
    }

    /// Timestamps captured when the event was last signaled.
    ///
    /// # Errors
    /// `UnsupportedFeature` unless the pool was created with
    /// `KERNEL_TIMESTAMP`, `NotReady` while the event is not signaled.
    pub fn query_kernel_timestamp(&self) -> ZeResult<KernelTimestampResult> {
        self.pool.context.check_alive()?;
        if !self.pool.has_timestamps() {
            return Err(ZeError::UnsupportedFeature(
                "event pool has no kernel timestamps".into(),
            ));
        }
        if !self.is_signaled() {
            return Err(ZeError::NotReady);
        }

        let mask = self.pool.timestamp_mask;
        let read = |field| self.pool.read_u64(self.index, field).map(|v| v & mask);
        Ok(KernelTimestampResult {
            global: KernelTimestampData {
                kernel_start: read(GLOBAL_START_OFFSET)?,
                kernel_end: read(GLOBAL_END_OFFSET)?,
            },
            context: KernelTimestampData {
                kernel_start: read(CONTEXT_START_OFFSET)?,
                kernel_end: read(CONTEXT_END_OFFSET)?,
            },
            valid_mask: mask,
        })
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if let Some(slot) = lock(&self.pool.in_use).get_mut(self.index as usize) {
            *slot = false;
        }
    }
}
