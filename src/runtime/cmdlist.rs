//! # Command lists
//!
//! A command list records GPU operations into an engine-family specific
//! command buffer. Recording is transactional per append: the commands of
//! one operation are built and encoded on the side and only committed to the
//! list once every step succeeded, so a failed append leaves the list as it
//! was.
//!
//! Memory touched by an operation is recorded in the list's reference set.
//! It is only made resident when the closed list is submitted to a queue.

use crate::error::{ZeError, ZeResult};
use crate::kmd::engine::BatchSegment;
use crate::kmd::isa::{Command, CommandEncoder, EngineFamily, TimestampKind, encoder_for};
use crate::kmd::program::LaunchPayload;
use crate::kmd::storage::PhysicalMemory;
use crate::runtime::context::Context;
use crate::runtime::device::Device;
use crate::runtime::event::{
    CONTEXT_END_OFFSET, CONTEXT_START_OFFSET, Event, EventScopeFlags, GLOBAL_END_OFFSET,
    GLOBAL_START_OFFSET, KERNEL_TIMESTAMP_RESULT_SIZE, STATE_CLEARED, STATE_SIGNALED,
    TIMESTAMP_OFFSET,
};
use crate::runtime::kernel::Kernel;
use crate::runtime::memory::MemoryAdvice;
use crate::runtime::queue::{CommandQueue, CommandQueueDesc};
use crate::utils::is_aligned;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hint kind used for prefetches; advice hints use the `MemoryAdvice` value.
const HINT_PREFETCH: u32 = 0x100;

static NEXT_LIST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandListDesc {
    /// Engine group the list is encoded for; see `Device::command_queue_groups`.
    pub command_queue_group_ordinal: u32,
}

/// A box inside a pitched surface. `origin_x` and `width` are in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyRegion {
    pub origin_x: u32,
    pub origin_y: u32,
    pub origin_z: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// A pitched 2D/3D surface in GPU memory.
#[derive(Debug, Clone, Copy)]
pub struct Surface {
    pub ptr: u64,
    pub pitch: u32,
    pub slice_pitch: u32,
}

impl Surface {
    /// Address of the region's first byte and the span it covers.
    fn extent(&self, region: &CopyRegion) -> ZeResult<(u64, u64)> {
        let (pitch, slice) = (u64::from(self.pitch), u64::from(self.slice_pitch));
        if region.height > 1 && pitch < u64::from(region.width) {
            return Err(ZeError::invalid_arg(format!(
                "pitch {pitch} is narrower than the region width {}",
                region.width
            )));
        }
        if region.depth > 1 && slice < pitch.saturating_mul(u64::from(region.height)) {
            return Err(ZeError::invalid_arg(format!(
                "slice pitch {slice} is smaller than {} rows of {pitch}",
                region.height
            )));
        }

        let offset = |z: u32, y: u32, x: u32| -> Option<u64> {
            u64::from(z)
                .checked_mul(slice)?
                .checked_add(u64::from(y).checked_mul(pitch)?)?
                .checked_add(u64::from(x))
        };
        let start = offset(region.origin_z, region.origin_y, region.origin_x)
            .and_then(|o| self.ptr.checked_add(o));
        let span = offset(
            region.depth.saturating_sub(1),
            region.height.saturating_sub(1),
            region.width,
        );
        match (start, span) {
            (Some(start), Some(span)) if start.checked_add(span).is_some() => Ok((start, span)),
            _ => Err(ZeError::invalid_arg(format!(
                "region at 0x{:x} overflows the address space",
                self.ptr
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    Open,
    Closed,
}

/// Side buffer of one append; committed to the list only if it all encodes.
#[derive(Debug)]
struct Recording<'a> {
    context: &'a Context,
    launch_base: usize,
    commands: Vec<Command>,
    memory: Vec<Arc<PhysicalMemory>>,
    launches: Vec<LaunchPayload>,
    written_events: Vec<Arc<Event>>,
}

impl Recording<'_> {
    /// Validates `[ptr, ptr + size)` against the context and records its backing.
    fn touch(&mut self, ptr: u64, size: u64) -> ZeResult<()> {
        let blocks = self.context.resolve_range(ptr, size)?;
        self.memory.extend(blocks);
        Ok(())
    }

    /// Records every block reachable through a kernel buffer argument.
    fn touch_buffer(&mut self, ptr: u64) -> ZeResult<()> {
        let blocks = self.context.resolve_buffer(ptr)?;
        self.memory.extend(blocks);
        Ok(())
    }

    fn touch_event(&mut self, event: &Event) {
        self.memory.push(event.storage().backing().clone());
    }

    fn push(&mut self, cmd: Command) {
        self.commands.push(cmd);
    }

    fn launch(&mut self, payload: LaunchPayload) -> u32 {
        let index = self.launch_base + self.launches.len();
        self.launches.push(payload);
        u32::try_from(index).unwrap_or(u32::MAX)
    }
}

/// A recordable, replayable sequence of GPU operations for one engine family.
#[derive(Debug)]
pub struct CommandList {
    id: u64,
    context: Arc<Context>,
    device: Arc<Device>,
    ordinal: u32,
    encoder: Arc<dyn CommandEncoder>,
    state: ListState,
    dwords: Vec<u32>,
    launches: Vec<LaunchPayload>,
    references: Vec<Arc<PhysicalMemory>>,
    referenced_ids: HashSet<u64>,
    written_events: Vec<Arc<Event>>,
    closed: Option<BatchSegment>,
}

impl CommandList {
    /// # Errors
    /// `InvalidArgument` if the device is not in `context` or has no engine
    /// group `desc.command_queue_group_ordinal`.
    pub fn create(
        context: &Arc<Context>,
        device: &Arc<Device>,
        desc: &CommandListDesc,
    ) -> ZeResult<Self> {
        context.check_alive()?;
        if !context.contains_device(device) {
            return Err(ZeError::invalid_arg("device is not part of the context"));
        }
        let group = device.queue_group(desc.command_queue_group_ordinal)?;
        let encoder = encoder_for(group.family, device.kmd().hw_info());
        let id = NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "command list {id} created for {} engine of device {}",
            encoder.name(),
            device.ordinal()
        );
        Ok(Self {
            id,
            context: context.clone(),
            device: device.clone(),
            ordinal: desc.command_queue_group_ordinal,
            encoder,
            state: ListState::Open,
            dwords: Vec::new(),
            launches: Vec::new(),
            references: Vec::new(),
            referenced_ids: HashSet::new(),
            written_events: Vec::new(),
            closed: None,
        })
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn context(&self) -> &Arc<Context> {
        &self.context
    }

    #[must_use]
    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[must_use]
    pub const fn queue_group_ordinal(&self) -> u32 {
        self.ordinal
    }

    #[must_use]
    pub fn family(&self) -> EngineFamily {
        self.encoder.family()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == ListState::Closed
    }

    /// Dwords recorded so far, including the end marker once closed.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.dwords.len()
    }

    /// Number of distinct physical blocks the recorded operations touch.
    #[must_use]
    pub fn referenced_memory_count(&self) -> usize {
        self.references.len()
    }

    /// True if the recorded operations touch `memory`.
    #[must_use]
    pub fn references(&self, memory: &PhysicalMemory) -> bool {
        self.referenced_ids.contains(&memory.id())
    }

    pub(crate) fn referenced_memory(&self) -> &[Arc<PhysicalMemory>] {
        &self.references
    }

    pub(crate) fn written_events(&self) -> &[Arc<Event>] {
        &self.written_events
    }

    pub(crate) const fn segment(&self) -> Option<&BatchSegment> {
        self.closed.as_ref()
    }

    fn require_open(&self) -> ZeResult<()> {
        match self.state {
            ListState::Open => Ok(()),
            ListState::Closed => Err(ZeError::invalid_state(format!(
                "command list {} is closed",
                self.id
            ))),
        }
    }

    fn require_event(&self, event: &Event) -> ZeResult<()> {
        if Arc::ptr_eq(event.pool().context(), &self.context) {
            Ok(())
        } else {
            Err(ZeError::invalid_arg(
                "event belongs to a different context",
            ))
        }
    }

    // ===============================================================================================
    // Recording
    // ===============================================================================================

    /// Runs one append: waits, `body`, then the signal, committed atomically.
    fn record(
        &mut self,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
        body: impl FnOnce(&mut Recording<'_>) -> ZeResult<()>,
    ) -> ZeResult<()> {
        self.require_open()?;
        self.context.check_alive()?;
        for event in signal.into_iter().chain(waits.iter().copied()) {
            self.require_event(event)?;
        }

        let mut rec = Recording {
            context: &self.context,
            launch_base: self.launches.len(),
            commands: Vec::new(),
            memory: Vec::new(),
            launches: Vec::new(),
            written_events: Vec::new(),
        };

        for event in waits {
            rec.touch_event(event);
            rec.push(Command::SemaphoreWait {
                addr: event.gpu_address(),
                value: STATE_SIGNALED,
            });
        }

        let timed = signal.filter(|e| e.pool().has_timestamps());
        if let Some(event) = timed {
            let slot = event.gpu_address();
            rec.push(Command::Timestamp {
                dst: slot + GLOBAL_START_OFFSET,
                kind: TimestampKind::Global,
            });
            rec.push(Command::Timestamp {
                dst: slot + CONTEXT_START_OFFSET,
                kind: TimestampKind::Context,
            });
        }

        body(&mut rec)?;

        if let Some(event) = signal {
            let slot = event.gpu_address();
            if timed.is_some() {
                rec.push(Command::Timestamp {
                    dst: slot + GLOBAL_END_OFFSET,
                    kind: TimestampKind::Global,
                });
                rec.push(Command::Timestamp {
                    dst: slot + CONTEXT_END_OFFSET,
                    kind: TimestampKind::Context,
                });
            }
            if event
                .signal_scope()
                .intersects(EventScopeFlags::HOST | EventScopeFlags::DEVICE)
            {
                rec.push(Command::Barrier);
            }
            rec.push(Command::StoreData {
                addr: slot,
                value: STATE_SIGNALED,
            });
            rec.touch_event(event);
            rec.written_events.push(event.clone());
        }

        let Recording {
            commands,
            memory,
            launches,
            written_events,
            ..
        } = rec;
        self.commit(&commands, memory, launches, written_events)
    }

    fn commit(
        &mut self,
        commands: &[Command],
        memory: Vec<Arc<PhysicalMemory>>,
        launches: Vec<LaunchPayload>,
        written_events: Vec<Arc<Event>>,
    ) -> ZeResult<()> {
        let mut encoded = Vec::new();
        for cmd in commands {
            self.encoder.encode(cmd, &mut encoded)?;
        }

        self.dwords.extend(encoded);
        self.launches.extend(launches);
        for block in memory {
            if self.referenced_ids.insert(block.id()) {
                self.references.push(block);
            }
        }
        for event in written_events {
            if !self.written_events.iter().any(|e| Arc::ptr_eq(e, &event)) {
                self.written_events.push(event);
            }
        }
        Ok(())
    }

    // ===============================================================================================
    // Memory operations
    // ===============================================================================================

    /// Copies `size` bytes from `src` to `dst`. A zero-byte copy only waits
    /// and signals.
    ///
    /// # Errors
    /// `InvalidState` once closed, `InvalidArgument` for memory or events
    /// outside the context.
    pub fn append_memory_copy(
        &mut self,
        dst: u64,
        src: u64,
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> ZeResult<()> {
        self.record(signal, waits, |rec| {
            if size == 0 {
                return Ok(());
            }
            rec.touch(src, size)?;
            rec.touch(dst, size)?;
            rec.push(Command::Copy { src, dst, size });
            Ok(())
        })
    }

    /// Copies a box between two pitched surfaces.
    ///
    /// # Errors
    /// `InvalidArgument` if the regions differ in size, a pitch is too small
    /// for its region, or memory lies outside the context.
    pub fn append_memory_copy_region(
        &mut self,
        dst: Surface,
        dst_region: &CopyRegion,
        src: Surface,
        src_region: &CopyRegion,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> ZeResult<()> {
        let dims = |r: &CopyRegion| (r.width, r.height, r.depth);
        if dims(dst_region) != dims(src_region) {
            return Err(ZeError::invalid_arg(
                "source and destination regions differ in size",
            ));
        }
        let region = *src_region;

        self.record(signal, waits, |rec| {
            if region.width == 0 || region.height == 0 || region.depth == 0 {
                return Ok(());
            }
            let (src_start, src_span) = src.extent(src_region)?;
            let (dst_start, dst_span) = dst.extent(dst_region)?;
            rec.touch(src_start, src_span)?;
            rec.touch(dst_start, dst_span)?;
            rec.push(Command::CopyRegion {
                src: src_start,
                dst: dst_start,
                src_pitch: src.pitch,
                src_slice_pitch: src.slice_pitch,
                dst_pitch: dst.pitch,
                dst_slice_pitch: dst.slice_pitch,
                width: region.width,
                height: region.height,
                depth: region.depth,
            });
            Ok(())
        })
    }

    /// Fills `size` bytes at `ptr` by repeating `pattern`.
    ///
    /// # Errors
    /// `InvalidSize` for an empty or oversized pattern; copy engines reject
    /// patterns other than 1, 2 or 4 bytes with `UnsupportedFeature`.
    pub fn append_memory_fill(
        &mut self,
        ptr: u64,
        pattern: &[u8],
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> ZeResult<()> {
        if pattern.is_empty() {
            return Err(ZeError::InvalidSize("fill pattern is empty".into()));
        }
        self.record(signal, waits, |rec| {
            if size == 0 {
                return Ok(());
            }
            rec.touch(ptr, size)?;
            rec.push(Command::Fill {
                dst: ptr,
                size,
                pattern: pattern.to_vec(),
            });
            Ok(())
        })
    }

    /// Orders everything recorded before against everything after.
    ///
    /// # Errors
    /// `InvalidState` once closed.
    pub fn append_barrier(
        &mut self,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> ZeResult<()> {
        self.record(signal, waits, |rec| {
            rec.push(Command::Barrier);
            Ok(())
        })
    }

    /// Barrier limited to the given `(ptr, size)` ranges.
    ///
    /// # Errors
    /// `InvalidArgument` if a range is not memory of the context.
    pub fn append_memory_ranges_barrier(
        &mut self,
        ranges: &[(u64, u64)],
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> ZeResult<()> {
        self.record(signal, waits, |rec| {
            for &(ptr, size) in ranges.iter().filter(|(_, size)| *size > 0) {
                rec.context.resolve_range(ptr, size)?;
            }
            rec.push(Command::Barrier);
            Ok(())
        })
    }

    /// Writes the device global timestamp to the qword at `dst`.
    ///
    /// # Errors
    /// `InvalidArgument` unless `dst` is 8-byte aligned memory of the context.
    pub fn append_write_global_timestamp(
        &mut self,
        dst: u64,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> ZeResult<()> {
        if !is_aligned(dst, 8) {
            return Err(ZeError::invalid_arg(format!(
                "timestamp destination 0x{dst:x} is not 8-byte aligned"
            )));
        }
        self.record(signal, waits, |rec| {
            rec.touch(dst, 8)?;
            rec.push(Command::Timestamp {
                dst,
                kind: TimestampKind::Global,
            });
            Ok(())
        })
    }

    /// Hints that `[ptr, ptr + size)` will be used soon by this device.
    ///
    /// # Errors
    /// `InvalidArgument` for memory outside the context.
    pub fn append_memory_prefetch(&mut self, ptr: u64, size: u64) -> ZeResult<()> {
        self.record(None, &[], |rec| {
            if size == 0 {
                return Ok(());
            }
            rec.touch(ptr, size)?;
            rec.push(Command::Hint {
                addr: ptr,
                size,
                kind: HINT_PREFETCH,
            });
            Ok(())
        })
    }

    /// Records a memory usage hint. Has no effect on correctness.
    ///
    /// # Errors
    /// `InvalidArgument` for another device or memory outside the context.
    pub fn append_mem_advise(
        &mut self,
        device: &Device,
        ptr: u64,
        size: u64,
        advice: MemoryAdvice,
    ) -> ZeResult<()> {
        if !std::ptr::eq(device, self.device.as_ref()) {
            return Err(ZeError::invalid_arg(
                "advice targets a device other than the list's",
            ));
        }
        self.record(None, &[], |rec| {
            if size == 0 {
                return Ok(());
            }
            rec.touch(ptr, size)?;
            rec.push(Command::Hint {
                addr: ptr,
                size,
                kind: advice as u32,
            });
            Ok(())
        })
    }

    // ===============================================================================================
    // Kernel dispatch
    // ===============================================================================================

    /// Dispatches `kernel` over `group_count` work groups. Any zero
    /// dimension makes the launch a no-op.
    ///
    /// # Errors
    /// `InvalidArgument` for a kernel of another device or with unset
    /// arguments; `UnsupportedFeature` on a copy-engine list.
    pub fn append_launch_kernel(
        &mut self,
        kernel: &Kernel,
        group_count: [u32; 3],
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> ZeResult<()> {
        if !Arc::ptr_eq(kernel.module().device(), &self.device) {
            return Err(ZeError::invalid_arg(format!(
                "kernel {} was built for another device",
                kernel.name()
            )));
        }
        let payload = kernel.launch_payload()?;
        let buffers = kernel.buffer_arguments();

        self.record(signal, waits, |rec| {
            if group_count.contains(&0) {
                return Ok(());
            }
            for ptr in buffers {
                rec.touch_buffer(ptr)?;
            }
            let launch = rec.launch(payload);
            rec.push(Command::Dispatch {
                launch,
                group_count,
            });
            Ok(())
        })
    }

    /// Dispatches `kernel` over `global_size` work items using its current
    /// group size.
    ///
    /// # Errors
    /// `InvalidGroupSizeDimension` if the group size does not divide the
    /// global size; otherwise as [`CommandList::append_launch_kernel`].
    pub fn append_launch_kernel_for_global_size(
        &mut self,
        kernel: &Kernel,
        global_size: [u32; 3],
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> ZeResult<()> {
        let group = kernel.group_size();
        if global_size.iter().zip(group).any(|(&g, s)| g % s != 0) {
            return Err(ZeError::InvalidGroupSizeDimension);
        }
        let group_count = [0, 1, 2].map(|d| global_size[d] / group[d]);
        self.append_launch_kernel(kernel, group_count, signal, waits)
    }

    // ===============================================================================================
    // Events
    // ===============================================================================================

    /// Signals `event` once all prior work of the list has executed.
    ///
    /// # Errors
    /// `InvalidArgument` for an event of another context.
    pub fn append_signal_event(&mut self, event: &Arc<Event>) -> ZeResult<()> {
        self.record(Some(event), &[], |_| Ok(()))
    }

    /// Stalls the engine until every event in `events` is signaled.
    ///
    /// # Errors
    /// `InvalidArgument` for an event of another context.
    pub fn append_wait_on_events(&mut self, events: &[&Arc<Event>]) -> ZeResult<()> {
        self.record(None, events, |_| Ok(()))
    }

    /// Returns `event` to not-signaled from the GPU.
    ///
    /// # Errors
    /// `InvalidArgument` for an event of another context.
    pub fn append_event_reset(&mut self, event: &Arc<Event>) -> ZeResult<()> {
        self.require_event(event)?;
        self.record(None, &[], |rec| {
            rec.touch_event(event);
            rec.push(Command::StoreData {
                addr: event.gpu_address(),
                value: STATE_CLEARED,
            });
            rec.written_events.push(event.clone());
            Ok(())
        })
    }

    /// Copies the captured timestamps of each event to `dst`, 32 bytes per
    /// event: global start, global end, context start, context end. Waits
    /// for each event to be signaled first. Values are raw device ticks.
    ///
    /// # Errors
    /// `UnsupportedFeature` for events without kernel timestamps,
    /// `InvalidArgument` if `dst` is too small or outside the context.
    pub fn append_query_kernel_timestamps(
        &mut self,
        events: &[&Arc<Event>],
        dst: u64,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> ZeResult<()> {
        for event in events {
            self.require_event(event)?;
            if !event.pool().has_timestamps() {
                return Err(ZeError::UnsupportedFeature(
                    "event pool has no kernel timestamps".into(),
                ));
            }
        }
        self.record(signal, waits, |rec| {
            if events.is_empty() {
                return Ok(());
            }
            rec.touch(dst, events.len() as u64 * KERNEL_TIMESTAMP_RESULT_SIZE)?;
            for (i, event) in events.iter().enumerate() {
                let slot = event.gpu_address();
                rec.touch_event(event);
                rec.push(Command::SemaphoreWait {
                    addr: slot,
                    value: STATE_SIGNALED,
                });
                rec.push(Command::Copy {
                    src: slot + TIMESTAMP_OFFSET,
                    dst: dst + i as u64 * KERNEL_TIMESTAMP_RESULT_SIZE,
                    size: KERNEL_TIMESTAMP_RESULT_SIZE,
                });
            }
            Ok(())
        })
    }

    // ===============================================================================================
    // Lifecycle
    // ===============================================================================================

    /// Finalizes the buffer; the list becomes immutable and submittable.
    ///
    /// # Errors
    /// `InvalidState` if already closed.
    pub fn close(&mut self) -> ZeResult<()> {
        self.require_open()?;
        self.encoder
            .encode(&Command::BatchBufferEnd, &mut self.dwords)?;
        self.closed = Some(BatchSegment {
            dwords: Arc::from(self.dwords.as_slice()),
            launches: Arc::from(self.launches.as_slice()),
        });
        self.state = ListState::Closed;
        log::trace!(
            "command list {} closed: {} dwords, {} block(s) referenced",
            self.id,
            self.dwords.len(),
            self.references.len()
        );
        Ok(())
    }

    /// Discards all recorded work and reopens the list. Events the list
    /// referenced keep their state.
    pub fn reset(&mut self) {
        self.dwords.clear();
        self.launches.clear();
        self.references.clear();
        self.referenced_ids.clear();
        self.written_events.clear();
        self.closed = None;
        self.state = ListState::Open;
    }
}

// ===============================================================================================
// Immediate command lists
// ===============================================================================================

/// A command list bound to its own queue: every append is submitted at once.
#[derive(Debug)]
pub struct ImmediateCommandList {
    list: CommandList,
    queue: CommandQueue,
}

impl ImmediateCommandList {
    /// # Errors
    /// As [`CommandQueue::create`] and [`CommandList::create`].
    pub fn create(
        context: &Arc<Context>,
        device: &Arc<Device>,
        desc: &CommandQueueDesc,
    ) -> ZeResult<Self> {
        let queue = CommandQueue::create(context, device, desc)?;
        let list = CommandList::create(
            context,
            device,
            &CommandListDesc {
                command_queue_group_ordinal: desc.ordinal,
            },
        )?;
        Ok(Self { list, queue })
    }

    #[must_use]
    pub const fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Records with `record` and submits the result. The list is reopened
    /// afterwards whether or not the submission succeeded.
    ///
    /// # Errors
    /// Whatever recording or submission returns.
    pub fn append(
        &mut self,
        record: impl FnOnce(&mut CommandList) -> ZeResult<()>,
    ) -> ZeResult<()> {
        let result = record(&mut self.list)
            .and_then(|()| self.list.close())
            .and_then(|()| self.queue.execute_command_lists(&[&self.list], None));
        self.list.reset();
        result
    }

    /// # Errors
    /// As [`CommandQueue::synchronize`].
    pub fn synchronize(&self, timeout_ns: u64) -> ZeResult<()> {
        self.queue.synchronize(timeout_ns)
    }
}
