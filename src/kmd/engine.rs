#![allow(clippy::cast_possible_truncation)]

use crate::error::{ZeError, ZeResult};
use crate::kmd::GpuFault;
use crate::kmd::device::KmdDevice;
use crate::kmd::isa::{Command, CommandEncoder, TimestampKind};
use crate::kmd::page_table::GpuAddressSpace;
use crate::kmd::program::{DispatchInvocation, LaunchPayload};
use crate::utils::lock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const SEMAPHORE_POLL: Duration = Duration::from_millis(5);

/// Retirement progress of one hardware context.
///
/// Tasks are numbered from 1 in submission order; a task has retired once
/// `completed >= task`. An aborted context never retires anything again, so
/// every task counts as passed for lifetime tracking.
#[derive(Debug, Default)]
pub struct CompletionCounter {
    completed: AtomicU64,
    aborted: AtomicBool,
}

impl CompletionCounter {
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn has_completed(&self, task: u64) -> bool {
        self.completed() >= task
    }

    /// True once `task` can no longer be touched by the engine.
    #[must_use]
    pub fn has_passed(&self, task: u64) -> bool {
        self.is_aborted() || self.has_completed(task)
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn retire(&self, task: u64) {
        self.completed.fetch_max(task, Ordering::AcqRel);
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

/// One closed command buffer with the launches its dispatches refer to.
#[derive(Debug, Clone)]
pub struct BatchSegment {
    pub dwords: Arc<[u32]>,
    pub launches: Arc<[LaunchPayload]>,
}

/// A unit of submission: segments run back to back, then the task retires.
#[derive(Debug)]
pub struct Batch {
    pub task: u64,
    pub segments: Vec<BatchSegment>,
    pub address_space: Arc<GpuAddressSpace>,
}

#[derive(Debug, Default)]
struct RingState {
    pending: VecDeque<Batch>,
    last_reserved: u64,
    shutdown: bool,
}

#[derive(Debug)]
struct EngineShared {
    id: u32,
    ring: Mutex<RingState>,
    doorbell: Condvar,
    stopping: AtomicBool,
    counter: Arc<CompletionCounter>,
    encoder: Arc<dyn CommandEncoder>,
    device: Arc<KmdDevice>,
    /// Ticks accumulated by completed batches on this context.
    context_ticks: AtomicU64,
}

/// A hardware execution context: a ring of batches drained by one engine thread.
#[derive(Debug)]
pub struct HwContext {
    shared: Arc<EngineShared>,
    thread: Option<JoinHandle<()>>,
}

impl HwContext {
    pub(crate) fn spawn(
        id: u32,
        encoder: Arc<dyn CommandEncoder>,
        device: Arc<KmdDevice>,
    ) -> ZeResult<Self> {
        let shared = Arc::new(EngineShared {
            id,
            ring: Mutex::new(RingState::default()),
            doorbell: Condvar::new(),
            stopping: AtomicBool::new(false),
            counter: Arc::new(CompletionCounter::default()),
            encoder,
            device,
            context_ticks: AtomicU64::new(0),
        });

        let engine = shared.clone();
        let thread = thread::Builder::new()
            .name(format!("ze-{}-{id}", shared.encoder.name()))
            .spawn(move || engine.run())
            .map_err(|e| {
                log::error!("failed to spawn engine thread: {e}");
                ZeError::OutOfHostMemory
            })?;

        log::debug!(
            "hw context {id} ({}) started on device {}",
            shared.encoder.name(),
            shared.device.ordinal()
        );
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    #[must_use]
    pub fn counter(&self) -> &Arc<CompletionCounter> {
        &self.shared.counter
    }

    #[must_use]
    pub fn encoder(&self) -> &Arc<dyn CommandEncoder> {
        &self.shared.encoder
    }

    /// Highest task number handed out so far; zero if nothing was submitted.
    #[must_use]
    pub fn last_submitted_task(&self) -> u64 {
        lock(&self.shared.ring).last_reserved
    }

    /// Submits the batch produced by `build` under the next task number.
    ///
    /// `build` runs with the ring locked, so task numbers and ring order agree.
    /// If it fails, no task number is consumed and nothing is queued.
    ///
    /// # Errors
    /// Whatever `build` returns; `DeviceLost` if the device is already lost.
    pub fn submit(&self, build: impl FnOnce(u64) -> ZeResult<Batch>) -> ZeResult<u64> {
        let mut ring = lock(&self.shared.ring);
        if self.shared.device.is_lost() {
            return Err(ZeError::DeviceLost);
        }
        let task = ring.last_reserved + 1;
        let batch = build(task)?;
        debug_assert_eq!(batch.task, task);
        ring.last_reserved = task;
        ring.pending.push_back(batch);
        drop(ring);

        self.shared.doorbell.notify_one();
        Ok(task)
    }
}

impl Drop for HwContext {
    fn drop(&mut self) {
        {
            let mut ring = lock(&self.shared.ring);
            ring.shutdown = true;
        }
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.doorbell.notify_all();
        self.shared.device.interrupt().raise();

        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("engine thread of hw context {} panicked", self.shared.id);
            }
        }
    }
}

impl EngineShared {
    fn run(&self) {
        while let Some(batch) = self.next_batch() {
            let task = batch.task;

            if self.device.is_lost() {
                self.counter.abort();
                self.device.interrupt().raise();
                continue;
            }

            let started = Instant::now();
            let result = self.execute(&batch);
            self.context_ticks
                .fetch_add(self.device.ticks(started.elapsed()), Ordering::AcqRel);

            match result {
                Ok(()) => {
                    log::trace!("hw context {} retired task {task}", self.id);
                    self.counter.retire(task);
                }
                Err(GpuFault::Aborted) => {
                    log::warn!("hw context {} aborted task {task}", self.id);
                    self.counter.abort();
                }
                Err(fault) => {
                    self.device.mark_lost(&fault);
                    self.counter.abort();
                }
            }
            self.device.interrupt().raise();
        }
        log::debug!("hw context {} stopped", self.id);
    }

    fn next_batch(&self) -> Option<Batch> {
        let mut ring = lock(&self.ring);
        loop {
            if let Some(batch) = ring.pending.pop_front() {
                return Some(batch);
            }
            if ring.shutdown {
                return None;
            }
            ring = self
                .doorbell
                .wait(ring)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn execute(&self, batch: &Batch) -> Result<(), GpuFault> {
        let started = Instant::now();
        for segment in &batch.segments {
            self.execute_segment(segment, &batch.address_space, started)?;
        }
        Ok(())
    }

    fn execute_segment(
        &self,
        segment: &BatchSegment,
        space: &GpuAddressSpace,
        started: Instant,
    ) -> Result<(), GpuFault> {
        let mut cursor = 0usize;
        loop {
            let (cmd, len) = self.encoder.decode(&segment.dwords[cursor..])?;
            cursor += len;
            log::trace!("hw context {}: {cmd:?}", self.id);

            match cmd {
                Command::BatchBufferEnd => return Ok(()),
                Command::Copy { src, dst, size } => {
                    let mut buf = vec![0u8; size as usize];
                    space.read(src, &mut buf)?;
                    space.write(dst, &buf)?;
                }
                Command::CopyRegion {
                    src,
                    dst,
                    src_pitch,
                    src_slice_pitch,
                    dst_pitch,
                    dst_slice_pitch,
                    width,
                    height,
                    depth,
                } => {
                    let mut row = vec![0u8; width as usize];
                    for z in 0..u64::from(depth) {
                        for y in 0..u64::from(height) {
                            let s = src + z * u64::from(src_slice_pitch) + y * u64::from(src_pitch);
                            let d = dst + z * u64::from(dst_slice_pitch) + y * u64::from(dst_pitch);
                            space.read(s, &mut row)?;
                            space.write(d, &row)?;
                        }
                    }
                }
                Command::Fill { dst, size, pattern } => space.fill(dst, size, &pattern)?,
                Command::Dispatch {
                    launch,
                    group_count,
                } => {
                    let payload = segment.launches.get(launch as usize).ok_or_else(|| {
                        GpuFault::BadCommand(format!("dispatch of unknown launch {launch}"))
                    })?;
                    let mut inv = DispatchInvocation::new(payload, group_count, space);
                    payload.program.execute(&mut inv)?;
                }
                Command::Barrier | Command::Hint { .. } => {}
                Command::Timestamp { dst, kind } => {
                    let value = match kind {
                        TimestampKind::Global => self.device.global_timestamp(),
                        TimestampKind::Context => {
                            self.context_ticks.load(Ordering::Acquire)
                                + self.device.ticks(started.elapsed())
                        }
                    };
                    space.write_u64(dst, value)?;
                }
                Command::SemaphoreWait { addr, value } => self.semaphore_wait(space, addr, value)?,
                Command::StoreData { addr, value } => {
                    space.write_u64(addr, value)?;
                    self.device.interrupt().raise();
                }
            }
        }
    }

    fn semaphore_wait(&self, space: &GpuAddressSpace, addr: u64, value: u64) -> Result<(), GpuFault> {
        let interrupt = self.device.interrupt();
        loop {
            let seen = interrupt.generation();
            if space.read_u64(addr)? == value {
                return Ok(());
            }
            if self.stopping.load(Ordering::Acquire) || self.device.is_lost() {
                return Err(GpuFault::Aborted);
            }
            interrupt.wait(seen, SEMAPHORE_POLL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::kmd::interrupt::InterruptLine;
    use crate::kmd::isa::EngineFamily;
    use crate::kmd::page_table::AccessAttribute;
    use crate::kmd::storage::MemoryPool;

    const VA: u64 = 0x8000_0000_0000;

    fn setup() -> (Arc<KmdDevice>, Arc<GpuAddressSpace>, HwContext) {
        let device = KmdDevice::new(0, &DeviceConfig::default(), Arc::new(InterruptLine::new()));
        let space = Arc::new(GpuAddressSpace::new());
        let mem = device.allocate_physical(0x2000, MemoryPool::System).unwrap();
        space
            .map(VA, 0x2000, mem, 0, AccessAttribute::ReadWrite)
            .unwrap();
        let ctx = device.create_hw_context(EngineFamily::Compute).unwrap();
        (device, space, ctx)
    }

    fn segment(ctx: &HwContext, cmds: &[Command]) -> BatchSegment {
        let mut dwords = Vec::new();
        for c in cmds {
            ctx.encoder().encode(c, &mut dwords).unwrap();
        }
        ctx.encoder()
            .encode(&Command::BatchBufferEnd, &mut dwords)
            .unwrap();
        BatchSegment {
            dwords: dwords.into(),
            launches: Arc::from(Vec::new()),
        }
    }

    fn wait_for(counter: &CompletionCounter, task: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !counter.has_passed(task) {
            assert!(Instant::now() < deadline, "task {task} never retired");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn batches_retire_in_order() {
        let (_device, space, ctx) = setup();
        let fill = segment(
            &ctx,
            &[Command::Fill {
                dst: VA,
                size: 16,
                pattern: vec![0x5A],
            }],
        );
        let copy = segment(
            &ctx,
            &[Command::Copy {
                src: VA,
                dst: VA + 0x1000,
                size: 16,
            }],
        );

        for seg in [fill, copy] {
            ctx.submit(|task| {
                Ok(Batch {
                    task,
                    segments: vec![seg],
                    address_space: space.clone(),
                })
            })
            .unwrap();
        }
        wait_for(ctx.counter(), 2);
        assert!(!ctx.counter().is_aborted());
        assert_eq!(space.read_u64(VA + 0x1000).unwrap(), 0x5A5A_5A5A_5A5A_5A5A);
    }

    #[test]
    fn failed_build_consumes_no_task() {
        let (_device, _space, ctx) = setup();
        let res = ctx.submit(|_| Err(ZeError::OutOfDeviceMemory));
        assert_eq!(res, Err(ZeError::OutOfDeviceMemory));
        assert_eq!(ctx.last_submitted_task(), 0);
    }

    #[test]
    fn fault_marks_device_lost() {
        let (device, space, ctx) = setup();
        let seg = segment(
            &ctx,
            &[Command::StoreData {
                addr: VA + 0x10_0000,
                value: 1,
            }],
        );
        ctx.submit(|task| {
            Ok(Batch {
                task,
                segments: vec![seg],
                address_space: space.clone(),
            })
        })
        .unwrap();
        wait_for(ctx.counter(), 1);
        assert!(ctx.counter().is_aborted());
        assert!(device.is_lost());
    }
}
