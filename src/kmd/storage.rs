#![allow(clippy::cast_possible_truncation)]

use crate::error::{ZeError, ZeResult};
use crate::kmd::engine::CompletionCounter;
use crate::utils::lock;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Where a physical block lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryPool {
    /// Host memory, reachable by the device over the bus.
    System,
    /// Device-local memory; counts against the device budget.
    Local,
}

/// Anonymous, lazily committed host pages backing one physical block.
///
/// Pages are only committed by the OS once touched, so large sparse blocks
/// cost nothing until written.
#[derive(Debug)]
pub struct HostPages {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for HostPages {}
unsafe impl Sync for HostPages {}

impl HostPages {
    /// Maps `len` zeroed bytes.
    ///
    /// # Errors
    /// Returns `OutOfHostMemory` if the OS refuses the mapping.
    pub fn map(len: usize) -> ZeResult<Self> {
        if len == 0 {
            return Err(ZeError::InvalidSize("cannot map an empty page range".into()));
        }

        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if ret == libc::MAP_FAILED {
            log::error!("mmap of {len} bytes failed: {}", std::io::Error::last_os_error());
            return Err(ZeError::OutOfHostMemory);
        }

        let ptr = NonNull::new(ret.cast::<u8>()).ok_or(ZeError::OutOfHostMemory)?;
        Ok(Self { ptr, len })
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for HostPages {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct TaskUsage {
    counter: Arc<CompletionCounter>,
    task: u64,
}

/// A block of physical memory owned by the device model.
///
/// Also carries completion tracking: for every hardware context that
/// referenced it, the latest task count of a submission using it.
#[derive(Debug)]
pub struct PhysicalMemory {
    id: u64,
    size: u64,
    pool: MemoryPool,
    device_ordinal: Option<u32>,
    pages: Mutex<HostPages>,
    usage: Mutex<Vec<TaskUsage>>,
    resident: AtomicBool,
    /// Device budget counter this block was charged to.
    accounting: Option<Arc<AtomicU64>>,
}

impl PhysicalMemory {
    pub(crate) fn new(
        size: u64,
        pool: MemoryPool,
        device_ordinal: Option<u32>,
        accounting: Option<Arc<AtomicU64>>,
    ) -> ZeResult<Self> {
        let pages = HostPages::map(size as usize)?;
        Ok(Self {
            id: NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed),
            size,
            pool,
            device_ordinal,
            pages: Mutex::new(pages),
            usage: Mutex::new(Vec::new()),
            resident: AtomicBool::new(false),
            accounting,
        })
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn pool(&self) -> MemoryPool {
        self.pool
    }

    #[must_use]
    pub const fn device_ordinal(&self) -> Option<u32> {
        self.device_ordinal
    }

    /// Whether engines may currently touch this block. System memory is
    /// always reachable; local memory only while resident.
    #[must_use]
    pub fn is_accessible(&self) -> bool {
        self.pool == MemoryPool::System || self.resident.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_resident(&self) -> bool {
        self.resident.load(Ordering::Acquire)
    }

    pub fn set_resident(&self, resident: bool) {
        self.resident.store(resident, Ordering::Release);
    }

    fn check_bounds(&self, offset: u64, len: u64) -> ZeResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(ZeError::invalid_arg(format!(
                "range [0x{offset:x}, +0x{len:x}) exceeds physical block of 0x{:x} bytes",
                self.size
            ))),
        }
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> ZeResult<()> {
        self.check_bounds(offset, buf.len() as u64)?;
        let pages = lock(&self.pages);
        let start = offset as usize;
        buf.copy_from_slice(&pages.as_slice()[start..start + buf.len()]);
        Ok(())
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> ZeResult<()> {
        self.check_bounds(offset, data.len() as u64)?;
        let mut pages = lock(&self.pages);
        let start = offset as usize;
        pages.as_mut_slice()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Repeats `pattern` over `[offset, offset + len)`. `phase` is the index
    /// into the pattern of the first byte written.
    pub fn fill(&self, offset: u64, len: u64, pattern: &[u8], phase: usize) -> ZeResult<()> {
        self.check_bounds(offset, len)?;
        if pattern.is_empty() {
            return Err(ZeError::InvalidSize("empty fill pattern".into()));
        }
        let mut pages = lock(&self.pages);
        let start = offset as usize;
        let dst = &mut pages.as_mut_slice()[start..start + len as usize];
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = pattern[(phase + i) % pattern.len()];
        }
        Ok(())
    }

    pub fn read_u64(&self, offset: u64) -> ZeResult<u64> {
        let mut raw = [0u8; 8];
        self.read(offset, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    pub fn write_u64(&self, offset: u64, value: u64) -> ZeResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Records that task `task` on the context behind `counter` references this block.
    pub fn mark_used(&self, counter: &Arc<CompletionCounter>, task: u64) {
        let mut usage = lock(&self.usage);
        usage.retain(|u| !u.counter.has_passed(u.task));
        match usage
            .iter_mut()
            .find(|u| Arc::ptr_eq(&u.counter, counter))
        {
            Some(entry) => entry.task = entry.task.max(task),
            None => usage.push(TaskUsage {
                counter: counter.clone(),
                task,
            }),
        }
    }

    /// True while any submission referencing this block has not retired.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        lock(&self.usage)
            .iter()
            .any(|u| !u.counter.has_passed(u.task))
    }
}

impl Drop for PhysicalMemory {
    fn drop(&mut self) {
        if let Some(accounting) = &self.accounting {
            accounting.fetch_sub(self.size, Ordering::AcqRel);
        }
        log::trace!("physical memory {} ({} bytes) released", self.id, self.size);
    }
}
