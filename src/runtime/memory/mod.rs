pub mod aperture;
pub mod virtual_mem;

use crate::kmd::storage::{MemoryPool, PhysicalMemory};
use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Strategy for handing out virtual address ranges.
pub trait ApertureAllocator {
    /// Reserve a virtual address range within this aperture.
    fn allocate_va(&mut self, size: u64, align: u64) -> Option<u64>;

    /// Free a range previously returned by `allocate_va`. Returns false if
    /// `addr`/`size` do not match a live range.
    fn free_va(&mut self, addr: u64, size: u64) -> bool;

    /// Get the aperture's base and limit.
    fn bounds(&self) -> (u64, u64);
}

bitflags! {
    /// Cache policy hints for device allocations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceMemAllocFlags: u32 {
        const BIAS_CACHED = 1 << 0;
        const BIAS_UNCACHED = 1 << 1;
    }
}

bitflags! {
    /// Cache policy hints for host allocations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HostMemAllocFlags: u32 {
        const BIAS_CACHED = 1 << 0;
        const BIAS_UNCACHED = 1 << 1;
        const BIAS_WRITE_COMBINED = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceMemAllocDesc {
    pub flags: DeviceMemAllocFlags,
    /// Index of the device memory region; only region 0 exists.
    pub ordinal: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HostMemAllocDesc {
    pub flags: HostMemAllocFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationType {
    Unknown,
    Host,
    Device,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Default,
    Cached,
    Uncached,
    WriteCombined,
}

impl CachePolicy {
    fn from_device_flags(flags: DeviceMemAllocFlags) -> Self {
        if flags.contains(DeviceMemAllocFlags::BIAS_UNCACHED) {
            Self::Uncached
        } else if flags.contains(DeviceMemAllocFlags::BIAS_CACHED) {
            Self::Cached
        } else {
            Self::Default
        }
    }

    fn from_host_flags(flags: HostMemAllocFlags) -> Self {
        if flags.contains(HostMemAllocFlags::BIAS_UNCACHED) {
            Self::Uncached
        } else if flags.contains(HostMemAllocFlags::BIAS_WRITE_COMBINED) {
            Self::WriteCombined
        } else if flags.contains(HostMemAllocFlags::BIAS_CACHED) {
            Self::Cached
        } else {
            Self::Default
        }
    }

    pub(crate) fn for_allocation(
        device: Option<DeviceMemAllocFlags>,
        host: Option<HostMemAllocFlags>,
    ) -> Self {
        match (device.map(Self::from_device_flags), host.map(Self::from_host_flags)) {
            (Some(p), _) if p != Self::Default => p,
            (_, Some(p)) => p,
            (Some(p), None) => p,
            (None, None) => Self::Default,
        }
    }
}

/// Hints accepted by `append_mem_advise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryAdvice {
    SetReadMostly = 0,
    ClearReadMostly = 1,
    SetPreferredLocation = 2,
    ClearPreferredLocation = 3,
    SetNonAtomicMostly = 4,
    ClearNonAtomicMostly = 5,
    BiasCached = 6,
    BiasUncached = 7,
}

/// What `mem_free_ext` does when the allocation is still in use by the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemFreePolicy {
    /// Release once the last submission using it retires.
    #[default]
    Deferred,
    /// Block the caller until the last submission using it retires.
    BlockingFree,
}

static NEXT_ALLOCATION_ID: AtomicU64 = AtomicU64::new(1);

/// A GPU-addressable allocation made through the USM entry points.
///
/// Built on the same reserve / back / map sequence as explicit virtual
/// memory: the VA comes from a context aperture and is mapped onto one
/// physical block.
#[derive(Debug)]
pub struct GraphicsAllocation {
    id: u64,
    gpu_va: u64,
    size: u64,
    requested_size: u64,
    alloc_type: AllocationType,
    device_ordinal: Option<u32>,
    cache_policy: CachePolicy,
    backing: Arc<PhysicalMemory>,
}

impl GraphicsAllocation {
    pub(crate) fn new(
        gpu_va: u64,
        requested_size: u64,
        alloc_type: AllocationType,
        device_ordinal: Option<u32>,
        cache_policy: CachePolicy,
        backing: Arc<PhysicalMemory>,
    ) -> Self {
        Self {
            id: NEXT_ALLOCATION_ID.fetch_add(1, Ordering::Relaxed),
            gpu_va,
            size: backing.size(),
            requested_size,
            alloc_type,
            device_ordinal,
            cache_policy,
            backing,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn gpu_va(&self) -> u64 {
        self.gpu_va
    }

    /// Size of the mapped range, rounded up to the page size.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn requested_size(&self) -> u64 {
        self.requested_size
    }

    #[must_use]
    pub const fn alloc_type(&self) -> AllocationType {
        self.alloc_type
    }

    #[must_use]
    pub const fn device_ordinal(&self) -> Option<u32> {
        self.device_ordinal
    }

    #[must_use]
    pub const fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    #[must_use]
    pub fn memory_pool(&self) -> MemoryPool {
        self.backing.pool()
    }

    #[must_use]
    pub const fn backing(&self) -> &Arc<PhysicalMemory> {
        &self.backing
    }

    #[must_use]
    pub fn is_host_accessible(&self) -> bool {
        matches!(self.alloc_type, AllocationType::Host | AllocationType::Shared)
    }

    /// True if `[ptr, ptr + len)` lies inside this allocation.
    #[must_use]
    pub fn contains(&self, ptr: u64, len: u64) -> bool {
        ptr >= self.gpu_va
            && ptr
                .checked_add(len)
                .is_some_and(|end| end <= self.gpu_va + self.size)
    }

    /// True while a submission that references this allocation has not retired.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.backing.is_busy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_flags_take_precedence_over_host_flags() {
        let policy = CachePolicy::for_allocation(
            Some(DeviceMemAllocFlags::BIAS_UNCACHED),
            Some(HostMemAllocFlags::BIAS_CACHED),
        );
        assert_eq!(policy, CachePolicy::Uncached);
        let policy =
            CachePolicy::for_allocation(Some(DeviceMemAllocFlags::empty()), Some(HostMemAllocFlags::BIAS_WRITE_COMBINED));
        assert_eq!(policy, CachePolicy::WriteCombined);
        assert_eq!(CachePolicy::for_allocation(None, None), CachePolicy::Default);
    }

    #[test]
    fn containment_is_bounded() {
        let backing = Arc::new(PhysicalMemory::new(4096, MemoryPool::System, None, None).unwrap());
        let alloc = GraphicsAllocation::new(
            0x1000_0000,
            100,
            AllocationType::Host,
            None,
            CachePolicy::Default,
            backing,
        );
        assert_eq!(alloc.size(), 4096);
        assert!(alloc.contains(0x1000_0000, 4096));
        assert!(!alloc.contains(0x1000_0001, 4096));
        assert!(alloc.is_host_accessible());
    }
}
