use super::ApertureAllocator;
use super::aperture::Aperture;
use crate::error::{ZeError, ZeResult};
use crate::kmd::storage::PhysicalMemory;
use crate::utils::lock;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

// Address-space layout of a context. Host and shared allocations sit in the
// lower (SVM) half; device allocations and explicit reservations live at or
// above 2^47.
const SVM_BASE: u64 = 0x1000_0000;
const SVM_LIMIT: u64 = 1 << 47;
const RESERVATION_BASE: u64 = 1 << 47;
const RESERVATION_LIMIT: u64 = (1 << 47) + (1 << 46);
const DEVICE_BASE: u64 = RESERVATION_LIMIT;
const DEVICE_LIMIT: u64 = 1 << 48;

/// A reserved, not necessarily backed, range of GPU virtual addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualMemoryReservation {
    pub base: u64,
    pub size: u64,
    /// Granularity mappings into this range must respect.
    pub page_size: u64,
}

impl VirtualMemoryReservation {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.size
    }

    #[must_use]
    pub const fn contains(&self, ptr: u64, size: u64) -> bool {
        ptr >= self.base && size <= self.size && ptr - self.base <= self.size - size
    }
}

/// Descriptor for `Context::create_physical_memory`.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalMemoryDesc {
    pub size: u64,
}

/// Device-local physical memory that can be mapped into reservations.
///
/// Cloning yields another handle to the same block. Destroying it releases
/// the block once the last handle is gone.
#[derive(Debug, Clone)]
pub struct PhysicalMemoryObject {
    inner: Arc<Mutex<Option<Arc<PhysicalMemory>>>>,
    size: u64,
    device_ordinal: u32,
    page_size: u64,
}

impl PhysicalMemoryObject {
    pub(crate) fn new(memory: Arc<PhysicalMemory>, device_ordinal: u32, page_size: u64) -> Self {
        Self {
            size: memory.size(),
            inner: Arc::new(Mutex::new(Some(memory))),
            device_ordinal,
            page_size,
        }
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn device_ordinal(&self) -> u32 {
        self.device_ordinal
    }

    /// Largest supported page size dividing the block size.
    #[must_use]
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    /// # Errors
    /// `InvalidArgument` once the object has been destroyed.
    pub(crate) fn memory(&self) -> ZeResult<Arc<PhysicalMemory>> {
        lock(&self.inner)
            .clone()
            .ok_or_else(|| ZeError::invalid_arg("physical memory object was destroyed"))
    }

    pub(crate) fn take(&self) -> Option<Arc<PhysicalMemory>> {
        lock(&self.inner).take()
    }
}

/// Per-context bookkeeping of reservations and of the VA apertures.
#[derive(Debug)]
pub struct VirtualMemoryManager {
    reservations: BTreeMap<u64, VirtualMemoryReservation>,
    reservation_aperture: Aperture,
    device_aperture: Aperture,
    svm_aperture: Aperture,
}

impl VirtualMemoryManager {
    #[must_use]
    pub fn new(granularity: u64, guard_pages: u64) -> Self {
        Self {
            reservations: BTreeMap::new(),
            reservation_aperture: Aperture::new(RESERVATION_BASE, RESERVATION_LIMIT, granularity, 0),
            device_aperture: Aperture::new(DEVICE_BASE, DEVICE_LIMIT, granularity, guard_pages),
            svm_aperture: Aperture::new(SVM_BASE, SVM_LIMIT, granularity, guard_pages),
        }
    }

    /// Reserves `size` bytes, at `hint` if that exact range is free.
    ///
    /// # Errors
    /// `OutOfVirtualAddressSpace` if no range fits.
    pub fn reserve(
        &mut self,
        hint: Option<u64>,
        size: u64,
        page_size: u64,
    ) -> ZeResult<VirtualMemoryReservation> {
        let base = match hint {
            Some(addr) if self.reservation_aperture.reserve_exact(addr, size) => addr,
            _ => self
                .reservation_aperture
                .allocate_va(size, page_size)
                .ok_or(ZeError::OutOfVirtualAddressSpace)?,
        };

        let reservation = VirtualMemoryReservation {
            base,
            size,
            page_size,
        };
        self.reservations.insert(base, reservation);
        Ok(reservation)
    }

    /// Looks up the reservation starting exactly at `base` with `size`.
    #[must_use]
    pub fn exact(&self, base: u64, size: u64) -> Option<VirtualMemoryReservation> {
        self.reservations
            .get(&base)
            .copied()
            .filter(|r| r.size == size)
    }

    /// Reservation that wholly contains `[ptr, ptr + size)`.
    #[must_use]
    pub fn containing(&self, ptr: u64, size: u64) -> Option<VirtualMemoryReservation> {
        self.reservations
            .range(..=ptr)
            .next_back()
            .map(|(_, r)| *r)
            .filter(|r| r.contains(ptr, size))
    }

    /// # Errors
    /// `InvalidArgument` unless `[base, base + size)` was reserved as a unit.
    pub fn release(&mut self, base: u64, size: u64) -> ZeResult<()> {
        if self.exact(base, size).is_none() {
            return Err(ZeError::invalid_arg(format!(
                "0x{base:x} (+0x{size:x}) does not match a reservation"
            )));
        }
        self.reservations.remove(&base);
        self.reservation_aperture.free_va(base, size);
        Ok(())
    }

    #[must_use]
    pub fn reservations(&self) -> Vec<VirtualMemoryReservation> {
        self.reservations.values().copied().collect()
    }

    pub fn allocate_device_va(&mut self, size: u64, align: u64) -> ZeResult<u64> {
        self.device_aperture
            .allocate_va(size, align)
            .ok_or(ZeError::OutOfVirtualAddressSpace)
    }

    pub fn allocate_svm_va(&mut self, size: u64, align: u64) -> ZeResult<u64> {
        self.svm_aperture
            .allocate_va(size, align)
            .ok_or(ZeError::OutOfVirtualAddressSpace)
    }

    pub fn free_allocation_va(&mut self, addr: u64, size: u64) {
        if self.device_aperture.contains(addr) {
            self.device_aperture.free_va(addr, size);
        } else {
            self.svm_aperture.free_va(addr, size);
        }
    }
}
