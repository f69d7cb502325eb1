use crate::error::{ZeError, ZeResult};
use crate::kmd::interrupt::{INFINITE_TIMEOUT, InterruptLine, WaitPoll, wait_until};
use crate::kmd::page_table::{AccessAttribute, GpuAddressSpace};
use crate::kmd::storage::{MemoryPool, PhysicalMemory};
use crate::runtime::device::Device;
use crate::runtime::driver::Driver;
use crate::runtime::memory::virtual_mem::{
    PhysicalMemoryDesc, PhysicalMemoryObject, VirtualMemoryManager, VirtualMemoryReservation,
};
use crate::runtime::memory::{
    AllocationType, CachePolicy, DeviceMemAllocDesc, GraphicsAllocation, HostMemAllocDesc,
    MemFreePolicy,
};
use crate::utils::{align_up, host_page_size, is_aligned, lock};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// What `Context::get_allocation_properties` reports for a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAllocationProperties {
    pub alloc_type: AllocationType,
    /// Unique id of the allocation; zero for unknown pointers.
    pub id: u64,
    pub page_size: u64,
    pub device_ordinal: Option<u32>,
}

/// Groups devices with a shared GPU virtual address space.
///
/// Owns virtual memory reservations and every USM allocation, and is the
/// authority that resolves pointers to physical backing for residency.
#[derive(Debug)]
pub struct Context {
    driver: Arc<Driver>,
    devices: Vec<Arc<Device>>,
    granularity: u64,
    vmm: Mutex<VirtualMemoryManager>,
    address_space: Arc<GpuAddressSpace>,
    allocations: Mutex<BTreeMap<u64, Arc<GraphicsAllocation>>>,
    deferred_frees: Mutex<Vec<Arc<GraphicsAllocation>>>,
}

impl Context {
    /// # Errors
    /// `InvalidArgument` if `devices` is empty or names a device of another driver.
    pub fn new(driver: &Arc<Driver>, devices: &[Arc<Device>]) -> ZeResult<Arc<Self>> {
        if devices.is_empty() {
            return Err(ZeError::invalid_arg("a context needs at least one device"));
        }
        if let Some(stranger) = devices
            .iter()
            .find(|d| !driver.devices().iter().any(|own| Arc::ptr_eq(own, d)))
        {
            return Err(ZeError::invalid_arg(format!(
                "device {} does not belong to this driver",
                stranger.ordinal()
            )));
        }

        let granularity = devices
            .iter()
            .map(|d| d.min_page_size())
            .max()
            .unwrap_or_else(host_page_size);
        let vmm = VirtualMemoryManager::new(granularity, driver.config().allocation_guard_pages);

        log::debug!(
            "context created on {} device(s), VA granularity 0x{granularity:x}",
            devices.len()
        );
        Ok(Arc::new(Self {
            driver: driver.clone(),
            devices: devices.to_vec(),
            granularity,
            vmm: Mutex::new(vmm),
            address_space: Arc::new(GpuAddressSpace::new()),
            allocations: Mutex::new(BTreeMap::new()),
            deferred_frees: Mutex::new(Vec::new()),
        }))
    }

    #[must_use]
    pub const fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    #[must_use]
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    #[must_use]
    pub fn contains_device(&self, device: &Device) -> bool {
        self.devices.iter().any(|d| std::ptr::eq(d.as_ref(), device))
    }

    fn require_device(&self, device: &Device) -> ZeResult<()> {
        if self.contains_device(device) {
            Ok(())
        } else {
            Err(ZeError::invalid_arg(format!(
                "device {} is not part of this context",
                device.ordinal()
            )))
        }
    }

    /// Minimum size and alignment unit of reservations in this context.
    #[must_use]
    pub const fn granularity(&self) -> u64 {
        self.granularity
    }

    pub(crate) const fn address_space(&self) -> &Arc<GpuAddressSpace> {
        &self.address_space
    }

    pub(crate) fn interrupt(&self) -> &InterruptLine {
        self.driver.interrupt()
    }

    /// # Errors
    /// `DeviceLost` if any device of the context has faulted.
    pub fn check_alive(&self) -> ZeResult<()> {
        self.devices.iter().try_for_each(|d| d.check_alive())
    }

    fn is_lost(&self) -> bool {
        self.devices.iter().any(|d| d.is_lost())
    }

    /// Blocks on the driver interrupt line until `ready` holds.
    pub(crate) fn host_wait(&self, timeout_ns: u64, mut ready: impl FnMut() -> bool) -> ZeResult<()> {
        let spin = self.driver.config().host_wait_spin;
        wait_until(self.interrupt(), timeout_ns, spin, || {
            if ready() {
                WaitPoll::Ready
            } else if self.is_lost() {
                WaitPoll::Lost
            } else {
                WaitPoll::Pending
            }
        })
    }

    // ===============================================================================================
    // Virtual Memory
    // ===============================================================================================

    /// Reserves `size` bytes of GPU virtual address space, at `hint` when
    /// that exact range is free.
    ///
    /// # Errors
    /// `InvalidSize` unless `size` is a non-zero multiple of the context
    /// granularity, `OutOfVirtualAddressSpace` if no range fits.
    pub fn reserve_virtual_memory(
        &self,
        hint: Option<u64>,
        size: u64,
    ) -> ZeResult<VirtualMemoryReservation> {
        self.check_alive()?;
        if size == 0 || !is_aligned(size, self.granularity) {
            return Err(ZeError::InvalidSize(format!(
                "reservation size 0x{size:x} is not a multiple of 0x{:x}",
                self.granularity
            )));
        }

        let reservation = lock(&self.vmm).reserve(hint, size, self.granularity)?;
        log::debug!(
            "reserved VA 0x{:x}..0x{:x}",
            reservation.base,
            reservation.end()
        );
        Ok(reservation)
    }

    /// Releases a reservation. Its mappings must have been removed first.
    ///
    /// # Errors
    /// `InvalidArgument` unless `[ptr, ptr + size)` was reserved as a unit,
    /// `InvalidState` while pages of it are still mapped.
    pub fn free_virtual_memory(&self, ptr: u64, size: u64) -> ZeResult<()> {
        let mut vmm = lock(&self.vmm);
        if vmm.exact(ptr, size).is_none() {
            return Err(ZeError::invalid_arg(format!(
                "0x{ptr:x} (+0x{size:x}) was not reserved as a unit"
            )));
        }
        if self.address_space.has_mappings_in(ptr, size) {
            return Err(ZeError::invalid_state(format!(
                "reservation at 0x{ptr:x} still has mapped pages"
            )));
        }
        vmm.release(ptr, size)
    }

    /// Page granularity `device` uses for `size` bytes.
    ///
    /// # Errors
    /// `InvalidArgument` if the device is not part of this context.
    pub fn query_page_size(&self, device: &Device, size: u64) -> ZeResult<u64> {
        self.require_device(device)?;
        Ok(device.query_page_size(size))
    }

    /// Allocates unmapped device-local physical memory.
    ///
    /// # Errors
    /// `InvalidSize` unless the size is a non-zero multiple of the device's
    /// smallest page, `OutOfDeviceMemory` past the device allocation limit.
    pub fn create_physical_memory(
        &self,
        device: &Device,
        desc: &PhysicalMemoryDesc,
    ) -> ZeResult<PhysicalMemoryObject> {
        self.check_alive()?;
        self.require_device(device)?;
        let min_page = device.min_page_size();
        if desc.size == 0 || !is_aligned(desc.size, min_page) {
            return Err(ZeError::InvalidSize(format!(
                "physical size 0x{:x} is not a multiple of 0x{min_page:x}",
                desc.size
            )));
        }

        let memory = device.kmd().allocate_physical(desc.size, MemoryPool::Local)?;
        let page_size = device
            .kmd()
            .hw_info()
            .page_size_dividing(desc.size)
            .unwrap_or(min_page);
        Ok(PhysicalMemoryObject::new(memory, device.ordinal(), page_size))
    }

    /// # Errors
    /// `InvalidState` while the memory is mapped, `InvalidArgument` if it was
    /// already destroyed.
    pub fn destroy_physical_memory(&self, physical: &PhysicalMemoryObject) -> ZeResult<()> {
        let memory = physical.memory()?;
        if self.address_space.maps_memory(memory.id()) {
            return Err(ZeError::invalid_state("physical memory is still mapped"));
        }
        drop(memory);
        physical.take();
        Ok(())
    }

    /// Maps `physical[physical_offset..+size]` at `reservation.base + offset`.
    ///
    /// # Errors
    /// `InvalidArgument` for a reservation this context does not own,
    /// misaligned offsets or sizes, ranges outside the reservation or the
    /// physical object, and overlap with an existing mapping.
    pub fn map_virtual_memory(
        &self,
        reservation: &VirtualMemoryReservation,
        offset: u64,
        size: u64,
        physical: &PhysicalMemoryObject,
        physical_offset: u64,
        access: AccessAttribute,
    ) -> ZeResult<()> {
        self.check_alive()?;
        if size == 0 {
            return Err(ZeError::InvalidSize("cannot map zero bytes".into()));
        }
        let vmm = lock(&self.vmm);
        if vmm.exact(reservation.base, reservation.size).is_none() {
            return Err(ZeError::invalid_arg(format!(
                "0x{:x} is not a live reservation",
                reservation.base
            )));
        }

        let page = reservation.page_size;
        if !is_aligned(offset, page) || !is_aligned(size, page) || !is_aligned(physical_offset, page)
        {
            return Err(ZeError::invalid_arg(format!(
                "offset 0x{offset:x}, size 0x{size:x} and physical offset 0x{physical_offset:x} \
                 must be aligned to 0x{page:x}"
            )));
        }
        if offset.checked_add(size).is_none_or(|end| end > reservation.size) {
            return Err(ZeError::invalid_arg(format!(
                "0x{offset:x} (+0x{size:x}) exceeds reservation of 0x{:x} bytes",
                reservation.size
            )));
        }
        if !self
            .devices
            .iter()
            .any(|d| d.ordinal() == physical.device_ordinal())
        {
            return Err(ZeError::invalid_arg(
                "physical memory belongs to a device outside this context",
            ));
        }

        let memory = physical.memory()?;
        self.address_space
            .map(reservation.base + offset, size, memory, physical_offset, access)?;
        drop(vmm);
        Ok(())
    }

    fn require_reserved(&self, ptr: u64, size: u64) -> ZeResult<VirtualMemoryReservation> {
        lock(&self.vmm).containing(ptr, size).ok_or_else(|| {
            ZeError::invalid_arg(format!("0x{ptr:x} (+0x{size:x}) is not inside a reservation"))
        })
    }

    /// Removes the mappings covering exactly `[ptr, ptr + size)`.
    ///
    /// # Errors
    /// `InvalidArgument` if the range is not inside a reservation, nothing is
    /// mapped there, or a mapping straddles its boundary.
    pub fn unmap_virtual_memory(&self, ptr: u64, size: u64) -> ZeResult<()> {
        self.require_reserved(ptr, size)?;
        let removed = self.address_space.unmap(ptr, size)?;
        log::trace!("unmapped {} mapping(s) at 0x{ptr:x}", removed.len());
        Ok(())
    }

    /// # Errors
    /// `InvalidArgument` unless the whole range is reserved and mapped.
    pub fn set_access_attribute(
        &self,
        ptr: u64,
        size: u64,
        access: AccessAttribute,
    ) -> ZeResult<()> {
        self.require_reserved(ptr, size)?;
        self.address_space.set_access(ptr, size, access)
    }

    /// Attribute at `ptr` and the length of the run from `ptr` sharing it.
    ///
    /// The reported length is capped at `size` and may be shorter when the
    /// attribute changes partway through the range.
    ///
    /// # Errors
    /// `InvalidArgument` if the range is outside every reservation,
    /// `UnsupportedFeature` if `ptr` is not mapped.
    pub fn get_access_attribute(&self, ptr: u64, size: u64) -> ZeResult<(AccessAttribute, u64)> {
        self.require_reserved(ptr, size)?;
        self.address_space
            .query_access(ptr, size)
            .ok_or_else(|| ZeError::UnsupportedFeature(format!("0x{ptr:x} is not mapped")))
    }

    // ===============================================================================================
    // Unified Shared Memory
    // ===============================================================================================

    fn check_alignment(alignment: u64) -> ZeResult<()> {
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(ZeError::invalid_arg(format!(
                "alignment {alignment} is not a power of two"
            )));
        }
        Ok(())
    }

    /// Reserves VA, maps `backing` read-write and registers the allocation.
    #[allow(clippy::too_many_arguments)]
    fn publish(
        &self,
        device_va: bool,
        alignment: u64,
        requested_size: u64,
        alloc_type: AllocationType,
        device_ordinal: Option<u32>,
        cache_policy: CachePolicy,
        backing: Arc<PhysicalMemory>,
    ) -> ZeResult<Arc<GraphicsAllocation>> {
        let size = backing.size();
        let va = {
            let mut vmm = lock(&self.vmm);
            let va = if device_va {
                vmm.allocate_device_va(size, alignment)?
            } else {
                vmm.allocate_svm_va(size, alignment)?
            };
            if let Err(e) =
                self.address_space
                    .map(va, size, backing.clone(), 0, AccessAttribute::ReadWrite)
            {
                vmm.free_allocation_va(va, size);
                return Err(e);
            }
            va
        };

        let allocation = Arc::new(GraphicsAllocation::new(
            va,
            requested_size,
            alloc_type,
            device_ordinal,
            cache_policy,
            backing,
        ));
        lock(&self.allocations).insert(va, allocation.clone());
        log::debug!(
            "{alloc_type:?} allocation {} at 0x{va:x} ({size} bytes)",
            allocation.id()
        );
        Ok(allocation)
    }

    /// Allocates device-local memory visible only to the GPU.
    ///
    /// # Errors
    /// `InvalidSize` for zero or oversized requests, `InvalidArgument` for a
    /// bad alignment, ordinal or device, `OutOfDeviceMemory` when exhausted.
    pub fn mem_alloc_device(
        &self,
        desc: &DeviceMemAllocDesc,
        size: u64,
        alignment: u64,
        device: &Device,
    ) -> ZeResult<u64> {
        self.check_alive()?;
        self.require_device(device)?;
        Self::check_alignment(alignment)?;
        if desc.ordinal != 0 {
            return Err(ZeError::invalid_arg(format!(
                "device memory ordinal {} does not exist",
                desc.ordinal
            )));
        }
        if size == 0 || size > device.properties().max_mem_alloc_size {
            return Err(ZeError::InvalidSize(format!(
                "device allocation of {size} bytes"
            )));
        }
        self.process_deferred_frees();

        let page = device.query_page_size(size);
        let backing = device
            .kmd()
            .allocate_physical(align_up(size, page), MemoryPool::Local)?;
        let allocation = self.publish(
            true,
            alignment.max(page),
            size,
            AllocationType::Device,
            Some(device.ordinal()),
            CachePolicy::for_allocation(Some(desc.flags), None),
            backing,
        )?;
        Ok(allocation.gpu_va())
    }

    fn alloc_system(
        &self,
        size: u64,
        alignment: u64,
        alloc_type: AllocationType,
        device_ordinal: Option<u32>,
        cache_policy: CachePolicy,
    ) -> ZeResult<u64> {
        self.check_alive()?;
        Self::check_alignment(alignment)?;
        if size == 0 {
            return Err(ZeError::InvalidSize("zero-byte allocation".into()));
        }
        self.process_deferred_frees();

        let page = host_page_size();
        let memory = PhysicalMemory::new(align_up(size, page), MemoryPool::System, None, None)?;
        let allocation = self.publish(
            false,
            alignment.max(page),
            size,
            alloc_type,
            device_ordinal,
            cache_policy,
            Arc::new(memory),
        )?;
        Ok(allocation.gpu_va())
    }

    /// Allocates host memory accessible to every device of the context.
    ///
    /// # Errors
    /// `InvalidSize` for zero bytes, `InvalidArgument` for a bad alignment.
    pub fn mem_alloc_host(&self, desc: &HostMemAllocDesc, size: u64, alignment: u64) -> ZeResult<u64> {
        let policy = CachePolicy::for_allocation(None, Some(desc.flags));
        self.alloc_system(size, alignment, AllocationType::Host, None, policy)
    }

    /// Allocates memory shared between the host and the GPU, optionally
    /// associated with `device`.
    ///
    /// # Errors
    /// As [`Context::mem_alloc_host`]; `InvalidArgument` for a foreign device.
    pub fn mem_alloc_shared(
        &self,
        device_desc: &DeviceMemAllocDesc,
        host_desc: &HostMemAllocDesc,
        size: u64,
        alignment: u64,
        device: Option<&Device>,
    ) -> ZeResult<u64> {
        if let Some(device) = device {
            self.require_device(device)?;
        }
        let policy = CachePolicy::for_allocation(Some(device_desc.flags), Some(host_desc.flags));
        self.alloc_system(
            size,
            alignment,
            AllocationType::Shared,
            device.map(Device::ordinal),
            policy,
        )
    }

    /// Frees the allocation starting at `ptr`. Release is deferred until
    /// in-flight work that references it retires.
    ///
    /// # Errors
    /// `InvalidArgument` if `ptr` is not the base of a live allocation.
    pub fn mem_free(&self, ptr: u64) -> ZeResult<()> {
        self.mem_free_ext(ptr, MemFreePolicy::Deferred)
    }

    /// Frees the allocation starting at `ptr` according to `policy`.
    ///
    /// # Errors
    /// `InvalidArgument` if `ptr` is not the base of a live allocation.
    pub fn mem_free_ext(&self, ptr: u64, policy: MemFreePolicy) -> ZeResult<()> {
        let allocation = lock(&self.allocations)
            .remove(&ptr)
            .ok_or_else(|| ZeError::invalid_arg(format!("0x{ptr:x} is not an allocation")))?;

        if allocation.is_busy() {
            match policy {
                MemFreePolicy::Deferred => {
                    log::debug!("allocation {} busy, deferring free", allocation.id());
                    lock(&self.deferred_frees).push(allocation);
                    return Ok(());
                }
                MemFreePolicy::BlockingFree => {
                    self.host_wait(INFINITE_TIMEOUT, || !allocation.is_busy())
                        .or_else(|e| if e == ZeError::DeviceLost { Ok(()) } else { Err(e) })?;
                }
            }
        }
        self.release(&allocation);
        self.process_deferred_frees();
        Ok(())
    }

    fn release(&self, allocation: &GraphicsAllocation) {
        let (va, size) = (allocation.gpu_va(), allocation.size());
        if let Err(e) = self.address_space.unmap(va, size) {
            log::warn!("allocation {} was not mapped at release: {e}", allocation.id());
        }
        lock(&self.vmm).free_allocation_va(va, size);
        log::trace!("allocation {} released", allocation.id());
    }

    /// Releases deferred allocations whose last submission has retired.
    pub fn process_deferred_frees(&self) {
        let ready: Vec<Arc<GraphicsAllocation>> = {
            let mut pending = lock(&self.deferred_frees);
            let (idle, busy) = pending.drain(..).partition(|a| !a.is_busy());
            *pending = busy;
            idle
        };
        for allocation in &ready {
            self.release(allocation);
        }
    }

    /// Number of freed allocations still waiting for their work to retire.
    #[must_use]
    pub fn deferred_free_count(&self) -> usize {
        lock(&self.deferred_frees).len()
    }

    /// The live allocation containing `ptr`, if any.
    #[must_use]
    pub fn get_allocation(&self, ptr: u64) -> Option<Arc<GraphicsAllocation>> {
        self.find_allocation(ptr, 1)
    }

    fn find_allocation(&self, ptr: u64, len: u64) -> Option<Arc<GraphicsAllocation>> {
        lock(&self.allocations)
            .range(..=ptr)
            .next_back()
            .map(|(_, a)| a)
            .filter(|a| a.contains(ptr, len.max(1)))
            .cloned()
    }

    /// Type and identity of the allocation containing `ptr`; `Unknown` for
    /// pointers this context did not allocate.
    #[must_use]
    pub fn get_allocation_properties(&self, ptr: u64) -> MemoryAllocationProperties {
        self.get_allocation(ptr).map_or(
            MemoryAllocationProperties {
                alloc_type: AllocationType::Unknown,
                id: 0,
                page_size: 0,
                device_ordinal: None,
            },
            |a| MemoryAllocationProperties {
                alloc_type: a.alloc_type(),
                id: a.id(),
                page_size: match a.alloc_type() {
                    AllocationType::Device => self
                        .devices
                        .iter()
                        .find(|d| Some(d.ordinal()) == a.device_ordinal())
                        .map_or(self.granularity, |d| d.query_page_size(a.requested_size())),
                    _ => host_page_size(),
                },
                device_ordinal: a.device_ordinal(),
            },
        )
    }

    /// Base address and size of the allocation containing `ptr`.
    ///
    /// # Errors
    /// `InvalidArgument` if `ptr` is not inside a live allocation.
    pub fn mem_get_address_range(&self, ptr: u64) -> ZeResult<(u64, u64)> {
        self.get_allocation(ptr)
            .map(|a| (a.gpu_va(), a.size()))
            .ok_or_else(|| ZeError::invalid_arg(format!("0x{ptr:x} is not inside an allocation")))
    }

    fn host_allocation(&self, ptr: u64, len: u64) -> ZeResult<Arc<GraphicsAllocation>> {
        self.find_allocation(ptr, len)
            .filter(|a| a.is_host_accessible())
            .ok_or_else(|| {
                ZeError::invalid_arg(format!(
                    "0x{ptr:x} (+0x{len:x}) is not inside a host-accessible allocation"
                ))
            })
    }

    /// Host read of a host or shared allocation.
    ///
    /// # Errors
    /// `InvalidArgument` if the range is not inside such an allocation.
    pub fn read_memory(&self, ptr: u64, buf: &mut [u8]) -> ZeResult<()> {
        let allocation = self.host_allocation(ptr, buf.len() as u64)?;
        allocation.backing().read(ptr - allocation.gpu_va(), buf)
    }

    /// Host write to a host or shared allocation.
    ///
    /// # Errors
    /// `InvalidArgument` if the range is not inside such an allocation.
    pub fn write_memory(&self, ptr: u64, data: &[u8]) -> ZeResult<()> {
        let allocation = self.host_allocation(ptr, data.len() as u64)?;
        allocation.backing().write(ptr - allocation.gpu_va(), data)
    }

    // ===============================================================================================
    // Residency
    // ===============================================================================================

    /// Physical blocks behind `[ptr, ptr + size)`: a USM allocation, or a
    /// fully mapped part of a reservation.
    ///
    /// # Errors
    /// `InvalidArgument` if the range is not known to this context.
    pub(crate) fn resolve_range(&self, ptr: u64, size: u64) -> ZeResult<Vec<Arc<PhysicalMemory>>> {
        if let Some(allocation) = self.find_allocation(ptr, size) {
            return Ok(vec![allocation.backing().clone()]);
        }
        let reserved = lock(&self.vmm).containing(ptr, size.max(1)).is_some();
        if reserved && self.address_space.is_mapped(ptr, size.max(1)) {
            return Ok(self.address_space.backing_in(ptr, size.max(1)));
        }
        Err(ZeError::invalid_arg(format!(
            "0x{ptr:x} (+0x{size:x}) is not memory of this context"
        )))
    }

    /// Every physical block a kernel may reach through a buffer pointer: the
    /// whole USM allocation, or every block mapped anywhere in the
    /// reservation containing `ptr`.
    ///
    /// # Errors
    /// `InvalidArgument` unless `ptr` itself is allocated or mapped memory of
    /// this context.
    pub(crate) fn resolve_buffer(&self, ptr: u64) -> ZeResult<Vec<Arc<PhysicalMemory>>> {
        if let Some(allocation) = self.find_allocation(ptr, 1) {
            return Ok(vec![allocation.backing().clone()]);
        }
        let reservation = lock(&self.vmm).containing(ptr, 1);
        match reservation {
            Some(r) if self.address_space.is_mapped(ptr, 1) => {
                Ok(self.address_space.backing_in(r.base, r.size))
            }
            _ => Err(ZeError::invalid_arg(format!(
                "buffer 0x{ptr:x} is not memory of this context"
            ))),
        }
    }

    /// Pins the memory behind `[ptr, ptr + size)` resident on `device`.
    ///
    /// # Errors
    /// `InvalidArgument` for unknown memory or devices, `OutOfDeviceMemory`
    /// if it does not fit in the device's local memory.
    pub fn make_memory_resident(&self, device: &Device, ptr: u64, size: u64) -> ZeResult<()> {
        self.check_alive()?;
        self.require_device(device)?;
        let blocks = self.resolve_range(ptr, size)?;
        device.residency().make_resident(&blocks)
    }

    /// Drops the residency requirement on `[ptr, ptr + size)`. Advisory:
    /// non-resident memory is left alone.
    ///
    /// # Errors
    /// `InvalidArgument` for unknown memory or devices.
    pub fn evict_memory(&self, device: &Device, ptr: u64, size: u64) -> ZeResult<()> {
        self.require_device(device)?;
        let blocks = self.resolve_range(ptr, size)?;
        let mut residency = device.residency();
        for block in &blocks {
            residency.evict(block);
        }
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let live = lock(&self.allocations).len();
        if live > 0 {
            log::debug!("context dropped with {live} live allocation(s)");
        }
    }
}
