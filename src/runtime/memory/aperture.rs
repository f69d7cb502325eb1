use super::ApertureAllocator;
use crate::utils::{PAGE_SIZE_4K, align_up, is_aligned};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy)]
struct Region {
    /// First tracked byte, including the leading guard.
    start: u64,
    /// One past the last tracked byte, including the trailing guard.
    end: u64,
    size: u64,
}

/// A managed range of GPU virtual address space.
#[derive(Debug)]
pub struct Aperture {
    base: u64,
    limit: u64,
    align: u64,
    guard_pages: u64,

    // Returned address -> tracked region. Regions never overlap, so this
    // order is also the order of their tracked ranges.
    regions: BTreeMap<u64, Region>,
}

impl Aperture {
    #[must_use]
    pub const fn new(base: u64, limit: u64, align: u64, guard_pages: u64) -> Self {
        Self {
            base,
            limit,
            align,
            guard_pages,
            regions: BTreeMap::new(),
        }
    }

    const fn guard_size(&self) -> u64 {
        self.guard_pages * PAGE_SIZE_4K
    }

    /// Address for `size` bytes placed in the hole `[cursor, hole_end)`.
    fn place(&self, cursor: u64, hole_end: u64, size: u64, align: u64) -> Option<u64> {
        let guard = self.guard_size();
        let addr = align_up(cursor.checked_add(guard)?, align);
        let end = addr.checked_add(size)?.checked_add(guard)?;
        (end <= hole_end).then_some(addr)
    }

    fn find_hole(&self, size: u64, align: u64) -> Option<u64> {
        let mut cursor = self.base;
        for region in self.regions.values() {
            if let Some(addr) = self.place(cursor, region.start, size, align) {
                return Some(addr);
            }
            cursor = cursor.max(region.end);
        }
        self.place(cursor, self.limit, size, align)
    }

    /// Reserves exactly `[addr, addr + size)` without guard pages.
    ///
    /// Returns false if the range is misaligned, outside the aperture, or
    /// collides with a live region.
    pub fn reserve_exact(&mut self, addr: u64, size: u64) -> bool {
        let Some(end) = addr.checked_add(size) else {
            return false;
        };
        if size == 0 || !is_aligned(addr, self.align) || addr < self.base || end > self.limit {
            return false;
        }

        let collides = self
            .regions
            .values()
            .any(|r| r.start < end && addr < r.end);
        if collides {
            return false;
        }

        self.regions.insert(
            addr,
            Region {
                start: addr,
                end,
                size,
            },
        );
        true
    }

    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        (self.base..self.limit).contains(&addr)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl ApertureAllocator for Aperture {
    fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    fn allocate_va(&mut self, size: u64, align: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let align = align.max(self.align);
        let addr = self.find_hole(size, align)?;
        let guard = self.guard_size();

        self.regions.insert(
            addr,
            Region {
                start: addr - guard,
                end: addr + size + guard,
                size,
            },
        );
        Some(addr)
    }

    fn free_va(&mut self, addr: u64, size: u64) -> bool {
        match self.regions.get(&addr) {
            Some(region) if region.size == size => {
                self.regions.remove(&addr);
                true
            }
            _ => {
                log::warn!("tried to free VA 0x{addr:x} (+0x{size:x}) which was not tracked");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{PAGE_SIZE_2M, PAGE_SIZE_64K};

    const BASE: u64 = 0x8000_0000_0000;

    #[test]
    fn guard_pages_separate_allocations() {
        let mut ap = Aperture::new(BASE, BASE + PAGE_SIZE_2M, PAGE_SIZE_4K, 1);
        let a = ap.allocate_va(PAGE_SIZE_4K, PAGE_SIZE_4K).unwrap();
        let b = ap.allocate_va(PAGE_SIZE_4K, PAGE_SIZE_4K).unwrap();
        assert_eq!(a, BASE + PAGE_SIZE_4K);
        assert!(b >= a + 2 * PAGE_SIZE_4K);
    }

    #[test]
    fn large_alignment_is_honoured_after_guard() {
        let mut ap = Aperture::new(BASE, BASE + 8 * PAGE_SIZE_2M, PAGE_SIZE_4K, 1);
        let a = ap.allocate_va(PAGE_SIZE_2M, PAGE_SIZE_2M).unwrap();
        assert!(is_aligned(a, PAGE_SIZE_2M));
        assert!(a > BASE);
    }

    #[test]
    fn freed_hole_is_reused() {
        let mut ap = Aperture::new(BASE, BASE + 4 * PAGE_SIZE_64K, PAGE_SIZE_64K, 0);
        let a = ap.allocate_va(PAGE_SIZE_64K, 0).unwrap();
        let _b = ap.allocate_va(PAGE_SIZE_64K, 0).unwrap();
        assert!(!ap.free_va(a, PAGE_SIZE_4K));
        assert!(ap.free_va(a, PAGE_SIZE_64K));
        assert_eq!(ap.allocate_va(PAGE_SIZE_64K, 0), Some(a));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut ap = Aperture::new(BASE, BASE + 2 * PAGE_SIZE_64K, PAGE_SIZE_64K, 0);
        assert!(ap.allocate_va(2 * PAGE_SIZE_64K, 0).is_some());
        assert_eq!(ap.allocate_va(PAGE_SIZE_64K, 0), None);
    }

    #[test]
    fn exact_reservation_rejects_collisions() {
        let mut ap = Aperture::new(BASE, BASE + 16 * PAGE_SIZE_64K, PAGE_SIZE_64K, 0);
        assert!(ap.reserve_exact(BASE + 4 * PAGE_SIZE_64K, 2 * PAGE_SIZE_64K));
        assert!(!ap.reserve_exact(BASE + 5 * PAGE_SIZE_64K, PAGE_SIZE_64K));
        assert!(!ap.reserve_exact(BASE + 1, PAGE_SIZE_64K));
        let hole = ap.allocate_va(4 * PAGE_SIZE_64K, 0).unwrap();
        assert_eq!(hole, BASE);
        let next = ap.allocate_va(PAGE_SIZE_64K, 0).unwrap();
        assert_eq!(next, BASE + 6 * PAGE_SIZE_64K);
    }
}
