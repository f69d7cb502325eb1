#![allow(clippy::cast_sign_loss)]

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const PAGE_SIZE_4K: u64 = 4 * 1024;
pub const PAGE_SIZE_64K: u64 = 64 * 1024;
pub const PAGE_SIZE_2M: u64 = 2 * 1024 * 1024;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn align_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}

/// Half-open range intersection test.
#[must_use]
pub const fn ranges_overlap(a_start: u64, a_size: u64, b_start: u64, b_size: u64) -> bool {
    a_start < b_start + b_size && b_start < a_start + a_size
}

/// Host page size as reported by the OS, cached after the first query.
pub fn host_page_size() -> u64 {
    static HOST_PAGE_SIZE: OnceLock<u64> = OnceLock::new();

    *HOST_PAGE_SIZE.get_or_init(|| {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret > 0 { ret as u64 } else { PAGE_SIZE_4K }
    })
}

/// Locks a mutex, recovering the guard if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
