#![allow(clippy::cast_possible_truncation)]

use crate::error::{ZeError, ZeResult};
use crate::kmd::storage::PhysicalMemory;
use crate::kmd::{AccessKind, GpuFault};
use crate::utils::{read_lock, write_lock};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Page permission of a mapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessAttribute {
    None,
    ReadOnly,
    ReadWrite,
}

impl AccessAttribute {
    const fn permits(self, access: AccessKind) -> bool {
        matches!(
            (self, access),
            (Self::ReadWrite, _) | (Self::ReadOnly, AccessKind::Read)
        )
    }
}

/// One page-table entry run: `[va, va + size)` maps onto `memory` at `offset`.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub va: u64,
    pub size: u64,
    pub memory: Arc<PhysicalMemory>,
    pub offset: u64,
    pub access: AccessAttribute,
}

impl Mapping {
    const fn end(&self) -> u64 {
        self.va + self.size
    }
}

/// A GPU virtual address space: the set of live mappings, keyed by start VA.
///
/// Shared by every engine executing work of the owning context.
#[derive(Debug, Default)]
pub struct GpuAddressSpace {
    mappings: RwLock<BTreeMap<u64, Mapping>>,
}

/// A resolved piece of a GPU access.
struct Chunk {
    memory: Arc<PhysicalMemory>,
    offset: u64,
    len: u64,
}

fn checked_end(va: u64, size: u64) -> ZeResult<u64> {
    va.checked_add(size)
        .ok_or_else(|| ZeError::invalid_arg("address range overflows"))
}

impl GpuAddressSpace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Page-table updates
    // ========================================================================

    /// Installs a mapping of `memory[offset..offset + size]` at `va`.
    ///
    /// # Errors
    /// `InvalidArgument` if the range overlaps a live mapping or exceeds the
    /// physical block.
    pub fn map(
        &self,
        va: u64,
        size: u64,
        memory: Arc<PhysicalMemory>,
        offset: u64,
        access: AccessAttribute,
    ) -> ZeResult<()> {
        let end = checked_end(va, size)?;
        if size == 0 {
            return Err(ZeError::InvalidSize("cannot map an empty range".into()));
        }
        if offset.checked_add(size).is_none_or(|e| e > memory.size()) {
            return Err(ZeError::invalid_arg(format!(
                "physical range [0x{offset:x}, +0x{size:x}) exceeds block of 0x{:x} bytes",
                memory.size()
            )));
        }

        let mut mappings = write_lock(&self.mappings);
        if let Some((_, prev)) = mappings.range(..end).next_back() {
            if prev.end() > va {
                return Err(ZeError::invalid_arg(format!(
                    "range 0x{va:x}..0x{end:x} overlaps mapping at 0x{:x}",
                    prev.va
                )));
            }
        }

        log::trace!("map 0x{va:x}..0x{end:x} -> phys {} +0x{offset:x} {access:?}", memory.id());
        mappings.insert(
            va,
            Mapping {
                va,
                size,
                memory,
                offset,
                access,
            },
        );
        Ok(())
    }

    /// Removes every mapping inside `[va, va + size)` and returns them.
    ///
    /// # Errors
    /// `InvalidArgument` if nothing is mapped there, or if a mapping straddles
    /// either boundary of the range.
    pub fn unmap(&self, va: u64, size: u64) -> ZeResult<Vec<Mapping>> {
        let end = checked_end(va, size)?;
        let mut mappings = write_lock(&self.mappings);

        let straddles = Self::overlapping(&mappings, va, end).any(|m| m.va < va || m.end() > end);
        if straddles {
            return Err(ZeError::invalid_arg(format!(
                "range 0x{va:x}..0x{end:x} does not cover whole mappings"
            )));
        }

        let keys: Vec<u64> = mappings.range(va..end).map(|(&k, _)| k).collect();
        if keys.is_empty() {
            return Err(ZeError::invalid_arg(format!(
                "nothing mapped in 0x{va:x}..0x{end:x}"
            )));
        }

        Ok(keys
            .into_iter()
            .filter_map(|k| mappings.remove(&k))
            .collect())
    }

    /// Changes the permission of `[va, va + size)`, splitting mappings at
    /// the range boundaries.
    ///
    /// # Errors
    /// `InvalidArgument` unless the whole range is mapped.
    pub fn set_access(&self, va: u64, size: u64, access: AccessAttribute) -> ZeResult<()> {
        let end = checked_end(va, size)?;
        let mut mappings = write_lock(&self.mappings);

        if !Self::covers(&mappings, va, end) {
            return Err(ZeError::invalid_arg(format!(
                "range 0x{va:x}..0x{end:x} is not fully mapped"
            )));
        }

        Self::split_at(&mut mappings, va);
        Self::split_at(&mut mappings, end);
        for m in mappings.range_mut(va..end).map(|(_, m)| m) {
            m.access = access;
        }
        Ok(())
    }

    fn split_at(mappings: &mut BTreeMap<u64, Mapping>, at: u64) {
        let Some((_, m)) = mappings.range_mut(..at).next_back() else {
            return;
        };
        if m.end() <= at {
            return;
        }

        let head = at - m.va;
        let tail = Mapping {
            va: at,
            size: m.size - head,
            memory: m.memory.clone(),
            offset: m.offset + head,
            access: m.access,
        };
        m.size = head;
        mappings.insert(at, tail);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    fn overlapping(
        mappings: &BTreeMap<u64, Mapping>,
        va: u64,
        end: u64,
    ) -> impl Iterator<Item = &Mapping> {
        let before = mappings
            .range(..va)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.end() > va);
        before.into_iter().chain(mappings.range(va..end).map(|(_, m)| m))
    }

    fn covers(mappings: &BTreeMap<u64, Mapping>, va: u64, end: u64) -> bool {
        let mut cursor = va;
        for m in Self::overlapping(mappings, va, end) {
            if m.va > cursor {
                return false;
            }
            cursor = cursor.max(m.end());
            if cursor >= end {
                return true;
            }
        }
        cursor >= end
    }

    #[must_use]
    pub fn is_mapped(&self, va: u64, size: u64) -> bool {
        let Some(end) = va.checked_add(size) else {
            return false;
        };
        Self::covers(&read_lock(&self.mappings), va, end)
    }

    #[must_use]
    pub fn has_mappings_in(&self, va: u64, size: u64) -> bool {
        let Some(end) = va.checked_add(size) else {
            return false;
        };
        Self::overlapping(&read_lock(&self.mappings), va, end)
            .next()
            .is_some()
    }

    /// Attribute at `va` and the length of the run from `va` that shares it,
    /// capped at `size`. `None` if `va` is not mapped.
    #[must_use]
    pub fn query_access(&self, va: u64, size: u64) -> Option<(AccessAttribute, u64)> {
        let end = va.saturating_add(size);
        let mappings = read_lock(&self.mappings);

        let mut iter = Self::overlapping(&mappings, va, end.max(va.saturating_add(1)));
        let first = iter.next().filter(|m| m.va <= va)?;
        let attr = first.access;
        let mut run_end = first.end();

        for m in iter {
            if m.va != run_end || m.access != attr || run_end >= end {
                break;
            }
            run_end = m.end();
        }
        Some((attr, run_end.min(end) - va))
    }

    /// Distinct physical blocks backing any part of `[va, va + size)`.
    #[must_use]
    pub fn backing_in(&self, va: u64, size: u64) -> Vec<Arc<PhysicalMemory>> {
        let end = va.saturating_add(size);
        let mappings = read_lock(&self.mappings);
        let mut out: Vec<Arc<PhysicalMemory>> = Vec::new();
        for m in Self::overlapping(&mappings, va, end) {
            if !out.iter().any(|p| Arc::ptr_eq(p, &m.memory)) {
                out.push(m.memory.clone());
            }
        }
        out
    }

    /// True if any mapping refers to the physical block `memory_id`.
    #[must_use]
    pub fn maps_memory(&self, memory_id: u64) -> bool {
        read_lock(&self.mappings)
            .values()
            .any(|m| m.memory.id() == memory_id)
    }

    // ========================================================================
    // Engine-side access
    // ========================================================================

    fn translate(&self, va: u64, len: u64, access: AccessKind) -> Result<Vec<Chunk>, GpuFault> {
        let mappings = read_lock(&self.mappings);
        let end = va.checked_add(len).ok_or(GpuFault::NotPresent(va))?;
        let mut chunks = Vec::new();
        let mut cursor = va;

        while cursor < end {
            let m = mappings
                .range(..=cursor)
                .next_back()
                .map(|(_, m)| m)
                .filter(|m| m.end() > cursor)
                .ok_or(GpuFault::NotPresent(cursor))?;

            if !m.access.permits(access) {
                return Err(GpuFault::Protection { va: cursor, access });
            }
            if !m.memory.is_accessible() {
                return Err(GpuFault::NotResident(cursor));
            }

            let chunk_end = m.end().min(end);
            chunks.push(Chunk {
                memory: m.memory.clone(),
                offset: m.offset + (cursor - m.va),
                len: chunk_end - cursor,
            });
            cursor = chunk_end;
        }
        Ok(chunks)
    }

    pub fn read(&self, va: u64, buf: &mut [u8]) -> Result<(), GpuFault> {
        let mut done = 0usize;
        for c in self.translate(va, buf.len() as u64, AccessKind::Read)? {
            let len = c.len as usize;
            c.memory
                .read(c.offset, &mut buf[done..done + len])
                .map_err(|e| GpuFault::Kernel(e.to_string()))?;
            done += len;
        }
        Ok(())
    }

    pub fn write(&self, va: u64, data: &[u8]) -> Result<(), GpuFault> {
        let mut done = 0usize;
        for c in self.translate(va, data.len() as u64, AccessKind::Write)? {
            let len = c.len as usize;
            c.memory
                .write(c.offset, &data[done..done + len])
                .map_err(|e| GpuFault::Kernel(e.to_string()))?;
            done += len;
        }
        Ok(())
    }

    pub fn fill(&self, va: u64, len: u64, pattern: &[u8]) -> Result<(), GpuFault> {
        let mut done = 0usize;
        for c in self.translate(va, len, AccessKind::Write)? {
            c.memory
                .fill(c.offset, c.len, pattern, done)
                .map_err(|e| GpuFault::Kernel(e.to_string()))?;
            done += c.len as usize;
        }
        Ok(())
    }

    pub fn read_u64(&self, va: u64) -> Result<u64, GpuFault> {
        let mut raw = [0u8; 8];
        self.read(va, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    pub fn write_u64(&self, va: u64, value: u64) -> Result<(), GpuFault> {
        self.write(va, &value.to_le_bytes())
    }
}
