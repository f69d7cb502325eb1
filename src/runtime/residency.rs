use crate::error::{ZeError, ZeResult};
use crate::kmd::storage::{MemoryPool, PhysicalMemory};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone)]
struct ResidentEntry {
    memory: Weak<PhysicalMemory>,
    /// Bytes charged against the budget; zero for system memory.
    charge: u64,
    /// Pinned by `make_resident` rather than pulled in by a submission.
    explicit: bool,
    last_use: u64,
}

/// Resident set captured by [`ResidencyTracker::checkpoint`].
#[derive(Debug)]
pub struct ResidencyCheckpoint {
    entries: HashMap<u64, ResidentEntry>,
    epoch: u64,
}

/// Per-device resident set.
///
/// Residency is only established when work is submitted or when a caller
/// asks for it explicitly. Entries hold weak references so that freeing an
/// allocation needs no tracker call.
#[derive(Debug)]
pub struct ResidencyTracker {
    budget: u64,
    entries: HashMap<u64, ResidentEntry>,
    epoch: u64,
}

fn charge_of(memory: &PhysicalMemory) -> u64 {
    match memory.pool() {
        MemoryPool::Local => memory.size(),
        MemoryPool::System => 0,
    }
}

impl ResidencyTracker {
    #[must_use]
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            entries: HashMap::new(),
            epoch: 0,
        }
    }

    fn prune(&mut self) {
        self.entries.retain(|_, e| e.memory.strong_count() > 0);
    }

    /// Bytes of local memory currently resident.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| e.memory.strong_count() > 0)
            .map(|e| e.charge)
            .sum()
    }

    #[must_use]
    pub const fn budget(&self) -> u64 {
        self.budget
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.memory.strong_count() > 0)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_resident(&self, memory: &PhysicalMemory) -> bool {
        self.entries.contains_key(&memory.id())
    }

    /// Picks implicit, idle entries to evict (least recently used first)
    /// until `needed` more bytes fit. Entries in `keep` are never chosen.
    fn plan_eviction(&self, needed: u64, keep: &[u64]) -> ZeResult<Vec<u64>> {
        let used = self.used();
        if used + needed <= self.budget {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<(u64, &ResidentEntry, Arc<PhysicalMemory>)> = self
            .entries
            .iter()
            .filter(|(id, e)| !e.explicit && e.charge > 0 && !keep.contains(id))
            .filter_map(|(&id, e)| e.memory.upgrade().map(|m| (id, e, m)))
            .filter(|(_, _, m)| !m.is_busy())
            .collect();
        candidates.sort_by_key(|(_, e, _)| e.last_use);

        let mut freed = 0u64;
        let mut victims = Vec::new();
        for (id, e, _) in candidates {
            if used + needed - freed <= self.budget {
                break;
            }
            freed += e.charge;
            victims.push(id);
        }

        if used + needed - freed > self.budget {
            log::debug!(
                "residency: {needed} bytes do not fit ({used} of {} in use)",
                self.budget
            );
            return Err(ZeError::OutOfDeviceMemory);
        }
        Ok(victims)
    }

    fn evict_ids(&mut self, victims: &[u64]) {
        for id in victims {
            if let Some(entry) = self.entries.remove(id) {
                if let Some(memory) = entry.memory.upgrade() {
                    log::trace!("residency: evicting physical memory {id}");
                    memory.set_resident(false);
                }
            }
        }
    }

    fn insert(&mut self, memory: &Arc<PhysicalMemory>, explicit: bool) {
        self.epoch += 1;
        let epoch = self.epoch;
        let entry = self
            .entries
            .entry(memory.id())
            .or_insert_with(|| ResidentEntry {
                memory: Arc::downgrade(memory),
                charge: charge_of(memory),
                explicit,
                last_use: epoch,
            });
        entry.explicit |= explicit;
        entry.last_use = epoch;
        memory.set_resident(true);
    }

    fn establish(&mut self, blocks: &[Arc<PhysicalMemory>], explicit: bool) -> ZeResult<()> {
        self.prune();
        let keep: Vec<u64> = blocks.iter().map(|m| m.id()).collect();
        let needed: u64 = blocks
            .iter()
            .filter(|m| !self.is_resident(m))
            .map(|m| charge_of(m))
            .sum();

        let victims = self.plan_eviction(needed, &keep)?;
        self.evict_ids(&victims);
        for memory in blocks {
            self.insert(memory, explicit);
        }
        Ok(())
    }

    /// Makes every block in `required` resident for a submission.
    ///
    /// All or nothing: on failure the resident set is unchanged.
    ///
    /// # Errors
    /// `OutOfDeviceMemory` if the blocks cannot fit even after evicting every
    /// idle, implicitly resident block.
    pub fn make_resident_for_submission(&mut self, required: &[Arc<PhysicalMemory>]) -> ZeResult<()> {
        self.establish(required, false)
    }

    /// Pins `blocks` resident until `evict` is called. Idempotent.
    ///
    /// # Errors
    /// `OutOfDeviceMemory` if they cannot fit; nothing changes in that case.
    pub fn make_resident(&mut self, blocks: &[Arc<PhysicalMemory>]) -> ZeResult<()> {
        self.establish(blocks, true)
    }

    #[must_use]
    pub fn checkpoint(&self) -> ResidencyCheckpoint {
        ResidencyCheckpoint {
            entries: self.entries.clone(),
            epoch: self.epoch,
        }
    }

    /// Returns the resident set to `checkpoint`, re-admitting blocks evicted
    /// since and dropping blocks admitted since. Blocks freed in between stay
    /// gone.
    pub fn restore(&mut self, checkpoint: ResidencyCheckpoint) {
        for (id, entry) in &self.entries {
            if !checkpoint.entries.contains_key(id) {
                if let Some(memory) = entry.memory.upgrade() {
                    memory.set_resident(false);
                }
            }
        }
        for (id, entry) in &checkpoint.entries {
            if !self.entries.contains_key(id) {
                if let Some(memory) = entry.memory.upgrade() {
                    memory.set_resident(true);
                }
            }
        }
        self.entries = checkpoint.entries;
        self.epoch = checkpoint.epoch;
        self.prune();
    }

    /// Drops the residency requirement on `memory`.
    ///
    /// Advisory: not resident is a no-op, and a block still used by in-flight
    /// work stays resident until it is idle and space is needed.
    pub fn evict(&mut self, memory: &PhysicalMemory) {
        let Some(entry) = self.entries.get_mut(&memory.id()) else {
            log::warn!("residency: evicting non-resident physical memory {}", memory.id());
            return;
        };

        if memory.is_busy() {
            entry.explicit = false;
            return;
        }
        self.entries.remove(&memory.id());
        memory.set_resident(false);
    }
}
