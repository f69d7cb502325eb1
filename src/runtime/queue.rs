use crate::config::DefaultQueueMode;
use crate::error::{ZeError, ZeResult};
use crate::kmd::engine::{Batch, HwContext};
use crate::kmd::isa::EngineFamily;
use crate::kmd::storage::PhysicalMemory;
use crate::runtime::cmdlist::CommandList;
use crate::runtime::context::Context;
use crate::runtime::device::Device;
use crate::runtime::fence::{Fence, FenceDesc};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandQueueMode {
    /// Resolved through `DriverConfig::default_queue_mode`.
    #[default]
    Default,
    /// `execute_command_lists` returns once the work has retired.
    Synchronous,
    Asynchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandQueuePriority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandQueueDesc {
    /// Engine group; see `Device::command_queue_groups`.
    pub ordinal: u32,
    /// Engine within the group.
    pub index: u32,
    pub mode: CommandQueueMode,
    pub priority: CommandQueuePriority,
}

/// Builds a [`CommandQueue`] step by step.
pub struct CommandQueueBuilder<'a> {
    context: &'a Arc<Context>,
    device: &'a Arc<Device>,
    desc: CommandQueueDesc,
}

impl<'a> CommandQueueBuilder<'a> {
    #[must_use]
    pub fn new(context: &'a Arc<Context>, device: &'a Arc<Device>) -> Self {
        Self {
            context,
            device,
            desc: CommandQueueDesc::default(),
        }
    }

    #[must_use]
    pub const fn with_ordinal(mut self, ordinal: u32) -> Self {
        self.desc.ordinal = ordinal;
        self
    }

    #[must_use]
    pub const fn with_index(mut self, index: u32) -> Self {
        self.desc.index = index;
        self
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: CommandQueueMode) -> Self {
        self.desc.mode = mode;
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: CommandQueuePriority) -> Self {
        self.desc.priority = priority;
        self
    }

    /// # Errors
    /// See [`CommandQueue::create`].
    pub fn create(self) -> ZeResult<CommandQueue> {
        CommandQueue::create(self.context, self.device, &self.desc)
    }
}

/// Submits closed command lists to one hardware context.
///
/// Batches execute in submission order. Dropping the queue stops its
/// hardware context after the pending batches drain.
#[derive(Debug)]
pub struct CommandQueue {
    id: u64,
    context: Arc<Context>,
    device: Arc<Device>,
    ordinal: u32,
    family: EngineFamily,
    mode: CommandQueueMode,
    priority: CommandQueuePriority,
    hw: HwContext,
}

impl CommandQueue {
    /// # Errors
    /// `InvalidArgument` for a device outside the context, an unknown group
    /// ordinal or an engine index past the group size.
    pub fn create(
        context: &Arc<Context>,
        device: &Arc<Device>,
        desc: &CommandQueueDesc,
    ) -> ZeResult<Self> {
        context.check_alive()?;
        if !context.contains_device(device) {
            return Err(ZeError::invalid_arg("device is not part of the context"));
        }
        let group = device.queue_group(desc.ordinal)?;
        if desc.index >= group.num_queues {
            return Err(ZeError::invalid_arg(format!(
                "queue index {} out of range: group {} has {} engine(s)",
                desc.index, desc.ordinal, group.num_queues
            )));
        }

        let mode = match desc.mode {
            CommandQueueMode::Default => match context.driver().config().default_queue_mode {
                DefaultQueueMode::Synchronous => CommandQueueMode::Synchronous,
                DefaultQueueMode::Asynchronous => CommandQueueMode::Asynchronous,
            },
            mode => mode,
        };
        let hw = device.kmd().create_hw_context(group.family)?;
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "command queue {id}: {:?} engine {} of device {}, {mode:?}, {:?} priority",
            group.family,
            desc.index,
            device.ordinal(),
            desc.priority
        );
        Ok(Self {
            id,
            context: context.clone(),
            device: device.clone(),
            ordinal: desc.ordinal,
            family: group.family,
            mode,
            priority: desc.priority,
            hw,
        })
    }

    #[must_use]
    pub const fn mode(&self) -> CommandQueueMode {
        self.mode
    }

    #[must_use]
    pub const fn priority(&self) -> CommandQueuePriority {
        self.priority
    }

    #[must_use]
    pub const fn ordinal(&self) -> u32 {
        self.ordinal
    }

    #[must_use]
    pub const fn family(&self) -> EngineFamily {
        self.family
    }

    #[must_use]
    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Creates a fence bound to this queue's submissions.
    #[must_use]
    pub fn create_fence(&self, desc: &FenceDesc) -> Fence {
        Fence::new(
            self.id,
            self.context.clone(),
            self.hw.counter().clone(),
            desc,
        )
    }

    fn validate(&self, lists: &[&CommandList], fence: Option<&Fence>) -> ZeResult<()> {
        if lists.is_empty() {
            return Err(ZeError::invalid_arg("no command lists to execute"));
        }
        for list in lists {
            if !list.is_closed() {
                return Err(ZeError::invalid_arg(format!(
                    "command list {} is not closed",
                    list.id()
                )));
            }
            if list.family() != self.family {
                return Err(ZeError::invalid_arg(format!(
                    "command list {} targets {:?} engines, queue runs {:?}",
                    list.id(),
                    list.family(),
                    self.family
                )));
            }
            if !Arc::ptr_eq(list.context(), &self.context) || !Arc::ptr_eq(list.device(), &self.device)
            {
                return Err(ZeError::invalid_arg(format!(
                    "command list {} belongs to another context or device",
                    list.id()
                )));
            }
        }
        if let Some(fence) = fence {
            if fence.queue_id() != self.id {
                return Err(ZeError::invalid_arg("fence belongs to another queue"));
            }
            if !fence.is_cleared() {
                return Err(ZeError::invalid_state("fence must be reset before reuse"));
            }
        }
        Ok(())
    }

    /// Submits `lists` as one batch, in array order.
    ///
    /// Residency for every block the lists reference is established first;
    /// if that fails nothing is submitted. With a fence, the fence signals
    /// once the whole batch retires.
    ///
    /// # Errors
    /// `InvalidArgument` for open, foreign or mismatched lists or a foreign
    /// fence, `InvalidState` for a fence that was not reset,
    /// `OutOfDeviceMemory` if residency cannot be established, `DeviceLost`
    /// after a fault.
    pub fn execute_command_lists(
        &self,
        lists: &[&CommandList],
        fence: Option<&Fence>,
    ) -> ZeResult<()> {
        self.context.check_alive()?;
        self.validate(lists, fence)?;

        let mut seen = HashSet::new();
        let blocks: Vec<Arc<PhysicalMemory>> = lists
            .iter()
            .flat_map(|l| l.referenced_memory())
            .filter(|m| seen.insert(m.id()))
            .cloned()
            .collect();

        // Held through submission so no other queue evicts these blocks
        // before they are marked in use.
        let mut residency = self.device.residency();
        let checkpoint = residency.checkpoint();
        residency.make_resident_for_submission(&blocks)?;

        let submitted = self
            .hw
            .submit(|task| self.build_batch(task, lists, fence, &blocks));
        let task = match submitted {
            Ok(task) => task,
            Err(err) => {
                residency.restore(checkpoint);
                return Err(err);
            }
        };
        drop(residency);

        log::debug!(
            "queue {}: task {task} with {} list(s), {} block(s) resident",
            self.id,
            lists.len(),
            blocks.len()
        );

        if self.mode == CommandQueueMode::Synchronous {
            self.synchronize(crate::kmd::interrupt::INFINITE_TIMEOUT)?;
        }
        Ok(())
    }

    /// Assembles the batch for `task`. Nothing is marked until every
    /// fallible step has passed.
    fn build_batch(
        &self,
        task: u64,
        lists: &[&CommandList],
        fence: Option<&Fence>,
        blocks: &[Arc<PhysicalMemory>],
    ) -> ZeResult<Batch> {
        let segments = lists
            .iter()
            .map(|l| {
                l.segment()
                    .cloned()
                    .ok_or_else(|| ZeError::invalid_state("command list lost its buffer"))
            })
            .collect::<ZeResult<Vec<_>>>()?;
        if let Some(fence) = fence {
            fence.arm(task)?;
        }

        let counter = self.hw.counter();
        for block in blocks {
            block.mark_used(counter, task);
        }
        for event in lists.iter().flat_map(|l| l.written_events()) {
            event.mark_pending(counter, task);
        }
        Ok(Batch {
            task,
            segments,
            address_space: self.context.address_space().clone(),
        })
    }

    /// Blocks until every batch submitted so far has retired.
    ///
    /// # Errors
    /// `InvalidState` if nothing was ever submitted, `NotReady` on timeout,
    /// `DeviceLost` after a fault.
    pub fn synchronize(&self, timeout_ns: u64) -> ZeResult<()> {
        self.context.check_alive()?;
        let last = self.hw.last_submitted_task();
        if last == 0 {
            return Err(ZeError::invalid_state(
                "command queue has never been submitted to",
            ));
        }

        let counter = self.hw.counter();
        self.context
            .host_wait(timeout_ns, || counter.has_passed(last))?;
        if !counter.has_completed(last) {
            return Err(ZeError::DeviceLost);
        }
        self.context.process_deferred_frees();
        Ok(())
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        log::debug!("command queue {} destroyed", self.id);
    }
}
