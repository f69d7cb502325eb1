use crate::error::{ZeError, ZeResult};
use crate::kmd::engine::CompletionCounter;
use crate::runtime::context::Context;
use crate::utils::lock;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Default)]
pub struct FenceDesc {
    /// Create the fence already signaled.
    pub signaled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Cleared,
    Signaled,
    /// Armed by a submission; signaled once that task retires.
    Pending(u64),
}

/// Completion marker of one submission batch on one command queue.
#[derive(Debug)]
pub struct Fence {
    queue_id: u64,
    context: Arc<Context>,
    counter: Arc<CompletionCounter>,
    state: Mutex<FenceState>,
}

impl Fence {
    pub(crate) fn new(
        queue_id: u64,
        context: Arc<Context>,
        counter: Arc<CompletionCounter>,
        desc: &FenceDesc,
    ) -> Self {
        let state = if desc.signaled {
            FenceState::Signaled
        } else {
            FenceState::Cleared
        };
        Self {
            queue_id,
            context,
            counter,
            state: Mutex::new(state),
        }
    }

    pub(crate) const fn queue_id(&self) -> u64 {
        self.queue_id
    }

    pub(crate) fn is_cleared(&self) -> bool {
        *lock(&self.state) == FenceState::Cleared
    }

    /// Binds the fence to `task`.
    ///
    /// # Errors
    /// `InvalidState` unless the fence is cleared.
    pub(crate) fn arm(&self, task: u64) -> ZeResult<()> {
        let mut state = lock(&self.state);
        if *state != FenceState::Cleared {
            return Err(ZeError::invalid_state("fence must be reset before reuse"));
        }
        *state = FenceState::Pending(task);
        Ok(())
    }

    /// Folds a retired pending task into `Signaled`.
    fn refresh(&self) -> FenceState {
        let mut state = lock(&self.state);
        if let FenceState::Pending(task) = *state {
            if self.counter.has_completed(task) {
                *state = FenceState::Signaled;
            }
        }
        *state
    }

    /// # Errors
    /// `NotReady` until the submission retires, `DeviceLost` after a fault.
    pub fn query_status(&self) -> ZeResult<()> {
        self.context.check_alive()?;
        match self.refresh() {
            FenceState::Signaled => Ok(()),
            FenceState::Cleared | FenceState::Pending(_) => Err(ZeError::NotReady),
        }
    }

    /// Blocks until the submission the fence was armed with retires.
    ///
    /// # Errors
    /// `InvalidState` if the fence was never submitted, `NotReady` on
    /// timeout, `DeviceLost` after a fault.
    pub fn host_synchronize(&self, timeout_ns: u64) -> ZeResult<()> {
        self.context.check_alive()?;
        let task = match self.refresh() {
            FenceState::Signaled => return Ok(()),
            FenceState::Cleared => {
                return Err(ZeError::invalid_state("fence has not been submitted"));
            }
            FenceState::Pending(task) => task,
        };

        self.context
            .host_wait(timeout_ns, || self.counter.has_passed(task))?;
        match self.refresh() {
            FenceState::Signaled => Ok(()),
            _ => Err(ZeError::DeviceLost),
        }
    }

    /// Returns the fence to `Cleared`.
    ///
    /// # Errors
    /// `InvalidState` while its submission is still in flight.
    pub fn reset(&self) -> ZeResult<()> {
        let mut state = lock(&self.state);
        if let FenceState::Pending(task) = *state {
            if !self.counter.has_passed(task) {
                return Err(ZeError::invalid_state(
                    "cannot reset a fence whose submission is in flight",
                ));
            }
        }
        *state = FenceState::Cleared;
        Ok(())
    }
}
