use crate::error::{ZeError, ZeResult};
use crate::utils::lock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Timeout value meaning "wait forever".
pub const INFINITE_TIMEOUT: u64 = u64::MAX;

/// Upper bound on one sleep, so waiters re-check device loss periodically.
const MAX_SLEEP: Duration = Duration::from_millis(50);

/// Driver-wide completion interrupt.
///
/// Engines raise it after every store to memory, batch retirement or fault.
/// Host waiters spin for a while and then sleep on it.
#[derive(Debug, Default)]
pub struct InterruptLine {
    generation: Mutex<u64>,
    cond: Condvar,
    waiters: AtomicU32,
}

struct WaitGuard<'a>(&'a InterruptLine);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.waiters.fetch_sub(1, Ordering::Relaxed);
    }
}

impl InterruptLine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        let mut generation = lock(&self.generation);
        *generation = generation.wrapping_add(1);
        if self.waiters.load(Ordering::Relaxed) > 0 {
            self.cond.notify_all();
        }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        *lock(&self.generation)
    }

    /// Sleeps until the line is raised past `seen` or `timeout` elapses.
    pub fn wait(&self, seen: u64, timeout: Duration) {
        self.waiters.fetch_add(1, Ordering::Relaxed);
        let _guard = WaitGuard(self);

        let generation = lock(&self.generation);
        if *generation != seen {
            return;
        }
        let _ = self
            .cond
            .wait_timeout_while(generation, timeout, |g| *g == seen);
    }
}

/// Outcome of one poll of a host wait condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPoll {
    Ready,
    Pending,
    Lost,
}

/// Polls `poll` until it reports ready, the device is lost, or `timeout_ns`
/// elapses.
///
/// Busy-polls for `spin`, then sleeps on `line` between polls. A timeout of
/// zero polls exactly once.
///
/// # Errors
/// `NotReady` on timeout, `DeviceLost` if the poll reports loss.
pub fn wait_until(
    line: &InterruptLine,
    timeout_ns: u64,
    spin: Duration,
    mut poll: impl FnMut() -> WaitPoll,
) -> ZeResult<()> {
    let start = Instant::now();
    let timeout = (timeout_ns != INFINITE_TIMEOUT).then(|| Duration::from_nanos(timeout_ns));

    loop {
        let seen = line.generation();
        match poll() {
            WaitPoll::Ready => return Ok(()),
            WaitPoll::Lost => return Err(ZeError::DeviceLost),
            WaitPoll::Pending => {}
        }

        let elapsed = start.elapsed();
        if timeout.is_some_and(|t| elapsed >= t) {
            return Err(ZeError::NotReady);
        }

        if elapsed < spin {
            std::hint::spin_loop();
            continue;
        }

        let remaining = timeout.map_or(MAX_SLEEP, |t| (t - elapsed).min(MAX_SLEEP));
        line.wait(seen, remaining);
    }
}
