use crate::error::{KfdMemError, KfdMemResult};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct FenceState {
    seqno: u64,
    signaled: bool,
    signaling_enabled: bool,
    closed: bool,
}

struct WaitGuard<'a>(&'a Fence);
impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A one-shot completion signal in the style of a DMA fence.
///
/// A fence starts unsignaled and becomes signaled exactly once per sequence number. Waiters
/// block on a condition variable; `rearm` starts a new sequence number on the same instance.
#[derive(Debug)]
pub struct Fence {
    state: Mutex<FenceState>,
    cond: Condvar,

    /// Tracks how many threads are currently waiting on this fence.
    waiting: AtomicU32,

    /// Number of unsignaled -> signaled transitions over the fence's lifetime.
    signal_count: AtomicU32,
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl Fence {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FenceState {
                seqno: 1,
                ..FenceState::default()
            }),
            cond: Condvar::new(),
            waiting: AtomicU32::new(0),
            signal_count: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    /// The fence was closed and stays signaled for good.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[must_use]
    pub fn seqno(&self) -> u64 {
        self.state.lock().seqno
    }

    #[must_use]
    pub fn waiters(&self) -> u32 {
        self.waiting.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Acquire)
    }

    /// Signals the fence and wakes all waiters.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn signal(&self) -> bool {
        let mut state = self.state.lock();
        if state.signaled {
            return false;
        }
        state.signaled = true;
        self.signal_count.fetch_add(1, Ordering::AcqRel);
        drop(state);

        self.cond.notify_all();
        true
    }

    /// Records that signaling was requested for the current sequence number.
    ///
    /// Returns `true` the first time per sequence number.
    pub fn mark_signaling_enabled(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.signaling_enabled, true)
    }

    /// Returns a signaled fence to the unsignaled state under a new sequence number.
    ///
    /// Returns `false` (and does nothing) if the fence is not signaled or has been closed.
    pub fn rearm(&self) -> bool {
        let mut state = self.state.lock();
        if !state.signaled || state.closed {
            return false;
        }
        state.seqno += 1;
        state.signaled = false;
        state.signaling_enabled = false;
        true
    }

    /// Signals the fence and forbids any later `rearm`.
    ///
    /// Returns `true` only for the first close.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        let transition = !std::mem::replace(&mut state.signaled, true);
        if transition {
            self.signal_count.fetch_add(1, Ordering::AcqRel);
        }
        drop(state);

        if transition {
            self.cond.notify_all();
        }
        true
    }

    /// Blocks until the fence is signaled, or until `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> KfdMemResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);

        self.waiting.fetch_add(1, Ordering::Relaxed);
        let _guard = WaitGuard(self);

        let mut state = self.state.lock();
        while !state.signaled {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() && !state.signaled
                    {
                        return Err(KfdMemError::WaitTimeout);
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        Ok(())
    }
}
