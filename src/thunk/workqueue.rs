use crate::error::{KfdMemError, KfdMemResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Default)]
struct WorkState {
    generation: u64,
    /// Generation of the run that is queued but has not started.
    pending: Option<u64>,
    running: bool,
    closed: bool,
}

/// A single-flight delayed task, the equivalent of a kernel `delayed_work`.
///
/// At most one run is queued at a time: queueing again replaces the queued run. A run that
/// has already started is never interrupted; `cancel_sync` waits for it.
#[derive(Debug)]
pub struct DelayedWork {
    name: String,
    state: Mutex<WorkState>,
    idle: Condvar,
}

impl DelayedWork {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(WorkState::default()),
            idle: Condvar::new(),
        })
    }

    /// Queues `func` to run after `delay`, replacing a queued run that has not started yet.
    ///
    /// Fails with `ResourceExhausted` once the work is closed or if no worker can be started.
    pub fn queue<F>(self: &Arc<Self>, delay: Duration, func: F) -> KfdMemResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = {
            let mut state = self.state.lock();
            if state.closed {
                log::debug!("{}: closed, not queueing", self.name);
                return Err(KfdMemError::ResourceExhausted);
            }
            state.generation += 1;
            state.pending = Some(state.generation);
            state.generation
        };

        let work = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || work.run(generation, delay, func));

        if let Err(e) = spawned {
            log::error!("{}: failed to spawn worker: {e}", self.name);
            let mut state = self.state.lock();
            if state.pending == Some(generation) {
                state.pending = None;
            }
            return Err(KfdMemError::ResourceExhausted);
        }
        Ok(())
    }

    fn run<F: FnOnce()>(&self, generation: u64, delay: Duration, func: F) {
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        {
            let mut state = self.state.lock();
            while state.running {
                self.idle.wait(&mut state);
            }
            if state.pending != Some(generation) {
                // Cancelled or superseded while sleeping.
                return;
            }
            state.pending = None;
            state.running = true;
        }

        func();

        self.state.lock().running = false;
        self.idle.notify_all();
    }

    /// Drops a queued run. Does not wait for a run that already started.
    ///
    /// Returns `true` if a queued run was dropped.
    pub fn cancel(&self) -> bool {
        let cancelled = self.state.lock().pending.take().is_some();
        if cancelled {
            self.idle.notify_all();
        }
        cancelled
    }

    /// Refuses every later `queue` and drops a queued run. A started run is not waited for.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        if state.pending.take().is_some() {
            drop(state);
            self.idle.notify_all();
        }
    }

    /// Drops a queued run and waits for a started one to finish.
    ///
    /// Must not be called from inside the work function itself.
    pub fn cancel_sync(&self) -> bool {
        let mut state = self.state.lock();
        let cancelled = state.pending.take().is_some();
        while state.running {
            self.idle.wait(&mut state);
        }
        drop(state);
        self.idle.notify_all();
        cancelled
    }

    /// Waits until nothing is queued or running.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        while state.running || state.pending.is_some() {
            self.idle.wait(&mut state);
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }
}
