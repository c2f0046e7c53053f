use crate::error::KfdMemResult;
use crate::kfd::host::MmId;
use crate::kfd::sched::QueueScheduler;
use crate::thunk::signal::Fence;
use crate::utils::next_id;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// The fence attached to every buffer of one process.
///
/// The allocator must call [`EvictionFence::enable_signaling`] before it may reclaim a buffer
/// carrying this fence, which turns "evict this buffer" into "evict this process". The same
/// instance lives as long as the process and is re-armed after every restore.
pub struct EvictionFence {
    context: u64,
    mm: MmId,
    timeline_name: String,
    fence: Fence,
    scheduler: Arc<dyn QueueScheduler>,
    self_ref: Weak<EvictionFence>,
}

impl fmt::Debug for EvictionFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvictionFence")
            .field("context", &self.context)
            .field("mm", &self.mm)
            .field("timeline_name", &self.timeline_name)
            .field("fence", &self.fence)
            .finish_non_exhaustive()
    }
}

impl EvictionFence {
    pub fn create(
        mm: MmId,
        timeline_name: impl Into<String>,
        scheduler: Arc<dyn QueueScheduler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            context: next_id(),
            mm,
            timeline_name: timeline_name.into(),
            fence: Fence::new(),
            scheduler,
            self_ref: self_ref.clone(),
        })
    }

    /// Stable identity of this fence; equal for every buffer of the process.
    #[must_use]
    pub const fn context(&self) -> u64 {
        self.context
    }

    #[must_use]
    pub const fn mm(&self) -> MmId {
        self.mm
    }

    /// Whether eviction requests of this fence go to `scheduler`.
    #[must_use]
    pub fn is_served_by(&self, scheduler: &Arc<dyn QueueScheduler>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.scheduler), Arc::as_ptr(scheduler))
    }

    #[must_use]
    pub fn timeline_name(&self) -> &str {
        &self.timeline_name
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.fence.is_signaled()
    }

    #[must_use]
    pub fn signal_count(&self) -> u32 {
        self.fence.signal_count()
    }

    #[must_use]
    pub fn seqno(&self) -> u64 {
        self.fence.seqno()
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.fence.is_closed()
    }

    /// Called by the allocator when it wants to reclaim a buffer carrying this fence.
    ///
    /// Returns `true` if the fence is already signaled. Otherwise queues an evict-and-quiesce
    /// of the owning process (which signals the fence when done) and returns `false`. Never
    /// blocks.
    pub fn enable_signaling(&self) -> bool {
        if self.fence.is_signaled() {
            return true;
        }
        if !self.fence.mark_signaling_enabled() {
            // Eviction already requested for this sequence number.
            return false;
        }

        let Some(this) = self.self_ref.upgrade() else {
            return false;
        };
        log::debug!("{}: eviction requested on {}", self.timeline_name, self.mm);
        if !self.scheduler.schedule_evict_and_restore(self.mm, this) {
            log::warn!(
                "{}: scheduler refused evict request for {}",
                self.timeline_name,
                self.mm
            );
        }
        false
    }

    /// Signals the fence once the owning process has been quiesced.
    pub fn signal(&self) -> bool {
        self.fence.signal()
    }

    /// Makes a signaled fence usable again after the process has been restored.
    ///
    /// A released fence is never re-armed.
    pub fn rearm(&self) -> bool {
        self.fence.rearm()
    }

    pub fn wait(&self, timeout: Option<Duration>) -> KfdMemResult<()> {
        self.fence.wait(timeout)
    }

    /// Process teardown: signal unconditionally so nothing waits forever.
    pub fn release(&self) {
        if self.fence.close() {
            log::debug!("{}: released", self.timeline_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;

    #[derive(Default)]
    struct RecordingScheduler {
        evict_requests: Mutex<Vec<u64>>,
    }

    impl QueueScheduler for RecordingScheduler {
        fn quiesce_process(&self, _mm: MmId) -> KfdMemResult<()> {
            Ok(())
        }

        fn resume_process(&self, _mm: MmId) -> KfdMemResult<()> {
            Ok(())
        }

        fn schedule_evict_and_restore(&self, _mm: MmId, fence: Arc<EvictionFence>) -> bool {
            self.evict_requests.lock().push(fence.context());
            true
        }
    }

    #[test]
    fn enable_signaling_requests_eviction_once() {
        let sched = Arc::new(RecordingScheduler::default());
        let fence = EvictionFence::create(MmId(1), "kfd_fence_test", sched.clone());

        assert!(!fence.enable_signaling());
        assert!(!fence.enable_signaling());
        assert_eq!(sched.evict_requests.lock().as_slice(), &[fence.context()]);

        fence.signal();
        assert!(fence.enable_signaling());
    }

    #[test]
    fn rearmed_fence_can_be_evicted_again() {
        let sched = Arc::new(RecordingScheduler::default());
        let fence = EvictionFence::create(MmId(1), "kfd_fence_test", sched.clone());

        assert!(!fence.enable_signaling());
        fence.signal();
        assert!(fence.rearm());
        assert!(!fence.enable_signaling());

        assert_eq!(sched.evict_requests.lock().len(), 2);
    }

    #[test]
    fn release_after_signal_blocks_pending_rearm() {
        let sched = Arc::new(RecordingScheduler::default());
        let fence = EvictionFence::create(MmId(3), "kfd_fence_test", sched);

        assert!(!fence.enable_signaling());
        fence.signal();
        // Teardown lands between a restore's signaled check and its rearm.
        fence.release();
        assert!(!fence.rearm());
        assert!(fence.is_signaled());
        assert!(fence.wait(Some(Duration::ZERO)).is_ok());
        assert!(fence.enable_signaling());
    }

    #[test]
    fn concurrent_release_signals_once() {
        let sched = Arc::new(RecordingScheduler::default());
        let fence = EvictionFence::create(MmId(2), "kfd_fence_test", sched);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fence = fence.clone();
                thread::spawn(move || fence.release())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(fence.is_signaled());
        assert_eq!(fence.signal_count(), 1);
        assert!(!fence.rearm());
    }
}
