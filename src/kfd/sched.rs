use crate::error::KfdMemResult;
use crate::kfd::host::MmId;
use crate::thunk::memory::eviction::EvictionFence;
use std::sync::Arc;

/// The command-queue scheduler serving one device.
pub trait QueueScheduler: Send + Sync {
    /// Stop all user queues of the process owning `mm`.
    fn quiesce_process(&self, mm: MmId) -> KfdMemResult<()>;

    /// Restart the user queues stopped by `quiesce_process`.
    fn resume_process(&self, mm: MmId) -> KfdMemResult<()>;

    /// Queue an asynchronous evict-and-quiesce of the process owning `mm`.
    ///
    /// The scheduler signals `fence` once the queues are stopped. Called from the fence's
    /// signaling callback, so it must not block. Returns `false` if nothing could be queued.
    fn schedule_evict_and_restore(&self, mm: MmId, fence: Arc<EvictionFence>) -> bool;
}
