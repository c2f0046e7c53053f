use crate::error::{KfdMemError, KfdMemResult};
use crate::kfd::bo::BoAllocator;
use crate::kfd::sched::QueueScheduler;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A handle to one compute device.
///
/// Bundles the device identity with the external collaborators serving it. Cheap to clone;
/// VMs and allocations keep an `Arc` to the device they live on.
#[derive(Clone)]
pub struct KfdDevice {
    pub gpu_id: u32,
    allocator: Arc<dyn BoAllocator>,
    scheduler: Arc<dyn QueueScheduler>,
    compute_ready: Arc<AtomicBool>,
}

impl fmt::Debug for KfdDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KfdDevice")
            .field("gpu_id", &self.gpu_id)
            .field("compute_ready", &self.is_compute_ready())
            .finish_non_exhaustive()
    }
}

impl KfdDevice {
    /// Creates a device whose compute context is already initialized.
    pub fn new(
        gpu_id: u32,
        allocator: Arc<dyn BoAllocator>,
        scheduler: Arc<dyn QueueScheduler>,
    ) -> Self {
        Self {
            gpu_id,
            allocator,
            scheduler,
            compute_ready: Arc::new(AtomicBool::new(true)),
        }
    }

    #[must_use]
    pub fn allocator(&self) -> &dyn BoAllocator {
        self.allocator.as_ref()
    }

    #[must_use]
    pub fn scheduler(&self) -> &dyn QueueScheduler {
        self.scheduler.as_ref()
    }

    #[must_use]
    pub fn scheduler_arc(&self) -> Arc<dyn QueueScheduler> {
        self.scheduler.clone()
    }

    #[must_use]
    pub fn is_compute_ready(&self) -> bool {
        self.compute_ready.load(Ordering::Acquire)
    }

    /// Marks the compute context as (un)initialized, e.g. across a device reset.
    pub fn set_compute_ready(&self, ready: bool) {
        self.compute_ready.store(ready, Ordering::Release);
    }

    /// Fails with `DeviceNotReady` if the device has no compute context.
    pub fn check_ready(&self) -> KfdMemResult<()> {
        if self.is_compute_ready() {
            Ok(())
        } else {
            Err(KfdMemError::DeviceNotReady)
        }
    }
}
