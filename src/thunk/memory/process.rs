//! Per-process memory registry.

use crate::config::MemConfig;
use crate::error::{KfdMemError, KfdMemResult};
use crate::kfd::host::{HostPageSource, MmId};
use crate::thunk::memory::eviction::EvictionFence;
use crate::thunk::memory::mem::{KgdMem, MemId};
use crate::thunk::memory::restore::{evict_mem, schedule_restore_mem};
use crate::thunk::memory::userptr::UserptrNotifier;
use crate::thunk::memory::vm::{ProcessVm, VmId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Default)]
struct ProcessInner {
    vms: Vec<Arc<ProcessVm>>,
    kfd_bo_list: BTreeMap<MemId, Arc<KgdMem>>,
}

/// Everything the memory manager tracks for one host process: its VMs (one per GPU), its
/// allocations and the eviction fence shared by all of them.
pub struct ProcessInfo {
    mm: MmId,
    config: MemConfig,
    host: Option<Arc<dyn HostPageSource>>,
    notifier: Arc<UserptrNotifier>,
    eviction_fence: Arc<EvictionFence>,
    lock: Mutex<ProcessInner>,
}

impl fmt::Debug for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessInfo")
            .field("mm", &self.mm)
            .field("eviction_fence", &self.eviction_fence)
            .finish_non_exhaustive()
    }
}

impl ProcessInfo {
    pub(crate) fn new(
        mm: MmId,
        config: MemConfig,
        host: Option<Arc<dyn HostPageSource>>,
        notifier: Arc<UserptrNotifier>,
        eviction_fence: Arc<EvictionFence>,
    ) -> Arc<Self> {
        Arc::new(Self {
            mm,
            config,
            host,
            notifier,
            eviction_fence,
            lock: Mutex::new(ProcessInner::default()),
        })
    }

    #[must_use]
    pub const fn mm(&self) -> MmId {
        self.mm
    }

    #[must_use]
    pub const fn config(&self) -> &MemConfig {
        &self.config
    }

    #[must_use]
    pub fn host(&self) -> Option<&dyn HostPageSource> {
        self.host.as_deref()
    }

    /// The fence attached to every buffer of this process.
    #[must_use]
    pub const fn eviction_fence(&self) -> &Arc<EvictionFence> {
        &self.eviction_fence
    }

    #[must_use]
    pub const fn notifier(&self) -> &Arc<UserptrNotifier> {
        &self.notifier
    }

    pub(crate) fn add_vm(&self, vm: Arc<ProcessVm>) {
        self.lock.lock().vms.push(vm);
    }

    /// Drops `vm` from the registry. Returns how many VMs are left.
    pub(crate) fn remove_vm(&self, vm: VmId) -> usize {
        let mut inner = self.lock.lock();
        inner.vms.retain(|v| v.id != vm);
        inner.vms.len()
    }

    #[must_use]
    pub fn vm_count(&self) -> usize {
        self.lock.lock().vms.len()
    }

    #[must_use]
    pub fn vm_for(&self, gpu_id: u32) -> Option<Arc<ProcessVm>> {
        self.lock
            .lock()
            .vms
            .iter()
            .find(|vm| vm.device().gpu_id == gpu_id)
            .cloned()
    }

    pub(crate) fn add_mem(&self, mem: Arc<KgdMem>) {
        self.lock.lock().kfd_bo_list.insert(mem.id, mem);
    }

    pub(crate) fn remove_mem(&self, id: MemId) -> Option<Arc<KgdMem>> {
        self.lock.lock().kfd_bo_list.remove(&id)
    }

    /// Snapshot of the allocations of this process.
    #[must_use]
    pub fn mems(&self) -> Vec<Arc<KgdMem>> {
        self.lock.lock().kfd_bo_list.values().cloned().collect()
    }

    /// Evicts every allocation of the process and signals the eviction fence.
    ///
    /// Called by the queue scheduler once it has acted on
    /// [`EvictionFence::enable_signaling`]. Allocations that fail to evict stay resident and
    /// are reported in the returned error; the fence is signaled regardless so the allocator
    /// is not left waiting.
    pub fn evict_process(&self) -> KfdMemResult<()> {
        let mut first_err = None;
        for mem in self.mems() {
            if let Err(e) = evict_mem(&mem, self.mm) {
                log::error!("{}: failed to evict {}: {e}", self.mm, mem.id);
                first_err.get_or_insert(e);
            }
        }
        self.eviction_fence.signal();
        log::debug!("{}: process evicted", self.mm);
        first_err.map_or(Ok(()), Err)
    }

    /// Schedules a restore of every allocation after the configured restore delay and
    /// re-arms the eviction fence.
    ///
    /// Allocations with no outstanding eviction are skipped.
    pub fn restore_process(&self) -> KfdMemResult<()> {
        let delay = self.config.restore_delay;
        let mut first_err = None;
        for mem in self.mems() {
            match schedule_restore_mem(&mem, self.mm, delay) {
                Ok(()) | Err(KfdMemError::Unbalanced) => {}
                Err(e) => {
                    log::error!("{}: failed to schedule restore of {}: {e}", self.mm, mem.id);
                    first_err.get_or_insert(e);
                }
            }
        }
        if !self.eviction_fence.rearm() {
            log::debug!("{}: eviction fence not re-armed", self.mm);
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Tears the registry down with its last VM.
    pub(crate) fn teardown(&self) {
        self.eviction_fence.release();

        let (vms, mems) = {
            let mut inner = self.lock.lock();
            (
                std::mem::take(&mut inner.vms),
                std::mem::take(&mut inner.kfd_bo_list),
            )
        };
        if !mems.is_empty() {
            log::warn!("{}: {} allocations leaked at teardown", self.mm, mems.len());
        }
        for vm in vms {
            vm.destroy();
        }
        log::debug!("{}: process torn down", self.mm);
    }
}
