use crate::config::MemConfig;
use crate::error::{KfdMemError, KfdMemResult};
use crate::kfd::device::KfdDevice;
use crate::kfd::host::{HostPageSource, MmId};
use crate::thunk::memory::eviction::EvictionFence;
use crate::thunk::memory::process::ProcessInfo;
use crate::thunk::memory::userptr::UserptrNotifier;
use crate::thunk::memory::vm::ProcessVm;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// ===============================================================================================
// Process Table
// ===============================================================================================

/// Every process the memory manager knows about, keyed by host address space.
///
/// A process registry is created with the first VM a process opens and torn down with the
/// last one.
pub struct ProcessTable {
    config: MemConfig,
    host: Option<Arc<dyn HostPageSource>>,
    notifier: Arc<UserptrNotifier>,
    processes: Mutex<HashMap<MmId, Arc<ProcessInfo>>>,
}

impl fmt::Debug for ProcessTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTable")
            .field("config", &self.config)
            .field("processes", &self.processes.lock().len())
            .finish_non_exhaustive()
    }
}

impl ProcessTable {
    #[must_use]
    pub fn new(config: MemConfig, host: Option<Arc<dyn HostPageSource>>) -> Self {
        let notifier = UserptrNotifier::new(config.userptr_restore_delay);
        Self {
            config,
            host,
            notifier,
            processes: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &MemConfig {
        &self.config
    }

    #[must_use]
    pub const fn notifier(&self) -> &Arc<UserptrNotifier> {
        &self.notifier
    }

    #[must_use]
    pub fn process(&self, mm: MmId) -> Option<Arc<ProcessInfo>> {
        self.processes.lock().get(&mm).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.processes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processes.lock().is_empty()
    }

    /// Returns the VM of process `mm` on `device`, creating the VM (and the process registry)
    /// on first use.
    ///
    /// A process is quiesced through one queue scheduler, the one of its first device; every
    /// further device of the process must share it.
    ///
    /// # Errors
    /// Returns `DeviceNotReady` if the device has no compute context, `InvalidArgument` if
    /// the device is served by a different queue scheduler, or the allocator error if the
    /// page directory cannot be created.
    pub fn acquire_vm(&self, mm: MmId, device: &KfdDevice) -> KfdMemResult<Arc<ProcessVm>> {
        let mut processes = self.processes.lock();

        let (process, created) = match processes.get(&mm) {
            Some(p) => (p.clone(), false),
            None => {
                let fence = EvictionFence::create(
                    mm,
                    format!("kfd-evict-{:x}", mm.0),
                    device.scheduler_arc(),
                );
                let p = ProcessInfo::new(
                    mm,
                    self.config.clone(),
                    self.host.clone(),
                    self.notifier.clone(),
                    fence,
                );
                (p, true)
            }
        };

        if let Some(vm) = process.vm_for(device.gpu_id) {
            return Ok(vm);
        }
        if !process.eviction_fence().is_served_by(&device.scheduler_arc()) {
            return Err(KfdMemError::InvalidArgument(format!(
                "gpu {:#x} has another queue scheduler than the rest of {mm}",
                device.gpu_id
            )));
        }

        let vm = ProcessVm::new(device, mm)?;
        process.add_vm(vm.clone());
        if created {
            processes.insert(mm, process);
            log::debug!("{mm}: process registered");
        }
        log::debug!("{mm}: {} created on gpu {:#x}", vm.id, device.gpu_id);
        Ok(vm)
    }

    /// Destroys `vm`, and the process registry with it if it was the last one.
    ///
    /// # Errors
    /// Returns `StillMapped` if an allocation is still mapped into `vm`.
    pub fn release_vm(&self, vm: &Arc<ProcessVm>) -> KfdMemResult<()> {
        let mut processes = self.processes.lock();
        let Some(process) = processes.get(&vm.mm()).cloned() else {
            return Err(KfdMemError::InvalidArgument(format!(
                "{} is not registered",
                vm.id
            )));
        };

        if process.mems().iter().any(|mem| mem.is_mapped_to(vm.id)) {
            return Err(KfdMemError::StillMapped);
        }

        let left = process.remove_vm(vm.id);
        vm.destroy();

        if left == 0 {
            processes.remove(&vm.mm());
            drop(processes);
            process.teardown();
        }
        Ok(())
    }
}
