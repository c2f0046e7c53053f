use crate::config::MemConfig;
use crate::error::{KfdMemError, KfdMemResult};
use crate::kfd::bo::{BoCreateInfo, BoDomain, BoKind};
use crate::kfd::device::KfdDevice;
use crate::kfd::host::{HostPageSource, MmId};
use crate::thunk::context::ProcessTable;
use crate::thunk::memory::mem::{KgdMem, MemId};
use crate::thunk::memory::process::ProcessInfo;
use crate::thunk::memory::restore::cancel_restore;
use crate::thunk::memory::userptr::UserptrNotifier;
use crate::thunk::memory::vm::ProcessVm;
use crate::thunk::memory::{AllocFlags, MemDomain};
use crate::utils::{GPU_PAGE_SIZE, align_up, is_aligned, next_id};
use parking_lot::Mutex;
use std::sync::Arc;

/// Bytes charged against the configured limits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemUsage {
    pub system: u64,
    pub vram: u64,
}

/// The upward API of the memory manager: allocation, mapping and teardown of GPU memory
/// for every process that opened a VM.
#[derive(Debug)]
pub struct MemoryManager {
    processes: ProcessTable,
    usage: Mutex<MemUsage>,
}

impl MemoryManager {
    /// Creates a manager. `host` faults in pages for userptr allocations; without it, userptr
    /// allocations are refused.
    #[must_use]
    pub fn new(config: MemConfig, host: Option<Arc<dyn HostPageSource>>) -> Self {
        Self {
            processes: ProcessTable::new(config, host),
            usage: Mutex::new(MemUsage::default()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &MemConfig {
        self.processes.config()
    }

    /// The host-memory-change notifier. The host side calls
    /// [`UserptrNotifier::invalidate_range_start`] and
    /// [`UserptrNotifier::invalidate_range_end`] on it.
    #[must_use]
    pub const fn notifier(&self) -> &Arc<UserptrNotifier> {
        self.processes.notifier()
    }

    #[must_use]
    pub fn process(&self, mm: MmId) -> Option<Arc<ProcessInfo>> {
        self.processes.process(mm)
    }

    #[must_use]
    pub fn usage(&self) -> MemUsage {
        *self.usage.lock()
    }

    pub fn acquire_vm(&self, mm: MmId, device: &KfdDevice) -> KfdMemResult<Arc<ProcessVm>> {
        self.processes.acquire_vm(mm, device)
    }

    pub fn release_vm(&self, vm: &Arc<ProcessVm>) -> KfdMemResult<()> {
        self.processes.release_vm(vm)
    }

    fn charge(&self, domain: BoDomain, size: u64) -> KfdMemResult<()> {
        let config = self.processes.config();
        let mut usage = self.usage.lock();
        let (used, limit) = match domain {
            BoDomain::Vram => (&mut usage.vram, config.vram_limit),
            BoDomain::Gtt | BoDomain::Cpu => (&mut usage.system, config.system_mem_limit),
        };

        match used.checked_add(size) {
            Some(total) if total <= limit => {
                *used = total;
                Ok(())
            }
            _ => {
                log::debug!("Refusing {size} bytes in {domain:?}: {used} of {limit} in use");
                Err(KfdMemError::OutOfMemory)
            }
        }
    }

    fn uncharge(&self, domain: BoDomain, size: u64) {
        let mut usage = self.usage.lock();
        let used = match domain {
            BoDomain::Vram => &mut usage.vram,
            BoDomain::Gtt | BoDomain::Cpu => &mut usage.system,
        };
        *used = used.saturating_sub(size);
    }

    /// Allocates `size` bytes of GPU memory for the process owning `vm`, to be mapped at `va`.
    ///
    /// `host_address` is the host range backing a [`MemDomain::HostPinned`] allocation and
    /// must be given for that domain only. The allocation is not mapped anywhere yet.
    ///
    /// # Errors
    /// * `InvalidArgument` for a zero size, a misaligned VA, conflicting flags or a missing
    ///   or unexpected host address.
    /// * `OutOfMemory` if the accounting limit of the domain would be exceeded.
    /// * Allocator and host-fault errors are passed through.
    pub fn allocate(
        &self,
        vm: &Arc<ProcessVm>,
        va: u64,
        size: u64,
        domain: MemDomain,
        flags: AllocFlags,
        host_address: Option<u64>,
    ) -> KfdMemResult<Arc<KgdMem>> {
        if size == 0 {
            return Err(KfdMemError::InvalidArgument("zero-sized allocation".into()));
        }
        if !is_aligned(va, GPU_PAGE_SIZE) {
            return Err(KfdMemError::InvalidArgument(format!(
                "VA 0x{va:x} is not page aligned"
            )));
        }
        flags.validate(domain)?;
        if (domain == MemDomain::HostPinned) != host_address.is_some() {
            return Err(KfdMemError::InvalidArgument(
                "a host address is required for, and only for, host-pinned memory".into(),
            ));
        }

        let process = self.processes.process(vm.mm()).ok_or_else(|| {
            KfdMemError::InvalidArgument(format!("{} is not registered", vm.id))
        })?;
        if host_address.is_some() && process.host().is_none() {
            return Err(KfdMemError::HostFault("no host page source".into()));
        }

        let size = align_up(size, GPU_PAGE_SIZE);
        if host_address.is_some_and(|host| host.checked_add(size).is_none()) {
            return Err(KfdMemError::InvalidArgument(
                "host range wraps the address space".into(),
            ));
        }
        let bo_domain = domain.bo_domain();
        self.charge(bo_domain, size)?;

        let device = vm.device();
        let bo = match device.allocator().create_bo(&BoCreateInfo {
            size,
            domain: bo_domain,
            flags: flags.to_kfd_ioctl_flags(domain),
            kind: BoKind::Data,
            userptr: host_address,
        }) {
            Ok(bo) => bo,
            Err(e) => {
                self.uncharge(bo_domain, size);
                return Err(e);
            }
        };

        let mem = KgdMem::new(
            MemId(next_id()),
            bo,
            va,
            size,
            domain,
            flags,
            device.clone(),
            Arc::downgrade(&process),
            host_address,
        );
        device
            .allocator()
            .attach_fence(bo, process.eviction_fence());
        process.add_mem(mem.clone());

        if mem.is_userptr() {
            let registered = process
                .notifier()
                .register_hsa(process.mm(), &mem)
                .and_then(|()| Self::init_user_pages(&process, &mem));
            if let Err(e) = registered {
                log::warn!("{}: userptr setup failed: {e}", mem.id);
                self.discard(&process, &mem);
                return Err(e);
            }
        }

        log::debug!(
            "{}: {size} bytes in {domain:?} at 0x{va:x} ({bo})",
            mem.id
        );
        Ok(mem)
    }

    /// Faults in the host pages of a new userptr allocation.
    ///
    /// If the range is invalidated while faulting, the pages are left stale and the next map
    /// fetches them again.
    fn init_user_pages(process: &ProcessInfo, mem: &KgdMem) -> KfdMemResult<()> {
        let (Some(host), Some(addr)) = (process.host(), mem.userptr_addr()) else {
            return Ok(());
        };

        let seq = mem.invalidate_seq();
        let pages = host.get_user_pages(process.mm(), addr, mem.npages())?;

        let mut inner = mem.lock.lock();
        if mem.invalidate_seq() == seq {
            mem.device().allocator().set_user_pages(mem.bo, &pages)?;
            inner.user_pages_seq = seq;
            inner.user_pages_valid = true;
        }
        Ok(())
    }

    /// Releases everything `allocate` set up for `mem`.
    fn discard(&self, process: &ProcessInfo, mem: &Arc<KgdMem>) {
        if mem.is_userptr() {
            process.notifier().unregister_hsa(process.mm(), mem.id);
        }
        let allocator = mem.device().allocator();
        allocator.detach_fence(mem.bo, process.eviction_fence());
        mem.remove_all_entries();
        process.remove_mem(mem.id);
        allocator.release_bo(mem.bo);
        self.uncharge(mem.domain.bo_domain(), mem.size);
    }

    /// Frees an allocation that is no longer mapped anywhere.
    ///
    /// # Errors
    /// Returns `StillMapped` while the allocation is mapped into any VM. Once marked freed,
    /// further maps of `mem` fail.
    pub fn free(&self, mem: &Arc<KgdMem>) -> KfdMemResult<()> {
        let evict_quiesce = mem.mark_freed()?;

        mem.restore_work.close();
        cancel_restore(mem);
        if let Some(mm) = evict_quiesce {
            mem.resume_evict_quiesce(mm);
        }

        match mem.process() {
            Ok(process) => self.discard(&process, mem),
            Err(_) => {
                // The process registry is already gone; only the buffer is left.
                mem.remove_all_entries();
                mem.device().allocator().release_bo(mem.bo);
                self.uncharge(mem.domain.bo_domain(), mem.size);
            }
        }
        log::debug!("{}: freed", mem.id);
        Ok(())
    }

    /// Maps `mem` into `vm`. Mapping an already mapped allocation is a no-op.
    ///
    /// While the allocation is evicted, the mapping is only recorded and realised by the next
    /// restore.
    pub fn map(&self, mem: &Arc<KgdMem>, vm: &Arc<ProcessVm>) -> KfdMemResult<()> {
        mem.map_to_vm(vm)
    }

    /// Unmaps `mem` from `vm`.
    ///
    /// # Errors
    /// Returns `NotMapped` if `mem` is not mapped into `vm`.
    pub fn unmap(&self, mem: &Arc<KgdMem>, vm: &Arc<ProcessVm>) -> KfdMemResult<()> {
        mem.unmap_from_vm(vm)
    }

    /// Waits for all GPU work on `mem` to complete.
    pub fn sync_memory(&self, mem: &KgdMem) -> KfdMemResult<()> {
        mem.device().allocator().wait_idle(mem.bo)
    }
}
