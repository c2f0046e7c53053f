use crate::error::{KfdMemError, KfdMemResult};
use crate::kfd::bo::BoId;
use crate::kfd::device::KfdDevice;
use crate::kfd::host::MmId;
use crate::thunk::memory::process::ProcessInfo;
use crate::thunk::memory::resv::{MappedFilter, ReservationContext, VmFilter};
use crate::thunk::memory::vm::{ProcessVm, VmId};
use crate::thunk::memory::{AllocFlags, MemDomain};
use crate::thunk::workqueue::DelayedWork;
use crate::utils::{align_up, host_page_size};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemId(pub u64);

impl fmt::Display for MemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem#{}", self.0)
    }
}

/// Links an allocation to one VM it is mapped into.
#[derive(Debug, Clone)]
pub struct BoVaEntry {
    pub vm: Arc<ProcessVm>,
    /// GPU VA of this mapping. The second mapping of an AQL queue buffer sits at `va + size`.
    pub va: u64,
    /// The mapping is wanted. While the allocation is evicted it is not in the page tables.
    pub is_mapped: bool,
    /// The last restore could not re-establish this mapping.
    pub map_failed: bool,
    /// Recorded while evicted. Holds one quiesce of this VM's device until restored or
    /// unmapped.
    pub(crate) quiesced: bool,
}

impl BoVaEntry {
    #[must_use]
    pub fn gpu_id(&self) -> u32 {
        self.vm.device().gpu_id
    }
}

/// Snapshot of one mapping record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingInfo {
    pub vm: VmId,
    pub gpu_id: u32,
    pub va: u64,
    pub is_mapped: bool,
    pub map_failed: bool,
}

/// State guarded by the allocation lock.
#[derive(Debug, Default)]
pub struct KgdMemInner {
    pub(crate) bo_va_list: Vec<BoVaEntry>,
    pub(crate) mapped_to_gpu_memory: u32,
    /// 0: resident. 1: restore queued or running. n >= 2: evicted, n - 1 evictions outstanding.
    pub(crate) evicted_bos: u32,
    pub(crate) restore_mm: Option<MmId>,
    /// The quiesce taken by the first eviction, still to be resumed.
    pub(crate) evict_quiesce: Option<MmId>,
    /// Set by `free`; no new mappings after that.
    pub(crate) freed: bool,
    pub(crate) user_pages_seq: u64,
    pub(crate) user_pages_valid: bool,
}

impl KgdMemInner {
    fn entries_for(&self, vm: VmId) -> impl Iterator<Item = &BoVaEntry> {
        self.bo_va_list.iter().filter(move |e| e.vm.id == vm)
    }
}

/// One GPU allocation of a process.
pub struct KgdMem {
    pub id: MemId,
    pub bo: BoId,
    pub va: u64,
    pub size: u64,
    pub domain: MemDomain,
    pub flags: AllocFlags,
    device: KfdDevice,
    process: Weak<ProcessInfo>,
    userptr: Option<u64>,
    /// Bumped by the userptr notifier whenever the backing host range changes.
    invalidate_seq: AtomicU64,
    pub(crate) lock: Mutex<KgdMemInner>,
    pub(crate) restore_work: Arc<DelayedWork>,
}

impl fmt::Debug for KgdMem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KgdMem")
            .field("id", &self.id)
            .field("bo", &self.bo)
            .field("va", &format_args!("0x{:x}", self.va))
            .field("size", &self.size)
            .field("domain", &self.domain)
            .field("userptr", &self.userptr)
            .finish_non_exhaustive()
    }
}

impl KgdMem {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: MemId,
        bo: BoId,
        va: u64,
        size: u64,
        domain: MemDomain,
        flags: AllocFlags,
        device: KfdDevice,
        process: Weak<ProcessInfo>,
        userptr: Option<u64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            bo,
            va,
            size,
            domain,
            flags,
            device,
            process,
            userptr,
            invalidate_seq: AtomicU64::new(0),
            lock: Mutex::new(KgdMemInner::default()),
            restore_work: DelayedWork::new(format!("kfd-restore-{}", id.0)),
        })
    }

    #[must_use]
    pub const fn device(&self) -> &KfdDevice {
        &self.device
    }

    pub(crate) fn process(&self) -> KfdMemResult<Arc<ProcessInfo>> {
        self.process
            .upgrade()
            .ok_or_else(|| KfdMemError::InvalidArgument(format!("{}: process is gone", self.id)))
    }

    #[must_use]
    pub const fn userptr_addr(&self) -> Option<u64> {
        self.userptr
    }

    #[must_use]
    pub const fn is_userptr(&self) -> bool {
        self.userptr.is_some()
    }

    /// Number of host pages backing a userptr allocation.
    #[must_use]
    pub fn npages(&self) -> u64 {
        let page = host_page_size();
        let start = self.userptr.unwrap_or(0);
        let first = start & !(page - 1);
        (align_up(start + self.size, page) - first) / page
    }

    #[must_use]
    pub fn invalidate_seq(&self) -> u64 {
        self.invalidate_seq.load(Ordering::Acquire)
    }

    pub(crate) fn bump_invalidate_seq(&self) {
        self.invalidate_seq.fetch_add(1, Ordering::AcqRel);
    }

    /// The eviction counter.
    #[must_use]
    pub fn eviction_count(&self) -> u32 {
        self.lock.lock().evicted_bos
    }

    /// Number of VMs this allocation is mapped into.
    #[must_use]
    pub fn mapped_count(&self) -> u32 {
        self.lock.lock().mapped_to_gpu_memory
    }

    #[must_use]
    pub fn mappings(&self) -> Vec<MappingInfo> {
        self.lock
            .lock()
            .bo_va_list
            .iter()
            .map(|e| MappingInfo {
                vm: e.vm.id,
                gpu_id: e.gpu_id(),
                va: e.va,
                is_mapped: e.is_mapped,
                map_failed: e.map_failed,
            })
            .collect()
    }

    #[must_use]
    pub fn is_mapped_to(&self, vm: VmId) -> bool {
        self.lock.lock().entries_for(vm).any(|e| e.is_mapped)
    }

    #[must_use]
    pub fn restore_pending(&self) -> bool {
        self.restore_work.is_pending()
    }

    pub(crate) fn user_pages_current(&self, inner: &KgdMemInner) -> bool {
        !self.is_userptr()
            || (inner.user_pages_valid && inner.user_pages_seq == self.invalidate_seq())
    }

    /// Pins the buffer and page tables for one mapping and programs it.
    ///
    /// Leaves no pins behind on failure.
    pub(crate) fn map_entry(&self, vm: &ProcessVm, va: u64) -> KfdMemResult<()> {
        let allocator = self.device.allocator();

        let backing = allocator.pin(self.bo, self.domain.bo_domain())?;
        if let Err(e) = vm.pin_pd_pts(va, self.size) {
            allocator.unpin(self.bo);
            return Err(e);
        }
        if let Err(e) = vm.map_range(va, self.size, self.bo, backing) {
            vm.unpin_pd_pts(va, self.size);
            allocator.unpin(self.bo);
            return Err(e);
        }
        Ok(())
    }

    /// Removes one mapping from the page tables and drops its pins.
    pub(crate) fn unmap_entry(&self, vm: &ProcessVm, va: u64) {
        if vm.unmap_range(va).is_none() {
            log::warn!("{}: no translation at 0x{va:x} in {}", self.id, vm.id);
        }
        vm.unpin_pd_pts(va, self.size);
        self.device.allocator().unpin(self.bo);
    }

    /// Maps every unmapped entry of `vm`, unwinding all of them if one fails.
    fn map_vm_entries(&self, inner: &mut KgdMemInner, vm: &ProcessVm) -> KfdMemResult<()> {
        let targets: Vec<usize> = inner
            .bo_va_list
            .iter()
            .enumerate()
            .filter(|(_, e)| e.vm.id == vm.id && !e.is_mapped)
            .map(|(i, _)| i)
            .collect();

        let mut done: Vec<u64> = Vec::with_capacity(targets.len());
        for &idx in &targets {
            let va = inner.bo_va_list[idx].va;
            if let Err(e) = self.map_entry(vm, va) {
                log::warn!("{}: mapping 0x{va:x} into {} failed: {e}", self.id, vm.id);
                for &mapped in done.iter().rev() {
                    self.unmap_entry(vm, mapped);
                }
                return Err(e);
            }
            done.push(va);
        }

        for idx in targets {
            let entry = &mut inner.bo_va_list[idx];
            entry.is_mapped = true;
            entry.map_failed = false;
        }
        Ok(())
    }

    /// Creates the mapping records for `vm` if there are none yet. Returns how many were made.
    fn add_vm_entries(
        &self,
        inner: &mut KgdMemInner,
        vm: &Arc<ProcessVm>,
    ) -> KfdMemResult<usize> {
        if inner.entries_for(vm.id).next().is_some() {
            return Ok(0);
        }

        let mut vas = vec![self.va];
        if self.flags.aql_queue_mem {
            vas.push(self.va + self.size);
        }

        for (i, &va) in vas.iter().enumerate() {
            if let Err(e) = vm.reserve_va(va, self.size, self.id.0) {
                for &reserved in &vas[..i] {
                    vm.release_va(reserved, self.id.0);
                }
                return Err(e);
            }
        }

        for &va in &vas {
            inner.bo_va_list.push(BoVaEntry {
                vm: vm.clone(),
                va,
                is_mapped: false,
                map_failed: false,
                quiesced: false,
            });
        }
        Ok(vas.len())
    }

    fn remove_vm_entries(&self, inner: &mut KgdMemInner, vm: VmId) {
        inner.bo_va_list.retain(|e| {
            if e.vm.id == vm {
                e.vm.release_va(e.va, self.id.0);
                false
            } else {
                true
            }
        });
    }

    /// Destroys every mapping record. Only valid once nothing is mapped.
    pub(crate) fn remove_all_entries(&self) {
        let mut inner = self.lock.lock();
        for e in inner.bo_va_list.drain(..) {
            e.vm.release_va(e.va, self.id.0);
        }
    }

    pub(crate) fn map_to_vm(&self, vm: &Arc<ProcessVm>) -> KfdMemResult<()> {
        let process = self.process()?;
        if vm.mm() != process.mm() {
            return Err(KfdMemError::InvalidArgument(format!(
                "{} belongs to another process",
                vm.id
            )));
        }
        let config = process.config();
        let mm = process.mm();

        let mut inner = self.lock.lock();
        if inner.freed {
            return Err(KfdMemError::InvalidArgument(format!("{} is freed", self.id)));
        }
        let created = self.add_vm_entries(&mut inner, vm)?;

        if inner.entries_for(vm.id).all(|e| e.is_mapped) {
            return Ok(());
        }

        if inner.evicted_bos > 0 {
            return self.map_while_evicted(&mut inner, vm, mm, created);
        }

        let mut ctx = match ReservationContext::acquire(
            self,
            &inner.bo_va_list,
            VmFilter::Only(vm.id),
            MappedFilter::Unmapped,
        ) {
            Ok(ctx) => ctx,
            Err(e) => {
                if created > 0 {
                    self.remove_vm_entries(&mut inner, vm.id);
                }
                return Err(e);
            }
        };

        if !self.user_pages_current(&inner) {
            let fetched = match process.host() {
                Some(host) => ctx.reacquire_after_host_fault(
                    self,
                    &mut inner,
                    host,
                    mm,
                    config.host_fault_retries,
                ),
                None => Err(KfdMemError::HostFault("no host page source".into())),
            };
            let fetched = fetched.and_then(|()| {
                // The allocation lock was dropped while faulting.
                if inner.freed {
                    Err(KfdMemError::InvalidArgument(format!("{} is freed", self.id)))
                } else {
                    Ok(())
                }
            });
            if let Err(e) = fetched {
                drop(ctx);
                if created > 0 {
                    self.remove_vm_entries(&mut inner, vm.id);
                }
                return Err(e);
            }

            if inner.entries_for(vm.id).all(|e| e.is_mapped) {
                return ctx.release(false);
            }
            if inner.evicted_bos > 0 {
                drop(ctx);
                return self.map_while_evicted(&mut inner, vm, mm, created);
            }
        }

        if let Err(e) = self.map_vm_entries(&mut inner, vm) {
            drop(ctx);
            if created > 0 {
                self.remove_vm_entries(&mut inner, vm.id);
            }
            return Err(e);
        }
        inner.mapped_to_gpu_memory += 1;
        drop(inner);

        if let Err(e) = ctx.release(config.wait_idle_after_map) {
            log::warn!("{}: map into {} did not settle: {e}", self.id, vm.id);
        }
        Ok(())
    }

    /// Records the mapping for the restore path and keeps the queues off memory that is
    /// not in the page tables yet. The restore, or an unmap, resumes the queues again.
    fn map_while_evicted(
        &self,
        inner: &mut KgdMemInner,
        vm: &ProcessVm,
        mm: MmId,
        created: usize,
    ) -> KfdMemResult<()> {
        if let Err(e) = vm.device().scheduler().quiesce_process(mm) {
            log::warn!("{}: failed to quiesce {mm}: {e}", self.id);
            if created > 0 {
                self.remove_vm_entries(inner, vm.id);
            }
            return Err(e);
        }

        for entry in inner.bo_va_list.iter_mut().filter(|e| e.vm.id == vm.id) {
            entry.is_mapped = true;
            entry.map_failed = false;
            entry.quiesced = true;
        }
        inner.mapped_to_gpu_memory += 1;
        log::debug!("{}: mapped into {} while evicted", self.id, vm.id);
        Ok(())
    }

    /// Resumes the queues stopped by the first eviction.
    pub(crate) fn resume_evict_quiesce(&self, mm: MmId) {
        if let Err(e) = self.device.scheduler().resume_process(mm) {
            log::warn!("{}: failed to resume {mm}: {e}", self.id);
        }
    }

    /// Marks the allocation as freed. Fails while it is mapped anywhere.
    ///
    /// Returns the eviction quiesce the allocation still holds, for the caller to resume.
    pub(crate) fn mark_freed(&self) -> KfdMemResult<Option<MmId>> {
        let mut inner = self.lock.lock();
        if inner.mapped_to_gpu_memory > 0 {
            return Err(KfdMemError::StillMapped);
        }
        if std::mem::replace(&mut inner.freed, true) {
            return Err(KfdMemError::InvalidArgument(format!("{} is already freed", self.id)));
        }
        Ok(inner.evict_quiesce.take())
    }

    pub(crate) fn unmap_from_vm(&self, vm: &Arc<ProcessVm>) -> KfdMemResult<()> {
        let process = self.process()?;
        let config = process.config();
        let mm = process.mm();

        let mut inner = self.lock.lock();
        if !inner.entries_for(vm.id).any(|e| e.is_mapped) {
            return Err(KfdMemError::NotMapped);
        }

        if inner.evicted_bos > 0 {
            let quiesced = inner.entries_for(vm.id).any(|e| e.quiesced);
            self.remove_vm_entries(&mut inner, vm.id);
            inner.mapped_to_gpu_memory -= 1;

            // With nothing left to restore, the eviction no longer needs the queues stopped.
            let evict_quiesce = if inner.bo_va_list.iter().any(|e| e.is_mapped) {
                None
            } else {
                inner.evict_quiesce.take()
            };
            drop(inner);

            log::debug!("{}: unmapped from {} while evicted", self.id, vm.id);
            if quiesced {
                if let Err(e) = vm.device().scheduler().resume_process(mm) {
                    log::warn!("{}: failed to resume {mm}: {e}", self.id);
                }
            }
            if let Some(evict_mm) = evict_quiesce {
                self.resume_evict_quiesce(evict_mm);
            }
            return Ok(());
        }

        let ctx = ReservationContext::acquire(
            self,
            &inner.bo_va_list,
            VmFilter::Only(vm.id),
            MappedFilter::Mapped,
        )?;

        let mapped: Vec<u64> = inner
            .entries_for(vm.id)
            .filter(|e| e.is_mapped)
            .map(|e| e.va)
            .collect();
        for &va in mapped.iter().rev() {
            self.unmap_entry(vm, va);
        }
        self.remove_vm_entries(&mut inner, vm.id);
        inner.mapped_to_gpu_memory -= 1;
        drop(inner);

        if let Err(e) = ctx.release(config.wait_idle_after_map) {
            log::warn!("{}: unmap from {} did not settle: {e}", self.id, vm.id);
        }
        Ok(())
    }
}
