//! Eviction and restore of individual allocations.
//!
//! Every trigger (the eviction fence, the userptr notifier, process-wide eviction) goes
//! through [`evict_mem`] and [`schedule_restore_mem`], so the counter arithmetic lives here
//! only. The counter on an allocation reads:
//!
//! * `0`: resident, every `is_mapped` record is in the page tables.
//! * `1`: a restore is queued or running.
//! * `n >= 2`: unmapped from the page tables, `n - 1` evictions still outstanding.
//!
//! The first eviction jumps straight to `2` so its matching restore lands on `1`, the only
//! value at which a restore is queued.

use crate::error::{KfdMemError, KfdMemResult};
use crate::kfd::host::MmId;
use crate::thunk::memory::mem::{KgdMem, KgdMemInner};
use crate::thunk::memory::resv::{MappedFilter, ReservationContext, VmFilter};
use crate::thunk::memory::vm::ProcessVm;
use std::sync::Arc;
use std::time::Duration;

/// Evicts `mem` on behalf of the process owning `mm`.
///
/// The first eviction quiesces the process queues and removes every mapping from the page
/// tables. Further evictions only count.
pub fn evict_mem(mem: &KgdMem, mm: MmId) -> KfdMemResult<()> {
    mem.device().check_ready()?;

    let mut inner = mem.lock.lock();
    if inner.evicted_bos >= 1 {
        // Already out of the page tables. A queued restore would map it right back.
        if inner.evicted_bos == 1 {
            mem.restore_work.cancel();
        }
        inner.evicted_bos += 1;
        log::debug!("{}: evicted again, counter {}", mem.id, inner.evicted_bos);
        return Ok(());
    }

    mem.restore_work.cancel();
    mem.device().scheduler().quiesce_process(mm)?;

    match unmap_all(mem, &mut inner) {
        Ok(()) => {
            inner.evicted_bos = 2;
            inner.evict_quiesce = Some(mm);
            log::debug!("{}: evicted", mem.id);
            Ok(())
        }
        Err(e) => {
            // Leave the counter at 0 so the paired restore fails instead of double-mapping.
            inner.evicted_bos = 0;
            drop(inner);
            log::error!("{}: eviction failed: {e}", mem.id);
            if let Err(e) = mem.device().scheduler().resume_process(mm) {
                log::warn!("{}: failed to resume {mm}: {e}", mem.id);
            }
            Err(e)
        }
    }
}

/// Takes every mapped record out of the page tables, keeping `is_mapped` set.
fn unmap_all(mem: &KgdMem, inner: &mut KgdMemInner) -> KfdMemResult<()> {
    let ctx = ReservationContext::acquire(
        mem,
        &inner.bo_va_list,
        VmFilter::All,
        MappedFilter::Mapped,
    )?;

    for entry in inner.bo_va_list.iter().rev().filter(|e| e.is_mapped) {
        mem.unmap_entry(&entry.vm, entry.va);
    }

    if let Err(e) = ctx.release(true) {
        log::warn!("{}: unmap did not settle: {e}", mem.id);
    }
    Ok(())
}

/// Undoes one eviction. When the last outstanding eviction is undone, a restore is queued
/// to run after `delay`.
pub fn schedule_restore_mem(mem: &Arc<KgdMem>, mm: MmId, delay: Duration) -> KfdMemResult<()> {
    let mut inner = mem.lock.lock();
    if inner.evicted_bos <= 1 {
        return Err(KfdMemError::Unbalanced);
    }

    inner.evicted_bos -= 1;
    if inner.evicted_bos > 1 {
        return Ok(());
    }

    mem.restore_work.cancel();
    inner.restore_mm = Some(mm);

    let weak = Arc::downgrade(mem);
    let queued = mem.restore_work.queue(delay, move || {
        if let Some(mem) = weak.upgrade() {
            restore_worker(&mem);
        }
    });

    if let Err(e) = queued {
        inner.evicted_bos += 1;
        return Err(e);
    }
    log::debug!("{}: restore queued in {delay:?}", mem.id);
    Ok(())
}

/// Re-establishes the mappings of an evicted allocation.
///
/// Does nothing unless the counter is still exactly 1. Mappings that cannot be restored are
/// downgraded to unmapped so the GPU faults on them instead of using stale translations; the
/// process queues are resumed either way, once for every quiesce the eviction took.
pub fn restore_worker(mem: &KgdMem) {
    let process = match mem.process() {
        Ok(p) => p,
        Err(e) => {
            log::debug!("{}: skipping restore: {e}", mem.id);
            return;
        }
    };
    let config = process.config();

    let mut inner = mem.lock.lock();
    if inner.evicted_bos != 1 {
        log::debug!(
            "{}: restore raced, counter is {}",
            mem.id,
            inner.evicted_bos
        );
        return;
    }
    let mm = inner.restore_mm.unwrap_or_else(|| process.mm());

    let mut ctx = match ReservationContext::acquire(
        mem,
        &inner.bo_va_list,
        VmFilter::All,
        MappedFilter::Mapped,
    ) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            log::error!("{}: cannot reserve for restore: {e}", mem.id);
            None
        }
    };

    let mut fetched = Ok(());
    if let Some(resv) = ctx.as_mut() {
        if !mem.user_pages_current(&inner) {
            fetched = match process.host() {
                Some(host) => resv.reacquire_after_host_fault(
                    mem,
                    &mut inner,
                    host,
                    mm,
                    config.host_fault_retries,
                ),
                None => Err(KfdMemError::HostFault("no host page source".into())),
            };

            if inner.evicted_bos != 1 {
                // Evicted again while the lock was dropped; that eviction owns the state now.
                return;
            }
        }
    }
    if let Err(e) = fetched {
        log::error!("{}: cannot fault in host pages: {e}", mem.id);
        ctx = None;
    }

    let mut vms: Vec<Arc<ProcessVm>> = Vec::new();
    for entry in inner.bo_va_list.iter().filter(|e| e.is_mapped) {
        if !vms.iter().any(|vm| vm.id == entry.vm.id) {
            vms.push(entry.vm.clone());
        }
    }

    for vm in &vms {
        let restored = if ctx.is_some() {
            restore_vm(mem, &inner, vm)
        } else {
            Err(KfdMemError::ResourceExhausted)
        };

        if let Err(e) = restored {
            log::error!(
                "{}: could not restore mapping in {}, leaving it unmapped: {e}",
                mem.id,
                vm.id
            );
            for entry in inner.bo_va_list.iter_mut().filter(|e| e.vm.id == vm.id) {
                entry.is_mapped = false;
                entry.map_failed = true;
            }
            inner.mapped_to_gpu_memory = inner.mapped_to_gpu_memory.saturating_sub(1);
        }
    }

    let mut quiesced: Vec<Arc<ProcessVm>> = Vec::new();
    for entry in inner.bo_va_list.iter_mut().filter(|e| e.quiesced) {
        entry.quiesced = false;
        if !quiesced.iter().any(|vm| vm.id == entry.vm.id) {
            quiesced.push(entry.vm.clone());
        }
    }
    let evict_quiesce = inner.evict_quiesce.take();

    inner.evicted_bos = 0;
    inner.restore_mm = None;
    drop(inner);

    if let Some(ctx) = ctx {
        if let Err(e) = ctx.release(config.wait_idle_after_map) {
            log::warn!("{}: restore did not settle: {e}", mem.id);
        }
    }

    if let Some(evict_mm) = evict_quiesce {
        mem.resume_evict_quiesce(evict_mm);
    }
    for vm in &quiesced {
        if let Err(e) = vm.device().scheduler().resume_process(mm) {
            log::warn!("{}: failed to resume {mm} on {}: {e}", mem.id, vm.id);
        }
    }
    log::debug!("{}: restored", mem.id);
}

/// Maps every wanted record of `vm` again, unwinding this VM's mappings on failure.
fn restore_vm(mem: &KgdMem, inner: &KgdMemInner, vm: &ProcessVm) -> KfdMemResult<()> {
    let vas: Vec<u64> = inner
        .bo_va_list
        .iter()
        .filter(|e| e.vm.id == vm.id && e.is_mapped)
        .map(|e| e.va)
        .collect();

    for (i, &va) in vas.iter().enumerate() {
        if let Err(e) = mem.map_entry(vm, va) {
            for &mapped in vas[..i].iter().rev() {
                mem.unmap_entry(vm, mapped);
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Drops a queued restore and waits for a running one to finish.
///
/// Must be called without the allocation lock held.
pub fn cancel_restore(mem: &KgdMem) -> bool {
    mem.restore_work.cancel_sync()
}

/// Waits until no restore of `mem` is queued or running.
pub fn flush_restore(mem: &KgdMem) {
    mem.restore_work.flush();
}
