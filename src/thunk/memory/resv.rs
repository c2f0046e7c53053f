//! Multi-object reservation.
//!
//! Buffer objects are locked through a wound-wait class: every acquire context draws a stamp,
//! an older context that finds an object held by a younger one wounds it and waits, and a
//! wounded context backs off (drops everything, sleeps on the contended object) at its next
//! lock attempt. A context keeps its stamp across retries, so it eventually becomes the oldest
//! and the class as a whole cannot deadlock.

use crate::error::{KfdMemError, KfdMemResult};
use crate::kfd::bo::BoId;
use crate::kfd::device::KfdDevice;
use crate::kfd::host::{HostPageSource, MmId};
use crate::thunk::memory::mem::{BoVaEntry, KgdMem, KgdMemInner};
use crate::thunk::memory::vm::VmId;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// The reservation class shared by every buffer object.
pub static RESERVATION_WW_CLASS: WwClass = WwClass::new();

#[derive(Debug)]
struct Ticket {
    stamp: u64,
    wounded: AtomicBool,
}

/// A wound-wait lock class: ownership of every object in the class.
#[derive(Debug)]
pub struct WwClass {
    owners: Mutex<BTreeMap<BoId, Arc<Ticket>>>,
    cond: Condvar,
    stamp: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockError {
    /// Already held by this context.
    Already,
    /// This context was wounded and must drop its locks, then sleep on the given object.
    Backoff(BoId),
}

impl WwClass {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            owners: Mutex::new(BTreeMap::new()),
            cond: Condvar::new(),
            stamp: AtomicU64::new(1),
        }
    }

    /// Whether `bo` is currently reserved by anyone.
    #[must_use]
    pub fn is_locked(&self, bo: BoId) -> bool {
        self.owners.lock().contains_key(&bo)
    }
}

impl Default for WwClass {
    fn default() -> Self {
        Self::new()
    }
}

/// One acquire transaction against a [`WwClass`].
#[derive(Debug)]
pub struct WwAcquireCtx<'a> {
    class: &'a WwClass,
    ticket: Arc<Ticket>,
    held: Vec<BoId>,
}

impl<'a> WwAcquireCtx<'a> {
    #[must_use]
    pub fn new(class: &'a WwClass) -> Self {
        Self {
            class,
            ticket: Arc::new(Ticket {
                stamp: class.stamp.fetch_add(1, Ordering::Relaxed),
                wounded: AtomicBool::new(false),
            }),
            held: Vec::new(),
        }
    }

    #[must_use]
    pub fn held(&self) -> &[BoId] {
        &self.held
    }

    fn lock(&mut self, bo: BoId) -> Result<(), LockError> {
        let mut owners = self.class.owners.lock();
        loop {
            // A wounded context only has to yield if it holds something an older one may need.
            if !self.held.is_empty() && self.ticket.wounded.load(Ordering::Acquire) {
                return Err(LockError::Backoff(bo));
            }

            match owners.get(&bo) {
                None => {
                    owners.insert(bo, self.ticket.clone());
                    self.held.push(bo);
                    return Ok(());
                }
                Some(owner) if Arc::ptr_eq(owner, &self.ticket) => {
                    return Err(LockError::Already);
                }
                Some(owner) => {
                    if owner.stamp > self.ticket.stamp
                        && !owner.wounded.swap(true, Ordering::AcqRel)
                    {
                        log::trace!(
                            "ww: stamp {} wounds stamp {} over {bo}",
                            self.ticket.stamp,
                            owner.stamp
                        );
                        self.class.cond.notify_all();
                    }
                    self.class.cond.wait(&mut owners);
                }
            }
        }
    }

    /// Sleeps until `bo` is free and takes it. Only called with nothing held.
    fn lock_slow(&mut self, bo: BoId) {
        debug_assert!(self.held.is_empty());
        self.ticket.wounded.store(false, Ordering::Release);

        let mut owners = self.class.owners.lock();
        while owners.contains_key(&bo) {
            self.class.cond.wait(&mut owners);
        }
        owners.insert(bo, self.ticket.clone());
        self.held.push(bo);
    }

    /// Locks every object in `objects`, backing off and retrying on wounds.
    pub fn lock_all(&mut self, objects: &[BoId]) {
        loop {
            let mut contended = None;
            for &bo in objects {
                match self.lock(bo) {
                    Ok(()) | Err(LockError::Already) => {}
                    Err(LockError::Backoff(at)) => {
                        contended = Some(at);
                        break;
                    }
                }
            }

            let Some(contended) = contended else {
                return;
            };

            log::debug!(
                "ww: stamp {} backing off on {contended}",
                self.ticket.stamp
            );
            self.unlock_all();
            self.lock_slow(contended);
        }
    }

    /// Releases every held object in reverse acquisition order.
    pub fn unlock_all(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let mut owners = self.class.owners.lock();
        while let Some(bo) = self.held.pop() {
            owners.remove(&bo);
        }
        drop(owners);
        self.class.cond.notify_all();
    }
}

impl Drop for WwAcquireCtx<'_> {
    fn drop(&mut self) {
        self.unlock_all();
    }
}

/// Which VMs' page directories an acquisition covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmFilter {
    All,
    Only(VmId),
}

/// Which mapping records an acquisition covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedFilter {
    Mapped,
    Unmapped,
}

impl VmFilter {
    fn matches(self, entry: &BoVaEntry) -> bool {
        match self {
            Self::All => true,
            Self::Only(id) => entry.vm.id == id,
        }
    }
}

impl MappedFilter {
    fn matches(self, entry: &BoVaEntry) -> bool {
        match self {
            Self::Mapped => entry.is_mapped,
            Self::Unmapped => !entry.is_mapped,
        }
    }
}

/// The lock set guarding a page-table update of one allocation: its buffer plus the page
/// directory of every matching VM.
#[derive(Debug)]
pub struct ReservationContext {
    ticket: WwAcquireCtx<'static>,
    objects: Vec<(BoId, KfdDevice)>,
    reserved: bool,
}

impl ReservationContext {
    /// Reserves `mem`'s buffer and the page directories of the mappings matching the filters.
    pub fn acquire(
        mem: &KgdMem,
        entries: &[BoVaEntry],
        vm: VmFilter,
        mapped: MappedFilter,
    ) -> KfdMemResult<Self> {
        let selected: Vec<&BoVaEntry> = entries
            .iter()
            .filter(|e| vm.matches(e) && mapped.matches(e))
            .collect();

        let mut objects = Vec::new();
        objects
            .try_reserve_exact(selected.len() + 1)
            .map_err(|_| KfdMemError::ResourceExhausted)?;

        objects.push((mem.bo, mem.device().clone()));
        for entry in selected {
            let pd = entry.vm.pd();
            if !objects.iter().any(|(bo, _)| *bo == pd) {
                objects.push((pd, entry.vm.device().clone()));
            }
        }

        let mut ctx = Self {
            ticket: WwAcquireCtx::new(&RESERVATION_WW_CLASS),
            objects,
            reserved: false,
        };
        ctx.reserve();
        Ok(ctx)
    }

    fn reserve(&mut self) {
        let list: Vec<BoId> = self.objects.iter().map(|(bo, _)| *bo).collect();
        self.ticket.lock_all(&list);
        self.reserved = true;
    }

    fn unreserve(&mut self) {
        self.ticket.unlock_all();
        self.reserved = false;
    }

    /// Drops the reservation, optionally waiting for all reserved objects to go idle first.
    ///
    /// Idle-wait failures are reported after the locks are dropped.
    pub fn release(mut self, wait_for_idle: bool) -> KfdMemResult<()> {
        let mut result = Ok(());
        if wait_for_idle && self.reserved {
            for (bo, device) in &self.objects {
                if let Err(e) = device.allocator().wait_idle(*bo) {
                    log::warn!("Waiting for {bo} to go idle failed: {e}");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        self.unreserve();
        result
    }

    /// Refreshes the host pages of a userptr allocation.
    ///
    /// Faulting host pages can re-enter the userptr notifier, which takes the allocation lock,
    /// so both the reservation and `guard` are dropped around the fault. After reacquiring,
    /// the fetch is retried if the pages were invalidated again in the meantime.
    pub fn reacquire_after_host_fault(
        &mut self,
        mem: &KgdMem,
        guard: &mut MutexGuard<'_, KgdMemInner>,
        host: &dyn HostPageSource,
        mm: MmId,
        retries: u32,
    ) -> KfdMemResult<()> {
        let Some(addr) = mem.userptr_addr() else {
            return Ok(());
        };
        let npages = mem.npages();

        for attempt in 0..=retries {
            self.unreserve();

            let (seq, pages) = MutexGuard::unlocked(guard, || {
                let seq = mem.invalidate_seq();
                (seq, host.get_user_pages(mm, addr, npages))
            });

            let pages = pages?;
            self.reserve();

            if mem.invalidate_seq() == seq {
                mem.device().allocator().set_user_pages(mem.bo, &pages)?;
                guard.user_pages_seq = seq;
                guard.user_pages_valid = true;
                return Ok(());
            }

            log::debug!(
                "{}: host pages changed during fault (attempt {attempt}), retrying",
                mem.bo
            );
        }

        log::warn!("{}: giving up on host pages after {retries} retries", mem.bo);
        Err(KfdMemError::DeadlockAvoided)
    }
}

impl Drop for ReservationContext {
    fn drop(&mut self) {
        if self.reserved {
            self.unreserve();
        }
    }
}
