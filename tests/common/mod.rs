#![allow(dead_code)]

use kfd_mem::config::MemConfig;
use kfd_mem::error::{KfdMemError, KfdMemResult};
use kfd_mem::kfd::bo::{BoAllocator, BoCreateInfo, BoDomain, BoId, BoKind};
use kfd_mem::kfd::device::KfdDevice;
use kfd_mem::kfd::host::{HostPageSource, MmId};
use kfd_mem::kfd::sched::QueueScheduler;
use kfd_mem::thunk::memory::{AllocFlags, KgdMem, MemDomain, MemoryManager};
use kfd_mem::thunk::memory::eviction::EvictionFence;
use kfd_mem::thunk::memory::vm::ProcessVm;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MockBo {
    pub info: BoCreateInfo,
    pub pins: u32,
    pub domain: BoDomain,
    pub fences: Vec<u64>,
    pub user_pages: Vec<u64>,
}

// Buffer ids are unique across allocators; the reservation lock class is global.
static NEXT_BO: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct AllocState {
    bos: HashMap<BoId, MockBo>,
    released: HashSet<BoId>,
    /// Successful pins left before the next one fails.
    pin_countdown: Option<u32>,
    broken: HashSet<BoId>,
    fail_create: Option<BoKind>,
    wait_idle_calls: u32,
}

/// Buffer allocator keeping per-BO pin counts, with failure injection.
#[derive(Debug, Default)]
pub struct MockAllocator {
    state: Mutex<AllocState>,
}

impl MockAllocator {
    /// The pin after the next `n` successful ones fails, once.
    pub fn fail_pin_after(&self, n: u32) {
        self.state.lock().pin_countdown = Some(n);
    }

    /// Every pin of `bo` fails until [`MockAllocator::heal`].
    pub fn break_bo(&self, bo: BoId) {
        self.state.lock().broken.insert(bo);
    }

    pub fn heal(&self, bo: BoId) {
        self.state.lock().broken.remove(&bo);
    }

    /// The next creation of a `kind` buffer fails.
    pub fn fail_next_create(&self, kind: BoKind) {
        self.state.lock().fail_create = Some(kind);
    }

    pub fn pin_count(&self, bo: BoId) -> u32 {
        self.state.lock().bos.get(&bo).map_or(0, |b| b.pins)
    }

    pub fn total_pins(&self) -> u32 {
        self.state.lock().bos.values().map(|b| b.pins).sum()
    }

    /// Pin count of every live buffer.
    pub fn pin_snapshot(&self) -> HashMap<BoId, u32> {
        self.state
            .lock()
            .bos
            .iter()
            .map(|(id, b)| (*id, b.pins))
            .collect()
    }

    pub fn bo(&self, bo: BoId) -> Option<MockBo> {
        self.state.lock().bos.get(&bo).cloned()
    }

    pub fn live_bos(&self) -> usize {
        self.state.lock().bos.len()
    }

    pub fn live_of_kind(&self, kind: BoKind) -> usize {
        self.state
            .lock()
            .bos
            .values()
            .filter(|b| b.info.kind == kind)
            .count()
    }

    pub fn is_released(&self, bo: BoId) -> bool {
        self.state.lock().released.contains(&bo)
    }

    pub fn wait_idle_calls(&self) -> u32 {
        self.state.lock().wait_idle_calls
    }
}

impl BoAllocator for MockAllocator {
    fn create_bo(&self, info: &BoCreateInfo) -> KfdMemResult<BoId> {
        let mut state = self.state.lock();
        if state.fail_create == Some(info.kind) {
            state.fail_create = None;
            return Err(KfdMemError::Allocator("injected create failure".into()));
        }
        let id = BoId(NEXT_BO.fetch_add(1, Ordering::Relaxed));
        state.bos.insert(
            id,
            MockBo {
                info: *info,
                pins: 0,
                domain: info.domain,
                fences: Vec::new(),
                user_pages: Vec::new(),
            },
        );
        Ok(id)
    }

    fn release_bo(&self, bo: BoId) {
        let mut state = self.state.lock();
        let removed = state.bos.remove(&bo);
        assert!(removed.is_some(), "{bo} released twice");
        assert_eq!(removed.map(|b| b.pins), Some(0), "{bo} released while pinned");
        state.released.insert(bo);
    }

    fn pin(&self, bo: BoId, domain: BoDomain) -> KfdMemResult<u64> {
        let mut state = self.state.lock();
        if state.broken.contains(&bo) {
            return Err(KfdMemError::Allocator(format!("{bo} cannot be pinned")));
        }
        if let Some(left) = state.pin_countdown {
            if left == 0 {
                state.pin_countdown = None;
                return Err(KfdMemError::Allocator("injected pin failure".into()));
            }
            state.pin_countdown = Some(left - 1);
        }
        let entry = state
            .bos
            .get_mut(&bo)
            .ok_or_else(|| KfdMemError::Allocator(format!("{bo} does not exist")))?;
        entry.pins += 1;
        entry.domain = domain;
        Ok(0x1_0000_0000 + bo.0 * 0x10_0000)
    }

    fn unpin(&self, bo: BoId) {
        let mut state = self.state.lock();
        let entry = state.bos.get_mut(&bo).expect("unpin of unknown bo");
        assert!(entry.pins > 0, "{bo} unpinned more often than pinned");
        entry.pins -= 1;
    }

    fn validate(&self, bo: BoId, domain: BoDomain) -> KfdMemResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .bos
            .get_mut(&bo)
            .ok_or_else(|| KfdMemError::Allocator(format!("{bo} does not exist")))?;
        entry.domain = domain;
        Ok(())
    }

    fn attach_fence(&self, bo: BoId, fence: &Arc<EvictionFence>) {
        if let Some(entry) = self.state.lock().bos.get_mut(&bo) {
            entry.fences.push(fence.context());
        }
    }

    fn detach_fence(&self, bo: BoId, fence: &Arc<EvictionFence>) {
        if let Some(entry) = self.state.lock().bos.get_mut(&bo) {
            entry.fences.retain(|&c| c != fence.context());
        }
    }

    fn wait_idle(&self, _bo: BoId) -> KfdMemResult<()> {
        self.state.lock().wait_idle_calls += 1;
        Ok(())
    }

    fn set_user_pages(&self, bo: BoId, pages: &[u64]) -> KfdMemResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .bos
            .get_mut(&bo)
            .ok_or_else(|| KfdMemError::Allocator(format!("{bo} does not exist")))?;
        entry.user_pages = pages.to_vec();
        Ok(())
    }
}

/// Queue scheduler recording what it was asked to do.
#[derive(Default)]
pub struct MockScheduler {
    quiesced: AtomicU32,
    resumed: AtomicU32,
    fail_quiesce: Mutex<bool>,
    evict_requests: Mutex<Vec<Arc<EvictionFence>>>,
}

impl MockScheduler {
    pub fn quiesce_calls(&self) -> u32 {
        self.quiesced.load(Ordering::SeqCst)
    }

    pub fn resume_calls(&self) -> u32 {
        self.resumed.load(Ordering::SeqCst)
    }

    pub fn set_fail_quiesce(&self, fail: bool) {
        *self.fail_quiesce.lock() = fail;
    }

    pub fn take_evict_requests(&self) -> Vec<Arc<EvictionFence>> {
        std::mem::take(&mut *self.evict_requests.lock())
    }
}

impl QueueScheduler for MockScheduler {
    fn quiesce_process(&self, _mm: MmId) -> KfdMemResult<()> {
        if *self.fail_quiesce.lock() {
            return Err(KfdMemError::Scheduler("injected quiesce failure".into()));
        }
        self.quiesced.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn resume_process(&self, _mm: MmId) -> KfdMemResult<()> {
        self.resumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn schedule_evict_and_restore(&self, _mm: MmId, fence: Arc<EvictionFence>) -> bool {
        self.evict_requests.lock().push(fence);
        true
    }
}

type FaultHook = Box<dyn FnOnce() + Send>;
type RepeatHook = Arc<dyn Fn() + Send + Sync>;

/// Host page source handing out predictable frame numbers.
#[derive(Default)]
pub struct MockHostPages {
    calls: AtomicU32,
    fail: Mutex<bool>,
    hook: Mutex<Option<FaultHook>>,
    every: Mutex<Option<RepeatHook>>,
}

impl MockHostPages {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    /// Runs `hook` inside the next fault, with no memory manager locks held.
    pub fn on_next_fault(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    /// Runs `hook` inside every fault until cleared.
    pub fn on_every_fault(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.every.lock() = Some(Arc::new(hook));
    }

    pub fn clear_every_fault(&self) {
        self.every.lock().take();
    }
}

impl HostPageSource for MockHostPages {
    fn get_user_pages(&self, _mm: MmId, start: u64, npages: u64) -> KfdMemResult<Vec<u64>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        let every = self.every.lock().clone();
        if let Some(every) = every {
            every();
        }
        if *self.fail.lock() {
            return Err(KfdMemError::HostFault("injected fault failure".into()));
        }
        Ok((0..npages)
            .map(|i| (start >> 12) + i + u64::from(call) * 0x1000)
            .collect())
    }
}

pub const GPU_ID: u32 = 0x1002;
pub const MM: MmId = MmId(0xdead_0000);

/// A manager over one mock device, with one VM opened for [`MM`].
pub struct Fixture {
    pub alloc: Arc<MockAllocator>,
    pub sched: Arc<MockScheduler>,
    pub host: Arc<MockHostPages>,
    pub device: KfdDevice,
    pub manager: MemoryManager,
    pub vm: Arc<ProcessVm>,
}

pub fn test_config() -> MemConfig {
    MemConfig {
        restore_delay: Duration::ZERO,
        userptr_restore_delay: Duration::ZERO,
        ..MemConfig::default()
    }
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: MemConfig) -> Self {
        let alloc = Arc::new(MockAllocator::default());
        let sched = Arc::new(MockScheduler::default());
        let host = Arc::new(MockHostPages::default());
        let device = KfdDevice::new(GPU_ID, alloc.clone(), sched.clone());
        let manager = MemoryManager::new(config, Some(host.clone()));
        let vm = manager.acquire_vm(MM, &device).expect("acquire vm");
        Self {
            alloc,
            sched,
            host,
            device,
            manager,
            vm,
        }
    }

    /// A second device with its own allocator, sharing the scheduler.
    pub fn second_device(&self) -> (Arc<MockAllocator>, KfdDevice) {
        let alloc = Arc::new(MockAllocator::default());
        let device = KfdDevice::new(GPU_ID + 1, alloc.clone(), self.sched.clone());
        (alloc, device)
    }
}

impl Fixture {
    pub fn alloc_vram(&self, va: u64, size: u64) -> Arc<KgdMem> {
        self.manager
            .allocate(&self.vm, va, size, MemDomain::DeviceLocal, AllocFlags::new(), None)
            .expect("allocate vram")
    }

    pub fn alloc_userptr(&self, va: u64, size: u64, host: u64) -> Arc<KgdMem> {
        self.manager
            .allocate(
                &self.vm,
                va,
                size,
                MemDomain::HostPinned,
                AllocFlags::new(),
                Some(host),
            )
            .expect("allocate userptr")
    }
}

/// Asserts every buffer pinned in `before` has the same pin count now, and that buffers
/// created since are unpinned.
pub fn assert_pins_restored(before: &HashMap<BoId, u32>, after: &HashMap<BoId, u32>) {
    for (bo, pins) in after {
        let expected = before.get(bo).copied().unwrap_or(0);
        assert_eq!(*pins, expected, "{bo} pin count changed");
    }
}
