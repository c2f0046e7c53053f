//! Host-memory-change notifier for userptr buffers.
//!
//! Buffers backed by host memory are indexed by host address range, per address space and
//! per kind. When the host is about to change a range, every overlapping compute buffer is
//! evicted; when the change is finished, a restore is scheduled after a short delay so a burst
//! of per-page invalidations collapses into one restore pass.

use crate::error::{KfdMemError, KfdMemResult};
use crate::kfd::bo::{BoDomain, BoId};
use crate::kfd::device::KfdDevice;
use crate::kfd::host::MmId;
use crate::thunk::memory::mem::{KgdMem, MemId};
use crate::thunk::memory::restore::{evict_mem, schedule_restore_mem};
use crate::utils::ranges_overlap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Which invalidation policy a registration gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MnKind {
    /// Ordinary graphics buffers: wait for idle and move out of device-visible memory.
    Gfx,
    /// Compute buffers: evict and restore through the allocation state machine.
    Hsa,
}

#[derive(Debug)]
struct RangeNode<T> {
    last: u64,
    items: Vec<(u64, u64, T)>,
}

/// Non-overlapping, coalesced host address intervals, each holding the registrations that
/// fall inside it. Bounds are inclusive.
#[derive(Debug)]
struct RangeIndex<T> {
    nodes: BTreeMap<u64, RangeNode<T>>,
}

impl<T> Default for RangeIndex<T> {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }
}

impl<T> RangeIndex<T> {
    /// Start keys of the nodes intersecting `[start, last]`.
    fn overlapping_keys(&self, start: u64, last: u64) -> Vec<u64> {
        // Nodes are disjoint and sorted, so their ends are sorted as well.
        let mut keys: Vec<u64> = self
            .nodes
            .range(..=last)
            .rev()
            .take_while(|(_, node)| node.last >= start)
            .map(|(&k, _)| k)
            .collect();
        keys.reverse();
        keys
    }

    fn insert(&mut self, start: u64, last: u64, item: T) {
        let mut node_start = start;
        let mut node_last = last;
        let mut items = Vec::new();

        for key in self.overlapping_keys(start, last) {
            if let Some(node) = self.nodes.remove(&key) {
                node_start = node_start.min(key);
                node_last = node_last.max(node.last);
                items.extend(node.items);
            }
        }
        items.push((start, last, item));

        self.nodes.insert(
            node_start,
            RangeNode {
                last: node_last,
                items,
            },
        );
    }

    /// Removes the first registration matching `pred`, dropping its node once empty.
    fn remove(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let (key, pos) = self.nodes.iter().find_map(|(&key, node)| {
            node.items
                .iter()
                .position(|(_, _, item)| pred(item))
                .map(|pos| (key, pos))
        })?;

        let node = self.nodes.get_mut(&key)?;
        let (_, _, item) = node.items.remove(pos);
        if node.items.is_empty() {
            self.nodes.remove(&key);
        }
        Some(item)
    }

    /// Registrations whose own range intersects `[start, last]`.
    fn matching(&self, start: u64, last: u64) -> impl Iterator<Item = &T> {
        self.overlapping_keys(start, last)
            .into_iter()
            .filter_map(move |key| self.nodes.get(&key))
            .flat_map(|node| node.items.iter())
            .filter(move |(s, l, _)| ranges_overlap(*s, *l, start, last))
            .map(|(_, _, item)| item)
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone)]
enum MnEntry {
    Hsa { id: MemId, mem: Weak<KgdMem> },
    Gfx { bo: BoId, device: KfdDevice },
}

/// Invalidation work collected under the registry lock and run after dropping it.
enum Pending {
    Hsa(Arc<KgdMem>),
    Gfx(BoId, KfdDevice),
}

/// The host-memory-change notifier shared by every process of a memory manager.
#[derive(Debug)]
pub struct UserptrNotifier {
    registries: Mutex<HashMap<(MmId, MnKind), RangeIndex<MnEntry>>>,
    restore_delay: Duration,
}

impl UserptrNotifier {
    #[must_use]
    pub fn new(restore_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            registries: Mutex::new(HashMap::new()),
            restore_delay,
        })
    }

    fn register(
        &self,
        mm: MmId,
        kind: MnKind,
        start: u64,
        size: u64,
        entry: MnEntry,
    ) -> KfdMemResult<()> {
        let last = start.checked_add(size.max(1) - 1).ok_or_else(|| {
            KfdMemError::InvalidArgument(format!(
                "host range 0x{start:x}+0x{size:x} wraps the address space"
            ))
        })?;
        self.registries
            .lock()
            .entry((mm, kind))
            .or_default()
            .insert(start, last, entry);
        Ok(())
    }

    fn unregister(&self, mm: MmId, kind: MnKind, pred: impl FnMut(&MnEntry) -> bool) -> bool {
        let mut registries = self.registries.lock();
        let Some(index) = registries.get_mut(&(mm, kind)) else {
            return false;
        };
        let removed = index.remove(pred).is_some();
        if index.is_empty() {
            registries.remove(&(mm, kind));
        }
        removed
    }

    /// Registers a compute userptr allocation for the host range backing it.
    pub fn register_hsa(&self, mm: MmId, mem: &Arc<KgdMem>) -> KfdMemResult<()> {
        let Some(start) = mem.userptr_addr() else {
            return Ok(());
        };
        let entry = MnEntry::Hsa {
            id: mem.id,
            mem: Arc::downgrade(mem),
        };
        self.register(mm, MnKind::Hsa, start, mem.size, entry)
    }

    /// Registers an ordinary graphics buffer backed by `[start, start + size)`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the range runs past the end of the address space.
    pub fn register_gfx(
        &self,
        mm: MmId,
        bo: BoId,
        device: &KfdDevice,
        start: u64,
        size: u64,
    ) -> KfdMemResult<()> {
        let entry = MnEntry::Gfx {
            bo,
            device: device.clone(),
        };
        self.register(mm, MnKind::Gfx, start, size, entry)
    }

    pub fn unregister_hsa(&self, mm: MmId, id: MemId) -> bool {
        self.unregister(mm, MnKind::Hsa, |e| {
            matches!(e, MnEntry::Hsa { id: i, .. } if *i == id)
        })
    }

    pub fn unregister_gfx(&self, mm: MmId, bo: BoId) -> bool {
        self.unregister(mm, MnKind::Gfx, |e| {
            matches!(e, MnEntry::Gfx { bo: b, .. } if *b == bo)
        })
    }

    fn collect(&self, mm: MmId, start: u64, end: u64, kinds: &[MnKind]) -> Vec<Pending> {
        if end <= start {
            return Vec::new();
        }
        let last = end - 1;
        let registries = self.registries.lock();

        let mut pending = Vec::new();
        for kind in kinds {
            let Some(index) = registries.get(&(mm, *kind)) else {
                continue;
            };
            for entry in index.matching(start, last) {
                match entry {
                    MnEntry::Hsa { mem, .. } => {
                        if let Some(mem) = mem.upgrade() {
                            pending.push(Pending::Hsa(mem));
                        }
                    }
                    MnEntry::Gfx { bo, device } => {
                        pending.push(Pending::Gfx(*bo, device.clone()));
                    }
                }
            }
        }
        pending
    }

    /// The host is about to change `[start, end)` of `mm`.
    pub fn invalidate_range_start(&self, mm: MmId, start: u64, end: u64) {
        for work in self.collect(mm, start, end, &[MnKind::Gfx, MnKind::Hsa]) {
            match work {
                Pending::Hsa(mem) => {
                    mem.bump_invalidate_seq();
                    if let Err(e) = evict_mem(&mem, mm) {
                        log::error!("{}: userptr eviction failed: {e}", mem.id);
                    }
                }
                Pending::Gfx(bo, device) => {
                    let allocator = device.allocator();
                    if let Err(e) = allocator.wait_idle(bo) {
                        log::warn!("{bo}: wait for idle before invalidation failed: {e}");
                    }
                    if let Err(e) = allocator.validate(bo, BoDomain::Cpu) {
                        log::error!("{bo}: failed to move out of device memory: {e}");
                    }
                }
            }
        }
    }

    /// The host has finished changing `[start, end)` of `mm`.
    pub fn invalidate_range_end(&self, mm: MmId, start: u64, end: u64) {
        for work in self.collect(mm, start, end, &[MnKind::Hsa]) {
            if let Pending::Hsa(mem) = work {
                if let Err(e) = schedule_restore_mem(&mem, mm, self.restore_delay) {
                    log::debug!("{}: no restore after invalidation: {e}", mem.id);
                }
            }
        }
    }

    /// Number of interval nodes registered for `(mm, kind)`.
    #[must_use]
    pub fn node_count(&self, mm: MmId, kind: MnKind) -> usize {
        self.registries
            .lock()
            .get(&(mm, kind))
            .map_or(0, RangeIndex::len)
    }
}
