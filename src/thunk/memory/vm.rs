use crate::error::{KfdMemError, KfdMemResult};
use crate::kfd::bo::{BoCreateInfo, BoDomain, BoId, BoKind};
use crate::kfd::device::KfdDevice;
use crate::kfd::host::MmId;
use crate::thunk::memory::aperture::Aperture;
use crate::utils::{GPU_PAGE_SIZE, next_id, pt_indices};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// Constants from the GFX9+ GPUVM layout
const GPUVM_BASE: u64 = GPU_PAGE_SIZE;
const GPUVM_LIMIT: u64 = (1 << 47) - 1; // 47-bit VA limit
const PD_SIZE: u64 = 4096;
const PT_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmId(pub u64);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm#{}", self.0)
    }
}

/// One entry of the page table image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwMapping {
    pub bo: BoId,
    pub size: u64,
    /// Device address the BO was pinned at when the mapping was programmed.
    pub backing: u64,
}

#[derive(Debug)]
struct VmInner {
    aperture: Aperture,
    /// Page-table BOs, one per 2 MiB of VA, created on first use.
    page_tables: BTreeMap<u64, BoId>,
    /// What the device page tables currently translate: start VA -> mapping.
    ptes: BTreeMap<u64, HwMapping>,
    destroyed: bool,
}

/// The GPU virtual address space of one process on one device.
///
/// The VM refers back to its process by `mm` only; the process registry owns the VM.
pub struct ProcessVm {
    pub id: VmId,
    mm: MmId,
    device: KfdDevice,
    pd: BoId,
    inner: Mutex<VmInner>,
}

impl fmt::Debug for ProcessVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessVm")
            .field("id", &self.id)
            .field("mm", &self.mm)
            .field("gpu_id", &self.device.gpu_id)
            .field("pd", &self.pd)
            .finish_non_exhaustive()
    }
}

impl ProcessVm {
    /// Creates the VM and its page directory.
    pub fn new(device: &KfdDevice, mm: MmId) -> KfdMemResult<Arc<Self>> {
        device.check_ready()?;

        let pd = device.allocator().create_bo(&BoCreateInfo {
            size: PD_SIZE,
            domain: BoDomain::Vram,
            flags: 0,
            kind: BoKind::PageDirectory,
            userptr: None,
        })?;

        Ok(Arc::new(Self {
            id: VmId(next_id()),
            mm,
            device: device.clone(),
            pd,
            inner: Mutex::new(VmInner {
                aperture: Aperture::new(GPUVM_BASE, GPUVM_LIMIT),
                page_tables: BTreeMap::new(),
                ptes: BTreeMap::new(),
                destroyed: false,
            }),
        }))
    }

    #[must_use]
    pub const fn mm(&self) -> MmId {
        self.mm
    }

    #[must_use]
    pub const fn device(&self) -> &KfdDevice {
        &self.device
    }

    #[must_use]
    pub const fn pd(&self) -> BoId {
        self.pd
    }

    /// Claims `[va, va + size)` in this VM for allocation `owner`.
    pub fn reserve_va(&self, va: u64, size: u64, owner: u64) -> KfdMemResult<()> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(KfdMemError::InvalidArgument(format!("{} is torn down", self.id)));
        }
        inner.aperture.reserve(va, size, owner)
    }

    pub fn release_va(&self, va: u64, owner: u64) {
        self.inner.lock().aperture.release(va, owner);
    }

    /// Page-table BOs covering `[va, va + size)`, creating missing ones.
    fn page_tables_for(&self, va: u64, size: u64) -> KfdMemResult<Vec<BoId>> {
        let (first, last) = pt_indices(va, size);
        let mut inner = self.inner.lock();
        let mut pts = Vec::new();

        for idx in first..=last {
            if let Some(&pt) = inner.page_tables.get(&idx) {
                pts.push(pt);
                continue;
            }
            let pt = self.device.allocator().create_bo(&BoCreateInfo {
                size: PT_SIZE,
                domain: BoDomain::Vram,
                flags: 0,
                kind: BoKind::PageTable,
                userptr: None,
            })?;
            inner.page_tables.insert(idx, pt);
            pts.push(pt);
        }
        Ok(pts)
    }

    /// Pins the page directory and every page table covering the range.
    ///
    /// On failure everything pinned by this call is unpinned again.
    pub fn pin_pd_pts(&self, va: u64, size: u64) -> KfdMemResult<()> {
        let allocator = self.device.allocator();
        let pts = self.page_tables_for(va, size)?;

        allocator.pin(self.pd, BoDomain::Vram)?;
        for (i, &pt) in pts.iter().enumerate() {
            if let Err(e) = allocator.pin(pt, BoDomain::Vram) {
                log::warn!("{}: failed to pin page table {pt}: {e}", self.id);
                for &pinned in pts[..i].iter().rev() {
                    allocator.unpin(pinned);
                }
                allocator.unpin(self.pd);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Undoes `pin_pd_pts` for the same range.
    pub fn unpin_pd_pts(&self, va: u64, size: u64) {
        let allocator = self.device.allocator();
        let (first, last) = pt_indices(va, size);
        let pts: Vec<BoId> = {
            let inner = self.inner.lock();
            (first..=last)
                .filter_map(|idx| inner.page_tables.get(&idx).copied())
                .collect()
        };

        for &pt in pts.iter().rev() {
            allocator.unpin(pt);
        }
        allocator.unpin(self.pd);
    }

    /// Writes the translation for `[va, va + size)` to `bo` into the page tables.
    ///
    /// The caller holds the page directory reservation.
    pub fn map_range(&self, va: u64, size: u64, bo: BoId, backing: u64) -> KfdMemResult<()> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(KfdMemError::InvalidArgument(format!("{} is torn down", self.id)));
        }
        inner.ptes.insert(va, HwMapping { bo, size, backing });
        Ok(())
    }

    /// Clears the translation starting at `va`. Returns the removed mapping, if any.
    pub fn unmap_range(&self, va: u64) -> Option<HwMapping> {
        self.inner.lock().ptes.remove(&va)
    }

    /// Whether the device page tables currently translate `va`.
    #[must_use]
    pub fn is_mapped_in_hw(&self, va: u64) -> bool {
        self.hw_mapping(va).is_some()
    }

    #[must_use]
    pub fn hw_mapping(&self, va: u64) -> Option<HwMapping> {
        let inner = self.inner.lock();
        inner
            .ptes
            .range(..=va)
            .next_back()
            .filter(|(start, m)| va < *start + m.size)
            .map(|(_, m)| *m)
    }

    #[must_use]
    pub fn hw_mapping_count(&self) -> usize {
        self.inner.lock().ptes.len()
    }

    #[must_use]
    pub fn page_tables(&self) -> Vec<BoId> {
        self.inner.lock().page_tables.values().copied().collect()
    }

    /// Releases the page directory and page tables. Remaining translations are dropped.
    pub fn destroy(&self) {
        let pts = {
            let mut inner = self.inner.lock();
            if std::mem::replace(&mut inner.destroyed, true) {
                return;
            }
            if !inner.ptes.is_empty() {
                log::warn!(
                    "{}: destroyed with {} live mappings",
                    self.id,
                    inner.ptes.len()
                );
                inner.ptes.clear();
            }
            std::mem::take(&mut inner.page_tables)
        };

        let allocator = self.device.allocator();
        for pt in pts.into_values().rev() {
            allocator.release_bo(pt);
        }
        allocator.release_bo(self.pd);
    }
}
