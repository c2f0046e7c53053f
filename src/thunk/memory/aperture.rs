use crate::error::{KfdMemError, KfdMemResult};
use crate::utils::{GPU_PAGE_SIZE, is_aligned};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reservation {
    size: u64,
    owner: u64,
}

/// The GPU virtual-address range of one VM and the sub-ranges currently mapped in it.
#[derive(Debug)]
pub struct Aperture {
    base: u64,
    limit: u64,

    // Tracks occupied ranges: Start Address -> (Size, owning allocation)
    ranges: BTreeMap<u64, Reservation>,
}

impl Aperture {
    #[must_use]
    pub fn new(base: u64, limit: u64) -> Self {
        Self {
            base,
            limit,
            ranges: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    /// Claims `[va, va + size)` for `owner`.
    ///
    /// Claiming the exact range an owner already holds is a no-op; any other overlap fails.
    pub fn reserve(&mut self, va: u64, size: u64, owner: u64) -> KfdMemResult<()> {
        if size == 0 || !is_aligned(va, GPU_PAGE_SIZE) || !is_aligned(size, GPU_PAGE_SIZE) {
            return Err(KfdMemError::InvalidArgument(format!(
                "unaligned range 0x{va:x}+0x{size:x}"
            )));
        }
        let Some(last) = va.checked_add(size - 1) else {
            return Err(KfdMemError::InvalidArgument("range wraps".into()));
        };
        if va < self.base || last > self.limit {
            return Err(KfdMemError::InvalidArgument(format!(
                "range 0x{va:x}..=0x{last:x} outside aperture 0x{:x}..=0x{:x}",
                self.base, self.limit
            )));
        }

        if let Some(existing) = self.ranges.get(&va) {
            if existing.size == size && existing.owner == owner {
                return Ok(());
            }
        }

        // The closest range starting at or below `last` is the only one that can overlap.
        if let Some((&start, r)) = self.ranges.range(..=last).next_back() {
            if start + r.size > va {
                return Err(KfdMemError::InvalidArgument(format!(
                    "range 0x{va:x}+0x{size:x} overlaps mapping at 0x{start:x}"
                )));
            }
        }

        self.ranges.insert(va, Reservation { size, owner });
        Ok(())
    }

    /// Releases a range claimed by `owner`. Returns `false` if it was not tracked.
    pub fn release(&mut self, va: u64, owner: u64) -> bool {
        match self.ranges.get(&va) {
            Some(r) if r.owner == owner => {
                self.ranges.remove(&va);
                true
            }
            _ => {
                log::warn!("Tried to release VA 0x{va:x} which was not tracked for {owner}");
                false
            }
        }
    }

    #[must_use]
    pub fn is_reserved(&self, va: u64) -> bool {
        self.ranges
            .range(..=va)
            .next_back()
            .is_some_and(|(&start, r)| va < start + r.size)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
