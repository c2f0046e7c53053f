use crate::error::KfdMemResult;
use std::fmt;

/// Identity of a host address space. Only ever compared, never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MmId(pub u64);

impl fmt::Display for MmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mm#{:x}", self.0)
    }
}

/// Faults in host pages backing a userptr allocation.
///
/// Faulting may re-enter the userptr notifier of the same address space, so callers must not
/// hold allocation or reservation locks across `get_user_pages`.
pub trait HostPageSource: Send + Sync {
    /// Fault in `npages` pages starting at `start` and return their frame numbers.
    fn get_user_pages(&self, mm: MmId, start: u64, npages: u64) -> KfdMemResult<Vec<u64>>;
}
