use crate::error::KfdMemResult;
use crate::thunk::memory::eviction::EvictionFence;
use std::fmt;
use std::sync::Arc;

/// Identity of a buffer object owned by the buffer allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoId(pub u64);

impl fmt::Display for BoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bo#{}", self.0)
    }
}

/// Placement a buffer object can be validated or pinned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoDomain {
    /// Not GPU accessible.
    Cpu,
    /// System memory reachable through the GART.
    Gtt,
    /// Device-local memory.
    Vram,
}

/// What a buffer object is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoKind {
    Data,
    PageDirectory,
    PageTable,
}

#[derive(Debug, Clone, Copy)]
pub struct BoCreateInfo {
    pub size: u64,
    pub domain: BoDomain,
    /// Raw `KFD_IOC_ALLOC_MEM_FLAGS_*` word.
    pub flags: u32,
    pub kind: BoKind,
    /// Host address backing a userptr buffer.
    pub userptr: Option<u64>,
}

/// The buffer/residency allocator this memory manager sits on.
///
/// The allocator owns placement and eviction-candidate policy; the memory manager only asks
/// it to create, pin, move and fence buffers.
pub trait BoAllocator: Send + Sync {
    /// Create a buffer object.
    fn create_bo(&self, info: &BoCreateInfo) -> KfdMemResult<BoId>;

    /// Drop the memory manager's reference to a buffer object.
    fn release_bo(&self, bo: BoId);

    /// Pin a buffer into `domain`, returning its device address. Pins nest.
    fn pin(&self, bo: BoId, domain: BoDomain) -> KfdMemResult<u64>;

    /// Undo one `pin`.
    fn unpin(&self, bo: BoId);

    /// Move a buffer into `domain` without pinning it.
    fn validate(&self, bo: BoId, domain: BoDomain) -> KfdMemResult<()>;

    /// Attach the process eviction fence, so the allocator must ask before reclaiming `bo`.
    fn attach_fence(&self, bo: BoId, fence: &Arc<EvictionFence>);

    /// Remove a previously attached eviction fence.
    fn detach_fence(&self, bo: BoId, fence: &Arc<EvictionFence>);

    /// Block until all outstanding GPU work on `bo` has completed.
    fn wait_idle(&self, bo: BoId) -> KfdMemResult<()>;

    /// Bind freshly faulted host pages to a userptr buffer.
    fn set_user_pages(&self, bo: BoId, pages: &[u64]) -> KfdMemResult<()>;
}
