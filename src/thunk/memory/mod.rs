pub mod aperture;
pub mod eviction;
pub mod manager;
pub mod mem;
pub mod process;
pub mod restore;
pub mod resv;
pub mod userptr;
pub mod vm;

use crate::error::{KfdMemError, KfdMemResult};
use crate::kfd::bo::BoDomain;
use crate::kfd::ioctl::{
    KFD_IOC_ALLOC_MEM_FLAGS_AQL_QUEUE_MEM, KFD_IOC_ALLOC_MEM_FLAGS_COHERENT,
    KFD_IOC_ALLOC_MEM_FLAGS_CONTIGUOUS_BEST_EFFORT, KFD_IOC_ALLOC_MEM_FLAGS_DOORBELL,
    KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE, KFD_IOC_ALLOC_MEM_FLAGS_EXT_COHERENT,
    KFD_IOC_ALLOC_MEM_FLAGS_GTT, KFD_IOC_ALLOC_MEM_FLAGS_MMIO_REMAP,
    KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE, KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC,
    KFD_IOC_ALLOC_MEM_FLAGS_UNCACHED, KFD_IOC_ALLOC_MEM_FLAGS_USERPTR,
    KFD_IOC_ALLOC_MEM_FLAGS_VRAM, KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE,
};

/// Where the memory of an allocation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemDomain {
    /// VRAM.
    DeviceLocal,
    /// System memory owned by the driver and mapped through the GART.
    DeviceShared,
    /// Pages of the host process itself (userptr).
    HostPinned,
}

impl MemDomain {
    /// Domain the backing buffer is validated and pinned into.
    #[must_use]
    pub const fn bo_domain(self) -> BoDomain {
        match self {
            Self::DeviceLocal => BoDomain::Vram,
            Self::DeviceShared | Self::HostPinned => BoDomain::Gtt,
        }
    }

    const fn ioctl_flag(self) -> u32 {
        match self {
            Self::DeviceLocal => KFD_IOC_ALLOC_MEM_FLAGS_VRAM,
            Self::DeviceShared => KFD_IOC_ALLOC_MEM_FLAGS_GTT,
            Self::HostPinned => KFD_IOC_ALLOC_MEM_FLAGS_USERPTR,
        }
    }
}

/// Flags controlling allocation behavior (maps to the KFD allocation flag word).
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocFlags {
    pub host_access: bool,
    pub read_only: bool,
    pub execute_access: bool,
    pub coherent: bool,
    pub uncached: bool,
    pub extended_coherent: bool,
    pub aql_queue_mem: bool,
    pub no_substitute: bool,
    pub contiguous: bool,
    pub doorbell: bool,
    pub mmio_remap: bool,
}

impl AllocFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn host_access(mut self) -> Self {
        self.host_access = true;
        self
    }

    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[must_use]
    pub const fn executable(mut self) -> Self {
        self.execute_access = true;
        self
    }

    #[must_use]
    pub const fn coherent(mut self) -> Self {
        self.coherent = true;
        self
    }

    #[must_use]
    pub const fn uncached(mut self) -> Self {
        self.uncached = true;
        self
    }

    #[must_use]
    pub const fn aql_queue_mem(mut self) -> Self {
        self.aql_queue_mem = true;
        self
    }

    #[must_use]
    pub const fn no_substitute(mut self) -> Self {
        self.no_substitute = true;
        self
    }

    #[must_use]
    pub const fn contiguous(mut self) -> Self {
        self.contiguous = true;
        self
    }

    #[must_use]
    pub const fn doorbell(mut self) -> Self {
        self.doorbell = true;
        self
    }

    #[must_use]
    pub const fn mmio_remap(mut self) -> Self {
        self.mmio_remap = true;
        self
    }

    /// Rejects flag combinations the allocator cannot honor for `domain`.
    pub fn validate(&self, domain: MemDomain) -> KfdMemResult<()> {
        let kernel_mapped = self.doorbell || self.mmio_remap;

        if domain == MemDomain::HostPinned && kernel_mapped {
            return Err(KfdMemError::InvalidArgument(
                "host-pinned memory cannot be kernel mapped".into(),
            ));
        }
        if self.doorbell && self.mmio_remap {
            return Err(KfdMemError::InvalidArgument(
                "doorbell and MMIO remap are exclusive".into(),
            ));
        }
        if self.no_substitute && domain != MemDomain::DeviceLocal {
            return Err(KfdMemError::InvalidArgument(
                "no-substitute only applies to device-local memory".into(),
            ));
        }
        if self.extended_coherent && !self.coherent {
            return Err(KfdMemError::InvalidArgument(
                "extended coherence requires coherence".into(),
            ));
        }
        Ok(())
    }

    /// Converts high-level flags into the raw flag word passed down to the allocator.
    #[must_use]
    pub const fn to_kfd_ioctl_flags(self, domain: MemDomain) -> u32 {
        let mut ioc_flags = domain.ioctl_flag();

        if self.no_substitute {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE;
        }
        if self.doorbell {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_DOORBELL;
        }
        if self.mmio_remap {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_MMIO_REMAP;
        }
        if self.host_access {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC;
        }
        // WRITABLE is needed unless ReadOnly is explicit.
        if !self.read_only {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE;
        }
        if self.execute_access {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE;
        }
        if self.coherent {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_COHERENT;
        }
        if self.uncached {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_UNCACHED;
        }
        if self.extended_coherent {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_EXT_COHERENT;
        }
        if self.aql_queue_mem {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_AQL_QUEUE_MEM;
        }
        if self.contiguous {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_CONTIGUOUS_BEST_EFFORT;
        }

        ioc_flags
    }
}

// Re-export the main manager for easy access
pub use manager::MemoryManager;
pub use mem::{BoVaEntry, KgdMem};
