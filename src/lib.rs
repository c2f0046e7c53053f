//! GPU memory residency for compute processes: allocation records, their per-VM mappings,
//! and the eviction/restore machinery that keeps user queues off memory the allocator has
//! reclaimed.

pub mod config;
pub mod error;
pub mod utils;

pub mod kfd {
    pub mod bo;
    pub mod device;
    pub mod host;
    pub mod ioctl;
    pub mod sched;
}

pub mod thunk {
    pub mod context;
    pub mod memory;
    pub mod signal;
    pub mod workqueue;
}

pub use config::MemConfig;
pub use error::{KfdMemError, KfdMemResult};
