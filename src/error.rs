use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KfdMemError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of GPU Memory")]
    OutOfMemory,

    #[error("Allocation is still mapped to a GPU")]
    StillMapped,

    #[error("Allocation is not mapped to the requested VM")]
    NotMapped,

    #[error("Restore requested without a matching eviction")]
    Unbalanced,

    #[error("Device has no compute context")]
    DeviceNotReady,

    #[error("Could not allocate the reservation lock set")]
    ResourceExhausted,

    #[error("Reservation retry budget exceeded")]
    DeadlockAvoided,

    #[error("Operation timed out")]
    WaitTimeout,

    #[error("Buffer allocator error: {0}")]
    Allocator(String),

    #[error("Queue scheduler error: {0}")]
    Scheduler(String),

    #[error("Host page fault failed: {0}")]
    HostFault(String),
}

impl KfdMemError {
    /// The negative errno the ioctl layer reports for this error.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        let errno = match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::OutOfMemory | Self::ResourceExhausted => libc::ENOMEM,
            Self::StillMapped => libc::EBUSY,
            Self::NotMapped => libc::ENOENT,
            Self::Unbalanced => libc::EINVAL,
            Self::DeviceNotReady => libc::ENODEV,
            Self::DeadlockAvoided => libc::EDEADLK,
            Self::WaitTimeout => libc::ETIME,
            Self::Allocator(_) | Self::Scheduler(_) => libc::EIO,
            Self::HostFault(_) => libc::EFAULT,
        };
        -errno
    }
}

// A convenient alias
pub type KfdMemResult<T> = Result<T, KfdMemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_matches_kernel_conventions() {
        assert_eq!(KfdMemError::StillMapped.errno(), -libc::EBUSY);
        assert_eq!(KfdMemError::OutOfMemory.errno(), -libc::ENOMEM);
        assert_eq!(KfdMemError::DeviceNotReady.errno(), -libc::ENODEV);
        assert_eq!(KfdMemError::DeadlockAvoided.errno(), -libc::EDEADLK);
        assert_eq!(
            KfdMemError::InvalidArgument("zero size".into()).errno(),
            -libc::EINVAL
        );
    }
}
