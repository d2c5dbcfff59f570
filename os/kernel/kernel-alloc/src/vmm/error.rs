use crate::frame_alloc::FrameAllocError;
use kernel_vmem::PmapError;

/// Failure of a VM operation.
///
/// Resource exhaustion, invariant violations and bad accesses all end up
/// here; the lower layers' errors convert with `?`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("already exists")]
    AlreadyExists,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
}

impl VmError {
    /// The matching POSIX error number (positive).
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::OutOfMemory => 12,      // ENOMEM
            Self::AlreadyExists => 17,    // EEXIST
            Self::InvalidArgument => 22,  // EINVAL
            Self::NotFound => 2,          // ENOENT
            Self::PermissionDenied => 13, // EACCES
        }
    }
}

impl From<PmapError> for VmError {
    fn from(value: PmapError) -> Self {
        match value {
            PmapError::OutOfMemory => Self::OutOfMemory,
            PmapError::AlreadyMapped(_) => Self::AlreadyExists,
            PmapError::KernelRange(_) => Self::InvalidArgument,
        }
    }
}

impl From<FrameAllocError> for VmError {
    fn from(value: FrameAllocError) -> Self {
        match value {
            FrameAllocError::OutOfMemory => Self::OutOfMemory,
            FrameAllocError::AlreadyAllocated(_) => Self::AlreadyExists,
            FrameAllocError::NotAllocated(_) => Self::NotFound,
            FrameAllocError::OutOfRange(_)
            | FrameAllocError::Unaligned(_)
            | FrameAllocError::EmptyRun => Self::InvalidArgument,
        }
    }
}
