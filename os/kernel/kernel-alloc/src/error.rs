use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Failures of the bitmap physical memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PmmError {
    #[error("out of physical memory: {requested} contiguous frames requested, {free} free")]
    OutOfMemory { requested: usize, free: usize },
    #[error("requested zero frames")]
    EmptyRequest,
    #[error("{pages} frames at {addr} are not managed by the PMM")]
    InvalidFrame { addr: PhysicalAddress, pages: usize },
    #[error("frame {addr} is not allocated")]
    DoubleFree { addr: PhysicalAddress },
    #[error("bitmap corrupt: {counted} frames accounted, {actual} bits set")]
    CorruptBitmap { counted: usize, actual: usize },
    #[error("the memory map has no allocatable memory")]
    NoUsableMemory,
    #[error("no allocatable region can hold the {bytes}-byte frame bitmap")]
    NoBitmapRegion { bytes: usize },
}

/// Failures of the kernel heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("out of memory: {pages} pages needed, {free} free")]
    OutOfMemory { pages: usize, free: usize },
    #[error("a {size}-byte request exceeds physical memory")]
    TooLarge { size: usize },
    #[error("{0} was not allocated by the heap")]
    InvalidFree(VirtualAddress),
    #[error("{0} was already freed")]
    DoubleFree(VirtualAddress),
    #[error("heap metadata corrupt: {0}")]
    Corrupt(&'static str),
    #[error(transparent)]
    Pmm(PmmError),
}

impl HeapError {
    /// Out-of-memory style failures a caller may survive by getting null.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. } | Self::TooLarge { .. })
    }
}

impl From<PmmError> for HeapError {
    fn from(e: PmmError) -> Self {
        match e {
            PmmError::OutOfMemory { requested, free } => Self::OutOfMemory {
                pages: requested,
                free,
            },
            other => Self::Pmm(other),
        }
    }
}

/// Failures while installing the global heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    #[error("failed to build the physical memory manager: {0}")]
    Pmm(#[from] PmmError),
    #[error("the kernel heap was already initialized")]
    AlreadyInitialized,
}
