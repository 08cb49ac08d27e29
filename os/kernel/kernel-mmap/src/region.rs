use kernel_memory_addresses::PhysicalAddress;

/// What a physical region holds, as reported by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Free RAM.
    Usable,
    /// Firmware or hardware owned; never touched.
    Reserved,
    /// The kernel image and its boot-time data.
    Kernel,
    /// The linear framebuffer.
    Framebuffer,
    /// ACPI non-volatile storage; must be preserved.
    AcpiNvs,
    /// ACPI tables; free once parsed.
    AcpiReclaimable,
    /// Loader data; free once the kernel took over.
    BootloaderReclaimable,
}

impl MemoryKind {
    /// Whether the region may become allocatable after boot.
    #[inline]
    #[must_use]
    pub const fn is_reclaimable(self) -> bool {
        matches!(self, Self::AcpiReclaimable | Self::BootloaderReclaimable)
    }
}

/// One entry of the boot memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub address: PhysicalAddress,
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryRegion {
    pub(crate) const EMPTY: Self = Self::new(PhysicalAddress::zero(), 0, MemoryKind::Reserved);

    #[inline]
    #[must_use]
    pub const fn new(address: PhysicalAddress, length: u64, kind: MemoryKind) -> Self {
        Self {
            address,
            length,
            kind,
        }
    }

    /// One past the last byte, or `None` if the region wraps.
    #[inline]
    #[must_use]
    pub const fn checked_end(&self) -> Option<PhysicalAddress> {
        self.address.checked_add(self.length)
    }

    /// One past the last byte, saturating at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        match self.checked_end() {
            Some(end) => end,
            None => PhysicalAddress::new(u64::MAX),
        }
    }
}
