use crate::{MemoryKind, MemoryMapError, MemoryRegion};
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, Size4K};

/// Upper bound on the number of entries a [`MemoryMap`] keeps.
///
/// Firmware maps on the machines we run on stay well below this; the map is
/// stored inline because it exists before any allocator does.
pub const MAX_REGIONS: usize = 128;

/// A run of whole, page-aligned frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    pub start: PhysicalAddress,
    pub frames: u64,
}

impl FrameRange {
    /// One past the last byte of the last frame.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64() + (self.frames << kernel_info::memory::PAGE_SHIFT))
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: PhysicalAddress) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.end().as_u64()
    }
}

/// The validated, immutable boot memory map.
#[derive(Clone)]
pub struct MemoryMap {
    regions: [MemoryRegion; MAX_REGIONS],
    len: usize,
}

impl MemoryMap {
    /// Copy and validate the loader's regions.
    ///
    /// # Errors
    /// * [`MemoryMapError::TooManyRegions`] if `regions` exceeds [`MAX_REGIONS`].
    /// * [`MemoryMapError::Unsorted`] if start addresses are not ascending.
    /// * [`MemoryMapError::AddressOverflow`] if a region wraps the address space.
    pub fn new(regions: &[MemoryRegion]) -> Result<Self, MemoryMapError> {
        if regions.len() > MAX_REGIONS {
            return Err(MemoryMapError::TooManyRegions {
                count: regions.len(),
                capacity: MAX_REGIONS,
            });
        }

        for (index, region) in regions.iter().enumerate() {
            if region.checked_end().is_none() {
                return Err(MemoryMapError::AddressOverflow { index });
            }
            if index > 0 && region.address < regions[index - 1].address {
                return Err(MemoryMapError::Unsorted { index });
            }
        }

        let mut map = Self {
            regions: [MemoryRegion::EMPTY; MAX_REGIONS],
            len: regions.len(),
        };
        map.regions[..regions.len()].copy_from_slice(regions);
        Ok(map)
    }

    #[inline]
    #[must_use]
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions[..self.len]
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The frame ranges a physical allocator may own, in ascending order.
    ///
    /// `Usable` regions are clipped at the start of the following entry;
    /// reclaimable regions count only if they end before it. Partial frames
    /// at either edge are dropped.
    pub fn allocatable(&self) -> impl Iterator<Item = FrameRange> + '_ {
        let regions = self.regions();
        regions.iter().enumerate().filter_map(move |(i, region)| {
            let next = regions.get(i + 1).map(|n| n.address);
            let mut end = region.end();
            match region.kind {
                MemoryKind::Usable => {
                    if let Some(next) = next {
                        end = end.min(next);
                    }
                }
                kind if kind.is_reclaimable() => {
                    if next.is_some_and(|next| end > next) {
                        return None;
                    }
                }
                _ => return None,
            }

            let start = region.address.checked_add(kernel_info::memory::PAGE_SIZE - 1)?;
            let start = start.align_down::<Size4K>();
            let end = end.align_down::<Size4K>();
            if end <= start {
                return None;
            }
            Some(FrameRange {
                start,
                frames: start.frames_until::<Size4K>(end),
            })
        })
    }

    /// First allocatable frame and one past the last allocatable byte.
    #[must_use]
    pub fn allocatable_span(&self) -> Option<(PhysicalAddress, PhysicalAddress)> {
        let first = self.allocatable().next()?;
        let last = self.allocatable().last()?;
        Some((first.start, last.end()))
    }
}

impl fmt::Debug for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.regions()).finish()
    }
}
