//! # Heap tuning
//!
//! Size classes are fixed at compile time; the big-block cache limits can be
//! chosen at boot through [`HeapConfig`].

use kernel_info::memory::PAGE_SIZE_USIZE;

/// Bytes per frame, as `usize`.
pub const PAGE_SIZE: usize = PAGE_SIZE_USIZE;

/// Smallest block handed out by the small buckets.
pub const MIN_BLOCK_SIZE: usize = 64;

/// Number of power-of-two small buckets (`64 << 0` .. `64 << 5`).
pub const SMALL_BUCKETS: usize = 6;

/// Largest request served by a small bucket; anything above gets whole pages.
pub const MAX_SMALL_SIZE: usize = MIN_BLOCK_SIZE << (SMALL_BUCKETS - 1);

/// Default number of freed big blocks kept for reuse.
pub const N_BIGBLOCKS_CACHED: usize = 16;

/// Default size ceiling for a cached big block.
pub const BIGBLOCKS_CACHE_MAXSIZE: usize = 64 * 1024;

const _: () = {
    assert!(MIN_BLOCK_SIZE.is_power_of_two());
    assert!(MAX_SMALL_SIZE == 2048);
    // A chunk's occupancy bitmap is a single u64.
    assert!(PAGE_SIZE / MIN_BLOCK_SIZE <= u64::BITS as usize);
    assert!(MAX_SMALL_SIZE < PAGE_SIZE);
    assert!(BIGBLOCKS_CACHE_MAXSIZE.is_multiple_of(PAGE_SIZE));
};

/// Runtime limits of the big-block reuse cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Maximum number of cached blocks.
    pub cache_entries: usize,
    /// Largest block (in pages) that may be cached.
    pub cache_max_pages: usize,
}

impl HeapConfig {
    pub const DEFAULT: Self = Self {
        cache_entries: N_BIGBLOCKS_CACHED,
        cache_max_pages: BIGBLOCKS_CACHE_MAXSIZE / PAGE_SIZE,
    };

    /// A configuration that never caches; every freed block goes straight
    /// back to the PMM.
    pub const NO_CACHE: Self = Self {
        cache_entries: 0,
        cache_max_pages: 0,
    };

    #[must_use]
    pub const fn with_cache_entries(mut self, entries: usize) -> Self {
        self.cache_entries = entries;
        self
    }

    /// Set the size ceiling in bytes; partial pages round down.
    #[must_use]
    pub const fn with_cache_max_bytes(mut self, bytes: usize) -> Self {
        self.cache_max_pages = bytes / PAGE_SIZE;
        self
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits() {
        let cfg = HeapConfig::default();
        assert_eq!(cfg.cache_entries, 16);
        assert_eq!(cfg.cache_max_pages, 16);
    }

    #[test]
    fn builder_rounds_bytes_down() {
        let cfg = HeapConfig::DEFAULT
            .with_cache_entries(2)
            .with_cache_max_bytes(3 * PAGE_SIZE + 100);
        assert_eq!(cfg, HeapConfig { cache_entries: 2, cache_max_pages: 3 });
    }
}
