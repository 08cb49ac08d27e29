//! # Address registry
//!
//! Maps every live allocation address to the record that owns it, so `free`
//! can find the chunk without a header in front of the block. An open
//! addressing table with linear probing; the table pages come from the PMM
//! like everything else.
//!
//! Freed entries become tombstones that keep their key. A lookup that only
//! finds tombstones for an address reports a double free; one that finds
//! nothing at all reports an invalid free.

use super::chunk::ChunkHandle;
use super::page_source::PageSource;
use crate::PageMapper;
use crate::config::PAGE_SIZE;
use crate::error::HeapError;
use core::ptr::NonNull;
use kernel_memory_addresses::VirtualAddress;
use log::debug;

/// An empty slot has key 0; a tombstone has a key and no value.
#[derive(Clone, Copy)]
#[repr(C)]
struct Slot {
    key: usize,
    value: Option<ChunkHandle>,
}

const _: () = assert!(size_of::<Slot>() == 16);

/// Slots in the first table.
const INITIAL_CAPACITY: usize = PAGE_SIZE / size_of::<Slot>();

/// 2^64 / φ
const FIBONACCI: u64 = 0x9E37_79B9_7F4A_7C15;

enum Lookup {
    Found(usize, ChunkHandle),
    Freed,
    Missing,
}

pub(crate) struct AddressRegistry {
    table: Option<NonNull<Slot>>,
    capacity: usize,
    live: usize,
    tombstones: usize,
}

impl AddressRegistry {
    pub const fn new() -> Self {
        Self {
            table: None,
            capacity: 0,
            live: 0,
            tombstones: 0,
        }
    }

    /// Live entries.
    pub const fn len(&self) -> usize {
        self.live
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Make sure one more [`insert`](Self::insert) stays under a 3/4 load.
    ///
    /// Grows the table when live entries dominate, otherwise rebuilds it at
    /// the same size to drop tombstones.
    pub fn reserve<M: PageMapper>(&mut self, src: &mut PageSource<'_, M>) -> Result<(), HeapError> {
        if (self.live + self.tombstones + 1) * 4 <= self.capacity * 3 {
            return Ok(());
        }
        let capacity = if self.capacity == 0 {
            INITIAL_CAPACITY
        } else if (self.live + 1) * 2 > self.capacity {
            self.capacity * 2
        } else {
            self.capacity
        };
        self.rehash(capacity, src)
    }

    /// Record `chunk` as the owner of `key`. Needs a prior
    /// [`reserve`](Self::reserve).
    pub fn insert(&mut self, key: VirtualAddress, chunk: ChunkHandle) -> Result<(), HeapError> {
        if (self.live + self.tombstones + 1) * 4 > self.capacity * 3 {
            return Err(HeapError::Corrupt("registry insert without reserve"));
        }
        let key = key.as_usize();
        let mask = self.capacity - 1;
        let slots = self.slots_mut();

        let mut index = hash(key, mask);
        let mut reuse = None;
        while slots[index].key != 0 {
            let slot = slots[index];
            if slot.key == key && slot.value.is_some() {
                return Err(HeapError::Corrupt("address registered twice"));
            }
            if slot.value.is_none() && reuse.is_none() {
                reuse = Some(index);
            }
            index = (index + 1) & mask;
        }

        let target = reuse.unwrap_or(index);
        let was_tombstone = slots[target].key != 0;
        slots[target] = Slot {
            key,
            value: Some(chunk),
        };
        if was_tombstone {
            self.tombstones -= 1;
        }
        self.live += 1;
        Ok(())
    }

    /// The record owning the live allocation at `key`.
    ///
    /// # Errors
    /// [`HeapError::DoubleFree`] if `key` was freed, [`HeapError::InvalidFree`]
    /// if it was never handed out.
    pub fn get(&self, key: VirtualAddress) -> Result<ChunkHandle, HeapError> {
        match self.find(key) {
            Lookup::Found(_, chunk) => Ok(chunk),
            Lookup::Freed => Err(HeapError::DoubleFree(key)),
            Lookup::Missing => Err(HeapError::InvalidFree(key)),
        }
    }

    /// Like [`get`](Self::get), and turns the entry into a tombstone.
    pub fn remove(&mut self, key: VirtualAddress) -> Result<ChunkHandle, HeapError> {
        match self.find(key) {
            Lookup::Found(index, chunk) => {
                self.slots_mut()[index].value = None;
                self.live -= 1;
                self.tombstones += 1;
                Ok(chunk)
            }
            Lookup::Freed => Err(HeapError::DoubleFree(key)),
            Lookup::Missing => Err(HeapError::InvalidFree(key)),
        }
    }

    fn find(&self, key: VirtualAddress) -> Lookup {
        if self.capacity == 0 {
            return Lookup::Missing;
        }
        let key = key.as_usize();
        let mask = self.capacity - 1;
        let slots = self.slots();

        let mut index = hash(key, mask);
        let mut freed = false;
        while slots[index].key != 0 {
            let slot = slots[index];
            if slot.key == key {
                match slot.value {
                    Some(chunk) => return Lookup::Found(index, chunk),
                    None => freed = true,
                }
            }
            index = (index + 1) & mask;
        }
        if freed { Lookup::Freed } else { Lookup::Missing }
    }

    fn rehash<M: PageMapper>(
        &mut self,
        capacity: usize,
        src: &mut PageSource<'_, M>,
    ) -> Result<(), HeapError> {
        let pages = capacity * size_of::<Slot>() / PAGE_SIZE;
        let base = src.allocate_zeroed(pages)?;
        // SAFETY: zeroed pages are a valid table of empty slots.
        let table = unsafe { NonNull::new_unchecked(base.as_mut_ptr::<Slot>()) };

        let old_table = self.table.replace(table);
        let old_capacity = core::mem::replace(&mut self.capacity, capacity);
        let live = self.live;
        self.live = 0;
        self.tombstones = 0;

        if let Some(old) = old_table {
            // SAFETY: the old table stays valid until its pages are released below.
            let old_slots = unsafe { core::slice::from_raw_parts(old.as_ptr(), old_capacity) };
            for slot in old_slots {
                if let Some(chunk) = slot.value {
                    self.insert(VirtualAddress::new(slot.key as u64), chunk)?;
                }
            }
            let old_pages = old_capacity * size_of::<Slot>() / PAGE_SIZE;
            src.release(VirtualAddress::from_nonnull(old), old_pages)?;
        }
        debug_assert_eq!(self.live, live);

        debug!("heap: address registry now {capacity} slots ({live} live)");
        Ok(())
    }

    fn slots(&self) -> &[Slot] {
        match self.table {
            // SAFETY: the registry owns `capacity` initialized slots at `table`.
            Some(table) => unsafe { core::slice::from_raw_parts(table.as_ptr(), self.capacity) },
            None => &[],
        }
    }

    fn slots_mut(&mut self) -> &mut [Slot] {
        match self.table {
            // SAFETY: as in `slots`, and `&mut self` makes the access exclusive.
            Some(table) => unsafe {
                core::slice::from_raw_parts_mut(table.as_ptr(), self.capacity)
            },
            None => &mut [],
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn hash(key: usize, mask: usize) -> usize {
    let bits = mask.count_ones();
    ((key as u64).wrapping_mul(FIBONACCI) >> (u64::BITS - bits)) as usize
}
