//! Contiguous in-memory copy of protected payloads.
//!
//! Every protected record owns one slot: an `(offset, len, capacity)` window into a single
//! zeroizing region. Rewrites reuse the slot when the new value fits and otherwise append a
//! larger slot, leaving the old window as garbage until [`VariableCache::compact`] runs.
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use shared::{GuardError, GuardResult};
use zeroize::{Zeroize, Zeroizing};

/// Window of the cache region owned by one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSlot {
    pub offset: u32,
    pub len: u32,
    pub capacity: u32,
}

impl CacheSlot {
    fn range(&self) -> core::ops::Range<usize> {
        let start = self.offset as usize;
        start..start + self.len as usize
    }

    fn end(&self) -> usize {
        self.offset as usize + self.capacity as usize
    }
}

#[derive(Debug, Default)]
pub struct VariableCache {
    region: Zeroizing<Vec<u8>>,
    garbage: usize,
}

impl VariableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a cache from a region captured by an earlier stage.
    pub fn from_region(region: Vec<u8>, garbage: usize) -> Self {
        Self {
            region: Zeroizing::new(region),
            garbage,
        }
    }

    pub fn region(&self) -> &[u8] {
        &self.region
    }

    /// Bytes held by released or outgrown slots.
    pub fn garbage(&self) -> usize {
        self.garbage
    }

    pub fn store(&mut self, bytes: &[u8]) -> GuardResult<CacheSlot> {
        let offset = u32::try_from(self.region.len()).map_err(|_| GuardError::OutOfResources)?;
        let len = u32::try_from(bytes.len()).map_err(|_| GuardError::OutOfResources)?;
        self.region
            .try_reserve(bytes.len())
            .map_err(|_| GuardError::OutOfResources)?;
        self.region.extend_from_slice(bytes);
        Ok(CacheSlot {
            offset,
            len,
            capacity: len,
        })
    }

    /// Replace the contents of `slot`, growing into a new slot when `bytes` does not fit.
    pub fn rewrite(&mut self, slot: CacheSlot, bytes: &[u8]) -> GuardResult<CacheSlot> {
        if slot.end() > self.region.len() {
            return Err(GuardError::InvalidParameter("cache slot"));
        }

        if bytes.len() <= slot.capacity as usize {
            let start = slot.offset as usize;
            let window = &mut self.region[start..slot.end()];
            window.zeroize();
            window[..bytes.len()].copy_from_slice(bytes);
            return Ok(CacheSlot {
                len: bytes.len() as u32,
                ..slot
            });
        }

        let grown = self.store(bytes)?;
        self.release(slot);
        Ok(grown)
    }

    pub fn get(&self, slot: &CacheSlot) -> Option<&[u8]> {
        if slot.end() > self.region.len() {
            return None;
        }
        self.region.get(slot.range())
    }

    pub fn get_mut(&mut self, slot: &CacheSlot) -> Option<&mut [u8]> {
        if slot.end() > self.region.len() {
            return None;
        }
        self.region.get_mut(slot.range())
    }

    pub fn release(&mut self, slot: CacheSlot) {
        if let Some(window) = self.region.get_mut(slot.offset as usize..slot.end()) {
            window.zeroize();
            self.garbage += slot.capacity as usize;
        }
    }

    /// Move every live slot to the front of the region and drop the garbage.
    ///
    /// `slots` must name every slot still referenced by a record; offsets are rewritten
    /// in place.
    pub fn compact<'a>(&mut self, slots: impl IntoIterator<Item = &'a mut CacheSlot>) {
        let mut live: Vec<&'a mut CacheSlot> = slots.into_iter().collect();
        live.sort_by_key(|slot| slot.offset);

        let mut cursor = 0usize;
        for slot in live {
            let start = slot.offset as usize;
            let capacity = slot.len as usize;
            self.region.copy_within(start..start + capacity, cursor);
            slot.offset = cursor as u32;
            slot.capacity = slot.len;
            cursor += capacity;
        }

        self.region[cursor..].zeroize();
        self.region.truncate(cursor);
        self.garbage = 0;
    }
}
