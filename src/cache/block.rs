//! The block store.
//!
//! One contiguous arena divided into equal blocks. Each block starts with a
//! header, item pointers grow upward from it, item bodies grow downward
//! from the block end. All addressing is `(blockid, itemid)`; nothing in
//! the arena is a machine address, so the layout matches what a shared
//! segment would hold.
//!
//! Block header:   flags u8 | num_items u16 | free_bytes u32   (8 bytes)
//! Item pointer:   key [16] | next (u32,u32) | offset u32 | flags u8  (32 bytes)
//! Item body:      timestamp u64 | ttl u32 | total_length u32 | data

use crate::cache::fsmm::{BlockId, Fsmm};
use crate::cache::hashtable::{CacheId, HashIndex};
use crate::cache::CacheKey;
use crate::errors::Error;

const BLOCK_HEADER_SIZE: usize = 8;
const ITEM_POINTER_SIZE: usize = 32;
const ITEM_HEADER_SIZE: usize = 16;

const BLOCK_USED: u8 = 1;
const ITEM_USED: u8 = 1;
const ITEM_DELETED: u8 = 2;

pub struct ShmemCache {
    arena: Vec<u8>,
    block_size: usize,
    num_blocks: usize,
    fsmm: Fsmm,
    index: HashIndex,
}

impl ShmemCache {
    pub fn new(total_size: usize, block_size: usize, max_num_cache: usize) -> Self {
        let num_blocks = (total_size / block_size).max(1);
        let mut cache = Self {
            arena: vec![0; num_blocks * block_size],
            block_size,
            num_blocks,
            fsmm: Fsmm::new(num_blocks, block_size),
            index: HashIndex::new(max_num_cache),
        };
        for block in 0..num_blocks as BlockId {
            cache.init_block(block);
        }
        cache
    }

    pub fn num_entries(&self) -> usize {
        self.index.len()
    }

    /// Largest payload a single block can hold.
    pub fn max_item_size(&self) -> usize {
        self.block_size - BLOCK_HEADER_SIZE - ITEM_POINTER_SIZE - ITEM_HEADER_SIZE
    }

    fn block_range(&self, block: BlockId) -> std::ops::Range<usize> {
        let start = block as usize * self.block_size;
        start..start + self.block_size
    }

    fn init_block(&mut self, block: BlockId) {
        let range = self.block_range(block);
        self.arena[range].fill(0);
        self.set_header(block, BLOCK_USED, 0, (self.block_size - BLOCK_HEADER_SIZE) as u32);
        self.fsmm.update(block, self.block_size - BLOCK_HEADER_SIZE);
    }

    fn set_header(&mut self, block: BlockId, flags: u8, num_items: u16, free_bytes: u32) {
        let base = block as usize * self.block_size;
        self.arena[base] = flags;
        self.arena[base + 2..base + 4].copy_from_slice(&num_items.to_le_bytes());
        self.arena[base + 4..base + 8].copy_from_slice(&free_bytes.to_le_bytes());
    }

    fn num_items(&self, block: BlockId) -> u16 {
        let base = block as usize * self.block_size;
        u16::from_le_bytes([self.arena[base + 2], self.arena[base + 3]])
    }

    fn free_bytes(&self, block: BlockId) -> u32 {
        let base = block as usize * self.block_size;
        u32::from_le_bytes([
            self.arena[base + 4],
            self.arena[base + 5],
            self.arena[base + 6],
            self.arena[base + 7],
        ])
    }

    fn pointer_base(&self, cacheid: CacheId) -> usize {
        cacheid.block as usize * self.block_size
            + BLOCK_HEADER_SIZE
            + cacheid.item as usize * ITEM_POINTER_SIZE
    }

    fn item_flags(&self, cacheid: CacheId) -> u8 {
        self.arena[self.pointer_base(cacheid) + 28]
    }

    fn item_offset(&self, cacheid: CacheId) -> u32 {
        let base = self.pointer_base(cacheid) + 24;
        u32::from_le_bytes([
            self.arena[base],
            self.arena[base + 1],
            self.arena[base + 2],
            self.arena[base + 3],
        ])
    }

    fn item_key(&self, cacheid: CacheId) -> CacheKey {
        let base = self.pointer_base(cacheid);
        let mut key = [0u8; 16];
        key.copy_from_slice(&self.arena[base..base + 16]);
        CacheKey(key)
    }

    fn validate(&self, cacheid: CacheId) -> Result<(), Error> {
        if cacheid.block as usize >= self.num_blocks {
            return Err(Error::CacheCorrupt(format!(
                "block id {} out of range",
                cacheid.block
            )));
        }
        if cacheid.item >= u32::from(self.num_items(cacheid.block)) {
            return Err(Error::CacheCorrupt(format!(
                "item id {} out of range in block {}",
                cacheid.item, cacheid.block
            )));
        }
        let offset = self.item_offset(cacheid) as usize;
        if offset < BLOCK_HEADER_SIZE || offset + ITEM_HEADER_SIZE > self.block_size {
            return Err(Error::CacheCorrupt(format!(
                "item offset {offset} out of range"
            )));
        }
        Ok(())
    }

    /// Store one entry. `Ok(None)` means the payload cannot be cached (too
    /// large for a block, or the index is out of elements).
    pub fn insert(
        &mut self,
        key: CacheKey,
        data: &[u8],
        now: u64,
        ttl: u32,
    ) -> Result<Option<CacheId>, Error> {
        let needed = ITEM_POINTER_SIZE + ITEM_HEADER_SIZE + data.len();
        if needed > self.block_size - BLOCK_HEADER_SIZE {
            return Ok(None);
        }

        // Replace an existing entry outright.
        if self.index.get(&key).is_some() {
            self.delete(&key)?;
        }

        let block = match self.find_block(needed) {
            Some(block) => block,
            None => {
                // Clock eviction: the nominated block is wiped wholesale and
                // its entries leave the index.
                let victim = self.fsmm.advance_clock();
                self.index.remove_block(victim);
                self.init_block(victim);
                victim
            }
        };

        let num_items = self.num_items(block);
        let free = self.free_bytes(block) as usize;
        if free < needed {
            return Err(Error::CacheCorrupt(format!(
                "block {block} advertised {free} free bytes, need {needed}"
            )));
        }

        // Body goes below the lowest existing body; derive the tail from
        // the free region: [pointers end, tail).
        let pointers_end = BLOCK_HEADER_SIZE + (num_items as usize + 1) * ITEM_POINTER_SIZE;
        let tail = BLOCK_HEADER_SIZE
            + num_items as usize * ITEM_POINTER_SIZE
            + free;
        let body_len = ITEM_HEADER_SIZE + data.len();
        let body_offset = tail - body_len;
        if body_offset < pointers_end {
            return Err(Error::CacheCorrupt(format!(
                "block {block} free-space accounting is inconsistent"
            )));
        }

        let cacheid = CacheId {
            block,
            item: u32::from(num_items),
        };
        if !self.index.insert(key, cacheid) {
            return Ok(None);
        }

        // Item pointer.
        let pbase = self.pointer_base(cacheid);
        self.arena[pbase..pbase + 16].copy_from_slice(&key.0);
        self.arena[pbase + 16..pbase + 24].fill(0);
        self.arena[pbase + 24..pbase + 28].copy_from_slice(&(body_offset as u32).to_le_bytes());
        self.arena[pbase + 28] = ITEM_USED;

        // Item body.
        let base = block as usize * self.block_size + body_offset;
        self.arena[base..base + 8].copy_from_slice(&now.to_le_bytes());
        self.arena[base + 8..base + 12].copy_from_slice(&ttl.to_le_bytes());
        self.arena[base + 12..base + 16].copy_from_slice(&(body_len as u32).to_le_bytes());
        self.arena[base + 16..base + 16 + data.len()].copy_from_slice(data);

        let new_free = free - needed;
        self.set_header(block, BLOCK_USED, num_items + 1, new_free as u32);
        self.fsmm.update(block, new_free);

        Ok(Some(cacheid))
    }

    /// FSMM candidates verified against the block's exact free count. The
    /// encoding rounds down, so a candidate can fall short; its entry is
    /// corrected and the scan continues.
    fn find_block(&mut self, needed: usize) -> Option<BlockId> {
        let want = self.fsmm.encode(needed);
        for block in 0..self.num_blocks as BlockId {
            if self.fsmm.encoded(block) < want {
                continue;
            }
            let free = self.free_bytes(block) as usize;
            if free >= needed {
                return Some(block);
            }
            self.fsmm.update(block, free);
        }
        None
    }

    /// Fetch an entry's payload, enforcing its TTL.
    pub fn lookup(&mut self, key: &CacheKey, now: u64) -> Result<Option<Vec<u8>>, Error> {
        let cacheid = match self.index.get(key) {
            Some(cacheid) => cacheid,
            None => return Ok(None),
        };
        self.validate(cacheid)?;
        if self.item_flags(cacheid) & ITEM_USED == 0 || self.item_flags(cacheid) & ITEM_DELETED != 0
        {
            return Err(Error::CacheCorrupt(format!(
                "index points at dead item {cacheid:?}"
            )));
        }

        let base = cacheid.block as usize * self.block_size + self.item_offset(cacheid) as usize;
        let timestamp = u64::from_le_bytes(self.arena[base..base + 8].try_into().unwrap());
        let ttl = u32::from_le_bytes(self.arena[base + 8..base + 12].try_into().unwrap());
        let total = u32::from_le_bytes(self.arena[base + 12..base + 16].try_into().unwrap()) as usize;
        if total < ITEM_HEADER_SIZE
            || self.item_offset(cacheid) as usize + total > self.block_size
        {
            return Err(Error::CacheCorrupt(format!(
                "item {cacheid:?} length {total} out of range"
            )));
        }

        if ttl > 0 && now > timestamp + u64::from(ttl) {
            self.delete(key)?;
            return Ok(None);
        }

        Ok(Some(
            self.arena[base + ITEM_HEADER_SIZE..base + total].to_vec(),
        ))
    }

    /// Remove one entry. Its block space is reclaimed only when the clock
    /// evicts the whole block.
    pub fn delete(&mut self, key: &CacheKey) -> Result<(), Error> {
        if let Some(cacheid) = self.index.remove(key) {
            self.validate(cacheid)?;
            let pbase = self.pointer_base(cacheid);
            self.arena[pbase + 28] |= ITEM_DELETED;
        }
        Ok(())
    }

    /// Remove by block address, as recorded in the oid map.
    pub fn delete_by_cacheid(&mut self, cacheid: CacheId) -> Result<(), Error> {
        if self.validate(cacheid).is_err() {
            // A stale oid-map record after an eviction; nothing to do.
            return Ok(());
        }
        if self.item_flags(cacheid) & ITEM_DELETED != 0 {
            return Ok(());
        }
        let key = self.item_key(cacheid);
        // Only delete if the index still maps this key to this address; the
        // slot may have been reused after an eviction.
        if self.index.get(&key) == Some(cacheid) {
            self.delete(&key)?;
        }
        Ok(())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.get(key).is_some()
    }

    /// Full reset: every block re-initialized, index and FSMM cleared.
    pub fn clear(&mut self) {
        self.index.clear();
        self.fsmm.reset(self.block_size - BLOCK_HEADER_SIZE);
        for block in 0..self.num_blocks as BlockId {
            self.init_block(block);
        }
    }

    #[cfg(test)]
    pub fn clock_hand(&self) -> usize {
        self.fsmm.clock_hand()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> CacheKey {
        CacheKey([byte; 16])
    }

    fn small_cache() -> ShmemCache {
        // Two 512-byte blocks, tiny index.
        ShmemCache::new(1024, 512, 16)
    }

    #[test]
    fn insert_then_lookup_round_trip() {
        let mut cache = small_cache();
        let data = b"T...D...C...".to_vec();
        let id = cache.insert(key(1), &data, 100, 0).unwrap().unwrap();
        assert_eq!(id.block, 0);
        assert_eq!(cache.lookup(&key(1), 200).unwrap(), Some(data));
        assert_eq!(cache.lookup(&key(9), 200).unwrap(), None);
    }

    #[test]
    fn expired_entries_vanish_on_lookup() {
        let mut cache = small_cache();
        cache.insert(key(1), b"payload", 100, 50).unwrap().unwrap();
        assert!(cache.lookup(&key(1), 149).unwrap().is_some());
        assert_eq!(cache.lookup(&key(1), 151).unwrap(), None);
        assert!(!cache.contains(&key(1)));
    }

    #[test]
    fn delete_hides_entry() {
        let mut cache = small_cache();
        cache.insert(key(1), b"payload", 100, 0).unwrap().unwrap();
        cache.delete(&key(1)).unwrap();
        assert_eq!(cache.lookup(&key(1), 100).unwrap(), None);
    }

    #[test]
    fn oversized_payload_is_refused_not_an_error() {
        let mut cache = small_cache();
        let data = vec![0u8; 1024];
        assert_eq!(cache.insert(key(1), &data, 100, 0).unwrap(), None);
    }

    #[test]
    fn reinsert_replaces_payload() {
        let mut cache = small_cache();
        cache.insert(key(1), b"old", 100, 0).unwrap().unwrap();
        cache.insert(key(1), b"new", 200, 0).unwrap().unwrap();
        assert_eq!(cache.lookup(&key(1), 300).unwrap(), Some(b"new".to_vec()));
        assert_eq!(cache.num_entries(), 1);
    }

    #[test]
    fn clock_eviction_reclaims_a_block_and_its_index_entries() {
        let mut cache = small_cache();
        // ~100-byte payloads: 148 bytes per entry, 504 free per block,
        // three fit per block, two blocks fill at six.
        let payload = vec![7u8; 100];
        for i in 0..6 {
            assert!(cache.insert(key(i), &payload, 100, 0).unwrap().is_some());
        }
        // Both blocks full; the next insert evicts the block under the
        // clock hand and its old items leave the index.
        let before = cache.clock_hand();
        let id = cache.insert(key(100), &payload, 100, 0).unwrap().unwrap();
        assert_eq!(id.block as usize, before);
        assert_ne!(cache.clock_hand(), before);

        let mut missing = 0;
        for i in 0..6 {
            if cache.lookup(&key(i), 100).unwrap().is_none() {
                missing += 1;
            }
        }
        // The three entries of the evicted block are gone.
        assert_eq!(missing, 3);
        assert!(cache.lookup(&key(100), 100).unwrap().is_some());
    }

    #[test]
    fn clear_resets_everything() {
        let mut cache = small_cache();
        cache.insert(key(1), b"payload", 100, 0).unwrap().unwrap();
        cache.clear();
        assert_eq!(cache.num_entries(), 0);
        assert_eq!(cache.lookup(&key(1), 100).unwrap(), None);
        // Fully usable again.
        assert!(cache.insert(key(2), b"payload", 100, 0).unwrap().is_some());
    }

    #[test]
    fn stale_cacheid_delete_is_harmless() {
        let mut cache = small_cache();
        cache
            .delete_by_cacheid(CacheId {
                block: 9,
                item: 0,
            })
            .unwrap();
        cache
            .delete_by_cacheid(CacheId {
                block: 0,
                item: 5,
            })
            .unwrap();
    }
}
