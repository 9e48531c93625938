//! Free-space management map: one byte per block.
//!
//! Each byte encodes the block's free-byte count divided by
//! `block_size / 256`, i.e. 32-byte granularity at the default 8192-byte
//! block. The scan is linear; when nothing fits, a clock hand nominates the
//! next block for wholesale eviction (approximate FIFO, no reference bit).

/// Address of one cache block.
pub type BlockId = u32;

pub struct Fsmm {
    map: Vec<u8>,
    ratio: usize,
    clock_hand: usize,
}

impl Fsmm {
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        let ratio = (block_size / 256).max(1);
        Self {
            // A fresh block is all free space.
            map: vec![Self::encode_with(block_size, ratio); num_blocks],
            ratio,
            clock_hand: 0,
        }
    }

    fn encode_with(free_bytes: usize, ratio: usize) -> u8 {
        (free_bytes / ratio).min(255) as u8
    }

    pub fn encode(&self, free_bytes: usize) -> u8 {
        Self::encode_with(free_bytes, self.ratio)
    }

    pub fn update(&mut self, block: BlockId, free_bytes: usize) {
        self.map[block as usize] = self.encode(free_bytes);
    }

    pub fn encoded(&self, block: BlockId) -> u8 {
        self.map[block as usize]
    }

    /// First block whose encoded free space covers the request. The caller
    /// must still verify the block's exact `free_bytes`; the encoding
    /// rounds down.
    pub fn find_candidate(&self, want_bytes: usize) -> Option<BlockId> {
        let want = self.encode(want_bytes);
        self.map
            .iter()
            .position(|&free| free >= want)
            .map(|i| i as BlockId)
    }

    /// Nominate the next victim block and advance the hand.
    pub fn advance_clock(&mut self) -> BlockId {
        let victim = self.clock_hand as BlockId;
        self.clock_hand += 1;
        if self.clock_hand >= self.map.len() {
            self.clock_hand = 0;
        }
        victim
    }

    pub fn clock_hand(&self) -> usize {
        self.clock_hand
    }

    pub fn reset(&mut self, block_size: usize) {
        let encoded = self.encode(block_size);
        self.map.fill(encoded);
        self.clock_hand = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_granularity_is_block_size_over_256() {
        let fsmm = Fsmm::new(4, 8192);
        // ratio = 32 bytes per step
        assert_eq!(fsmm.encode(0), 0);
        assert_eq!(fsmm.encode(31), 0);
        assert_eq!(fsmm.encode(32), 1);
        assert_eq!(fsmm.encode(8192), 255);
        assert_eq!(fsmm.encode(8160), 255);
        assert_eq!(fsmm.encode(8159), 254);
    }

    #[test]
    fn candidate_scan_and_update() {
        let mut fsmm = Fsmm::new(3, 8192);
        fsmm.update(0, 10);
        fsmm.update(1, 100);
        fsmm.update(2, 8000);

        assert_eq!(fsmm.find_candidate(64), Some(1));
        assert_eq!(fsmm.find_candidate(4000), Some(2));
        assert_eq!(fsmm.find_candidate(8191), None);
    }

    #[test]
    fn clock_hand_wraps() {
        let mut fsmm = Fsmm::new(2, 8192);
        assert_eq!(fsmm.advance_clock(), 0);
        assert_eq!(fsmm.advance_clock(), 1);
        assert_eq!(fsmm.advance_clock(), 0);
    }
}
