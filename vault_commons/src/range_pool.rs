use std::{collections::BTreeMap, ops::Range};

/// Free list of a sandbox scratch heap.
/// Blocks are carved from the top of the highest free range that can hold them at the
/// requested alignment, leftovers on either side stay free.
#[derive(Debug)]
pub struct RangePool {
    /// Free ranges, keyed by start address, value is one past the end
    free: BTreeMap<u64, u64>,
}

impl RangePool {
    pub fn new(range: Range<u64>) -> Self {
        let mut free = BTreeMap::new();
        if range.start < range.end {
            free.insert(range.start, range.end);
        }
        RangePool { free }
    }

    /// Take `size` bytes starting at a multiple of `alignment`, which has to be a power of two.
    pub fn take(&mut self, size: u64, alignment: u64) -> Option<u64> {
        debug_assert!(alignment.is_power_of_two());
        let (start, end, block) = self.free.iter().rev().find_map(|(&start, &end)| {
            let block = end.checked_sub(size)? & !(alignment - 1);
            (block >= start).then_some((start, end, block))
        })?;
        self.free.remove(&start);
        if block > start {
            self.free.insert(start, block);
        }
        let block_end = block + size;
        if end > block_end {
            self.free.insert(block_end, end);
        }
        Some(block)
    }

    /// Hand a block back, merging it with free neighbours.
    pub fn give_back(&mut self, start: u64, size: u64) {
        let mut start = start;
        let mut end = start.saturating_add(size);
        if let Some(next_end) = self.free.remove(&end) {
            end = next_end;
        }
        if let Some((&previous_start, &previous_end)) = self.free.range(..start).next_back() {
            if previous_end == start {
                self.free.remove(&previous_start);
                start = previous_start;
            }
        }
        self.free.insert(start, end);
    }

    /// Number of bytes still free
    pub fn available(&self) -> u64 {
        self.free.iter().map(|(start, end)| end - start).sum()
    }
}
