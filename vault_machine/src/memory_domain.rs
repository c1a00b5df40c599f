use crate::{page_align_down, page_align_up};
use log::trace;
use std::collections::{btree_map, BTreeMap};
use vault_commons::{range_pool::RangePool, VaultError, VaultResult};

/// Allocations from the scratch heap start at multiples of this
const HEAP_ALIGNMENT: u64 = 16;

/// Sparse, page granular address space.
/// Regions are keyed by their start address and never overlap.
#[derive(Debug, Default)]
pub struct AddressSpace {
    regions: BTreeMap<u64, Vec<u8>>,
    heap: Option<RangePool>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map zero filled memory covering `[address, address + size)`, extended to page boundaries.
    pub fn map(&mut self, address: u64, size: u64) -> VaultResult<()> {
        let start = page_align_down(address);
        let end = address
            .checked_add(size)
            .and_then(page_align_up)
            .ok_or(VaultError::MappingOverlap(address))?;
        if start == end {
            return Ok(());
        }
        // only the closest region starting before the end can reach into the new one
        if let Some((&base, storage)) = self.regions.range(..end).next_back() {
            if base + storage.len() as u64 > start {
                return Err(VaultError::MappingOverlap(start));
            }
        }
        trace!("mapping {:#x}..{:#x}", start, end);
        self.regions.insert(start, vec![0u8; (end - start) as usize]);
        Ok(())
    }

    /// Map a region and fill its start with `data`.
    pub fn map_with(&mut self, address: u64, size: u64, data: &[u8]) -> VaultResult<()> {
        self.map(address, size.max(data.len() as u64))?;
        self.write(address, data)
    }

    fn region_containing(&self, address: u64) -> Option<(u64, &Vec<u8>)> {
        let (&base, storage) = self.regions.range(..=address).next_back()?;
        if address - base < storage.len() as u64 {
            Some((base, storage))
        } else {
            None
        }
    }

    pub fn is_mapped(&self, address: u64, length: u64) -> bool {
        let mut current = address;
        let Some(end) = address.checked_add(length) else {
            return false;
        };
        while current < end {
            match self.region_containing(current) {
                Some((base, storage)) => current = base + storage.len() as u64,
                None => return false,
            }
        }
        true
    }

    /// Read `length` bytes, the range may span adjacent regions.
    pub fn read(&self, address: u64, length: usize) -> VaultResult<Vec<u8>> {
        let mut result = Vec::with_capacity(length);
        let mut current = address;
        while result.len() < length {
            let (base, storage) = self
                .region_containing(current)
                .ok_or(VaultError::InvalidRead(current))?;
            let start = (current - base) as usize;
            let take = (length - result.len()).min(storage.len() - start);
            result.extend_from_slice(&storage[start..start + take]);
            current += take as u64;
        }
        Ok(result)
    }

    /// Read up to `max_length` bytes, stopping at the first unmapped byte.
    pub fn read_available(&self, address: u64, max_length: usize) -> Vec<u8> {
        let mut result = Vec::with_capacity(max_length);
        let mut current = address;
        while result.len() < max_length {
            let Some((base, storage)) = self.region_containing(current) else {
                break;
            };
            let start = (current - base) as usize;
            let take = (max_length - result.len()).min(storage.len() - start);
            result.extend_from_slice(&storage[start..start + take]);
            current += take as u64;
        }
        result
    }

    pub fn write(&mut self, address: u64, data: &[u8]) -> VaultResult<()> {
        if !self.is_mapped(address, data.len() as u64) {
            return Err(VaultError::InvalidWrite(address));
        }
        let mut written = 0usize;
        while written < data.len() {
            let current = address + written as u64;
            let (&base, storage) = self
                .regions
                .range_mut(..=current)
                .next_back()
                .ok_or(VaultError::InvalidWrite(current))?;
            let start = (current - base) as usize;
            let take = (data.len() - written).min(storage.len() - start);
            storage[start..start + take].copy_from_slice(&data[written..written + take]);
            written += take;
        }
        Ok(())
    }

    /// Exact matches of `pattern` lying entirely inside `[begin, end)`, in address order.
    pub fn search<'a>(&'a self, pattern: &'a [u8], begin: u64, end: u64) -> Matches<'a> {
        Matches {
            regions: self.regions.range(..end),
            current: None,
            pattern,
            begin,
            end,
        }
    }

    /// Reserve and map `[base, base + size)` as scratch heap.
    pub fn init_heap(&mut self, base: u64, size: u64) -> VaultResult<()> {
        let end = base.checked_add(size).ok_or_else(|| {
            VaultError::ConfigError(format!(
                "heap {:#x} of size {:#x} exceeds the address space",
                base, size
            ))
        })?;
        self.map(base, size)?;
        self.heap = Some(RangePool::new(base..end));
        Ok(())
    }

    pub fn allocate(&mut self, length: usize) -> VaultResult<u64> {
        let heap = self.heap.as_mut().ok_or(VaultError::OutOfMemory)?;
        let size = length.max(1);
        let address = heap
            .take(size as u64, HEAP_ALIGNMENT)
            .ok_or(VaultError::OutOfMemory)?;
        // heap memory is handed out zeroed
        self.write(address, &vec![0u8; size])?;
        trace!("allocated {:#x} bytes at {:#x}", size, address);
        Ok(address)
    }

    pub fn free(&mut self, address: u64, length: usize) {
        if let Some(heap) = self.heap.as_mut() {
            heap.give_back(address, length.max(1) as u64);
        }
    }
}

/// Lazy iterator over pattern matches, cloning it restarts the scan from the clone point.
#[derive(Clone)]
pub struct Matches<'a> {
    regions: btree_map::Range<'a, u64, Vec<u8>>,
    /// address of the first byte of the slice still to be searched, and the slice
    current: Option<(u64, &'a [u8])>,
    pattern: &'a [u8],
    begin: u64,
    end: u64,
}

impl<'a> Iterator for Matches<'a> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.pattern.is_empty() {
            return None;
        }
        loop {
            if let Some((base, slice)) = self.current {
                if let Some(position) = slice
                    .windows(self.pattern.len())
                    .position(|window| window == self.pattern)
                {
                    let found = base + position as u64;
                    self.current = Some((found + 1, &slice[position + 1..]));
                    return Some(found);
                }
                self.current = None;
            }
            let (&region_base, storage) = self.regions.next()?;
            let region_end = region_base + storage.len() as u64;
            let clip_start = region_base.max(self.begin);
            let clip_end = region_end.min(self.end);
            if clip_start >= clip_end {
                continue;
            }
            let slice =
                &storage[(clip_start - region_base) as usize..(clip_end - region_base) as usize];
            self.current = Some((clip_start, slice));
        }
    }
}
