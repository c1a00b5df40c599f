pub mod function_driver;
pub mod machine_config;
pub mod memory_domain;

pub const PAGE_SIZE: u64 = 1 << 12;

pub fn page_align_down(address: u64) -> u64 {
    address & !(PAGE_SIZE - 1)
}

/// Rounds up to the next page boundary, `None` if that would leave the address space.
pub fn page_align_up(address: u64) -> Option<u64> {
    address
        .checked_add(PAGE_SIZE - 1)
        .map(|rounded| rounded & !(PAGE_SIZE - 1))
}

/// Contiguous range of the address space occupied by the loaded module
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub base: u64,
    pub size: u64,
}

impl ImageInfo {
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }
}
