use crate::ImageInfo;
use vault_commons::VaultResult;

pub mod compute_driver;
pub mod load_utils;

/// General purpose registers, numbered as in the x86-64 encoding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl core::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = format!("{:?}", self).to_lowercase();
        write!(f, "{}", name)
    }
}

/// Where the integer arguments of a call are passed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallingConvention {
    pub argument_registers: [Register; 4],
    /// bytes between the return address and the first stack passed argument
    pub shadow_space: u64,
}

impl CallingConvention {
    pub const WIN64: CallingConvention = CallingConvention {
        argument_registers: [Register::Rcx, Register::Rdx, Register::R8, Register::R9],
        shadow_space: 0x20,
    };

    /// Offset from the return address slot of the zero based argument `index`,
    /// which has to be one of the stack passed arguments.
    pub const fn stack_argument_offset(&self, index: u64) -> u64 {
        let register_count = self.argument_registers.len() as u64;
        8 + self.shadow_space + 8 * (index - register_count)
    }
}

/// Statistics of a run that reached its end address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    pub instructions: u64,
}

/// Capabilities the extraction core needs from a sandbox that hosts the module.
/// Addresses are absolute addresses in the sandbox's address space.
pub trait ExecutionEnvironment {
    fn image(&self) -> ImageInfo;

    /// Addresses where `pattern` occurs completely inside `[begin, end)`, ascending.
    fn search<'a>(
        &'a self,
        pattern: &'a [u8],
        begin: u64,
        end: u64,
    ) -> Box<dyn Iterator<Item = u64> + 'a>;

    fn read(&self, address: u64, length: usize) -> VaultResult<Vec<u8>>;
    fn write(&mut self, address: u64, data: &[u8]) -> VaultResult<()>;

    /// Zeroed scratch memory from the sandbox heap
    fn allocate(&mut self, length: usize) -> VaultResult<u64>;
    /// Return an allocation of `length` bytes at `address` to the sandbox heap
    fn free(&mut self, address: u64, length: usize);
    fn map(&mut self, address: u64, length: u64) -> VaultResult<()>;
    fn is_mapped(&self, address: u64, length: u64) -> bool;

    fn set_register(&mut self, register: Register, value: u64);
    fn get_register(&self, register: Register) -> u64;
    /// Write a pointer sized value at `offset` bytes above the stack pointer the next run starts with.
    /// Offset 0 is the return address slot.
    fn write_stack_slot(&mut self, offset: u64, value: u64) -> VaultResult<()>;

    /// Execute from `begin` until control reaches `end`, the return address of the run.
    /// Helpers outside of `[begin, end)` that the routine calls keep executing.
    /// A run that faults or executes more than `instruction_limit` instructions fails with
    /// `VaultError::ExecutionFault`.
    fn run(&mut self, begin: u64, end: u64, instruction_limit: u64) -> VaultResult<RunOutcome>;
}
