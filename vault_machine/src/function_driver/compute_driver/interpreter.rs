use crate::{
    function_driver::{load_utils, ExecutionEnvironment, Register, RunOutcome},
    machine_config::MachineConfig,
    memory_domain::AddressSpace,
    ImageInfo,
};
use iced_x86::{Decoder, DecoderError, DecoderOptions};
use log::{debug, trace};
use std::path::Path;
use vault_commons::{FaultKind, VaultError, VaultResult};

mod cpu;

use cpu::Cpu;

/// Longest possible x86 instruction
const MAX_INSTRUCTION_LENGTH: usize = 15;
/// Space kept free above the entry stack pointer for return address, home space and stack arguments
const STACK_ARGUMENT_AREA: u64 = 0x1000;

/// Sandbox that interprets the module's x86-64 code on a private address space.
pub struct InterpreterEnvironment {
    memory: AddressSpace,
    image: ImageInfo,
    cpu: Cpu,
    /// stack pointer at routine entry, pointing at the return address slot
    entry_stack_pointer: u64,
}

impl InterpreterEnvironment {
    /// Build an environment around an address space that already holds the image.
    pub fn new(
        mut memory: AddressSpace,
        image: ImageInfo,
        config: &MachineConfig,
    ) -> VaultResult<Self> {
        // at function entry the stack is 16 byte aligned minus the pushed return address
        let entry_stack_pointer = config
            .stack_base
            .checked_add(config.stack_size)
            .and_then(|top| top.checked_sub(STACK_ARGUMENT_AREA))
            .and_then(|top| (top & !0xF).checked_sub(8))
            .filter(|pointer| *pointer >= config.stack_base)
            .ok_or_else(|| {
                VaultError::ConfigError(format!(
                    "stack {:#x} of size {:#x} cannot hold the argument area",
                    config.stack_base, config.stack_size
                ))
            })?;
        memory.init_heap(config.heap_base, config.heap_size)?;
        memory.map(config.stack_base, config.stack_size)?;
        let mut cpu = Cpu::default();
        cpu.gpr[Register::Rsp as usize] = entry_stack_pointer;
        debug!(
            "interpreter ready, image {:#x}..{:#x}, entry stack pointer {:#x}",
            image.base,
            image.end(),
            entry_stack_pointer
        );
        Ok(InterpreterEnvironment {
            memory,
            image,
            cpu,
            entry_stack_pointer,
        })
    }

    pub fn load(module_path: &Path, config: &MachineConfig) -> VaultResult<Self> {
        let file = load_utils::load_u8_from_file(module_path)?;
        Self::from_bytes(&file, config)
    }

    pub fn from_bytes(file: &[u8], config: &MachineConfig) -> VaultResult<Self> {
        let mut memory = AddressSpace::new();
        let image = load_utils::load_image(&mut memory, file, config.raw_image_base)?;
        Self::new(memory, image, config)
    }

    fn fetch(&self, address: u64) -> Result<iced_x86::Instruction, FaultKind> {
        let bytes = self.memory.read_available(address, MAX_INSTRUCTION_LENGTH);
        if bytes.is_empty() {
            return Err(FaultKind::UnmappedFetch(address));
        }
        let mut decoder = Decoder::with_ip(64, &bytes, address, DecoderOptions::NONE);
        let instruction = decoder.decode();
        match decoder.last_error() {
            DecoderError::None => Ok(instruction),
            DecoderError::NoMoreBytes => Err(FaultKind::UnmappedFetch(address + bytes.len() as u64)),
            _ => Err(FaultKind::InvalidInstruction(address)),
        }
    }
}

impl ExecutionEnvironment for InterpreterEnvironment {
    fn image(&self) -> ImageInfo {
        self.image
    }

    fn search<'a>(
        &'a self,
        pattern: &'a [u8],
        begin: u64,
        end: u64,
    ) -> Box<dyn Iterator<Item = u64> + 'a> {
        Box::new(self.memory.search(pattern, begin, end))
    }

    fn read(&self, address: u64, length: usize) -> VaultResult<Vec<u8>> {
        self.memory.read(address, length)
    }

    fn write(&mut self, address: u64, data: &[u8]) -> VaultResult<()> {
        self.memory.write(address, data)
    }

    fn allocate(&mut self, length: usize) -> VaultResult<u64> {
        self.memory.allocate(length)
    }

    fn free(&mut self, address: u64, length: usize) {
        self.memory.free(address, length)
    }

    fn map(&mut self, address: u64, length: u64) -> VaultResult<()> {
        self.memory.map(address, length)
    }

    fn is_mapped(&self, address: u64, length: u64) -> bool {
        self.memory.is_mapped(address, length)
    }

    fn set_register(&mut self, register: Register, value: u64) {
        self.cpu.gpr[register as usize] = value;
    }

    fn get_register(&self, register: Register) -> u64 {
        self.cpu.gpr[register as usize]
    }

    fn write_stack_slot(&mut self, offset: u64, value: u64) -> VaultResult<()> {
        let address = self
            .entry_stack_pointer
            .checked_add(offset)
            .ok_or(VaultError::InvalidWrite(self.entry_stack_pointer))?;
        self.memory.write(address, &value.to_le_bytes())
    }

    fn run(&mut self, begin: u64, end: u64, instruction_limit: u64) -> VaultResult<RunOutcome> {
        // returning from the routine lands on the window end
        self.cpu.gpr[Register::Rsp as usize] = self.entry_stack_pointer;
        self.write_stack_slot(0, end)?;
        self.cpu.rip = begin;
        let mut executed = 0u64;
        while self.cpu.rip != end {
            if executed >= instruction_limit {
                return Err(FaultKind::InstructionLimit(instruction_limit).into());
            }
            let instruction = self.fetch(self.cpu.rip)?;
            trace!("{:#x}: {:?}", self.cpu.rip, instruction.mnemonic());
            self.cpu.rip = instruction.next_ip();
            self.cpu.execute(&instruction, &mut self.memory)?;
            executed += 1;
        }
        debug!(
            "returned from {:#x} to {:#x} after {} instructions",
            begin, end, executed
        );
        Ok(RunOutcome {
            instructions: executed,
        })
    }
}
