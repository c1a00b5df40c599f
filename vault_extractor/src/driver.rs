use crate::record::{RecordWrite, DEBUGGER_CELL_ADDRESS, DEBUGGER_NOT_PRESENT};
use log::debug;
use vault_commons::{VaultError, VaultResult};
use vault_machine::{
    function_driver::{CallingConvention, ExecutionEnvironment, RunOutcome},
    page_align_down, PAGE_SIZE,
};

pub const LICENSE_PAYLOAD_SIZE: usize = 4094;

/// Encrypted device license, always exactly [`LICENSE_PAYLOAD_SIZE`] bytes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LicensePayload(Vec<u8>);

impl LicensePayload {
    pub fn new(data: &[u8]) -> VaultResult<Self> {
        if data.len() != LICENSE_PAYLOAD_SIZE {
            return Err(VaultError::InputLengthMismatch {
                expected: LICENSE_PAYLOAD_SIZE,
                actual: data.len(),
            });
        }
        Ok(LicensePayload(data.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// How the routine expects its arguments
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvocationLayout {
    pub convention: CallingConvention,
    /// first argument
    pub selector: u64,
    /// second argument points this far into the payload copy
    pub key_offset: u64,
    /// fourth argument points this far into the payload copy
    pub blob_offset: u64,
    pub secret_size: usize,
    pub cache_size: usize,
    /// stack offset of the cache pointer, counted from the return address slot
    pub cache_slot: u64,
    pub instruction_limit: u64,
}

impl Default for InvocationLayout {
    fn default() -> Self {
        InvocationLayout {
            convention: CallingConvention::WIN64,
            selector: 0,
            key_offset: 4,
            blob_offset: 516,
            secret_size: 32,
            cache_size: 64,
            // sixth argument
            cache_slot: CallingConvention::WIN64.stack_argument_offset(5),
            instruction_limit: 1_000_000,
        }
    }
}

/// Entry of the routine and the length of the window it may execute in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoutineWindow {
    pub entry: u64,
    pub bound: u64,
}

impl RoutineWindow {
    pub fn end(&self) -> VaultResult<u64> {
        self.entry
            .checked_add(self.bound)
            .ok_or(VaultError::LayoutArithmeticFailure {
                address: self.entry,
            })
    }
}

/// Scratch memories start at multiples of this inside their shared heap block
const SCRATCH_ALIGNMENT: usize = 16;

/// Sandbox heap block holding the secret buffer, the cache and the payload copy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Scratch {
    base: u64,
    length: usize,
    secret_buffer: u64,
    cache: u64,
    payload_copy: u64,
}

impl Scratch {
    fn allocate(
        environment: &mut dyn ExecutionEnvironment,
        layout: &InvocationLayout,
        payload_size: usize,
    ) -> VaultResult<Self> {
        let cache_offset = layout.secret_size.next_multiple_of(SCRATCH_ALIGNMENT);
        let payload_offset = cache_offset + layout.cache_size.next_multiple_of(SCRATCH_ALIGNMENT);
        let length = payload_offset + payload_size;
        let base = environment.allocate(length)?;
        Ok(Scratch {
            base,
            length,
            secret_buffer: base,
            cache: base + cache_offset as u64,
            payload_copy: base + payload_offset as u64,
        })
    }
}

/// Routine that returned, its secret buffer stays allocated until [`Invocation::release`]
#[derive(Debug, PartialEq, Eq)]
pub struct Invocation {
    pub secret_buffer: u64,
    pub outcome: RunOutcome,
    scratch: Scratch,
}

impl Invocation {
    /// Hand the scratch memory of the invocation back to the sandbox heap.
    pub fn release(self, environment: &mut dyn ExecutionEnvironment) {
        environment.free(self.scratch.base, self.scratch.length);
    }
}

/// Make sure the debugger cell exists and reports no debugger.
pub fn prepare_debugger_cell(environment: &mut dyn ExecutionEnvironment) -> VaultResult<()> {
    let address = u64::from(DEBUGGER_CELL_ADDRESS);
    if !environment.is_mapped(address, 4) {
        debug!("mapping shared data page for debugger cell {:#x}", address);
        environment.map(page_align_down(address), PAGE_SIZE)?;
    }
    environment.write(address, &DEBUGGER_NOT_PRESENT.to_le_bytes())
}

/// Populate the record and scratch buffers, set up the call and run the routine
/// until it returns. On failure all scratch memory is released again.
pub fn invoke(
    environment: &mut dyn ExecutionEnvironment,
    routine: RoutineWindow,
    record_writes: &[RecordWrite],
    payload: &LicensePayload,
    layout: &InvocationLayout,
) -> VaultResult<Invocation> {
    let end = routine.end()?;
    let scratch = Scratch::allocate(environment, layout, payload.as_bytes().len())?;
    debug!(
        "secret buffer {:#x}, payload copy {:#x}, cache {:#x}",
        scratch.secret_buffer, scratch.payload_copy, scratch.cache
    );
    match call(environment, routine.entry, end, &scratch, record_writes, payload, layout) {
        Ok(outcome) => Ok(Invocation {
            secret_buffer: scratch.secret_buffer,
            outcome,
            scratch,
        }),
        Err(err) => {
            environment.free(scratch.base, scratch.length);
            Err(err)
        }
    }
}

fn call(
    environment: &mut dyn ExecutionEnvironment,
    entry: u64,
    end: u64,
    scratch: &Scratch,
    record_writes: &[RecordWrite],
    payload: &LicensePayload,
    layout: &InvocationLayout,
) -> VaultResult<RunOutcome> {
    environment.write(scratch.payload_copy, payload.as_bytes())?;
    for write in record_writes {
        environment.write(write.address, &write.bytes)?;
    }
    prepare_debugger_cell(environment)?;

    let key = scratch.payload_copy + layout.key_offset;
    let blob = scratch.payload_copy + layout.blob_offset;
    let [first, second, third, fourth] = layout.convention.argument_registers;
    environment.set_register(first, layout.selector);
    environment.set_register(second, key);
    environment.set_register(third, scratch.secret_buffer);
    environment.set_register(fourth, blob);
    environment.write_stack_slot(layout.cache_slot, scratch.cache)?;

    debug!(
        "running routine {:#x}..{:#x}, {}={:#x} {}={:#x} {}={:#x} {}={:#x}",
        entry,
        end,
        first,
        layout.selector,
        second,
        key,
        third,
        scratch.secret_buffer,
        fourth,
        blob
    );
    environment.run(entry, end, layout.instruction_limit)
}
