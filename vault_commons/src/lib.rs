pub mod range_pool;
pub mod records;

use thiserror::Error;

/// Reasons a bounded run of the routine stopped abnormally
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FaultKind {
    /// data read from an address that is not mapped
    #[error("invalid read at {0:#x}")]
    InvalidRead(u64),
    /// data write to an address that is not mapped
    #[error("invalid write at {0:#x}")]
    InvalidWrite(u64),
    /// instruction fetch from an unmapped address
    #[error("unmapped instruction fetch at {0:#x}")]
    UnmappedFetch(u64),
    /// bytes at the address do not decode to a valid instruction
    #[error("undecodable instruction at {0:#x}")]
    InvalidInstruction(u64),
    /// the backend does not model this instruction
    #[error("unsupported instruction `{mnemonic}` at {address:#x}")]
    UnsupportedInstruction { address: u64, mnemonic: String },
    /// the routine did not return within the configured ceiling
    #[error("instruction limit of {0} exceeded")]
    InstructionLimit(u64),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VaultError {
    // locator errors, the module does not look like the catalog expects
    /// no signature of the list matched exactly once
    #[error("wrong module version: no match for {what} signatures")]
    LocatorNotFound { what: String },
    /// the last usable signature matched more than once
    #[error("wrong module version: ambiguous {what} signature, candidates {candidates:x?}")]
    LocatorAmbiguous { what: String, candidates: Vec<u64> },
    /// the relative operand could not be read or the address computation overflowed
    #[error("could not resolve relative operand at {address:#x}")]
    LayoutArithmeticFailure { address: u64 },
    // execution errors
    /// the sandbox faulted while running the routine
    #[error("sandbox fault: {0}")]
    ExecutionFault(FaultKind),
    // input errors
    /// license payload has the wrong size
    #[error("bad input length: license payload is {actual} bytes, expected {expected}")]
    InputLengthMismatch { expected: usize, actual: usize },
    /// an input could not be decoded
    #[error("malformed input: {0}")]
    MalformedInput(String),
    // address space errors outside of a run
    /// tried to read outside of the mapped memory
    #[error("read of unmapped memory at {0:#x}")]
    InvalidRead(u64),
    /// tried to write outside of the mapped memory
    #[error("write to unmapped memory at {0:#x}")]
    InvalidWrite(u64),
    /// new mapping collides with an existing one
    #[error("mapping at {0:#x} overlaps an existing region")]
    MappingOverlap(u64),
    /// scratch heap has no range left that fits the request
    #[error("scratch heap exhausted")]
    OutOfMemory,
    // configuration errors
    /// signature catalog could not be parsed or violates its invariants
    #[error("malformed signature catalog: {0}")]
    MalformedCatalog(String),
    /// machine or tool settings are unusable
    #[error("invalid configuration: {0}")]
    ConfigError(String),
    /// module could not be parsed or mapped
    #[error("malformed module image: {0}")]
    MalformedImage(String),
    /// error while performing IO on a file
    #[error("file error: {0}")]
    FileError(String),
    // metering errors
    /// Call to record phases were not called in order
    #[error("phase {1:?} recorded before {0:?}")]
    RecordSequencingFailure(records::RecordPoint, records::RecordPoint),
}

impl From<FaultKind> for VaultError {
    fn from(fault: FaultKind) -> Self {
        VaultError::ExecutionFault(fault)
    }
}

pub type VaultResult<T> = std::result::Result<T, VaultError>;
