//! Layout of the request record the routine consumes, packed without padding:
//!
//! | field                 | offset | size |
//! |-----------------------|--------|------|
//! | version               | 0      | 4    |
//! | smbios                | 4      | 256  |
//! | drive serial          | 260    | 64   |
//! | tpm status            | 324    | 1    |
//! | tpm info              | 325    | 901  |
//! | is to go              | 1226   | 1    |
//! | debugger enabled ptr  | 1227   | 4    |
//! | debugger attached ptr | 1231   | 4    |
//! | remainder             | 1235   |      |

pub const RECORD_VERSION: u32 = 4;

pub const VERSION_OFFSET: u64 = 0;
pub const SMBIOS_OFFSET: u64 = VERSION_OFFSET + 4;
pub const SMBIOS_CAPACITY: usize = 256;
pub const DRIVE_SERIAL_OFFSET: u64 = SMBIOS_OFFSET + SMBIOS_CAPACITY as u64;
pub const DRIVE_SERIAL_CAPACITY: usize = 64;
pub const TPM_STATUS_OFFSET: u64 = DRIVE_SERIAL_OFFSET + DRIVE_SERIAL_CAPACITY as u64;
pub const TPM_INFO_OFFSET: u64 = TPM_STATUS_OFFSET + 1;
pub const TPM_INFO_SIZE: u64 = 901;
pub const IS_TO_GO_OFFSET: u64 = TPM_INFO_OFFSET + TPM_INFO_SIZE;
pub const DEBUGGER_ENABLED_OFFSET: u64 = IS_TO_GO_OFFSET + 1;
pub const DEBUGGER_ATTACHED_OFFSET: u64 = DEBUGGER_ENABLED_OFFSET + 4;
pub const REMAINDER_OFFSET: u64 = DEBUGGER_ATTACHED_OFFSET + 4;

/// Debugger byte of the shared user data page
pub const DEBUGGER_CELL_ADDRESS: u32 = 0x7FFE_02D4;
/// Debugger neither enabled nor attached
pub const DEBUGGER_NOT_PRESENT: u32 = 0x10;

/// Caller supplied content of the record
#[derive(Clone, Copy, Debug)]
pub struct RecordInputs<'a> {
    pub smbios: &'a [u8],
    pub drive_serial: &'a [u8],
    pub debugger_enabled: u32,
    pub debugger_attached: u32,
}

impl<'a> RecordInputs<'a> {
    /// Both debugger fields point at the shared debugger cell.
    pub fn new(smbios: &'a [u8], drive_serial: &'a [u8]) -> Self {
        RecordInputs {
            smbios,
            drive_serial,
            debugger_enabled: DEBUGGER_CELL_ADDRESS,
            debugger_attached: DEBUGGER_CELL_ADDRESS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordWrite {
    pub address: u64,
    pub bytes: Vec<u8>,
}

/// Writes that populate the record at `record_base`, in field order.
/// Oversized inputs are truncated to their field, tpm info and the remainder are left alone.
pub fn build(record_base: u64, inputs: &RecordInputs) -> Vec<RecordWrite> {
    let smbios = &inputs.smbios[..inputs.smbios.len().min(SMBIOS_CAPACITY)];
    let drive_serial = &inputs.drive_serial[..inputs.drive_serial.len().min(DRIVE_SERIAL_CAPACITY)];
    let version = RECORD_VERSION.to_le_bytes();
    let debugger_enabled = inputs.debugger_enabled.to_le_bytes();
    let debugger_attached = inputs.debugger_attached.to_le_bytes();
    let fields: [(u64, &[u8]); 7] = [
        (VERSION_OFFSET, &version),
        (SMBIOS_OFFSET, smbios),
        (DRIVE_SERIAL_OFFSET, drive_serial),
        (TPM_STATUS_OFFSET, &[0]),
        (IS_TO_GO_OFFSET, &[0]),
        (DEBUGGER_ENABLED_OFFSET, &debugger_enabled),
        (DEBUGGER_ATTACHED_OFFSET, &debugger_attached),
    ];
    fields
        .into_iter()
        .filter(|(_, bytes)| !bytes.is_empty())
        .map(|(offset, bytes)| RecordWrite {
            address: record_base.wrapping_add(offset),
            bytes: bytes.to_vec(),
        })
        .collect()
}
