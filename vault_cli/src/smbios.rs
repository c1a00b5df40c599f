//! Extraction of the System Information structure from a raw SMBIOS table dump.
//!
//! Every structure starts with a 4 byte header (type, formatted length, handle) followed
//! by the rest of the formatted area and a string set terminated by two NUL bytes.

use log::{debug, trace};
use vault_commons::{VaultError, VaultResult};

pub const SYSTEM_INFORMATION: u8 = 1;
pub const END_OF_TABLE: u8 = 127;
/// Longest system struct the record can hold
pub const MAX_SYSTEM_STRUCT: usize = 256;

const HEADER_LENGTH: usize = 4;

fn malformed(reason: String) -> VaultError {
    VaultError::MalformedInput(format!("smbios tables: {}", reason))
}

/// Formatted area and string set of the first type 1 structure, truncated to
/// [`MAX_SYSTEM_STRUCT`] bytes.
pub fn system_struct(tables: &[u8]) -> VaultResult<Vec<u8>> {
    let mut current = 0usize;
    while current + HEADER_LENGTH <= tables.len() {
        let table_type = tables[current];
        let formatted_length = usize::from(tables[current + 1]);
        if formatted_length < HEADER_LENGTH {
            return Err(malformed(format!(
                "structure at {:#x} has formatted length {}",
                current, formatted_length
            )));
        }
        let strings_start = current + formatted_length;
        let strings_end = tables
            .get(strings_start..)
            .and_then(|rest| rest.windows(2).position(|pair| pair == [0, 0]))
            .map(|position| strings_start + position + 2)
            .ok_or_else(|| {
                malformed(format!("structure at {:#x} has no string set terminator", current))
            })?;
        trace!(
            "smbios structure type {} at {:#x}, formatted {} bytes, strings end at {:#x}",
            table_type,
            current,
            formatted_length,
            strings_end
        );
        if table_type == SYSTEM_INFORMATION {
            let mut system = tables[current..strings_end].to_vec();
            system.truncate(MAX_SYSTEM_STRUCT);
            debug!("found system struct at {:#x}, {} bytes", current, system.len());
            return Ok(system);
        }
        if table_type == END_OF_TABLE {
            break;
        }
        current = strings_end;
    }
    Err(malformed(String::from("no system information structure")))
}
