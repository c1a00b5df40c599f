use vault_commons::{VaultError, VaultResult};
use vault_machine::function_driver::ExecutionEnvironment;

/// Size of a 32 bit relative operand
pub const OPERAND_WIDTH: u64 = 4;

/// Absolute address targeted by the rip relative operand found `operand_offset` bytes
/// after `match_address`. The signed little endian displacement is measured from the
/// first byte after the operand.
pub fn resolve(
    environment: &dyn ExecutionEnvironment,
    match_address: u64,
    operand_offset: u64,
) -> VaultResult<u64> {
    let failure = VaultError::LayoutArithmeticFailure {
        address: match_address,
    };
    let operand_address = match_address
        .checked_add(operand_offset)
        .ok_or_else(|| failure.clone())?;
    let bytes = environment
        .read(operand_address, OPERAND_WIDTH as usize)
        .map_err(|_| failure.clone())?;
    let displacement = i32::from_le_bytes(bytes.try_into().map_err(|_| failure.clone())?);
    return operand_address
        .checked_add(OPERAND_WIDTH)
        .and_then(|next| next.checked_add_signed(i64::from(displacement)))
        .ok_or(failure);
}
