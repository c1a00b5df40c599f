use vault_commons::VaultResult;
use vault_machine::function_driver::ExecutionEnvironment;

pub const SECRET_SIZE: usize = 16;

/// Defined front part of the secret buffer after the routine ran
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Secret(pub [u8; SECRET_SIZE]);

impl Secret {
    pub fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl core::fmt::Display for Secret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

pub fn extract(environment: &dyn ExecutionEnvironment, secret_buffer: u64) -> VaultResult<Secret> {
    let bytes = environment.read(secret_buffer, SECRET_SIZE)?;
    let mut secret = [0u8; SECRET_SIZE];
    secret.copy_from_slice(&bytes);
    Ok(Secret(secret))
}

#[test]
fn hex_is_lowercase_and_padded() {
    let mut bytes = [0u8; SECRET_SIZE];
    bytes[0] = 0x0A;
    bytes[15] = 0xFF;
    assert_eq!(
        "0a0000000000000000000000000000ff",
        Secret(bytes).to_string()
    );
}
