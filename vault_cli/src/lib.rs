pub mod config;
pub mod smbios;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{ArgGroup, Parser};
use config::VaultConfig;
use log::debug;
use std::path::PathBuf;
use vault_commons::{VaultError, VaultResult};
use vault_extractor::{
    catalog::SignatureCatalog,
    driver::{InvocationLayout, LicensePayload},
    extractor::Secret,
    record::DRIVE_SERIAL_CAPACITY,
    ExtractionInputs, Extractor,
};
use vault_machine::machine_config::create_environment;

/// Recover the device secret computed by the vault routine of a kernel module
#[derive(Parser, Debug)]
#[command(name = "vault_extract", version)]
#[command(group(ArgGroup::new("system").required(true).args(["smbios", "smbios_tables"])))]
#[command(group(ArgGroup::new("serial").required(true).args(["driveser", "drive_serial"])))]
pub struct CliArgs {
    /// Module image containing the vault routine
    #[arg(long, env = "VAULT_MODULE", value_hint = clap::ValueHint::FilePath)]
    pub module: PathBuf,
    /// JSON signature catalog matching the module version
    #[arg(long, env = "VAULT_CATALOG", value_hint = clap::ValueHint::FilePath)]
    pub catalog: PathBuf,
    /// Base64 encoded encrypted device license (4094 bytes)
    #[arg(long)]
    pub license: String,
    /// Base64 encoded SMBIOS system struct
    #[arg(long)]
    pub smbios: Option<String>,
    /// Raw SMBIOS table dump to take the system struct from
    #[arg(long, value_name = "PATH", value_hint = clap::ValueHint::FilePath)]
    pub smbios_tables: Option<PathBuf>,
    /// Base64 encoded NUL terminated root drive serial number
    #[arg(long)]
    pub driveser: Option<String>,
    /// Root drive serial number as text
    #[arg(long, value_name = "SERIAL")]
    pub drive_serial: Option<String>,
    /// Ceiling on the instructions executed inside the routine
    #[arg(long)]
    pub instruction_limit: Option<u64>,
    /// Load address for modules that are not PE images
    #[arg(long, value_parser = parse_address)]
    pub raw_base: Option<u64>,
}

fn parse_address(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed.map_err(|err| format!("invalid address `{}`: {}", text, err))
}

fn decode_base64(field: &str, text: &str) -> VaultResult<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .map_err(|err| VaultError::MalformedInput(format!("{} is not valid base64: {}", field, err)))
}

/// UTF-8 bytes with a NUL terminator, cut to the record field
pub fn drive_serial_from_text(serial: &str) -> Vec<u8> {
    let mut bytes = serial.as_bytes().to_vec();
    bytes.push(0);
    bytes.truncate(DRIVE_SERIAL_CAPACITY);
    bytes
}

/// Caller inputs decoded from the command line
#[derive(Debug, PartialEq, Eq)]
pub struct DecodedInputs {
    pub license: LicensePayload,
    pub smbios: Vec<u8>,
    pub drive_serial: Vec<u8>,
}

impl DecodedInputs {
    pub fn from_args(args: &CliArgs) -> VaultResult<Self> {
        let license = LicensePayload::new(&decode_base64("license", &args.license)?)?;
        let smbios = match (&args.smbios, &args.smbios_tables) {
            (Some(smbios), _) => decode_base64("smbios", smbios)?,
            (None, Some(path)) => {
                let tables = std::fs::read(path).map_err(|err| {
                    VaultError::FileError(format!("{}: {}", path.display(), err))
                })?;
                smbios::system_struct(&tables)?
            }
            (None, None) => {
                return Err(VaultError::MalformedInput(String::from(
                    "no smbios system struct given",
                )))
            }
        };
        let drive_serial = match (&args.driveser, &args.drive_serial) {
            (Some(driveser), _) => decode_base64("driveser", driveser)?,
            (None, Some(text)) => drive_serial_from_text(text),
            (None, None) => {
                return Err(VaultError::MalformedInput(String::from(
                    "no drive serial given",
                )))
            }
        };
        debug!(
            "inputs: license {} bytes, smbios {} bytes, drive serial {} bytes",
            license.as_bytes().len(),
            smbios.len(),
            drive_serial.len()
        );
        Ok(DecodedInputs {
            license,
            smbios,
            drive_serial,
        })
    }

    pub fn extraction_inputs(&self) -> ExtractionInputs<'_> {
        ExtractionInputs {
            license: self.license.as_bytes(),
            smbios: &self.smbios,
            drive_serial: &self.drive_serial,
        }
    }
}

pub fn run(args: &CliArgs, config: &VaultConfig) -> VaultResult<Secret> {
    let inputs = DecodedInputs::from_args(args)?;
    let catalog = SignatureCatalog::load(&args.catalog)?;
    let mut machine = config.machine;
    if let Some(raw_base) = args.raw_base {
        machine.raw_image_base = raw_base;
    }
    let mut environment = create_environment(config.engine, &args.module, &machine)?;
    let layout = InvocationLayout {
        instruction_limit: args.instruction_limit.unwrap_or(config.instruction_limit),
        ..InvocationLayout::default()
    };
    Extractor::with_layout(&catalog, layout).run(environment.as_mut(), &inputs.extraction_inputs())
}
