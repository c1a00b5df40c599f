use log::{warn, LevelFilter};
use serde::Deserialize;
use std::str::FromStr;
use vault_commons::{VaultError, VaultResult};
use vault_machine::machine_config::{EngineType, MachineConfig};

#[derive(Debug, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "loglevel_default")]
    pub log_level: Option<LevelFilter>,
    #[serde(default = "engine_default")]
    pub engine: EngineType,
    #[serde(default = "instruction_limit_default")]
    pub instruction_limit: u64,
    /// sandbox memory placement
    #[serde(flatten)]
    pub machine: MachineConfig,
}

fn loglevel_default() -> Option<LevelFilter> {
    return std::env::var("RUST_LOG")
        .ok()
        .and_then(|env_string| LevelFilter::from_str(&env_string).ok());
}

fn engine_default() -> EngineType {
    return EngineType::Interpreter;
}

fn instruction_limit_default() -> u64 {
    return std::env::var("VAULT_INSTRUCTION_LIMIT")
        .ok()
        .and_then(|limit| limit.parse::<u64>().ok())
        .unwrap_or(1_000_000);
}

impl VaultConfig {
    pub fn from_json(data: &[u8]) -> VaultResult<Self> {
        serde_json::from_slice(data)
            .map_err(|err| VaultError::ConfigError(err.to_string()))
    }

    pub fn get_config() -> VaultResult<VaultConfig> {
        // get config path if it exists and if not use current working directory
        let config_path =
            std::env::var("VAULT_CONFIG").unwrap_or(String::from("./vault.json"));
        let config_buff = std::fs::read(&config_path)
            .map_or_else(
                |err| {
                    match err.kind() {
                        std::io::ErrorKind::NotFound => (),
                        err => {
                            warn!(
                                "Encountered error while searching for config file at {}: {:?}",
                                config_path, err
                            );
                            return None;
                        }
                    };
                    if let Ok(mut exec_path) = std::env::current_exe() {
                        exec_path.pop();
                        exec_path.push("vault.json");
                        match std::fs::read(&exec_path) {
                            Ok(buffer) => return Some(buffer),
                            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                            Err(err) => warn!(
                                "Encountered error while searching config file in exec path at {:?}: {:?}",
                                exec_path, err
                            ),
                        };
                    }
                    return None;
                },
                |ok| Some(ok),
            )
            .unwrap_or(String::from("{}").into_bytes());
        return Self::from_json(&config_buff);
    }
}

#[test]
fn empty_config_uses_defaults() {
    let config = VaultConfig::from_json(b"{}").expect("empty object is a valid config");
    assert_eq!(EngineType::Interpreter, config.engine);
    assert_eq!(MachineConfig::default(), config.machine);
}

#[test]
fn config_overrides_machine_layout() {
    let config = VaultConfig::from_json(
        br#"{"log_level": "trace", "instruction_limit": 5000, "raw_image_base": 4096, "heap_size": 65536}"#,
    )
    .expect("config is valid");
    assert_eq!(Some(LevelFilter::Trace), config.log_level);
    assert_eq!(5000, config.instruction_limit);
    assert_eq!(0x1000, config.machine.raw_image_base);
    assert_eq!(0x1_0000, config.machine.heap_size);
    assert_eq!(MachineConfig::default().stack_base, config.machine.stack_base);
}

#[test]
fn unknown_engine_is_rejected() {
    match VaultConfig::from_json(br#"{"engine": "unicorn"}"#) {
        Err(VaultError::ConfigError(_)) => (),
        other => panic!("expected config error, got {:?}", other),
    }
}
