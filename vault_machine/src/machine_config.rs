use crate::function_driver::ExecutionEnvironment;
use serde::Deserialize;
use std::path::Path;
use vault_commons::{VaultError, VaultResult};

/// Backends that can host the module
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    #[cfg(feature = "interpreter")]
    Interpreter,
}

/// Placement of the sandbox owned memory, independent of the module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub heap_base: u64,
    pub heap_size: u64,
    pub stack_base: u64,
    pub stack_size: u64,
    /// where files that are not PE images get mapped
    pub raw_image_base: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            heap_base: 0x5_0000_0000,
            heap_size: 0x10_0000,
            stack_base: 0x7FF0_0000,
            stack_size: 0x2_0000,
            raw_image_base: 0x1_C000_0000,
        }
    }
}

pub fn create_environment(
    engine_type: EngineType,
    module_path: &Path,
    config: &MachineConfig,
) -> VaultResult<Box<dyn ExecutionEnvironment>> {
    match engine_type {
        #[cfg(feature = "interpreter")]
        EngineType::Interpreter => {
            let environment =
                crate::function_driver::compute_driver::interpreter::InterpreterEnvironment::load(
                    module_path,
                    config,
                )?;
            Ok(Box::new(environment))
        }
        #[allow(unreachable_patterns)]
        _ => Err(VaultError::MalformedImage(format!(
            "no backend available to load {}",
            module_path.display()
        ))),
    }
}
