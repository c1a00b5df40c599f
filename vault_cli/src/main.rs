use clap::Parser;
use log::{debug, error};
use std::process::ExitCode;
use vault_cli::{config::VaultConfig, CliArgs};

fn main() -> ExitCode {
    let args = CliArgs::parse();

    // check if there is a configuration file
    let config = match VaultConfig::get_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let default_level = match config.log_level {
        Some(level) => level.to_string(),
        None if cfg!(debug_assertions) => String::from("debug"),
        None => String::from("warn"),
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
    debug!("config: {:?}", config);

    match vault_cli::run(&args, &config) {
        Ok(secret) => {
            println!("{}", secret);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("extraction failed: {:?}", err);
            eprintln!("Error: {}", err);
            ExitCode::FAILURE
        }
    }
}
