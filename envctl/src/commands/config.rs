use anyhow::{bail, Result};
use clap::Subcommand;
use config_loader::{ConfigError, ConfigLoader};
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate a worker config file against the schema
    Validate {
        /// Config file (defaults to $ENVCTL_CONFIG)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
}

pub fn handle(cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Validate { file } => validate(file),
    }
}

fn validate(file: Option<PathBuf>) -> Result<()> {
    let loader = ConfigLoader::new();
    let Some(path) = file.or_else(|| loader.config_path().map(PathBuf::from)) else {
        bail!("No config file given and ENVCTL_CONFIG is not set");
    };

    match loader.validate_config_file(&path) {
        Ok(()) => {
            println!("✓ Valid worker config: {}", path.display());
            Ok(())
        }
        Err(ConfigError::ValidationFailed { errors }) => {
            eprintln!("✗ Invalid worker config: {}", path.display());
            for error in &errors {
                let pointer = if error.json_pointer.is_empty() {
                    "/"
                } else {
                    error.json_pointer.as_str()
                };
                eprintln!("  {}: {}", pointer, error.message);
            }
            bail!("{} validation error(s)", errors.len());
        }
        Err(e) => Err(e.into()),
    }
}
