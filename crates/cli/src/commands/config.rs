//! Config Commands

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};

use crate::output::{print_success, OutputFormat};
use testenv_common::ControllerConfig;

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the default configuration
    Init {
        /// Destination file
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn execute(cmd: &ConfigCommands, config_path: &Path, format: OutputFormat) -> Result<i32> {
    match cmd {
        ConfigCommands::Show => {
            let config = ControllerConfig::load(config_path)
                .with_context(|| format!("loading {}", config_path.display()))?;
            config.validate()?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
                OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&config)?),
                _ => print!("{}", config.to_toml()?),
            }
        }
        ConfigCommands::Init { path, force } => {
            init(path, *force)?;
            print_success(&format!("Wrote default configuration to {}", path.display()));
        }
    }
    Ok(0)
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    ControllerConfig::default().save(path)?;
    Ok(())
}
