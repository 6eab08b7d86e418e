//! Configuration view and validation commands — `sysrev config`.

use anyhow::{Context, Result};
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    use sysrev::config::{SysrevConfig, SysrevToml};
    use sysrev::init::get_sysrev_dir;

    let sysrev_dir = get_sysrev_dir(project_dir);
    let config_path = sysrev_dir.join(sysrev::config::CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("sysrev Configuration");
            println!("====================");
            println!();

            let config = SysrevConfig::new(project_dir.to_path_buf())?;
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No sysrev.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();

            println!("Effective values (with env overrides):");
            println!("  store backend = \"{}\"", config.store_backend());
            println!("  store path = \"{}\"", config.store_path().display());
            println!();

            if !config_path.exists() {
                println!("Run 'sysrev config init' to create a sysrev.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No sysrev.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = SysrevToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("{}", console::style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("sysrev.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&sysrev_dir)
                .with_context(|| format!("Failed to create {}", sysrev_dir.display()))?;
            SysrevToml::default().save(&config_path)?;

            println!("Created sysrev.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [retry] base_delay_ms, multiplier, max_retries, max_delay_ms");
            println!("  - [store] backend, path");
            println!("  - [orchestrator] lease_ttl_secs, max_concurrent_runs, rate limits");
            println!("  - [stages.<name>] command, args, env, timeout_secs");
            println!();
        }
    }

    Ok(())
}
