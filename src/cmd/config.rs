use crate::ConfigCommands;
use anyhow::{Context, Result};
use soak::config::{Overrides, SoakToml};

pub fn cmd_config(command: &ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config } => {
            let toml = SoakToml::load(config, &Overrides::default())
                .with_context(|| format!("Invalid configuration in {}", config.display()))?;
            println!("{} is valid", config.display());
            println!(
                "  {} cycles x {} stages, {} attempts per cycle, checkpoint every {}",
                toml.run.cycles,
                toml.stages.len(),
                toml.run.attempt_budget(),
                toml.run.checkpoint_interval
            );
            let deps = &toml.dependencies;
            let mut configured = Vec::new();
            if deps.database.is_some() {
                configured.push("database");
            }
            if deps.llm_api.is_some() {
                configured.push("llm_api");
            }
            if deps.search.is_some() {
                configured.push("search");
            }
            if deps.vector_index.is_some() {
                configured.push("vector_index");
            }
            if deps.remote_shell.is_some() {
                configured.push("remote_shell");
            }
            if configured.is_empty() {
                println!("  dependencies: none");
            } else {
                println!("  dependencies: {}", configured.join(", "));
            }
        }
        ConfigCommands::Show { config } => {
            let toml = SoakToml::load(config, &Overrides::default())
                .with_context(|| format!("Invalid configuration in {}", config.display()))?;
            let rendered = toml::to_string_pretty(&toml).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        ConfigCommands::Init { path, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            std::fs::write(path, SoakToml::template())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
