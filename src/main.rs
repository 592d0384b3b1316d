use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "soak")]
#[command(version, about = "Drive a multi-stage pipeline through many unattended cycles")]
pub struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit JSON logs on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to soak.toml
    #[arg(short, long, default_value = "soak.toml")]
    pub config: PathBuf,

    /// Override [run] cycles
    #[arg(long)]
    pub cycles: Option<u32>,

    /// Override [run] artifact_dir
    #[arg(long)]
    pub artifact_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a fresh run
    Run(RunArgs),

    /// Continue a run from its last checkpoint
    Resume(RunArgs),

    /// Show progress of a run directory
    Status {
        /// Run directory (artifact_dir)
        #[arg(short, long)]
        dir: PathBuf,
    },

    /// Rebuild report.md and report.json for a run directory
    Report {
        /// Run directory (artifact_dir)
        #[arg(short, long)]
        dir: PathBuf,

        /// Print the JSON report instead of markdown
        #[arg(long)]
        json: bool,
    },

    /// Inspect or create configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Load and validate a config file
    Validate {
        #[arg(short, long, default_value = "soak.toml")]
        config: PathBuf,
    },
    /// Print the effective config after defaults are applied
    Show {
        #[arg(short, long, default_value = "soak.toml")]
        config: PathBuf,
    },
    /// Write a starter soak.toml
    Init {
        #[arg(default_value = "soak.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&cli, args, false).await?,
        Commands::Resume(args) => cmd::cmd_run(&cli, args, true).await?,
        Commands::Status { dir } => cmd::cmd_status(&cli, dir)?,
        Commands::Report { dir, json } => cmd::cmd_report(&cli, dir, *json)?,
        Commands::Config { command } => cmd::cmd_config(command)?,
    }

    Ok(())
}
