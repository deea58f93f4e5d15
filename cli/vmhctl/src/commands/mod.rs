//! CLI commands.

mod lifecycle;
mod networks;
mod vms;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use vmh_id::OwnerUuid;
use vmhctl::{Config, NapiClient, VmapiClient};

use crate::output::OutputFormat;

/// vmhctl - drive VM lifecycles against the compute orchestration API.
#[derive(Debug, Parser)]
#[command(name = "vmhctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Config file (defaults to the platform config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Compute orchestration API URL.
    #[arg(long, global = true)]
    vmapi_url: Option<String>,

    /// Network inventory API URL.
    #[arg(long, global = true)]
    napi_url: Option<String>,

    /// Owner UUID to act for.
    #[arg(long, global = true)]
    owner: Option<OwnerUuid>,

    /// Total attempts per request, including the first.
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Inspect and wait on VMs.
    Vms(vms::VmsCommand),

    /// Inspect networks.
    Networks(networks::NetworksCommand),

    /// Run the full create-to-destroy lifecycle against the backends.
    Lifecycle(lifecycle::LifecycleCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let format = match self.format.as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Table,
        };

        let mut config = match &self.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };
        if let Some(url) = self.vmapi_url {
            config.vmapi_url = url;
        }
        if let Some(url) = self.napi_url {
            config.napi_url = url;
        }
        if let Some(owner) = self.owner {
            config.owner_uuid = owner;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.retry_max_attempts = max_attempts;
        }
        config.validate().context("Invalid configuration")?;

        let ctx = CommandContext { config, format };

        match self.command {
            Commands::Vms(cmd) => cmd.run(ctx).await,
            Commands::Networks(cmd) => cmd.run(ctx).await,
            Commands::Lifecycle(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("vmhctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: Config,
    pub format: OutputFormat,
}

impl CommandContext {
    pub fn vmapi(&self) -> Result<VmapiClient> {
        self.config.vmapi()
    }

    pub fn napi(&self) -> Result<NapiClient> {
        self.config.napi()
    }
}

fn display_option(opt: &Option<String>) -> String {
    opt.as_deref().unwrap_or("-").to_string()
}
