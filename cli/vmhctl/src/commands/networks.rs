//! Network commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::Tabled;
use vmhctl::{Network, NetworkFilter};

use crate::output::print_output;

use super::{display_option, CommandContext};

/// Network commands.
#[derive(Debug, Args)]
pub struct NetworksCommand {
    #[command(subcommand)]
    command: NetworksSubcommand,
}

#[derive(Debug, Subcommand)]
enum NetworksSubcommand {
    /// List networks.
    List(ListNetworksArgs),
}

#[derive(Debug, Args)]
struct ListNetworksArgs {
    /// Only networks usable by the configured owner.
    #[arg(long)]
    mine: bool,

    /// Only networks with this name.
    #[arg(long)]
    name: Option<String>,
}

impl NetworksCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            NetworksSubcommand::List(args) => list_networks(ctx, args).await,
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct NetworkRow {
    #[tabled(rename = "UUID")]
    uuid: String,

    #[tabled(rename = "Name", display = "display_option")]
    name: Option<String>,
}

impl From<Network> for NetworkRow {
    fn from(network: Network) -> Self {
        Self {
            uuid: network.uuid.to_string(),
            name: network.name,
        }
    }
}

async fn list_networks(ctx: CommandContext, args: ListNetworksArgs) -> Result<()> {
    let napi = ctx.napi()?;
    let filter = NetworkFilter {
        owner_uuid: args.mine.then_some(ctx.config.owner_uuid),
        name: args.name,
    };

    let rows: Vec<NetworkRow> = napi
        .list_networks(&filter)
        .await?
        .into_iter()
        .map(NetworkRow::from)
        .collect();

    print_output(&rows, ctx.format);
    Ok(())
}
