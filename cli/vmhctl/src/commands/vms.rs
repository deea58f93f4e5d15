//! VM commands.

use std::time::Duration;

use anyhow::Result;
use clap::{ArgGroup, Args, Subcommand};
use serde::Serialize;
use tabled::Tabled;
use vmh_converge::WaitOptions;
use vmh_id::VmUuid;
use vmhctl::wait::{alias_is, state_is};
use vmhctl::{VmFilter, VmIdentity, VmSnapshot, VmState};

use crate::output::{format_elapsed, print_output, print_single, print_success, OutputFormat};

use super::{display_option, CommandContext};

/// VM commands.
#[derive(Debug, Args)]
pub struct VmsCommand {
    #[command(subcommand)]
    command: VmsSubcommand,
}

#[derive(Debug, Subcommand)]
enum VmsSubcommand {
    /// List VMs.
    List(ListVmsArgs),

    /// Get VM details.
    Get(GetVmArgs),

    /// Wait until a VM reaches a state or carries an alias.
    Wait(WaitVmArgs),
}

#[derive(Debug, Args)]
struct ListVmsArgs {
    /// List VMs of every owner, not just the configured one.
    #[arg(long)]
    all_owners: bool,

    /// Only VMs in this state.
    #[arg(long)]
    state: Option<VmState>,

    /// Only VMs with this alias.
    #[arg(long)]
    alias: Option<String>,
}

#[derive(Debug, Args)]
struct GetVmArgs {
    /// VM UUID.
    vm: VmUuid,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("target").required(true).args(["state", "alias"])))]
struct WaitVmArgs {
    /// VM UUID.
    vm: VmUuid,

    /// State to wait for.
    #[arg(long)]
    state: Option<VmState>,

    /// Alias to wait for.
    #[arg(long)]
    alias: Option<String>,

    /// Give up after this many seconds.
    #[arg(long, default_value = "120")]
    timeout: u64,

    /// Seconds between polls.
    #[arg(long, default_value = "3")]
    interval: u64,
}

impl VmsCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            VmsSubcommand::List(args) => list_vms(ctx, args).await,
            VmsSubcommand::Get(args) => get_vm(ctx, args).await,
            VmsSubcommand::Wait(args) => wait_vm(ctx, args).await,
        }
    }
}

/// Table row for a VM.
#[derive(Debug, Serialize, Tabled)]
struct VmRow {
    #[tabled(rename = "UUID")]
    uuid: String,

    #[tabled(rename = "Alias", display = "display_option")]
    alias: Option<String>,

    #[tabled(rename = "State")]
    state: String,

    #[tabled(rename = "Brand", display = "display_option")]
    brand: Option<String>,

    #[tabled(rename = "RAM", display = "display_ram")]
    ram: Option<u64>,

    #[tabled(rename = "Owner")]
    owner_uuid: String,
}

impl From<&VmSnapshot> for VmRow {
    fn from(vm: &VmSnapshot) -> Self {
        Self {
            uuid: vm.uuid.to_string(),
            alias: vm.alias.clone(),
            state: vm.state.to_string(),
            brand: vm.brand.clone(),
            ram: vm.ram,
            owner_uuid: vm.owner_uuid.to_string(),
        }
    }
}

fn display_ram(ram: &Option<u64>) -> String {
    ram.map(|mib| format!("{mib} MiB"))
        .unwrap_or_else(|| "-".to_string())
}

async fn list_vms(ctx: CommandContext, args: ListVmsArgs) -> Result<()> {
    let vmapi = ctx.vmapi()?;
    let filter = VmFilter {
        owner_uuid: (!args.all_owners).then_some(ctx.config.owner_uuid),
        state: args.state,
        alias: args.alias,
    };

    let vms = vmapi.list_vms(&filter).await?;
    match ctx.format {
        OutputFormat::Json => print_single(&vms),
        OutputFormat::Table => {
            let rows: Vec<VmRow> = vms.iter().map(VmRow::from).collect();
            print_output(&rows, ctx.format);
        }
    }
    Ok(())
}

async fn get_vm(ctx: CommandContext, args: GetVmArgs) -> Result<()> {
    let vmapi = ctx.vmapi()?;
    let vm = VmIdentity::new(args.vm, ctx.config.owner_uuid);

    let snapshot = vmapi.get_vm(&vm).await?;
    match ctx.format {
        OutputFormat::Json => print_single(&snapshot),
        OutputFormat::Table => print_output(&[VmRow::from(&snapshot)], ctx.format),
    }
    Ok(())
}

async fn wait_vm(ctx: CommandContext, args: WaitVmArgs) -> Result<()> {
    let vmapi = ctx.vmapi()?;
    let vm = VmIdentity::new(args.vm, ctx.config.owner_uuid);

    let condition = match (args.state, args.alias) {
        (Some(state), Some(alias)) => state_is(state).and(alias_is(alias)),
        (Some(state), None) => state_is(state),
        (None, Some(alias)) => alias_is(alias),
        (None, None) => anyhow::bail!("Either --state or --alias is required"),
    };
    let options = WaitOptions::with_timeout(Duration::from_secs(args.timeout))
        .interval(Duration::from_secs(args.interval));

    let converged = vmapi.wait_for_vm(&vm, &condition, &options).await?;
    match converged.snapshot {
        Some(snapshot) => match ctx.format {
            OutputFormat::Json => print_single(&snapshot),
            OutputFormat::Table => print_success(&format!(
                "{vm} reached {condition} after {} polls ({})",
                converged.attempts,
                format_elapsed(converged.elapsed)
            )),
        },
        None => print_success(&format!("{vm} is gone")),
    }
    Ok(())
}
