//! The end-to-end lifecycle command.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::Tabled;
use vmh_converge::WaitOptions;
use vmhctl::{RunReport, SequenceConfig, Sequencer};

use crate::output::{format_elapsed, print_output, print_single, print_success, OutputFormat};

use super::CommandContext;

/// Create a VM, drive it through update, stop, start and reboot, then
/// destroy it, checking each transition.
#[derive(Debug, Args)]
pub struct LifecycleCommand {
    /// Platform tag for the created VM.
    #[arg(long, default_value = "joyent-minimal")]
    brand: String,

    /// Memory for the created VM, in MiB.
    #[arg(long, default_value = "64")]
    ram: u64,

    /// Alias set by the update step.
    #[arg(long, default_value = "foobar")]
    alias: String,

    /// Seconds to wait after the VM first reports running.
    #[arg(long, default_value = "20")]
    settle: u64,

    /// Seconds to wait after a reboot before polling.
    #[arg(long, default_value = "3")]
    reboot_grace: u64,

    /// Timeout for provisioning and destruction, in seconds.
    #[arg(long, default_value = "300")]
    provision_timeout: u64,

    /// Timeout for update, stop, start and reboot, in seconds.
    #[arg(long, default_value = "120")]
    transition_timeout: u64,

    /// Seconds between polls.
    #[arg(long, default_value = "3")]
    interval: u64,

    /// Random extra delay per poll, as a fraction of the interval (0-1).
    #[arg(long, default_value = "0")]
    jitter: f64,
}

#[derive(Debug, Serialize, Tabled)]
struct StepRow {
    #[tabled(rename = "Step")]
    step: String,

    #[tabled(rename = "Elapsed")]
    elapsed: String,

    #[tabled(rename = "Job")]
    job: String,

    #[tabled(rename = "Detail")]
    detail: String,
}

impl LifecycleCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let vmapi = ctx.vmapi()?;
        let napi = ctx.napi()?;
        let config = self.sequence_config(&ctx);

        let report = Sequencer::new(&vmapi, &napi, config).run().await?;
        print_report(&report, ctx.format);
        Ok(())
    }

    fn sequence_config(&self, ctx: &CommandContext) -> SequenceConfig {
        let wait = |timeout: u64| {
            WaitOptions::with_timeout(Duration::from_secs(timeout))
                .interval(Duration::from_secs(self.interval))
                .jitter(self.jitter)
        };

        SequenceConfig {
            brand: self.brand.clone(),
            ram: self.ram,
            alias: self.alias.clone(),
            settle_after_create: Duration::from_secs(self.settle),
            reboot_grace: Duration::from_secs(self.reboot_grace),
            provision_wait: wait(self.provision_timeout),
            transition_wait: wait(self.transition_timeout),
            ..SequenceConfig::new(ctx.config.owner_uuid)
        }
    }
}

fn print_report(report: &RunReport, format: OutputFormat) {
    let rows: Vec<StepRow> = report
        .steps
        .iter()
        .map(|s| StepRow {
            step: s.step.to_string(),
            elapsed: format_elapsed(s.elapsed),
            job: s
                .job_uuid
                .map(|j| j.to_string())
                .unwrap_or_else(|| "-".to_string()),
            detail: s.detail.clone(),
        })
        .collect();

    match format {
        OutputFormat::Json => print_single(&serde_json::json!({
            "vm_uuid": report.vm.map(|vm| vm.uuid.to_string()),
            "total_secs": report.total_elapsed().as_secs_f64(),
            "steps": rows,
        })),
        OutputFormat::Table => {
            print_output(&rows, format);
            let vm = report
                .vm
                .map(|vm| vm.uuid.to_string())
                .unwrap_or_else(|| "-".to_string());
            print_success(&format!(
                "lifecycle of {} completed in {}",
                vm.cyan(),
                format_elapsed(report.total_elapsed())
            ));
        }
    }
}
