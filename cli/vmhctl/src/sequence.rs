//! End-to-end lifecycle run.
//!
//! Drives one VM through its whole life against live backends:
//!
//! ```text
//! list networks -> list VMs -> list by owner -> get
//!   -> create -> wait running -> (settle)
//!   -> update alias -> wait alias
//!   -> stop -> wait stopped -> start -> wait running
//!   -> reboot -> wait running
//!   -> delete -> wait destroyed -> verify destroyed
//! ```
//!
//! Steps run strictly in order and each depends on identifiers captured by
//! an earlier one. The first failing step aborts the run.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, info_span, Instrument};
use vmh_converge::{ConvergeError, WaitOptions};
use vmh_id::{ImageUuid, JobUuid, NetworkUuid, OwnerUuid};

use crate::error::ApiError;
use crate::model::{CreateVm, JobHandle, NetworkFilter, VmFilter, VmIdentity, VmPatch, VmState};
use crate::napi::NapiClient;
use crate::vmapi::VmapiClient;
use crate::wait::{alias_is, state_is};

/// Named steps of a lifecycle run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    ListNetworks,
    ListVms,
    ListVmsByOwner,
    GetVm,
    CreateVm,
    WaitRunning,
    UpdateVm,
    WaitUpdated,
    StopVm,
    WaitStopped,
    StartVm,
    WaitStarted,
    RebootVm,
    WaitRebooted,
    DeleteVm,
    WaitDestroyed,
    VerifyDestroyed,
}

impl Step {
    /// All steps, in execution order.
    pub const ALL: [Step; 17] = [
        Step::ListNetworks,
        Step::ListVms,
        Step::ListVmsByOwner,
        Step::GetVm,
        Step::CreateVm,
        Step::WaitRunning,
        Step::UpdateVm,
        Step::WaitUpdated,
        Step::StopVm,
        Step::WaitStopped,
        Step::StartVm,
        Step::WaitStarted,
        Step::RebootVm,
        Step::WaitRebooted,
        Step::DeleteVm,
        Step::WaitDestroyed,
        Step::VerifyDestroyed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListNetworks => "list_networks",
            Self::ListVms => "list_vms",
            Self::ListVmsByOwner => "list_vms_by_owner",
            Self::GetVm => "get_vm",
            Self::CreateVm => "create_vm",
            Self::WaitRunning => "wait_for_running",
            Self::UpdateVm => "update_vm",
            Self::WaitUpdated => "wait_for_updated",
            Self::StopVm => "stop_vm",
            Self::WaitStopped => "wait_for_stopped",
            Self::StartVm => "start_vm",
            Self::WaitStarted => "wait_for_started",
            Self::RebootVm => "reboot_vm",
            Self::WaitRebooted => "wait_for_reboot",
            Self::DeleteVm => "destroy_vm",
            Self::WaitDestroyed => "wait_for_destroyed",
            Self::VerifyDestroyed => "verify_destroyed",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed lifecycle run.
#[derive(Debug, Error)]
pub enum SequenceError {
    /// A gateway call failed.
    #[error("step {step} failed: {source}")]
    Api {
        step: Step,
        #[source]
        source: ApiError,
    },

    /// A wait timed out, hit an unrecoverable state, or a poll failed hard.
    #[error("step {step} failed: {source}")]
    Wait {
        step: Step,
        #[source]
        source: ConvergeError<ApiError>,
    },

    /// A step's own check failed.
    #[error("step {step} failed: {message}")]
    Assertion { step: Step, message: String },
}

impl SequenceError {
    pub fn step(&self) -> Step {
        match self {
            Self::Api { step, .. } | Self::Wait { step, .. } | Self::Assertion { step, .. } => {
                *step
            }
        }
    }
}

/// Parameters of a lifecycle run.
#[derive(Debug, Clone)]
pub struct SequenceConfig {
    /// Owner the VM is created for.
    pub owner_uuid: OwnerUuid,

    /// Platform tag for the created VM.
    pub brand: String,

    /// Memory for the created VM, in MiB.
    pub ram: u64,

    /// Alias set by the update step.
    pub alias: String,

    /// Pause after the VM first reports running, so the first-boot reboot
    /// is not interrupted by the next command.
    pub settle_after_create: Duration,

    /// Pause after a reboot command before polling, so the VM has left
    /// `running` by the first poll.
    pub reboot_grace: Duration,

    /// Waits for provisioning and destruction.
    pub provision_wait: WaitOptions,

    /// Waits for update, stop, start and reboot.
    pub transition_wait: WaitOptions,
}

impl SequenceConfig {
    pub fn new(owner_uuid: OwnerUuid) -> Self {
        Self {
            owner_uuid,
            brand: "joyent-minimal".to_string(),
            ram: 64,
            alias: "foobar".to_string(),
            settle_after_create: Duration::from_secs(20),
            reboot_grace: Duration::from_secs(3),
            provision_wait: WaitOptions::with_timeout(Duration::from_secs(300)),
            transition_wait: WaitOptions::with_timeout(Duration::from_secs(120)),
        }
    }
}

/// Outcome of one completed step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: Step,
    pub elapsed: Duration,
    pub job_uuid: Option<JobUuid>,
    pub detail: String,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub vm: Option<VmIdentity>,
    pub steps: Vec<StepReport>,
}

impl RunReport {
    pub fn total_elapsed(&self) -> Duration {
        self.steps.iter().map(|s| s.elapsed).sum()
    }
}

/// Identifiers captured while the run progresses.
#[derive(Debug, Default)]
struct RunState {
    network: Option<NetworkUuid>,
    image: Option<ImageUuid>,
    vm: Option<VmIdentity>,
}

/// Runs the lifecycle steps against the given gateways.
pub struct Sequencer<'a> {
    vmapi: &'a VmapiClient,
    napi: &'a NapiClient,
    config: SequenceConfig,
}

impl<'a> Sequencer<'a> {
    pub fn new(vmapi: &'a VmapiClient, napi: &'a NapiClient, config: SequenceConfig) -> Self {
        Self {
            vmapi,
            napi,
            config,
        }
    }

    /// Run every step in order.
    pub async fn run(&self) -> Result<RunReport, SequenceError> {
        let mut state = RunState::default();
        let mut report = RunReport::default();

        for step in Step::ALL {
            let started = Instant::now();
            let span = info_span!("step", name = step.as_str());
            let (job_uuid, detail) = self.execute(step, &mut state).instrument(span).await?;
            let elapsed = started.elapsed();

            info!(
                step = step.as_str(),
                elapsed_ms = elapsed.as_millis() as u64,
                detail = %detail,
                "Step passed"
            );
            report.steps.push(StepReport {
                step,
                elapsed,
                job_uuid,
                detail,
            });
        }

        report.vm = state.vm;
        Ok(report)
    }

    async fn execute(
        &self,
        step: Step,
        state: &mut RunState,
    ) -> Result<(Option<JobUuid>, String), SequenceError> {
        let api = |source: ApiError| SequenceError::Api { step, source };
        let waited = |source: ConvergeError<ApiError>| SequenceError::Wait { step, source };
        let cfg = &self.config;

        match step {
            Step::ListNetworks => {
                let network = self
                    .napi
                    .first_network(&NetworkFilter::default())
                    .await
                    .map_err(api)?;
                state.network = Some(network.uuid);
                Ok((None, format!("network {}", network.uuid)))
            }
            Step::ListVms => {
                let vms = self.vmapi.list_vms(&VmFilter::default()).await.map_err(api)?;
                let first = vms.first().ok_or_else(|| SequenceError::Assertion {
                    step,
                    message: "no VMs visible; cannot pick an image to provision from".to_string(),
                })?;
                state.image = Some(first.image_uuid);
                state.vm = Some(first.identity());
                Ok((None, format!("{} VMs, image {}", vms.len(), first.image_uuid)))
            }
            Step::ListVmsByOwner => {
                let vms = self
                    .vmapi
                    .list_vms(&VmFilter::owner(cfg.owner_uuid))
                    .await
                    .map_err(api)?;
                if let Some(stranger) = vms.iter().find(|vm| vm.owner_uuid != cfg.owner_uuid) {
                    return Err(SequenceError::Assertion {
                        step,
                        message: format!(
                            "owner filter returned VM {} owned by {}",
                            stranger.uuid, stranger.owner_uuid
                        ),
                    });
                }
                Ok((None, format!("{} VMs for owner {}", vms.len(), cfg.owner_uuid)))
            }
            Step::GetVm => {
                let vm = self.require_vm(step, state)?;
                let snapshot = self.vmapi.get_vm(&vm).await.map_err(api)?;
                Ok((None, format!("{} is {}", vm, snapshot.state)))
            }
            Step::CreateVm => {
                let request = CreateVm {
                    owner_uuid: Some(cfg.owner_uuid),
                    image_uuid: state.image,
                    networks: state.network.into_iter().collect(),
                    brand: Some(cfg.brand.clone()),
                    ram: Some(cfg.ram),
                    alias: None,
                };
                let job = self.vmapi.create_vm(&request).await.map_err(api)?;
                state.vm = Some(VmIdentity::new(job.vm_uuid, cfg.owner_uuid));
                Ok(queued(&job))
            }
            Step::WaitRunning => {
                let vm = self.require_vm(step, state)?;
                let done = self
                    .vmapi
                    .wait_for_vm(&vm, &state_is(VmState::Running), &cfg.provision_wait)
                    .await
                    .map_err(waited)?;
                if !cfg.settle_after_create.is_zero() {
                    info!(
                        settle_ms = cfg.settle_after_create.as_millis() as u64,
                        "Letting the new VM settle"
                    );
                    tokio::time::sleep(cfg.settle_after_create).await;
                }
                Ok((None, format!("running after {} polls", done.attempts)))
            }
            Step::UpdateVm => {
                let vm = self.require_vm(step, state)?;
                let job = self
                    .vmapi
                    .update_vm(&vm, &VmPatch::alias(cfg.alias.clone()))
                    .await
                    .map_err(api)?;
                Ok(queued(&job))
            }
            Step::WaitUpdated => {
                let vm = self.require_vm(step, state)?;
                let done = self
                    .vmapi
                    .wait_for_vm(&vm, &alias_is(cfg.alias.clone()), &cfg.transition_wait)
                    .await
                    .map_err(waited)?;
                Ok((None, format!("alias {} after {} polls", cfg.alias, done.attempts)))
            }
            Step::StopVm => {
                let vm = self.require_vm(step, state)?;
                let job = self.vmapi.stop_vm(&vm).await.map_err(api)?;
                Ok(queued(&job))
            }
            Step::WaitStopped => self.wait_state(step, state, VmState::Stopped, None).await,
            Step::StartVm => {
                let vm = self.require_vm(step, state)?;
                let job = self.vmapi.start_vm(&vm).await.map_err(api)?;
                Ok(queued(&job))
            }
            Step::WaitStarted => self.wait_state(step, state, VmState::Running, None).await,
            Step::RebootVm => {
                let vm = self.require_vm(step, state)?;
                let job = self.vmapi.reboot_vm(&vm).await.map_err(api)?;
                Ok(queued(&job))
            }
            Step::WaitRebooted => {
                self.wait_state(step, state, VmState::Running, Some(cfg.reboot_grace))
                    .await
            }
            Step::DeleteVm => {
                let vm = self.require_vm(step, state)?;
                let job = self.vmapi.delete_vm(&vm).await.map_err(api)?;
                Ok(queued(&job))
            }
            Step::WaitDestroyed => {
                let vm = self.require_vm(step, state)?;
                let done = self
                    .vmapi
                    .wait_for_vm(&vm, &state_is(VmState::Destroyed), &cfg.provision_wait)
                    .await
                    .map_err(waited)?;
                let detail = if done.is_gone() {
                    "purged by the backend".to_string()
                } else {
                    format!("destroyed after {} polls", done.attempts)
                };
                Ok((None, detail))
            }
            Step::VerifyDestroyed => {
                let vm = self.require_vm(step, state)?;
                match self.vmapi.get_vm(&vm).await {
                    Ok(snapshot) if snapshot.state == VmState::Destroyed => {
                        Ok((None, "destroyed record retained".to_string()))
                    }
                    Ok(snapshot) => Err(SequenceError::Assertion {
                        step,
                        message: format!("{} reappeared as {}", vm, snapshot.state),
                    }),
                    Err(e) if e.is_not_found() => Ok((None, "record removed".to_string())),
                    Err(e) => Err(api(e)),
                }
            }
        }
    }

    async fn wait_state(
        &self,
        step: Step,
        state: &RunState,
        target: VmState,
        initial_delay: Option<Duration>,
    ) -> Result<(Option<JobUuid>, String), SequenceError> {
        let vm = self.require_vm(step, state)?;
        let mut options = self.config.transition_wait.clone();
        if let Some(delay) = initial_delay {
            options = options.initial_delay(delay);
        }

        let done = self
            .vmapi
            .wait_for_vm(&vm, &state_is(target.clone()), &options)
            .await
            .map_err(|source| SequenceError::Wait { step, source })?;
        Ok((None, format!("{} after {} polls", target, done.attempts)))
    }

    fn require_vm(&self, step: Step, state: &RunState) -> Result<VmIdentity, SequenceError> {
        state.vm.ok_or_else(|| SequenceError::Assertion {
            step,
            message: "no VM captured by an earlier step".to_string(),
        })
    }
}

fn queued(job: &JobHandle) -> (Option<JobUuid>, String) {
    (
        Some(job.job_uuid),
        format!("job {} for vm {}", job.job_uuid, job.vm_uuid),
    )
}
