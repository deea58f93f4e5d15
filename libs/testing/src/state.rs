//! In-memory VM and network records.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use vmh_id::{ImageUuid, JobUuid, NetworkUuid, OwnerUuid, VmUuid};

/// A job that has been accepted but has not landed yet.
#[derive(Debug, Clone, Default)]
pub(crate) struct Pending {
    pub ready_at: Option<Instant>,
    pub state: Option<&'static str>,
    pub alias: Option<String>,
    pub ram: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct VmRecord {
    pub uuid: VmUuid,
    pub owner_uuid: OwnerUuid,
    pub image_uuid: ImageUuid,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub brand: String,
    pub ram: u64,
    pub networks: Vec<NetworkUuid>,
    pub last_modified: DateTime<Utc>,
    #[serde(skip)]
    pub pending: Option<Pending>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct NetworkRecord {
    pub uuid: NetworkUuid,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct JobResponse {
    pub job_uuid: JobUuid,
    pub vm_uuid: VmUuid,
}

/// Backend state shared between the server task and the test.
#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub vms: Vec<VmRecord>,
    pub networks: Vec<NetworkRecord>,
    pub job_delay: Duration,
    pub purge_destroyed: bool,
    pub fail_provisioning: bool,
    pub failing_gets: u32,
    pub gets: u32,
    pub commands: HashMap<&'static str, u32>,
}

impl FakeState {
    /// Land every job whose delay has passed.
    pub fn settle(&mut self) {
        let now = Instant::now();
        for vm in &mut self.vms {
            let ready = vm
                .pending
                .as_ref()
                .is_some_and(|p| p.ready_at.is_some_and(|at| at <= now));
            if !ready {
                continue;
            }
            if let Some(job) = vm.pending.take() {
                if let Some(state) = job.state {
                    vm.state = state.to_string();
                }
                if job.alias.is_some() {
                    vm.alias = job.alias;
                }
                if let Some(ram) = job.ram {
                    vm.ram = ram;
                }
                vm.last_modified = Utc::now();
            }
        }
        if self.purge_destroyed {
            self.vms.retain(|vm| vm.state != "destroyed");
        }
    }

    /// Queue a job against `vm`, switching it to `transitional` right away.
    pub fn schedule(&mut self, index: usize, transitional: Option<&'static str>, job: Pending) {
        let ready_at = Some(Instant::now() + self.job_delay);
        let vm = &mut self.vms[index];
        if let Some(state) = transitional {
            vm.state = state.to_string();
        }
        vm.last_modified = Utc::now();
        vm.pending = Some(Pending { ready_at, ..job });
    }

    pub fn find(&self, uuid: &VmUuid, owner: Option<&OwnerUuid>) -> Option<usize> {
        self.vms
            .iter()
            .position(|vm| &vm.uuid == uuid && owner.is_none_or(|o| &vm.owner_uuid == o))
    }

    pub fn count_command(&mut self, action: &'static str) {
        *self.commands.entry(action).or_default() += 1;
    }
}
