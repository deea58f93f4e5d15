//! Compute orchestration gateway.
//!
//! One method per lifecycle action. Commands are sent exactly once: the
//! transport may retry a request that never reached the backend, but this
//! layer never re-issues a command, since provisioning twice would create
//! two VMs.

use async_trait::async_trait;
use tracing::info;
use vmh_converge::{wait_for, Condition, ConvergeError, Converged, SnapshotSource, WaitOptions};
use vmh_id::VmUuid;

use crate::client::ApiClient;
use crate::error::ApiError;
use crate::model::{CreateVm, JobHandle, VmFilter, VmIdentity, VmPatch, VmSnapshot};

/// Lifecycle actions sent as `POST /vms/{uuid}?action=...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAction {
    Start,
    Stop,
    Reboot,
    Update,
}

impl VmAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reboot => "reboot",
            Self::Update => "update",
        }
    }
}

/// Typed access to the compute backend.
#[derive(Debug, Clone)]
pub struct VmapiClient {
    api: ApiClient,
}

impl VmapiClient {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// List VMs matching the filter, in backend order.
    pub async fn list_vms(&self, filter: &VmFilter) -> Result<Vec<VmSnapshot>, ApiError> {
        self.api.get("/vms", &filter.to_query()).await
    }

    /// Read one VM.
    pub async fn get_vm(&self, vm: &VmIdentity) -> Result<VmSnapshot, ApiError> {
        self.api
            .get(&vm_path(&vm.uuid), &[vm.owner_query()])
            .await
            .map_err(|e| not_found_as(e, vm))
    }

    /// Provision a VM. Required fields are checked before anything is sent.
    pub async fn create_vm(&self, request: &CreateVm) -> Result<JobHandle, ApiError> {
        let body = request.validate()?;
        let job: JobHandle = self.api.post("/vms", &[], &body).await?;
        info!(
            vm_uuid = %job.vm_uuid,
            job_uuid = %job.job_uuid,
            owner_uuid = %body.owner_uuid,
            brand = %body.brand,
            ram = body.ram,
            "Create VM job queued"
        );
        Ok(job)
    }

    /// Change mutable attributes of a VM.
    pub async fn update_vm(&self, vm: &VmIdentity, patch: &VmPatch) -> Result<JobHandle, ApiError> {
        if patch.is_empty() {
            return Err(ApiError::Validation {
                field: None,
                message: "update has no attributes to change".to_string(),
            });
        }

        let query = action_query(vm, VmAction::Update);
        let job: JobHandle = self
            .api
            .post(&vm_path(&vm.uuid), &query, patch)
            .await
            .map_err(|e| not_found_as(e, vm))?;
        info!(vm_uuid = %vm.uuid, job_uuid = %job.job_uuid, "Update VM job queued");
        Ok(job)
    }

    pub async fn start_vm(&self, vm: &VmIdentity) -> Result<JobHandle, ApiError> {
        self.action(vm, VmAction::Start).await
    }

    pub async fn stop_vm(&self, vm: &VmIdentity) -> Result<JobHandle, ApiError> {
        self.action(vm, VmAction::Stop).await
    }

    pub async fn reboot_vm(&self, vm: &VmIdentity) -> Result<JobHandle, ApiError> {
        self.action(vm, VmAction::Reboot).await
    }

    /// Destroy a VM.
    pub async fn delete_vm(&self, vm: &VmIdentity) -> Result<JobHandle, ApiError> {
        let job: JobHandle = self
            .api
            .delete(&vm_path(&vm.uuid), &[vm.owner_query()])
            .await
            .map_err(|e| not_found_as(e, vm))?;
        info!(vm_uuid = %vm.uuid, job_uuid = %job.job_uuid, "Delete VM job queued");
        Ok(job)
    }

    async fn action(&self, vm: &VmIdentity, action: VmAction) -> Result<JobHandle, ApiError> {
        let query = action_query(vm, action);
        let job: JobHandle = self
            .api
            .post_empty(&vm_path(&vm.uuid), &query)
            .await
            .map_err(|e| not_found_as(e, vm))?;
        info!(
            vm_uuid = %vm.uuid,
            job_uuid = %job.job_uuid,
            action = action.as_str(),
            "VM job queued"
        );
        Ok(job)
    }

    /// Poll the VM until `condition` holds.
    pub async fn wait_for_vm(
        &self,
        vm: &VmIdentity,
        condition: &Condition<VmSnapshot>,
        options: &WaitOptions,
    ) -> Result<Converged<VmSnapshot>, ConvergeError<ApiError>> {
        wait_for(self, vm, condition, options).await
    }
}

#[async_trait]
impl SnapshotSource for VmapiClient {
    type Key = VmIdentity;
    type Snapshot = VmSnapshot;
    type Error = ApiError;

    async fn snapshot(&self, key: &VmIdentity) -> Result<VmSnapshot, ApiError> {
        self.get_vm(key).await
    }
}

fn vm_path(uuid: &VmUuid) -> String {
    format!("/vms/{uuid}")
}

fn action_query(vm: &VmIdentity, action: VmAction) -> [(&'static str, String); 2] {
    [("action", action.as_str().to_string()), vm.owner_query()]
}

/// Name the VM in not-found errors instead of echoing the backend message.
fn not_found_as(err: ApiError, vm: &VmIdentity) -> ApiError {
    match err {
        ApiError::NotFound(_) => ApiError::NotFound(format!("VM {} not found", vm.uuid)),
        other => other,
    }
}
