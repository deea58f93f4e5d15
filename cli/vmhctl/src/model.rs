//! Wire types for the compute and network inventory backends.
//!
//! Only the fields the harness depends on are modelled; everything else in
//! a backend response is ignored.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmh_converge::Summarize;
use vmh_id::{ImageUuid, JobUuid, NetworkUuid, OwnerUuid, VmUuid};

use crate::error::ApiError;

/// Lifecycle state reported by the compute backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VmState {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Rebooting,
    Destroyed,
    Failed,
    /// Any state this client does not know, kept verbatim.
    Other(String),
}

impl VmState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Rebooting => "rebooting",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
            Self::Other(s) => s,
        }
    }

    /// States a VM never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed)
    }
}

impl From<String> for VmState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "provisioning" => Self::Provisioning,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "rebooting" => Self::Rebooting,
            "destroyed" => Self::Destroyed,
            "failed" => Self::Failed,
            _ => Self::Other(s),
        }
    }
}

impl From<VmState> for String {
    fn from(state: VmState) -> Self {
        state.as_str().to_string()
    }
}

impl std::str::FromStr for VmState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.trim().to_ascii_lowercase()))
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a lifecycle-managed VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmIdentity {
    pub uuid: VmUuid,
    pub owner_uuid: OwnerUuid,
}

impl VmIdentity {
    pub fn new(uuid: VmUuid, owner_uuid: OwnerUuid) -> Self {
        Self { uuid, owner_uuid }
    }

    /// Query string scoping a request to this VM's owner.
    pub(crate) fn owner_query(&self) -> (&'static str, String) {
        ("owner_uuid", self.owner_uuid.to_string())
    }
}

impl fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm {}", self.uuid)
    }
}

/// Point-in-time read of a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSnapshot {
    pub uuid: VmUuid,
    pub owner_uuid: OwnerUuid,
    pub state: VmState,
    #[serde(default)]
    pub alias: Option<String>,
    pub image_uuid: ImageUuid,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub ram: Option<u64>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

impl VmSnapshot {
    pub fn identity(&self) -> VmIdentity {
        VmIdentity::new(self.uuid, self.owner_uuid)
    }
}

impl Summarize for VmSnapshot {
    fn summary(&self) -> String {
        format!(
            "state={} alias={}",
            self.state,
            self.alias.as_deref().unwrap_or("-")
        )
    }
}

/// Reference to an asynchronous backend job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_uuid: JobUuid,
    pub vm_uuid: VmUuid,
}

/// Network from the inventory backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub uuid: NetworkUuid,
    #[serde(default)]
    pub name: Option<String>,
}

/// Filter for listing VMs. Empty means everything visible to the caller.
#[derive(Debug, Clone, Default)]
pub struct VmFilter {
    pub owner_uuid: Option<OwnerUuid>,
    pub state: Option<VmState>,
    pub alias: Option<String>,
}

impl VmFilter {
    pub fn owner(owner_uuid: OwnerUuid) -> Self {
        Self {
            owner_uuid: Some(owner_uuid),
            ..Self::default()
        }
    }

    pub(crate) fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(owner) = &self.owner_uuid {
            query.push(("owner_uuid", owner.to_string()));
        }
        if let Some(state) = &self.state {
            query.push(("state", state.to_string()));
        }
        if let Some(alias) = &self.alias {
            query.push(("alias", alias.clone()));
        }
        query
    }
}

/// Filter for listing networks.
#[derive(Debug, Clone, Default)]
pub struct NetworkFilter {
    pub owner_uuid: Option<OwnerUuid>,
    pub name: Option<String>,
}

impl NetworkFilter {
    pub(crate) fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(owner) = &self.owner_uuid {
            query.push(("owner_uuid", owner.to_string()));
        }
        if let Some(name) = &self.name {
            query.push(("name", name.clone()));
        }
        query
    }
}

/// Parameters for provisioning a VM.
///
/// Fields are optional here so a partially filled request can be rejected
/// locally, before anything is sent.
#[derive(Debug, Clone, Default)]
pub struct CreateVm {
    pub owner_uuid: Option<OwnerUuid>,
    pub image_uuid: Option<ImageUuid>,
    pub networks: Vec<NetworkUuid>,
    pub brand: Option<String>,
    pub ram: Option<u64>,
    pub alias: Option<String>,
}

/// Validated create request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateVmBody {
    pub owner_uuid: OwnerUuid,
    pub image_uuid: ImageUuid,
    pub networks: Vec<NetworkUuid>,
    pub brand: String,
    pub ram: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl CreateVm {
    /// Check required fields and build the request body.
    pub fn validate(&self) -> Result<CreateVmBody, ApiError> {
        let owner_uuid = self
            .owner_uuid
            .ok_or_else(|| ApiError::missing_field("owner_uuid"))?;
        let image_uuid = self
            .image_uuid
            .ok_or_else(|| ApiError::missing_field("image_uuid"))?;
        if self.networks.is_empty() {
            return Err(ApiError::missing_field("networks"));
        }
        let brand = self
            .brand
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ApiError::missing_field("brand"))?;
        let ram = match self.ram {
            Some(ram) if ram > 0 => ram,
            Some(_) => {
                return Err(ApiError::Validation {
                    field: Some("ram".to_string()),
                    message: "ram must be greater than zero".to_string(),
                })
            }
            None => return Err(ApiError::missing_field("ram")),
        };

        Ok(CreateVmBody {
            owner_uuid,
            image_uuid,
            networks: self.networks.clone(),
            brand: brand.to_string(),
            ram,
            alias: self.alias.clone(),
        })
    }
}

/// Mutable VM attributes for an update.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VmPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram: Option<u64>,
}

impl VmPatch {
    pub fn alias(alias: impl Into<String>) -> Self {
        Self {
            alias: Some(alias.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.alias.is_none() && self.ram.is_none()
    }
}
