//! HTTP surface of the fake backends.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::debug;
use vmh_id::{ImageUuid, JobUuid, NetworkUuid, OwnerUuid, VmUuid};

use crate::state::{FakeState, JobResponse, NetworkRecord, Pending, VmRecord};

/// Behaviour knobs for a [`FakeBackend`].
#[derive(Debug, Clone)]
pub struct FakeBackendConfig {
    /// How long an accepted job takes to land.
    pub job_delay: Duration,

    /// Drop destroyed VMs entirely, so reads return 404.
    pub purge_destroyed: bool,

    /// Provisioning ends in `failed` instead of `running`.
    pub fail_provisioning: bool,
}

impl Default for FakeBackendConfig {
    fn default() -> Self {
        Self {
            job_delay: Duration::from_millis(50),
            purge_destroyed: false,
            fail_provisioning: false,
        }
    }
}

type Shared = Arc<Mutex<FakeState>>;

/// Fake compute and network inventory backend on a loopback port.
///
/// The server task is aborted on drop.
pub struct FakeBackend {
    addr: SocketAddr,
    state: Shared,
    server: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start() -> std::io::Result<Self> {
        Self::start_with(FakeBackendConfig::default()).await
    }

    pub async fn start_with(config: FakeBackendConfig) -> std::io::Result<Self> {
        let state: Shared = Arc::new(Mutex::new(FakeState {
            job_delay: config.job_delay,
            purge_destroyed: config.purge_destroyed,
            fail_provisioning: config.fail_provisioning,
            ..FakeState::default()
        }));

        let app = Router::new()
            .route("/vms", get(list_vms).post(create_vm))
            .route("/vms/{uuid}", get(get_vm).post(vm_action).delete(delete_vm))
            .route("/networks", get(list_networks))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Fake backend stopped");
            }
        });

        debug!(%addr, "Fake backend listening");
        Ok(Self {
            addr,
            state,
            server,
        })
    }

    /// Base URL, usable for both the compute and the network endpoints.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Add a VM in `state` and return its UUID.
    pub fn seed_vm(&self, owner_uuid: OwnerUuid, state: &str) -> VmUuid {
        let uuid = VmUuid::new();
        lock(&self.state).vms.push(VmRecord {
            uuid,
            owner_uuid,
            image_uuid: ImageUuid::new(),
            state: state.to_string(),
            alias: None,
            brand: "joyent-minimal".to_string(),
            ram: 64,
            networks: Vec::new(),
            last_modified: Utc::now(),
            pending: None,
        });
        uuid
    }

    pub fn seed_network(&self, name: &str) -> NetworkUuid {
        let uuid = NetworkUuid::new();
        lock(&self.state).networks.push(NetworkRecord {
            uuid,
            name: name.to_string(),
        });
        uuid
    }

    /// Answer the next `n` GET requests with 503.
    pub fn fail_next_gets(&self, n: u32) {
        lock(&self.state).failing_gets = n;
    }

    /// GET requests received so far, failed ones included.
    pub fn gets(&self) -> u32 {
        lock(&self.state).gets
    }

    /// Command requests received for `action` (`create`, `start`, `stop`,
    /// `reboot`, `update` or `delete`), rejected ones included.
    pub fn commands(&self, action: &str) -> u32 {
        lock(&self.state)
            .commands
            .get(action)
            .copied()
            .unwrap_or_default()
    }

    /// Current state of a VM, or `None` once it is gone.
    pub fn vm_state(&self, uuid: &VmUuid) -> Option<String> {
        let mut state = lock(&self.state);
        state.settle();
        state
            .find(uuid, None)
            .map(|i| state.vms[i].state.clone())
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn lock(state: &Shared) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Error body in the backend's `{code, message}` shape.
struct Fault {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl Fault {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn vm_not_found(uuid: &VmUuid) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "ResourceNotFound",
            format!("VM {uuid} not found"),
        )
    }

    fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "ValidationFailed", message)
    }
}

impl IntoResponse for Fault {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "code": self.code, "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

/// Count a GET, and fail it if faults are armed.
fn observe_get(state: &mut FakeState) -> Result<(), Fault> {
    state.gets += 1;
    if state.failing_gets > 0 {
        state.failing_gets -= 1;
        return Err(Fault::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "ServiceUnavailable",
            "injected fault",
        ));
    }
    Ok(())
}

fn parse<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, Fault> {
    value
        .parse()
        .map_err(|_| Fault::validation(format!("invalid {field}: {value}")))
}

#[derive(Debug, Default, Deserialize)]
struct VmQuery {
    owner_uuid: Option<String>,
    state: Option<String>,
    alias: Option<String>,
    action: Option<String>,
}

impl VmQuery {
    fn owner(&self) -> Result<Option<OwnerUuid>, Fault> {
        self.owner_uuid
            .as_deref()
            .map(|o| parse("owner_uuid", o))
            .transpose()
    }
}

/// GET /vms
async fn list_vms(
    State(state): State<Shared>,
    Query(query): Query<VmQuery>,
) -> Result<Json<Vec<VmRecord>>, Fault> {
    let mut state = lock(&state);
    observe_get(&mut state)?;
    state.settle();

    let owner = query.owner()?;
    let vms = state
        .vms
        .iter()
        .filter(|vm| owner.is_none_or(|o| vm.owner_uuid == o))
        .filter(|vm| query.state.as_deref().is_none_or(|s| vm.state == s))
        .filter(|vm| {
            query
                .alias
                .as_deref()
                .is_none_or(|a| vm.alias.as_deref() == Some(a))
        })
        .cloned()
        .collect();
    Ok(Json(vms))
}

/// GET /vms/{uuid}
async fn get_vm(
    State(state): State<Shared>,
    Path(uuid): Path<String>,
    Query(query): Query<VmQuery>,
) -> Result<Json<VmRecord>, Fault> {
    let mut state = lock(&state);
    observe_get(&mut state)?;
    state.settle();

    let uuid: VmUuid = parse("uuid", &uuid)?;
    let owner = query.owner()?;
    let index = state
        .find(&uuid, owner.as_ref())
        .ok_or_else(|| Fault::vm_not_found(&uuid))?;
    Ok(Json(state.vms[index].clone()))
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    owner_uuid: Option<String>,
    image_uuid: Option<String>,
    #[serde(default)]
    networks: Vec<String>,
    brand: Option<String>,
    ram: Option<u64>,
    alias: Option<String>,
}

/// POST /vms
async fn create_vm(
    State(state): State<Shared>,
    body: Bytes,
) -> Result<(StatusCode, Json<JobResponse>), Fault> {
    let mut state = lock(&state);
    state.count_command("create");
    state.settle();

    let req: CreateRequest = serde_json::from_slice(&body)
        .map_err(|e| Fault::validation(format!("invalid body: {e}")))?;
    let owner_uuid: OwnerUuid = parse("owner_uuid", &required(req.owner_uuid, "owner_uuid")?)?;
    let image_uuid: ImageUuid = parse("image_uuid", &required(req.image_uuid, "image_uuid")?)?;
    let brand = required(req.brand, "brand")?;
    let ram = required(req.ram, "ram")?;
    if req.networks.is_empty() {
        return Err(Fault::validation("networks is required"));
    }
    let networks = req
        .networks
        .iter()
        .map(|n| parse::<NetworkUuid>("networks", n))
        .collect::<Result<Vec<_>, _>>()?;

    let uuid = VmUuid::new();
    state.vms.push(VmRecord {
        uuid,
        owner_uuid,
        image_uuid,
        state: "provisioning".to_string(),
        alias: req.alias,
        brand,
        ram,
        networks,
        last_modified: Utc::now(),
        pending: None,
    });

    let outcome = if state.fail_provisioning {
        "failed"
    } else {
        "running"
    };
    let index = state.vms.len() - 1;
    state.schedule(
        index,
        None,
        Pending {
            state: Some(outcome),
            ..Pending::default()
        },
    );

    debug!(%uuid, "Fake VM provisioning");
    Ok((StatusCode::ACCEPTED, Json(job(uuid))))
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, Fault> {
    value.ok_or_else(|| Fault::validation(format!("{field} is required")))
}

#[derive(Debug, Default, Deserialize)]
struct UpdateRequest {
    alias: Option<String>,
    ram: Option<u64>,
}

/// POST /vms/{uuid}?action=start|stop|reboot|update
async fn vm_action(
    State(state): State<Shared>,
    Path(uuid): Path<String>,
    Query(query): Query<VmQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<JobResponse>), Fault> {
    let mut state = lock(&state);
    let action = match query.action.as_deref() {
        Some("start") => "start",
        Some("stop") => "stop",
        Some("reboot") => "reboot",
        Some("update") => "update",
        other => {
            return Err(Fault::validation(format!(
                "unsupported action: {}",
                other.unwrap_or("none")
            )))
        }
    };
    state.count_command(action);
    state.settle();

    let uuid: VmUuid = parse("uuid", &uuid)?;
    let owner = query.owner()?;
    let index = state
        .find(&uuid, owner.as_ref())
        .ok_or_else(|| Fault::vm_not_found(&uuid))?;
    let current = state.vms[index].state.clone();
    let busy = state.vms[index].pending.is_some();

    let require = |wanted: &str, code: &'static str| {
        if current == wanted && !busy {
            Ok(())
        } else {
            Err(Fault::new(
                StatusCode::CONFLICT,
                code,
                format!("VM {uuid} is {current}"),
            ))
        }
    };

    let (transitional, job_state) = match action {
        "start" => {
            require("stopped", "VmNotStopped")?;
            (None, Some("running"))
        }
        "stop" => {
            require("running", "VmNotRunning")?;
            (Some("stopping"), Some("stopped"))
        }
        "reboot" => {
            require("running", "VmNotRunning")?;
            (Some("rebooting"), Some("running"))
        }
        _ => {
            if current == "destroyed" || current == "failed" {
                return Err(Fault::new(
                    StatusCode::CONFLICT,
                    "VmDestroyed",
                    format!("VM {uuid} is {current}"),
                ));
            }
            let patch: UpdateRequest = if body.is_empty() {
                UpdateRequest::default()
            } else {
                serde_json::from_slice(&body)
                    .map_err(|e| Fault::validation(format!("invalid body: {e}")))?
            };
            if patch.alias.is_none() && patch.ram.is_none() {
                return Err(Fault::validation("nothing to update"));
            }
            state.schedule(
                index,
                None,
                Pending {
                    alias: patch.alias,
                    ram: patch.ram,
                    ..Pending::default()
                },
            );
            return Ok((StatusCode::ACCEPTED, Json(job(uuid))));
        }
    };

    state.schedule(
        index,
        transitional,
        Pending {
            state: job_state,
            ..Pending::default()
        },
    );
    debug!(%uuid, action, "Fake VM job queued");
    Ok((StatusCode::ACCEPTED, Json(job(uuid))))
}

/// DELETE /vms/{uuid}
async fn delete_vm(
    State(state): State<Shared>,
    Path(uuid): Path<String>,
    Query(query): Query<VmQuery>,
) -> Result<(StatusCode, Json<JobResponse>), Fault> {
    let mut state = lock(&state);
    state.count_command("delete");
    state.settle();

    let uuid: VmUuid = parse("uuid", &uuid)?;
    let owner = query.owner()?;
    let index = state
        .find(&uuid, owner.as_ref())
        .ok_or_else(|| Fault::vm_not_found(&uuid))?;

    state.schedule(
        index,
        Some("stopping"),
        Pending {
            state: Some("destroyed"),
            ..Pending::default()
        },
    );
    debug!(%uuid, "Fake VM destroy queued");
    Ok((StatusCode::ACCEPTED, Json(job(uuid))))
}

#[derive(Debug, Default, Deserialize)]
struct NetworkQuery {
    name: Option<String>,
}

/// GET /networks
async fn list_networks(
    State(state): State<Shared>,
    Query(query): Query<NetworkQuery>,
) -> Result<Json<Vec<NetworkRecord>>, Fault> {
    let mut state = lock(&state);
    observe_get(&mut state)?;

    let networks = state
        .networks
        .iter()
        .filter(|n| query.name.as_deref().is_none_or(|name| n.name == name))
        .cloned()
        .collect();
    Ok(Json(networks))
}

fn job(vm_uuid: VmUuid) -> JobResponse {
    JobResponse {
        job_uuid: JobUuid::new(),
        vm_uuid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_jobs_land_after_delay() {
        let backend = FakeBackend::start_with(FakeBackendConfig {
            job_delay: Duration::from_millis(20),
            ..FakeBackendConfig::default()
        })
        .await
        .unwrap();
        let owner = OwnerUuid::new();
        let vm = backend.seed_vm(owner, "running");

        let owner = owner.to_string();
        let resp = reqwest::Client::new()
            .post(format!("{}/vms/{vm}", backend.url()))
            .query(&[("action", "stop"), ("owner_uuid", owner.as_str())])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        assert_eq!(backend.vm_state(&vm).as_deref(), Some("stopping"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(backend.vm_state(&vm).as_deref(), Some("stopped"));
        assert_eq!(backend.commands("stop"), 1);
    }

    #[tokio::test]
    async fn test_invalid_transition_is_conflict() {
        let backend = FakeBackend::start().await.unwrap();
        let owner = OwnerUuid::new();
        let vm = backend.seed_vm(owner, "running");

        let resp = reqwest::Client::new()
            .post(format!("{}/vms/{vm}", backend.url()))
            .query(&[("action", "start")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "VmNotStopped");
    }

    #[tokio::test]
    async fn test_owner_mismatch_is_not_found() {
        let backend = FakeBackend::start().await.unwrap();
        let vm = backend.seed_vm(OwnerUuid::new(), "running");

        let resp = reqwest::Client::new()
            .get(format!("{}/vms/{vm}", backend.url()))
            .query(&[("owner_uuid", OwnerUuid::new().to_string())])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_injected_get_faults() {
        let backend = FakeBackend::start().await.unwrap();
        backend.seed_network("external");
        backend.fail_next_gets(1);

        let client = reqwest::Client::new();
        let url = format!("{}/networks", backend.url());
        assert_eq!(client.get(&url).send().await.unwrap().status(), 503);
        assert_eq!(client.get(&url).send().await.unwrap().status(), 200);
        assert_eq!(backend.gets(), 2);
    }
}
