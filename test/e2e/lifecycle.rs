//! End-to-end lifecycle tests against the in-process fake backends.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p vmh-e2e --test lifecycle
//! ```

use std::time::Duration;

use tracing::info;
use vmh_converge::WaitOptions;
use vmh_id::{OwnerUuid, VmUuid};
use vmh_testing::{FakeBackend, FakeBackendConfig};
use vmhctl::wait::state_is;
use vmhctl::{
    ApiError, Config, NapiClient, SequenceConfig, SequenceError, Sequencer, Step, VmFilter,
    VmIdentity, VmState, VmapiClient,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vmhctl=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn config(backend: &FakeBackend, owner: OwnerUuid) -> Config {
    Config {
        vmapi_url: backend.url(),
        napi_url: backend.url(),
        owner_uuid: owner,
        retry_max_attempts: 3,
        retry_min_backoff_ms: 10,
        request_timeout_secs: 5,
    }
}

fn clients(backend: &FakeBackend, owner: OwnerUuid) -> (VmapiClient, NapiClient) {
    let config = config(backend, owner);
    (config.vmapi().unwrap(), config.napi().unwrap())
}

fn fast_wait() -> WaitOptions {
    WaitOptions::with_timeout(Duration::from_secs(5)).interval(Duration::from_millis(20))
}

fn fast_sequence(owner: OwnerUuid) -> SequenceConfig {
    SequenceConfig {
        settle_after_create: Duration::ZERO,
        reboot_grace: Duration::from_millis(10),
        provision_wait: fast_wait(),
        transition_wait: fast_wait(),
        ..SequenceConfig::new(owner)
    }
}

/// Backend with one existing VM to copy an image from and one network.
async fn seeded_backend(config: FakeBackendConfig) -> (FakeBackend, OwnerUuid) {
    let backend = FakeBackend::start_with(config).await.unwrap();
    let owner = OwnerUuid::new();
    backend.seed_network("external");
    backend.seed_vm(owner, "running");
    (backend, owner)
}

#[tokio::test]
async fn e2e_full_lifecycle() {
    init_tracing();
    let (backend, owner) = seeded_backend(FakeBackendConfig::default()).await;
    let (vmapi, napi) = clients(&backend, owner);

    let report = Sequencer::new(&vmapi, &napi, fast_sequence(owner))
        .run()
        .await
        .unwrap();

    let steps: Vec<Step> = report.steps.iter().map(|s| s.step).collect();
    assert_eq!(steps, Step::ALL.to_vec());

    let vm = report.vm.expect("run should record the created VM");
    assert_eq!(vm.owner_uuid, owner);
    assert_eq!(backend.vm_state(&vm.uuid).as_deref(), Some("destroyed"));

    info!(vm_uuid = %vm.uuid, steps = report.steps.len(), "Lifecycle run completed");

    let jobs = report.steps.iter().filter(|s| s.job_uuid.is_some()).count();
    assert_eq!(jobs, 6, "create, update, stop, start, reboot and delete queue jobs");
}

#[tokio::test]
async fn e2e_each_command_sent_once() {
    init_tracing();
    let (backend, owner) = seeded_backend(FakeBackendConfig::default()).await;
    let (vmapi, napi) = clients(&backend, owner);

    Sequencer::new(&vmapi, &napi, fast_sequence(owner))
        .run()
        .await
        .unwrap();

    for action in ["create", "update", "stop", "start", "reboot", "delete"] {
        info!(action, sent = backend.commands(action), "Commands received");
        assert_eq!(backend.commands(action), 1, "{action} sent more than once");
    }
}

#[tokio::test]
async fn e2e_purged_vm_counts_as_destroyed() {
    init_tracing();
    let (backend, owner) = seeded_backend(FakeBackendConfig {
        purge_destroyed: true,
        ..FakeBackendConfig::default()
    })
    .await;
    let (vmapi, napi) = clients(&backend, owner);

    let report = Sequencer::new(&vmapi, &napi, fast_sequence(owner))
        .run()
        .await
        .unwrap();

    let vm = report.vm.unwrap();
    assert_eq!(backend.vm_state(&vm.uuid), None);
    let verify = report
        .steps
        .iter()
        .find(|s| s.step == Step::VerifyDestroyed)
        .unwrap();
    assert_eq!(verify.detail, "record removed");
}

#[tokio::test]
async fn e2e_failed_provisioning_aborts_run() {
    init_tracing();
    let (backend, owner) = seeded_backend(FakeBackendConfig {
        fail_provisioning: true,
        ..FakeBackendConfig::default()
    })
    .await;
    let (vmapi, napi) = clients(&backend, owner);

    let err = Sequencer::new(&vmapi, &napi, fast_sequence(owner))
        .run()
        .await
        .unwrap_err();

    info!(error = %err, "Run aborted as expected");
    assert_eq!(err.step(), Step::WaitRunning);
    match err {
        SequenceError::Wait { source, .. } => assert!(source.is_unrecoverable()),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(backend.commands("update"), 0);
}

#[tokio::test]
async fn e2e_no_networks_aborts_first_step() {
    let backend = FakeBackend::start().await.unwrap();
    let owner = OwnerUuid::new();
    backend.seed_vm(owner, "running");
    let (vmapi, napi) = clients(&backend, owner);

    let err = Sequencer::new(&vmapi, &napi, fast_sequence(owner))
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.step(), Step::ListNetworks);
    assert_eq!(backend.commands("create"), 0);
}

#[tokio::test]
async fn e2e_unknown_vm_is_not_found() {
    let backend = FakeBackend::start().await.unwrap();
    let owner = OwnerUuid::new();
    let (vmapi, _) = clients(&backend, owner);

    let vm = VmIdentity::new(VmUuid::new(), owner);
    let err = vmapi.get_vm(&vm).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().contains(&vm.uuid.to_string()));
}

#[tokio::test]
async fn e2e_start_running_vm_is_invalid_state() {
    let backend = FakeBackend::start().await.unwrap();
    let owner = OwnerUuid::new();
    let uuid = backend.seed_vm(owner, "running");
    let (vmapi, _) = clients(&backend, owner);

    let err = vmapi
        .start_vm(&VmIdentity::new(uuid, owner))
        .await
        .unwrap_err();
    match err {
        ApiError::InvalidState { code, .. } => assert_eq!(code, "VmNotStopped"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(backend.commands("start"), 1);
}

#[tokio::test]
async fn e2e_repeated_reads_agree() {
    let backend = FakeBackend::start().await.unwrap();
    let owner = OwnerUuid::new();
    let uuid = backend.seed_vm(owner, "stopped");
    let (vmapi, _) = clients(&backend, owner);
    let vm = VmIdentity::new(uuid, owner);

    let first = vmapi.get_vm(&vm).await.unwrap();
    let second = vmapi.get_vm(&vm).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.state, VmState::Stopped);
}

#[tokio::test]
async fn e2e_owner_filter() {
    let backend = FakeBackend::start().await.unwrap();
    let owner = OwnerUuid::new();
    backend.seed_vm(owner, "running");
    backend.seed_vm(owner, "stopped");
    backend.seed_vm(OwnerUuid::new(), "running");
    let (vmapi, _) = clients(&backend, owner);

    let all = vmapi.list_vms(&VmFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);

    let mine = vmapi.list_vms(&VmFilter::owner(owner)).await.unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine.iter().all(|vm| vm.owner_uuid == owner));

    let running = vmapi
        .list_vms(&VmFilter {
            state: Some(VmState::Running),
            ..VmFilter::owner(owner)
        })
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
}

#[tokio::test]
async fn e2e_transient_read_faults_are_absorbed() {
    init_tracing();
    let backend = FakeBackend::start().await.unwrap();
    let owner = OwnerUuid::new();
    let uuid = backend.seed_vm(owner, "running");
    let (vmapi, _) = clients(&backend, owner);

    // Exhausts the transport retries of the first poll; the poller absorbs it.
    backend.fail_next_gets(4);
    info!(vm_uuid = %uuid, "Injected read faults");

    let done = vmapi
        .wait_for_vm(
            &VmIdentity::new(uuid, owner),
            &state_is(VmState::Running),
            &fast_wait(),
        )
        .await
        .unwrap();
    assert_eq!(done.attempts, 2);
    assert_eq!(backend.gets(), 5);
}

#[tokio::test]
async fn e2e_wait_times_out_on_stuck_vm() {
    let backend = FakeBackend::start().await.unwrap();
    let owner = OwnerUuid::new();
    let uuid = backend.seed_vm(owner, "stopped");
    let (vmapi, _) = clients(&backend, owner);

    let options =
        WaitOptions::with_timeout(Duration::from_millis(200)).interval(Duration::from_millis(20));
    let err = vmapi
        .wait_for_vm(
            &VmIdentity::new(uuid, owner),
            &state_is(VmState::Running),
            &options,
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}
