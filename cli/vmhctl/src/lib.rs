//! vmhctl - lifecycle harness for the compute orchestration API.
//!
//! Drives a VM through create, update, stop, start, reboot and destroy
//! against the compute orchestration backend (VMAPI) and the network
//! inventory backend (NAPI), and verifies each step by polling until the
//! VM is observed in the expected state.
//!
//! ## Layers
//!
//! - [`client`]: HTTP transport with bounded retry
//! - [`vmapi`], [`napi`]: typed gateways, one method per backend operation
//! - [`wait`]: VM conditions for the convergence poller (`vmh-converge`)
//! - [`sequence`]: the fixed end-to-end lifecycle run

pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod napi;
pub mod sequence;
pub mod vmapi;
pub mod wait;

pub use client::{ApiClient, RetryPolicy};
pub use config::Config;
pub use error::ApiError;
pub use model::{
    CreateVm, JobHandle, Network, NetworkFilter, VmFilter, VmIdentity, VmPatch, VmSnapshot,
    VmState,
};
pub use napi::NapiClient;
pub use sequence::{RunReport, SequenceConfig, SequenceError, Sequencer, Step, StepReport};
pub use vmapi::VmapiClient;
