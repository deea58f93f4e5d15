//! Test support for the VM lifecycle harness.
//!
//! [`FakeBackend`] serves the compute (`/vms`) and network inventory
//! (`/networks`) endpoints from memory on a loopback port. Commands are
//! accepted as jobs and take effect after a configurable delay, so pollers
//! see the same intermediate states a real backend reports.

mod backend;
mod state;

pub use backend::{FakeBackend, FakeBackendConfig};
