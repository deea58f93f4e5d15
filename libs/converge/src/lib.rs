//! Convergence polling primitives.
//!
//! Lifecycle commands against the compute backend are asynchronous: the
//! backend accepts the command, hands back a job reference and moves the
//! resource in the background. Nothing is pushed back to the caller, so the
//! only way to learn that a command took effect is to read the resource
//! again until it looks the way we expect. Key concepts:
//!
//! - **Source**: anything that can produce a fresh snapshot of a resource
//!   ([`SnapshotSource`]).
//! - **Condition**: a pure check over a snapshot, plus an optional
//!   "this can never become true" check ([`Condition`]).
//! - **Wait**: the poll loop ([`wait_for`]) that ends as satisfied, failed
//!   or timed out.
//!
//! # Invariants
//!
//! - A wait always terminates: either the deadline or the attempt ceiling
//!   in [`WaitOptions`] ends it.
//! - A timed-out wait never observed a snapshot that satisfied the condition.
//! - A single transient query failure never aborts a wait.
//! - Snapshots are never mutated; every poll yields a new value.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod condition;
mod options;
mod poller;

pub use condition::Condition;
pub use options::WaitOptions;
pub use poller::{wait_for, Converged, PollState};

/// Classification of a failed snapshot query.
pub trait QueryError: std::error::Error + Send + Sync + 'static {
    /// The failure is worth retrying (connectivity, 5xx).
    fn is_transient(&self) -> bool;

    /// The backend no longer knows the resource.
    fn is_not_found(&self) -> bool;
}

/// Short human-readable summary of a snapshot, used in logs and timeout
/// diagnostics.
pub trait Summarize {
    fn summary(&self) -> String;
}

/// Something that can read the current observable state of a resource.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Key identifying the resource being watched.
    type Key: std::fmt::Display + Send + Sync;

    /// Point-in-time view of the resource.
    type Snapshot: Summarize + Send;

    /// Query failure.
    type Error: QueryError;

    /// Read the resource once.
    async fn snapshot(&self, key: &Self::Key) -> Result<Self::Snapshot, Self::Error>;
}

/// Convergence errors.
#[derive(Debug, Error)]
pub enum ConvergeError<E> {
    /// The deadline or attempt ceiling was reached before the condition held.
    #[error("timeout after {elapsed:?} ({attempts} polls) waiting for {target} to reach {condition}")]
    Timeout {
        target: String,
        condition: String,
        attempts: u32,
        elapsed: Duration,
        /// Summary of the last successfully observed snapshot.
        last_observed: Option<String>,
        /// Last transient query failure, if the final polls failed.
        last_error: Option<String>,
    },

    /// The resource reached a state from which the condition cannot hold.
    #[error("{target} will never reach {condition}: {reason}")]
    Unrecoverable {
        target: String,
        condition: String,
        reason: String,
        snapshot: String,
    },

    /// A query failed with a non-transient error.
    #[error(transparent)]
    Query(E),
}

impl<E> ConvergeError<E> {
    /// Returns true if the wait ran out of time or attempts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the wait was cut short by an unrecoverable state.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable { .. })
    }
}

/// Default spacing between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Default ceiling for a single wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(120);
