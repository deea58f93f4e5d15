//! # vmh-id
//!
//! Typed identifiers for the resources the lifecycle harness touches.
//!
//! ## Design Principles
//!
//! - Backends assign identifiers; the harness never invents one for a
//!   resource it did not create
//! - Identifiers are bare hyphenated UUIDs on the wire
//!   (`930896af-bf8c-48d4-885c-6573a94b1853`)
//! - Each resource kind gets its own type so a network id can never be
//!   passed where a VM id is expected

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
