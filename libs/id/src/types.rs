//! Typed identifier definitions.

use crate::define_id;

// =============================================================================
// Compute
// =============================================================================

define_id!(VmUuid, "vm");
define_id!(ImageUuid, "image");
define_id!(JobUuid, "job");

// =============================================================================
// Ownership
// =============================================================================

define_id!(OwnerUuid, "owner");

// =============================================================================
// Networking
// =============================================================================

define_id!(NetworkUuid, "network");
