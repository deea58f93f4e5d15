//! Error types and user-facing error display.

use colored::Colorize;
use serde::Deserialize;
use thiserror::Error;
use vmh_converge::QueryError;

/// Backend error codes that mean the request itself was malformed.
const VALIDATION_CODES: &[&str] = &[
    "ValidationFailed",
    "InvalidArgument",
    "InvalidParameters",
    "MissingParameter",
];

/// Errors surfaced by the transport client and the resource gateways.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Connectivity failure or 5xx response, after retries were exhausted
    /// (or not attempted for non-idempotent requests).
    #[error("transport error on {method} {path} after {attempts} attempt(s): {message}")]
    Transport {
        method: String,
        path: String,
        status: Option<u16>,
        attempts: u32,
        message: String,
    },

    /// The request was rejected as malformed, locally or by the backend.
    #[error("validation failed: {message}")]
    Validation {
        field: Option<String>,
        message: String,
    },

    /// The backend does not know the resource.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend refused a transition given the current resource state.
    #[error("invalid state ({code}): {message}")]
    InvalidState { code: String, message: String },

    /// Any other 4xx response (auth, permissions, ...).
    #[error("request rejected with {status} ({code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },

    /// The HTTP client for a backend could not be built.
    #[error("failed to create HTTP client for {backend}: {message}")]
    Client {
        backend: &'static str,
        message: String,
    },

    /// A success response whose body could not be decoded.
    #[error("malformed response from {path}: {message}")]
    Decode { path: String, message: String },
}

impl ApiError {
    /// Local validation failure for a named field.
    pub fn missing_field(field: &str) -> Self {
        Self::Validation {
            field: Some(field.to_string()),
            message: format!("{field} is required"),
        }
    }

    /// Map a non-success, non-5xx response to a domain error.
    pub fn from_status(status: u16, body: ApiErrorBody, path: &str) -> Self {
        let code = body.code.unwrap_or_default();
        let message = body.message.unwrap_or_else(|| format!("{path} returned {status}"));

        if status == 404 || code == "ResourceNotFound" {
            return Self::NotFound(message);
        }

        if status == 400 || status == 422 || VALIDATION_CODES.contains(&code.as_str()) {
            return Self::Validation {
                field: None,
                message,
            };
        }

        if status == 409 {
            return Self::InvalidState { code, message };
        }

        Self::Rejected {
            status,
            code: if code.is_empty() {
                "unknown".to_string()
            } else {
                code
            },
            message,
        }
    }

    /// Returns true if retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl QueryError for ApiError {
    fn is_transient(&self) -> bool {
        ApiError::is_transient(self)
    }

    fn is_not_found(&self) -> bool {
        ApiError::is_not_found(self)
    }
}

/// Error body returned by the backends.
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    let api_err = err.chain().find_map(|cause| cause.downcast_ref::<ApiError>());
    match api_err {
        Some(ApiError::Transport { .. }) => {
            eprintln!(
                "\n{}",
                "Hint: Check connectivity to the backend and the VMAPI_URL / NAPI_URL settings."
                    .yellow()
            );
        }
        Some(ApiError::Rejected { status, .. }) if *status == 401 || *status == 403 => {
            eprintln!(
                "\n{}",
                "Hint: The backend refused the request; check the owner you are acting for."
                    .yellow()
            );
        }
        Some(ApiError::InvalidState { .. }) => {
            eprintln!(
                "\n{}",
                "Hint: Wait for the VM to settle (`vmhctl vms wait`) before retrying.".yellow()
            );
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn body(code: &str, message: &str) -> ApiErrorBody {
        ApiErrorBody {
            code: Some(code.to_string()),
            message: Some(message.to_string()),
        }
    }

    #[rstest]
    #[case(404, "ResourceNotFound", "not_found")]
    #[case(404, "", "not_found")]
    #[case(409, "VmNotRunning", "invalid_state")]
    #[case(409, "ValidationFailed", "validation")]
    #[case(400, "", "validation")]
    #[case(422, "InvalidArgument", "validation")]
    #[case(403, "NotAuthorized", "rejected")]
    #[case(401, "", "rejected")]
    fn test_status_mapping(#[case] status: u16, #[case] code: &str, #[case] expected: &str) {
        let err = ApiError::from_status(status, body(code, "boom"), "/vms");
        let kind = match err {
            ApiError::NotFound(_) => "not_found",
            ApiError::InvalidState { .. } => "invalid_state",
            ApiError::Validation { .. } => "validation",
            ApiError::Rejected { .. } => "rejected",
            _ => "other",
        };
        assert_eq!(kind, expected);
    }

    #[test]
    fn test_invalid_state_is_verbatim() {
        let err = ApiError::from_status(409, body("VmNotStopped", "VM is running"), "/vms/x");
        match err {
            ApiError::InvalidState { code, message } => {
                assert_eq!(code, "VmNotStopped");
                assert_eq!(message, "VM is running");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_body_uses_path() {
        let err = ApiError::from_status(404, ApiErrorBody::default(), "/vms/abc");
        assert_eq!(err.to_string(), "not found: /vms/abc returned 404");
    }

    #[test]
    fn test_only_transport_is_transient() {
        let transport = ApiError::Transport {
            method: "GET".to_string(),
            path: "/vms".to_string(),
            status: Some(503),
            attempts: 2,
            message: "unavailable".to_string(),
        };
        assert!(transport.is_transient());
        assert!(!ApiError::NotFound("x".to_string()).is_transient());
        assert!(!ApiError::missing_field("owner_uuid").is_transient());
        assert!(ApiError::NotFound("x".to_string()).is_not_found());
    }

    #[test]
    fn test_client_setup_error_is_terminal() {
        let err = ApiError::Client {
            backend: "vmapi",
            message: "no TLS backend".to_string(),
        };
        assert!(!err.is_transient());
        assert!(!err.is_not_found());
        assert_eq!(
            err.to_string(),
            "failed to create HTTP client for vmapi: no TLS backend"
        );
    }
}
