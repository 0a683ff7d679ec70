use crate::types::{BmcId, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── Mapping errors ───────────────────────────────────────────

/// Why a node could not be routed to a BMC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingErrorCode {
    MappingNotFound,
    EndpointMissing,
    CredentialMissing,
}

impl MappingErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingErrorCode::MappingNotFound => "mapping_not_found",
            MappingErrorCode::EndpointMissing => "endpoint_missing",
            MappingErrorCode::CredentialMissing => "credential_missing",
        }
    }
}

/// Routing failure for a single node. A value, not a control-flow error: the
/// engine branches on `code` and records it on the task.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{detail}")]
pub struct MappingError {
    pub code: MappingErrorCode,
    pub node_id: NodeId,
    pub bmc_id: Option<BmcId>,
    pub detail: String,
}

impl MappingError {
    pub fn not_found(node_id: &str) -> Self {
        Self {
            code: MappingErrorCode::MappingNotFound,
            node_id: node_id.to_string(),
            bmc_id: None,
            detail: format!("no BMC mapping for node {node_id}"),
        }
    }

    pub fn endpoint_missing(node_id: &str, bmc_id: &str) -> Self {
        Self {
            code: MappingErrorCode::EndpointMissing,
            node_id: node_id.to_string(),
            bmc_id: Some(bmc_id.to_string()),
            detail: format!("BMC {bmc_id} for node {node_id} has no endpoint"),
        }
    }

    pub fn credential_missing(node_id: &str, bmc_id: &str) -> Self {
        Self {
            code: MappingErrorCode::CredentialMissing,
            node_id: node_id.to_string(),
            bmc_id: Some(bmc_id.to_string()),
            detail: format!("BMC {bmc_id} for node {node_id} has no credential id"),
        }
    }
}

// ─── Execution errors ─────────────────────────────────────────

/// HTTP statuses the executor retries: request timeout, too-early,
/// throttling, and gateway-class 5xx.
const RETRYABLE_STATUSES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

/// Outcome classification of one Redfish round trip.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// Connect/reset/timeout at the transport layer. Retryable.
    #[error("transport error: {detail}")]
    Transport { detail: String },

    /// Non-2xx HTTP response. Retryable only for the throttle/5xx set.
    #[error("http {status}: {detail}")]
    Http { status: u16, detail: String },

    /// Malformed Systems list, unknown PowerState, undecodable body. Terminal.
    #[error("protocol error: {detail}")]
    Protocol { detail: String },
}

impl ExecutionError {
    pub fn transport(detail: impl Into<String>) -> Self {
        ExecutionError::Transport {
            detail: detail.into(),
        }
    }

    pub fn http(status: u16, detail: impl Into<String>) -> Self {
        ExecutionError::Http {
            status,
            detail: detail.into(),
        }
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        ExecutionError::Protocol {
            detail: detail.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutionError::Transport { .. } => true,
            ExecutionError::Http { status, .. } => RETRYABLE_STATUSES.contains(status),
            ExecutionError::Protocol { .. } => false,
        }
    }

    /// Persisted `error_code` for this classification.
    pub fn task_error_code(&self) -> &'static str {
        match self {
            ExecutionError::Transport { .. } => codes::RETRYABLE_TRANSPORT,
            ExecutionError::Http { status, .. } if RETRYABLE_STATUSES.contains(status) => {
                codes::RETRYABLE_HTTP
            }
            ExecutionError::Http { .. } => codes::TERMINAL_HTTP_CLIENT,
            ExecutionError::Protocol { .. } => codes::TERMINAL_PROTOCOL,
        }
    }
}

impl From<reqwest::Error> for ExecutionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            ExecutionError::transport(e.to_string())
        } else if e.is_decode() {
            ExecutionError::protocol(e.to_string())
        } else {
            ExecutionError::transport(e.to_string())
        }
    }
}

// ─── Verification errors ──────────────────────────────────────

/// Why post-action verification did not confirm the expected state.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("expected state not observed within {window_ms}ms")]
    Timeout { window_ms: u64 },

    /// A terminal read error aborts verification immediately.
    #[error("verification read failed: {0}")]
    Read(ExecutionError),
}

// ─── Persisted task error codes ───────────────────────────────

/// String codes stored in `transition_tasks.error_code`.
pub mod codes {
    pub const MAPPING_NOT_FOUND: &str = "mapping_not_found";
    pub const ENDPOINT_MISSING: &str = "endpoint_missing";
    pub const CREDENTIAL_MISSING: &str = "credential_missing";
    pub const RETRYABLE_TRANSPORT: &str = "retryable_transport";
    pub const RETRYABLE_HTTP: &str = "retryable_http_5xx_or_throttle";
    pub const TERMINAL_HTTP_CLIENT: &str = "terminal_http_client";
    pub const TERMINAL_PROTOCOL: &str = "terminal_protocol";
    pub const VERIFICATION_TIMEOUT: &str = "verification_timeout";
    pub const VERIFICATION_READ_ERROR: &str = "verification_terminal_read_error";
    pub const DEADLINE_EXCEEDED: &str = "deadline_exceeded";
    pub const CANCELLED: &str = "cancelled";
    pub const PERSISTENCE: &str = "persistence";
}
