use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::EngineLifecycleState;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Authentication failure; the session must be re-established.
    Auth,
    /// Transient network or gateway failure.
    Network,
    /// Any other server-reported error.
    Protocol,
    /// Local store backend failure other than the distinguished conditions.
    Storage,
    /// The local store reported a distinguished "full" condition.
    StoreFull,
    /// The local store could not be parsed; its contents are untrusted.
    StoreCorrupt,
    /// Session-crypto failure (session creation, encryption, decryption).
    Crypto,
    /// Internal engine bug or invariant break.
    Internal,
}

/// Stable engine error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct EngineError {
    /// High-level error category.
    pub category: EngineErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl EngineError {
    /// Construct a new engine error.
    pub fn new(
        category: EngineErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: EngineLifecycleState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            EngineErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while engine is in state {current:?}"),
        )
    }
}

/// How a failed sync request should be handled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncFailureClass {
    /// Network-level failure or gateway warm-up status; retry the same
    /// request with no backoff growth.
    Transient,
    /// The access token is no longer accepted; halt and require login.
    AuthInvalid,
    /// Any other server-reported error; reschedule after a fixed delay
    /// (initial sync treats this as fatal instead).
    Protocol,
}

/// Gateway statuses treated as "server still warming up", not failures.
const TRANSIENT_GATEWAY_STATUSES: [u16; 3] = [502, 504, 524];

/// Protocol error codes that invalidate the session regardless of status.
const AUTH_ERROR_CODES: [&str; 2] = ["M_UNKNOWN_TOKEN", "M_MISSING_TOKEN"];

/// Classify a failed sync request from its HTTP status and protocol code.
///
/// `http_status` is `None` for transport-layer failures that never produced
/// a response.
pub fn classify_sync_failure(
    http_status: Option<u16>,
    protocol_code: Option<&str>,
) -> SyncFailureClass {
    if let Some(code) = protocol_code
        && AUTH_ERROR_CODES.contains(&code)
    {
        return SyncFailureClass::AuthInvalid;
    }

    match http_status {
        None => SyncFailureClass::Transient,
        Some(status) if !(100..=599).contains(&status) => SyncFailureClass::Transient,
        Some(status) if TRANSIENT_GATEWAY_STATUSES.contains(&status) => {
            SyncFailureClass::Transient
        }
        Some(401) => SyncFailureClass::AuthInvalid,
        Some(_) => SyncFailureClass::Protocol,
    }
}
