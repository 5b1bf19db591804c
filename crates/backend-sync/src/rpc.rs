use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use backend_core::{
    EngineError, EngineErrorCategory, OneTimeKeyCounts, SyncFailureClass, SyncToken,
    TimelineEvent, classify_sync_failure,
};

use crate::crypto::PreKey;

/// Error returned by the RPC client.
///
/// `http_status` is `None` for transport-layer failures that never produced
/// an HTTP response; `protocol_code` carries the server's machine-readable
/// error code when one was present.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rpc request failed (status {http_status:?}, code {protocol_code:?}): {message}")]
pub struct RpcError {
    pub http_status: Option<u16>,
    pub protocol_code: Option<String>,
    pub message: String,
}

impl RpcError {
    /// Transport-layer failure with no HTTP response.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            http_status: None,
            protocol_code: None,
            message: message.into(),
        }
    }

    /// Server response with a status and optional protocol error code.
    pub fn server(
        http_status: u16,
        protocol_code: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            http_status: Some(http_status),
            protocol_code: protocol_code.map(ToOwned::to_owned),
            message: message.into(),
        }
    }

    /// Whether the request never reached the server at all.
    pub fn is_transport(&self) -> bool {
        self.http_status.is_none()
    }

    /// Whether the server reported the endpoint as unsupported.
    pub fn is_not_found(&self) -> bool {
        self.http_status == Some(404)
    }

    /// Retry classification for this failure.
    pub fn classify(&self) -> SyncFailureClass {
        classify_sync_failure(self.http_status, self.protocol_code.as_deref())
    }

    /// Wrap into a stable engine error under the given code.
    pub fn to_engine_error(&self, code: &str) -> EngineError {
        let category = match self.classify() {
            SyncFailureClass::Transient => EngineErrorCategory::Network,
            SyncFailureClass::AuthInvalid => EngineErrorCategory::Auth,
            SyncFailureClass::Protocol => EngineErrorCategory::Protocol,
        };
        EngineError::new(category, code, self.to_string())
    }
}

/// Presence hint attached to sync polls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PresenceState {
    Online,
    Offline,
    Unavailable,
}

/// One sync poll request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncRequest {
    /// Resume cursor; `None` requests the full initial state.
    pub since: Option<SyncToken>,
    /// Server-side long-poll wait in milliseconds.
    pub timeout_ms: u64,
    /// Presence to advertise while polling.
    pub presence: PresenceState,
}

/// Per-room payload for a room this account has joined.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinedRoomUpdate {
    pub room_id: String,
    /// Best-effort display name from room state.
    pub name: Option<String>,
    /// New timeline events in server order.
    pub events: Vec<TimelineEvent>,
    /// Whether room state marks the room end-to-end encrypted.
    pub encrypted: bool,
    pub unread_notifications: u64,
    pub highlight_count: u64,
}

/// Per-room payload for a pending invite.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvitedRoomUpdate {
    pub room_id: String,
    pub name: Option<String>,
}

/// Per-room payload for a confirmed departure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeftRoomUpdate {
    pub room_id: String,
}

/// One sync poll response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncResponse {
    /// Cursor to resume from after this batch is processed.
    pub next_token: SyncToken,
    pub joined: Vec<JoinedRoomUpdate>,
    pub invited: Vec<InvitedRoomUpdate>,
    pub left: Vec<LeftRoomUpdate>,
    /// Server-side unused one-time key counts per algorithm.
    pub one_time_key_counts: OneTimeKeyCounts,
    /// Algorithms for which the server still holds an unused fallback key.
    pub unused_fallback_algorithms: Vec<String>,
}

impl SyncResponse {
    /// An empty batch resuming at `next_token`; test and fake-server helper.
    pub fn empty(next_token: SyncToken) -> Self {
        Self {
            next_token,
            joined: Vec::new(),
            invited: Vec::new(),
            left: Vec::new(),
            one_time_key_counts: OneTimeKeyCounts::new(),
            unused_fallback_algorithms: Vec::new(),
        }
    }
}

/// Pre-key upload request; all freshly generated keys go up in one call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct KeyUploadRequest {
    pub one_time_keys: Vec<PreKey>,
    pub fallback_key: Option<PreKey>,
}

impl KeyUploadRequest {
    pub fn is_empty(&self) -> bool {
        self.one_time_keys.is_empty() && self.fallback_key.is_none()
    }
}

/// Claim-and-discard request used to trim a runaway server-side surplus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyClaimRequest {
    pub algorithm: String,
    pub count: u64,
}

/// The chat protocol's HTTP API, reduced to the calls the engine makes.
///
/// Implementations own request serialization, transport, and credential
/// headers; the engine only sees typed pairs and `RpcError`.
#[async_trait]
pub trait SyncRpc: Send + Sync {
    /// Configure or clear the access token used by subsequent requests.
    fn set_access_token(&self, token: Option<String>);

    /// Abandon in-flight and queued requests (connectivity loss, logout).
    fn abort_pending(&self);

    /// Long-poll the event stream.
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, RpcError>;

    /// Upload freshly generated pre-keys; returns the new server-side counts.
    async fn upload_keys(&self, request: KeyUploadRequest)
    -> Result<OneTimeKeyCounts, RpcError>;

    /// Claim (and locally discard) pre-keys from this account's own supply.
    async fn claim_keys(&self, request: KeyClaimRequest) -> Result<(), RpcError>;

    /// Cheap reachability probe against the versions endpoint.
    async fn get_versions(&self) -> Result<(), RpcError>;
}
