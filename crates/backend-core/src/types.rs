use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key algorithm the engine replenishes one-time and fallback keys for.
pub const PRIMARY_KEY_ALGORITHM: &str = "signed_curve25519";

/// Engine lifecycle state reported to consumers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineLifecycleState {
    /// No account is configured; nothing is running.
    Disconnected,
    /// `Bootstrap` was accepted and account setup is in progress.
    Bootstrapping,
    /// The first full-state poll is running (or retrying on gateway errors).
    InitialSync,
    /// Steady state: the incremental long-poll loop is running.
    Syncing,
    /// A sync cycle failed with a protocol error; the next cycle is armed
    /// behind a fixed delay.
    RetryBackoff,
    /// Logout completed and session state was cleared.
    LoggedOut,
    /// Unrecoverable failure (auth loss, corrupt store, bootstrap failure).
    Fatal,
}

/// Opaque server-issued position marker for resuming the event stream.
///
/// Persisted after every successfully processed batch and never rewound
/// except on full account reset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SyncToken(String);

impl SyncToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SyncToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-side count of unused pre-keys, keyed by algorithm identifier.
///
/// Authoritative only immediately after a fetch; staleness is tolerated for
/// one sync cycle.
pub type OneTimeKeyCounts = BTreeMap<String, u64>;

/// Room membership as seen by this account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Membership {
    Join,
    Invite,
    Leave,
}

/// Message kind for plain message payloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageType {
    /// Standard text message.
    Text,
    /// Non-intrusive/system-like notice.
    Notice,
    /// Emote message.
    Emote,
}

/// Decoded content of one timeline event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventPayload {
    /// Plain (or already decrypted) room message.
    Message {
        /// Display-ready text body.
        body: String,
        /// Message kind.
        msgtype: MessageType,
    },
    /// Membership change for a user in the room.
    Membership {
        /// The user whose membership changed.
        user_id: String,
        /// The new membership.
        change: Membership,
    },
    /// Encrypted event the crypto module has not (yet) decrypted.
    Encrypted {
        /// Group session the ciphertext belongs to.
        session_id: String,
        /// Opaque ciphertext payload.
        ciphertext: Value,
    },
    /// Any other state or ephemeral event; skipped by message previews.
    State {
        /// Protocol event type.
        event_type: String,
        /// Raw event content.
        content: Value,
    },
}

/// One event in a room's ordered log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineEvent {
    /// Server-assigned event ID; the deduplication key.
    pub event_id: String,
    /// Sender user ID.
    pub sender: String,
    /// Server timestamp in milliseconds since Unix epoch.
    pub origin_ts_ms: u64,
    /// Client transaction ID echoed back for this account's own sends.
    pub txn_id: Option<String>,
    /// Decoded payload.
    pub payload: EventPayload,
}

/// A locally authored event not yet acknowledged by the server.
///
/// Owned by its room timeline until an echoed event with a matching
/// transaction ID promotes it to a confirmed entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingMessage {
    /// Client-generated transaction ID.
    pub txn_id: String,
    /// Sender user ID (this account).
    pub sender: String,
    /// Outgoing payload; already wrapped for encrypted rooms.
    pub payload: EventPayload,
    /// Local queue timestamp in milliseconds since Unix epoch.
    pub queued_at_ms: u64,
}

/// Cached "last message" preview for a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LastMessage {
    /// Most recent ordinary message in the scanned window.
    Message {
        sender: String,
        body: String,
        origin_ts_ms: u64,
    },
    /// Synthetic preview used when this account's own join is in the
    /// scanned window; takes priority over ordinary messages.
    YouJoined,
}

/// Lightweight room metadata for consumer room lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomSummary {
    /// Room ID.
    pub room_id: String,
    /// Best-effort display name.
    pub name: Option<String>,
    /// This account's membership.
    pub membership: Membership,
    /// Unread notification count reported by sync.
    pub unread_notifications: u64,
    /// Highlight/mention count reported by sync.
    pub highlight_count: u64,
    /// Cached preview of the newest relevant event.
    pub last_message: Option<LastMessage>,
}

/// Tuning values for the engine; defaults carry the production constants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Target minimum count of available one-time keys.
    pub one_time_key_watermark: u64,
    /// Grace window before a replaced fallback key is forgotten.
    pub fallback_rotation_grace_ms: u64,
    /// Server-side wait for the first full-state poll.
    pub initial_sync_timeout_ms: u64,
    /// Server-side wait for incremental long polls.
    pub incremental_sync_timeout_ms: u64,
    /// Fixed delay before re-arming a cycle after a protocol error.
    pub protocol_retry_delay_ms: u64,
    /// Cache compaction runs every this many processed cycles.
    pub compaction_interval_cycles: u64,
    /// Connectivity probe interval.
    pub connectivity_probe_interval_ms: u64,
    /// Upper bound on the backward scan when recomputing a room preview.
    pub last_message_scan_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            one_time_key_watermark: 50,
            fallback_rotation_grace_ms: 5 * 60 * 1000,
            initial_sync_timeout_ms: 0,
            incremental_sync_timeout_ms: 30_000,
            protocol_retry_delay_ms: 10_000,
            compaction_interval_cycles: 500,
            connectivity_probe_interval_ms: 15_000,
            last_message_scan_cap: 1000,
        }
    }
}

/// Command channel input accepted by the engine runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineCommand {
    /// Configure the account, then run bootstrap and the sync loop.
    Bootstrap {
        /// Account identifier, for example `@alice:example.org`.
        account_id: String,
        /// Homeserver base URL.
        homeserver: String,
        /// Access token for the RPC client.
        access_token: String,
    },
    /// Queue a message for a room; the engine assigns the transaction ID.
    SendMessage {
        /// Target room ID.
        room_id: String,
        /// Message content.
        content: Value,
    },
    /// Abandon in-flight work, disarm timers, clear session state.
    Logout,
}

/// Event channel output emitted by the engine runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineEvent {
    /// Engine lifecycle transition.
    StateChanged {
        /// New lifecycle state.
        state: EngineLifecycleState,
    },
    /// The room list is populated (after initial sync, and again whenever
    /// a batch adds or removes rooms).
    RoomListReady {
        /// Current room summaries.
        rooms: Vec<RoomSummary>,
    },
    /// A room's cached preview changed.
    LastMessageChanged {
        /// Target room ID.
        room_id: String,
        /// New preview; `None` when the scanned window held nothing relevant.
        last_message: Option<LastMessage>,
    },
    /// New events were appended to a room's log.
    NewEventsStored {
        /// Target room ID.
        room_id: String,
        /// First appended index in the room's event log.
        start: usize,
        /// One past the last appended index.
        end: usize,
    },
    /// The session is no longer usable; the user must authenticate again.
    LoginRequired {
        /// Human-readable reason (stale token, corrupt local state, ...).
        reason: String,
    },
    /// A merged batch raised a room's highlight count.
    NotificationMessage {
        /// Target room ID.
        room_id: String,
        /// Preview to show for the notification.
        summary: LastMessage,
    },
    /// A message was stored as pending and will be sent.
    SendQueued {
        /// Target room ID.
        room_id: String,
        /// Engine-assigned transaction ID.
        txn_id: String,
    },
    /// A message could not be queued or sent.
    SendFailed {
        /// Target room ID.
        room_id: String,
        /// Engine-assigned transaction ID when one was assigned.
        txn_id: Option<String>,
        /// Stable error code.
        code: String,
    },
    /// Sync loop status update.
    SyncStatus {
        /// Whether the loop is currently armed.
        running: bool,
        /// Delay before the next cycle when backing off.
        backoff_ms: Option<u64>,
    },
    /// Connectivity probe edge (lost or restored).
    ConnectivityChanged {
        /// `true` when the server became reachable again.
        online: bool,
    },
    /// Unrecoverable runtime error that is not an authentication problem.
    FatalError {
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}
