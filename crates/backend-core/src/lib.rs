//! Core engine contract shared between the sync runtime and its consumers.
//!
//! This crate defines the command/event protocol, lifecycle model, retry and
//! error-classification helpers, and common channel abstractions.

/// Async command/event channel primitives.
pub mod channel;
/// Stable engine error types and sync-failure classification.
pub mod error;
/// Sync-cycle retry policy (fixed delay, no exponential growth).
pub mod retry;
/// Engine lifecycle state machine.
pub mod state_machine;
/// Protocol and domain types (commands, events, timelines, config).
pub mod types;

pub use channel::{EngineChannelError, EngineChannels, EventStream};
pub use error::{EngineError, EngineErrorCategory, SyncFailureClass, classify_sync_failure};
pub use retry::RetryPolicy;
pub use state_machine::EngineStateMachine;
pub use types::{
    EngineCommand, EngineConfig, EngineEvent, EngineLifecycleState, EventPayload, LastMessage,
    Membership, MessageType, OneTimeKeyCounts, PendingMessage, PRIMARY_KEY_ALGORITHM, RoomSummary,
    SyncToken, TimelineEvent,
};
