use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use backend_core::{
    EngineError, EngineErrorCategory, Membership, PendingMessage, SyncToken, TimelineEvent,
};

use crate::rpc::SyncResponse;

/// What opening the store for an account revealed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CacheOpenReport {
    /// The store was just created; no prior account state exists.
    Fresh,
    /// The store matches the current schema version.
    Current,
    /// The store predates the current schema and needs migration.
    Older { version: u32 },
    /// The store was written by a newer build and cannot be trusted.
    Newer { version: u32 },
}

/// Errors reported by the state cache.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The store hit its size limit; compaction may free space.
    #[error("store is full")]
    Full,
    /// Stored data could not be parsed; local state is untrusted.
    #[error("store contents could not be parsed: {0}")]
    Corrupt(String),
    /// Any other backend failure.
    #[error("store backend failure: {0}")]
    Backend(String),
}

impl From<CacheError> for EngineError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Full => EngineError::new(
                EngineErrorCategory::StoreFull,
                "store_full",
                err.to_string(),
            ),
            CacheError::Corrupt(_) => EngineError::new(
                EngineErrorCategory::StoreCorrupt,
                "store_corrupt",
                err.to_string(),
            ),
            CacheError::Backend(_) => EngineError::new(
                EngineErrorCategory::Storage,
                "store_backend_error",
                err.to_string(),
            ),
        }
    }
}

/// Durable pre-key bookkeeping: the publication flag and the pending
/// fallback rotation deadline, both of which survive restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct KeyLifecycleState {
    /// Whether the most recently generated key batch was marked published.
    pub keys_published: bool,
    /// Absolute Unix deadline (ms) for forgetting the previous fallback
    /// key, when a rotation is pending.
    pub rotation_deadline_ms: Option<u64>,
}

/// Durable per-room state; the source of truth the in-memory timeline is
/// rebuilt from on restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub name: Option<String>,
    pub membership: Membership,
    pub encrypted: bool,
    pub events: Vec<TimelineEvent>,
    pub pending: Vec<PendingMessage>,
    pub unread_notifications: u64,
    pub highlight_count: u64,
}

/// The local persistent store, reduced to the operations the engine makes.
///
/// Writes are transactional on the implementation side; a `Full` error is a
/// recognized condition the engine answers with compact-then-retry-once.
#[async_trait]
pub trait StateCache: Send + Sync {
    /// Open (creating if needed) the store for an account.
    async fn open(&self, account_id: &str) -> Result<CacheOpenReport, CacheError>;

    /// Migrate an older store to the current schema version.
    async fn migrate(&self, from_version: u32) -> Result<(), CacheError>;

    async fn load_cursor(&self) -> Result<Option<SyncToken>, CacheError>;

    async fn save_cursor(&self, token: &SyncToken) -> Result<(), CacheError>;

    /// Persist a processed sync batch.
    async fn save_state(&self, batch: &SyncResponse) -> Result<(), CacheError>;

    /// Persist one room's full durable state (event log and pending set).
    async fn save_room_state(&self, snapshot: &RoomSnapshot) -> Result<(), CacheError>;

    async fn load_room_state(&self, room_id: &str) -> Result<Option<RoomSnapshot>, CacheError>;

    /// Room IDs with durable state, for restart reconstruction.
    async fn list_rooms(&self) -> Result<Vec<String>, CacheError>;

    async fn load_key_state(&self) -> Result<Option<KeyLifecycleState>, CacheError>;

    async fn save_key_state(&self, state: &KeyLifecycleState) -> Result<(), CacheError>;

    /// Drop a departed room's durable state.
    async fn remove_room_state(&self, room_id: &str) -> Result<(), CacheError>;

    /// Drop data past the server-side retention horizon.
    async fn compact(&self) -> Result<(), CacheError>;
}

/// Compact-then-retry-once write helpers shared by every cache user.
#[async_trait]
pub trait StateCacheExt: StateCache {
    async fn save_cursor_compacting(&self, token: &SyncToken) -> Result<(), CacheError> {
        match self.save_cursor(token).await {
            Err(CacheError::Full) => {
                self.compact().await?;
                self.save_cursor(token).await
            }
            other => other,
        }
    }

    async fn save_state_compacting(&self, batch: &SyncResponse) -> Result<(), CacheError> {
        match self.save_state(batch).await {
            Err(CacheError::Full) => {
                self.compact().await?;
                self.save_state(batch).await
            }
            other => other,
        }
    }

    async fn save_room_state_compacting(&self, snapshot: &RoomSnapshot) -> Result<(), CacheError> {
        match self.save_room_state(snapshot).await {
            Err(CacheError::Full) => {
                self.compact().await?;
                self.save_room_state(snapshot).await
            }
            other => other,
        }
    }
}

impl<C: StateCache + ?Sized> StateCacheExt for C {}

#[derive(Debug, Default)]
struct MemoryCacheInner {
    opened: bool,
    cursor: Option<SyncToken>,
    rooms: HashMap<String, RoomSnapshot>,
    key_state: Option<KeyLifecycleState>,
}

/// In-memory cache for tests and the smoke binary.
///
/// `compact` trims each room's event log to the newest `retention_events`
/// entries, standing in for a real retention-horizon sweep.
#[derive(Debug)]
pub struct MemoryStateCache {
    inner: RwLock<MemoryCacheInner>,
    retention_events: usize,
}

impl MemoryStateCache {
    pub fn new(retention_events: usize) -> Self {
        Self {
            inner: RwLock::new(MemoryCacheInner::default()),
            retention_events: retention_events.max(1),
        }
    }
}

impl Default for MemoryStateCache {
    fn default() -> Self {
        Self::new(512)
    }
}

#[async_trait]
impl StateCache for MemoryStateCache {
    async fn open(&self, _account_id: &str) -> Result<CacheOpenReport, CacheError> {
        let mut inner = self.inner.write().await;
        if inner.opened {
            Ok(CacheOpenReport::Current)
        } else {
            inner.opened = true;
            Ok(CacheOpenReport::Fresh)
        }
    }

    async fn migrate(&self, from_version: u32) -> Result<(), CacheError> {
        Err(CacheError::Backend(format!(
            "memory store has no migrations (requested from version {from_version})"
        )))
    }

    async fn load_cursor(&self) -> Result<Option<SyncToken>, CacheError> {
        Ok(self.inner.read().await.cursor.clone())
    }

    async fn save_cursor(&self, token: &SyncToken) -> Result<(), CacheError> {
        self.inner.write().await.cursor = Some(token.clone());
        Ok(())
    }

    async fn save_state(&self, _batch: &SyncResponse) -> Result<(), CacheError> {
        Ok(())
    }

    async fn save_room_state(&self, snapshot: &RoomSnapshot) -> Result<(), CacheError> {
        self.inner
            .write()
            .await
            .rooms
            .insert(snapshot.room_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load_room_state(&self, room_id: &str) -> Result<Option<RoomSnapshot>, CacheError> {
        Ok(self.inner.read().await.rooms.get(room_id).cloned())
    }

    async fn list_rooms(&self) -> Result<Vec<String>, CacheError> {
        let mut rooms: Vec<String> = self.inner.read().await.rooms.keys().cloned().collect();
        rooms.sort();
        Ok(rooms)
    }

    async fn load_key_state(&self) -> Result<Option<KeyLifecycleState>, CacheError> {
        Ok(self.inner.read().await.key_state.clone())
    }

    async fn save_key_state(&self, state: &KeyLifecycleState) -> Result<(), CacheError> {
        self.inner.write().await.key_state = Some(state.clone());
        Ok(())
    }

    async fn remove_room_state(&self, room_id: &str) -> Result<(), CacheError> {
        self.inner.write().await.rooms.remove(room_id);
        Ok(())
    }

    async fn compact(&self) -> Result<(), CacheError> {
        let mut inner = self.inner.write().await;
        for snapshot in inner.rooms.values_mut() {
            if snapshot.events.len() > self.retention_events {
                let excess = snapshot.events.len() - self.retention_events;
                snapshot.events.drain(0..excess);
            }
        }
        Ok(())
    }
}
