use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use backend_core::{
    EngineConfig, EngineError, EngineErrorCategory, EngineEvent, EventPayload, LastMessage,
    Membership, MessageType, PendingMessage, RoomSummary, TimelineEvent,
};

use crate::{
    cache::RoomSnapshot,
    crypto::SessionCrypto,
    rpc::{InvitedRoomUpdate, JoinedRoomUpdate, LeftRoomUpdate},
};

/// Result of merging one batch of events into a room timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Half-open index range of appended events, when any were appended.
    pub appended: Option<(usize, usize)>,
    /// Whether the cached last-message preview changed.
    pub last_message_changed: bool,
}

/// One conversation's ordered event log and local send queue.
#[derive(Debug)]
pub struct RoomTimeline {
    room_id: String,
    name: Option<String>,
    membership: Membership,
    encrypted: bool,
    events: Vec<TimelineEvent>,
    seen_event_ids: HashSet<String>,
    pending: Vec<PendingMessage>,
    last_message: Option<LastMessage>,
    unread_notifications: u64,
    highlight_count: u64,
    session_indexes: HashMap<String, u64>,
    failed_decryptions: u64,
    scan_cap: usize,
}

impl RoomTimeline {
    fn new(room_id: String, membership: Membership, scan_cap: usize) -> Self {
        Self {
            room_id,
            name: None,
            membership,
            encrypted: false,
            events: Vec::new(),
            seen_event_ids: HashSet::new(),
            pending: Vec::new(),
            last_message: None,
            unread_notifications: 0,
            highlight_count: 0,
            session_indexes: HashMap::new(),
            failed_decryptions: 0,
            scan_cap,
        }
    }

    fn from_snapshot(snapshot: &RoomSnapshot, scan_cap: usize, own_user_id: &str) -> Self {
        let mut timeline = Self::new(snapshot.room_id.clone(), snapshot.membership, scan_cap);
        timeline.name = snapshot.name.clone();
        timeline.encrypted = snapshot.encrypted;
        timeline.seen_event_ids = snapshot
            .events
            .iter()
            .map(|event| event.event_id.clone())
            .collect();
        timeline.events = snapshot.events.clone();
        timeline.pending = snapshot.pending.clone();
        timeline.unread_notifications = snapshot.unread_notifications;
        timeline.highlight_count = snapshot.highlight_count;
        timeline.recompute_last_message(own_user_id);
        timeline
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn pending(&self) -> &[PendingMessage] {
        &self.pending
    }

    pub fn last_message(&self) -> Option<&LastMessage> {
        self.last_message.as_ref()
    }

    pub fn failed_decryptions(&self) -> u64 {
        self.failed_decryptions
    }

    /// Append new server events in order, deduplicating by event ID.
    ///
    /// An echoed transaction ID promotes the matching pending message in
    /// place. Encrypted payloads are decrypted with a fresh per-session
    /// index; a decryption failure is recorded and merging continues.
    pub fn merge_events(
        &mut self,
        crypto: &dyn SessionCrypto,
        events: &[TimelineEvent],
        own_user_id: &str,
    ) -> MergeOutcome {
        let start = self.events.len();

        for incoming in events {
            if self.seen_event_ids.contains(&incoming.event_id) {
                continue;
            }

            if let Some(txn_id) = incoming.txn_id.as_deref()
                && let Some(position) = self.pending.iter().position(|p| p.txn_id == txn_id)
            {
                debug!(room_id = %self.room_id, txn_id, "server echo promotes pending message");
                self.pending.remove(position);
            }

            let decrypted = match &incoming.payload {
                EventPayload::Encrypted {
                    session_id,
                    ciphertext,
                } => {
                    let index = self.next_session_index(session_id);
                    match crypto.decrypt_event(index, session_id, ciphertext) {
                        Ok(plain) => Some(decoded_payload(&plain)),
                        Err(err) => {
                            // The missing session key usually arrives later;
                            // keep the ciphertext entry and move on.
                            self.failed_decryptions += 1;
                            debug!(
                                room_id = %self.room_id,
                                event_id = %incoming.event_id,
                                error = %err,
                                "event left undecrypted"
                            );
                            None
                        }
                    }
                }
                _ => None,
            };

            let mut event = incoming.clone();
            if let Some(payload) = decrypted {
                event.payload = payload;
            }

            self.seen_event_ids.insert(event.event_id.clone());
            self.events.push(event);
        }

        let end = self.events.len();
        let previous = self.last_message.clone();
        self.recompute_last_message(own_user_id);

        MergeOutcome {
            appended: (start != end).then_some((start, end)),
            last_message_changed: previous != self.last_message,
        }
    }

    /// Store a locally authored message as pending, wrapping the content
    /// with the room's group session first when the room is encrypted.
    pub fn queue_pending(
        &mut self,
        crypto: &dyn SessionCrypto,
        own_user_id: &str,
        content: &Value,
        now_ms: u64,
    ) -> Result<PendingMessage, EngineError> {
        let payload = if self.encrypted {
            let (session_id, ciphertext) = crypto
                .encrypt_group_message(&self.room_id, content)
                .map_err(|err| {
                    EngineError::new(
                        EngineErrorCategory::Crypto,
                        "send_encryption_failed",
                        err.to_string(),
                    )
                })?;
            EventPayload::Encrypted {
                session_id,
                ciphertext,
            }
        } else {
            message_payload(content).ok_or_else(|| {
                EngineError::new(
                    EngineErrorCategory::Config,
                    "invalid_message_content",
                    "message content has no body".to_owned(),
                )
            })?
        };

        let pending = PendingMessage {
            txn_id: Uuid::new_v4().to_string(),
            sender: own_user_id.to_owned(),
            payload,
            queued_at_ms: now_ms,
        };
        self.pending.push(pending.clone());
        Ok(pending)
    }

    /// Durable form of this timeline.
    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room_id.clone(),
            name: self.name.clone(),
            membership: self.membership,
            encrypted: self.encrypted,
            events: self.events.clone(),
            pending: self.pending.clone(),
            unread_notifications: self.unread_notifications,
            highlight_count: self.highlight_count,
        }
    }

    fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.room_id.clone(),
            name: self.name.clone(),
            membership: self.membership,
            unread_notifications: self.unread_notifications,
            highlight_count: self.highlight_count,
            last_message: self.last_message.clone(),
        }
    }

    fn next_session_index(&mut self, session_id: &str) -> u64 {
        let counter = self
            .session_indexes
            .entry(session_id.to_owned())
            .or_insert(0);
        let index = *counter;
        *counter += 1;
        index
    }

    /// Scan backward from the newest event (bounded by `scan_cap`), skipping
    /// non-message events. This account's own join beats any ordinary
    /// message found in the window.
    fn recompute_last_message(&mut self, own_user_id: &str) {
        let mut newest_message: Option<LastMessage> = None;

        for event in self.events.iter().rev().take(self.scan_cap) {
            match &event.payload {
                EventPayload::Membership {
                    user_id,
                    change: Membership::Join,
                } if user_id == own_user_id => {
                    self.last_message = Some(LastMessage::YouJoined);
                    return;
                }
                EventPayload::Message { body, .. } if newest_message.is_none() => {
                    newest_message = Some(LastMessage::Message {
                        sender: event.sender.clone(),
                        body: body.clone(),
                        origin_ts_ms: event.origin_ts_ms,
                    });
                }
                _ => {}
            }
        }

        self.last_message = newest_message;
    }
}

/// Outcome of applying one sync batch across all rooms.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Per-room events to broadcast, in application order.
    pub events: Vec<EngineEvent>,
    /// Whether rooms were created, removed, or changed membership.
    pub membership_changed: bool,
    /// Rooms whose durable state should be dropped.
    pub removed_rooms: Vec<String>,
    /// Rooms whose durable state should be re-persisted.
    pub touched_rooms: Vec<String>,
}

/// Owns one timeline per known conversation and reconciles server batches
/// against locally queued messages.
#[derive(Debug)]
pub struct RoomTimelineRegistry {
    own_user_id: String,
    scan_cap: usize,
    rooms: HashMap<String, RoomTimeline>,
}

impl RoomTimelineRegistry {
    pub fn new(own_user_id: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            own_user_id: own_user_id.into(),
            scan_cap: config.last_message_scan_cap,
            rooms: HashMap::new(),
        }
    }

    /// Rebuild one room from its durable snapshot (restart path).
    pub fn restore_room(&mut self, snapshot: &RoomSnapshot) {
        let timeline = RoomTimeline::from_snapshot(snapshot, self.scan_cap, &self.own_user_id);
        self.rooms.insert(snapshot.room_id.clone(), timeline);
    }

    pub fn room(&self, room_id: &str) -> Option<&RoomTimeline> {
        self.rooms.get(room_id)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Apply one sync batch. Room creation and removal are idempotent:
    /// applying the same batch twice yields identical state and no
    /// duplicate events.
    pub fn apply_batch(
        &mut self,
        crypto: &dyn SessionCrypto,
        joined: &[JoinedRoomUpdate],
        invited: &[InvitedRoomUpdate],
        left: &[LeftRoomUpdate],
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let scan_cap = self.scan_cap;
        let own_user_id = self.own_user_id.clone();

        for update in joined {
            let created = !self.rooms.contains_key(&update.room_id);
            let timeline = self.rooms.entry(update.room_id.clone()).or_insert_with(|| {
                RoomTimeline::new(update.room_id.clone(), Membership::Join, scan_cap)
            });

            if created || timeline.membership != Membership::Join {
                timeline.membership = Membership::Join;
                outcome.membership_changed = true;
            }
            if update.name.is_some() {
                timeline.name = update.name.clone();
            }
            timeline.encrypted |= update.encrypted;

            let merge = timeline.merge_events(crypto, &update.events, &own_user_id);
            if let Some((start, end)) = merge.appended {
                outcome.events.push(EngineEvent::NewEventsStored {
                    room_id: update.room_id.clone(),
                    start,
                    end,
                });
                outcome.touched_rooms.push(update.room_id.clone());
            }
            if merge.last_message_changed {
                outcome.events.push(EngineEvent::LastMessageChanged {
                    room_id: update.room_id.clone(),
                    last_message: timeline.last_message.clone(),
                });
            }

            if update.highlight_count > timeline.highlight_count
                && let Some(summary) = timeline.last_message.clone()
            {
                outcome.events.push(EngineEvent::NotificationMessage {
                    room_id: update.room_id.clone(),
                    summary,
                });
            }
            timeline.unread_notifications = update.unread_notifications;
            timeline.highlight_count = update.highlight_count;
        }

        for update in invited {
            let created = !self.rooms.contains_key(&update.room_id);
            let timeline = self.rooms.entry(update.room_id.clone()).or_insert_with(|| {
                RoomTimeline::new(update.room_id.clone(), Membership::Invite, scan_cap)
            });
            if update.name.is_some() {
                timeline.name = update.name.clone();
            }
            if created {
                outcome.membership_changed = true;
            }
        }

        for update in left {
            if self.rooms.remove(&update.room_id).is_some() {
                debug!(room_id = %update.room_id, "departure confirmed; destroying timeline");
                outcome.membership_changed = true;
                outcome.removed_rooms.push(update.room_id.clone());
            }
        }

        outcome
    }

    /// Queue a message for a joined room; the pending entry is stored (and
    /// visible to local readers) before any network traffic happens.
    pub fn queue_pending(
        &mut self,
        crypto: &dyn SessionCrypto,
        room_id: &str,
        content: &Value,
    ) -> Result<PendingMessage, EngineError> {
        let own_user_id = self.own_user_id.clone();
        let timeline = self.rooms.get_mut(room_id).ok_or_else(|| {
            EngineError::new(
                EngineErrorCategory::Config,
                "room_not_found",
                format!("room not found: {room_id}"),
            )
        })?;

        if timeline.membership != Membership::Join {
            return Err(EngineError::new(
                EngineErrorCategory::Config,
                "room_not_joined",
                format!("cannot send to {room_id} without joining it"),
            ));
        }

        let result = timeline.queue_pending(crypto, &own_user_id, content, unix_time_ms());
        if let Err(err) = &result {
            warn!(room_id, error = %err, "send aborted before queueing");
        }
        result
    }

    /// Current room summaries, sorted by room ID.
    pub fn room_summaries(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self
            .rooms
            .values()
            .map(RoomTimeline::summary)
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }

    /// Durable snapshot for one room, if it exists.
    pub fn snapshot_for(&self, room_id: &str) -> Option<RoomSnapshot> {
        self.rooms.get(room_id).map(RoomTimeline::snapshot)
    }
}

/// Decode a decrypted (or plain) content value into a payload.
fn decoded_payload(content: &Value) -> EventPayload {
    match message_payload(content) {
        Some(payload) => payload,
        None => EventPayload::State {
            event_type: content
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("m.unknown")
                .to_owned(),
            content: content.clone(),
        },
    }
}

fn message_payload(content: &Value) -> Option<EventPayload> {
    let body = content.get("body").and_then(Value::as_str)?.to_owned();
    let msgtype = match content.get("msgtype").and_then(Value::as_str) {
        Some("m.notice") => MessageType::Notice,
        Some("m.emote") => MessageType::Emote,
        _ => MessageType::Text,
    };
    Some(EventPayload::Message { body, msgtype })
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
