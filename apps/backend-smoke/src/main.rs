//! One full engine pass against in-process fakes: bootstrap, initial sync,
//! an incremental batch, a queued send, logout.

mod logging;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;
use tokio::time::timeout;
use tracing::info;

use backend_core::{
    EngineCommand, EngineConfig, EngineEvent, EngineLifecycleState, EventPayload, MessageType,
    OneTimeKeyCounts, SyncToken, TimelineEvent,
};
use backend_sync::{
    EngineContext, spawn_engine,
    cache::MemoryStateCache,
    crypto::PlaintextCrypto,
    rpc::{
        JoinedRoomUpdate, KeyClaimRequest, KeyUploadRequest, RpcError, SyncRequest, SyncResponse,
        SyncRpc,
    },
};

/// Serves a scripted batch sequence, then parks further polls like a real
/// long poll with nothing new to report.
struct ScriptedServer {
    batches: Mutex<VecDeque<SyncResponse>>,
}

impl ScriptedServer {
    fn new(batches: Vec<SyncResponse>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
        }
    }
}

#[async_trait]
impl SyncRpc for ScriptedServer {
    fn set_access_token(&self, _token: Option<String>) {}

    fn abort_pending(&self) {}

    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, RpcError> {
        info!(since = ?request.since, timeout_ms = request.timeout_ms, "poll received");
        let next = self.batches.lock().ok().and_then(|mut b| b.pop_front());
        match next {
            Some(batch) => Ok(batch),
            None => std::future::pending().await,
        }
    }

    async fn upload_keys(&self, request: KeyUploadRequest) -> Result<OneTimeKeyCounts, RpcError> {
        info!(
            one_time_keys = request.one_time_keys.len(),
            fallback = request.fallback_key.is_some(),
            "key upload received"
        );
        Ok(OneTimeKeyCounts::new())
    }

    async fn claim_keys(&self, _request: KeyClaimRequest) -> Result<(), RpcError> {
        Ok(())
    }

    async fn get_versions(&self) -> Result<(), RpcError> {
        Ok(())
    }
}

fn message(event_id: &str, sender: &str, body: &str, ts: u64) -> TimelineEvent {
    TimelineEvent {
        event_id: event_id.to_owned(),
        sender: sender.to_owned(),
        origin_ts_ms: ts,
        txn_id: None,
        payload: EventPayload::Message {
            body: body.to_owned(),
            msgtype: MessageType::Text,
        },
    }
}

fn scripted_batches() -> Vec<SyncResponse> {
    let initial = SyncResponse {
        joined: vec![JoinedRoomUpdate {
            room_id: "!lobby:smoke.example".to_owned(),
            name: Some("Lobby".to_owned()),
            events: vec![
                message("$1", "@bob:smoke.example", "hello alice", 1_000),
                message("$2", "@bob:smoke.example", "anyone around?", 2_000),
            ],
            encrypted: false,
            unread_notifications: 1,
            highlight_count: 0,
        }],
        ..SyncResponse::empty(SyncToken::new("smoke-1"))
    };

    let incremental = SyncResponse {
        joined: vec![JoinedRoomUpdate {
            room_id: "!lobby:smoke.example".to_owned(),
            name: None,
            events: vec![message("$3", "@bob:smoke.example", "ah, there you are", 3_000)],
            encrypted: false,
            unread_notifications: 2,
            highlight_count: 0,
        }],
        ..SyncResponse::empty(SyncToken::new("smoke-2"))
    };

    vec![initial, incremental]
}

async fn wait_for(
    events: &mut backend_core::EventStream,
    what: &str,
    predicate: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    loop {
        let event = match timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(err)) => {
                eprintln!("event stream closed while waiting for {what}: {err}");
                std::process::exit(1);
            }
            Err(_) => {
                eprintln!("timed out waiting for {what}");
                std::process::exit(1);
            }
        };
        info!(?event, "engine event");
        if predicate(&event) {
            return event;
        }
    }
}

#[tokio::main]
async fn main() {
    logging::init();

    let context = EngineContext {
        rpc: Arc::new(ScriptedServer::new(scripted_batches())),
        cache: Arc::new(MemoryStateCache::default()),
        crypto: Arc::new(PlaintextCrypto::default()),
        config: EngineConfig::default(),
    };

    let handle = spawn_engine(context);
    let mut events = handle.subscribe();

    if let Err(err) = handle
        .send(EngineCommand::Bootstrap {
            account_id: "@alice:smoke.example".to_owned(),
            homeserver: "https://smoke.example".to_owned(),
            access_token: "syt_smoke".to_owned(),
        })
        .await
    {
        eprintln!("failed to enqueue bootstrap: {err}");
        std::process::exit(1);
    }

    wait_for(&mut events, "room list", |event| {
        matches!(event, EngineEvent::RoomListReady { .. })
    })
    .await;
    wait_for(&mut events, "steady sync", |event| {
        matches!(
            event,
            EngineEvent::StateChanged {
                state: EngineLifecycleState::Syncing
            }
        )
    })
    .await;
    wait_for(&mut events, "incremental batch", |event| {
        matches!(event, EngineEvent::NewEventsStored { start, .. } if *start > 0)
    })
    .await;

    if let Err(err) = handle
        .send(EngineCommand::SendMessage {
            room_id: "!lobby:smoke.example".to_owned(),
            content: json!({"body": "hello from the smoke run"}),
        })
        .await
    {
        eprintln!("failed to enqueue send: {err}");
        std::process::exit(1);
    }
    wait_for(&mut events, "send ack", |event| {
        matches!(event, EngineEvent::SendQueued { .. })
    })
    .await;

    if let Err(err) = handle.send(EngineCommand::Logout).await {
        eprintln!("failed to enqueue logout: {err}");
        std::process::exit(1);
    }
    wait_for(&mut events, "logout", |event| {
        matches!(
            event,
            EngineEvent::StateChanged {
                state: EngineLifecycleState::LoggedOut
            }
        )
    })
    .await;

    println!("smoke pass complete: bootstrap, sync, send, and logout all behaved");
}
