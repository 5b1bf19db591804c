//! Sync engine runtime for WrenChat.
//!
//! Owns the account bootstrap sequence, the indefinite long-poll loop, room
//! timeline reconciliation, and pre-key lifecycle, against injected
//! collaborators: an RPC client ([`rpc::SyncRpc`]), a persistent state cache
//! ([`cache::StateCache`]), and a session crypto module
//! ([`crypto::SessionCrypto`]). Consumers drive it with
//! [`backend_core::EngineCommand`]s and observe a broadcast stream of
//! [`backend_core::EngineEvent`]s.

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use backend_core::{
    EngineChannelError, EngineChannels, EngineCommand, EngineConfig, EngineEvent,
    EngineLifecycleState, EventStream,
};

/// Persistent state cache contract and in-memory implementation.
pub mod cache;
/// Session crypto contract and plaintext test implementation.
pub mod crypto;
/// Pre-key generation, upload, trimming, and rotation.
pub mod keys;
/// Abstract RPC client contract and wire types.
pub mod rpc;
/// The sync engine and its single-sequence worker.
pub mod sync;
/// Room timelines and the per-conversation registry.
pub mod timeline;

mod connectivity;

use connectivity::ConnectivityMonitor;
use sync::{SyncWorker, WorkerMsg};

/// Injected collaborator bundle; no component reaches for globals.
#[derive(Clone)]
pub struct EngineContext {
    pub rpc: Arc<dyn rpc::SyncRpc>,
    pub cache: Arc<dyn cache::StateCache>,
    pub crypto: Arc<dyn crypto::SessionCrypto>,
    pub config: EngineConfig,
}

/// Cheap cloneable handle for driving a spawned engine runtime.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    channels: EngineChannels,
}

impl EngineHandle {
    pub async fn send(&self, command: EngineCommand) -> Result<(), EngineChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Spawn the engine runtime and return its handle.
pub fn spawn_engine(context: EngineContext) -> EngineHandle {
    let (channels, command_rx) = EngineChannels::new(128, 512);
    let runtime = EngineRuntime::new(context, channels.clone(), command_rx);
    tokio::spawn(runtime.run());

    EngineHandle { channels }
}

struct RunningSession {
    cancel: CancellationToken,
    worker: tokio::task::JoinHandle<()>,
    worker_tx: mpsc::Sender<WorkerMsg>,
    monitor: ConnectivityMonitor,
}

struct EngineRuntime {
    context: EngineContext,
    channels: EngineChannels,
    command_rx: mpsc::Receiver<EngineCommand>,
    session: Option<RunningSession>,
}

impl EngineRuntime {
    fn new(
        context: EngineContext,
        channels: EngineChannels,
        command_rx: mpsc::Receiver<EngineCommand>,
    ) -> Self {
        Self {
            context,
            channels,
            command_rx,
            session: None,
        }
    }

    async fn run(mut self) {
        while let Some(command) = self.command_rx.recv().await {
            self.handle_command(command).await;
        }
        // All handles dropped: tear the session down like a logout.
        self.teardown_session().await;
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Bootstrap {
                account_id,
                homeserver,
                access_token,
            } => self.handle_bootstrap(account_id, homeserver, access_token),
            EngineCommand::SendMessage { room_id, content } => {
                let Some(session) = &self.session else {
                    self.channels.emit(EngineEvent::SendFailed {
                        room_id,
                        txn_id: None,
                        code: "invalid_state_transition".to_owned(),
                    });
                    return;
                };

                let send = session.worker_tx.send(WorkerMsg::Send {
                    room_id: room_id.clone(),
                    content,
                });
                if send.await.is_err() {
                    self.channels.emit(EngineEvent::SendFailed {
                        room_id,
                        txn_id: None,
                        code: "engine_unavailable".to_owned(),
                    });
                }
            }
            EngineCommand::Logout => {
                if self.session.is_none() {
                    self.channels.emit(EngineEvent::FatalError {
                        code: "invalid_state_transition".to_owned(),
                        message: "no session to log out".to_owned(),
                    });
                    return;
                }
                self.teardown_session().await;
                self.channels.emit(EngineEvent::StateChanged {
                    state: EngineLifecycleState::LoggedOut,
                });
            }
        }
    }

    fn handle_bootstrap(&mut self, account_id: String, homeserver: String, access_token: String) {
        if self.session.is_some() {
            self.channels.emit(EngineEvent::FatalError {
                code: "invalid_state_transition".to_owned(),
                message: "a session is already running; log out first".to_owned(),
            });
            return;
        }

        info!(account_id = %account_id, "starting engine session");
        let cancel = CancellationToken::new();
        let (worker_tx, worker_rx) = mpsc::channel(64);

        let worker = SyncWorker::new(
            &self.context,
            account_id,
            homeserver,
            access_token,
            self.channels.event_sender(),
            cancel.clone(),
        );
        let worker = tokio::spawn(worker.run(worker_rx));

        let monitor = ConnectivityMonitor::spawn(
            Arc::clone(&self.context.rpc),
            Duration::from_millis(self.context.config.connectivity_probe_interval_ms),
            worker_tx.clone(),
        );

        self.session = Some(RunningSession {
            cancel,
            worker,
            worker_tx,
            monitor,
        });
    }

    /// Logout ordering: abandon in-flight work, stop the probe, then wait
    /// for the worker to leave its sequence so nothing writes to the cache
    /// afterwards, and only then drop credentials.
    async fn teardown_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        session.cancel.cancel();
        session.monitor.stop();
        self.context.rpc.abort_pending();
        let _ = session.worker.await;
        self.context.rpc.set_access_token(None);
        info!("engine session torn down");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::Mutex,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::timeout;

    use backend_core::{
        EventPayload, MessageType, OneTimeKeyCounts, SyncToken, TimelineEvent,
    };

    use crate::{
        cache::MemoryStateCache,
        crypto::PlaintextCrypto,
        rpc::{
            JoinedRoomUpdate, KeyClaimRequest, KeyUploadRequest, RpcError, SyncRequest,
            SyncResponse, SyncRpc,
        },
    };

    use super::*;

    /// Serves scripted sync responses, then parks further polls forever
    /// like a real long poll with no new events.
    struct LoopbackRpc {
        sync_results: Mutex<VecDeque<Result<SyncResponse, RpcError>>>,
        token_present: AtomicBool,
    }

    impl LoopbackRpc {
        fn scripted(results: Vec<Result<SyncResponse, RpcError>>) -> Self {
            Self {
                sync_results: Mutex::new(results.into()),
                token_present: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl SyncRpc for LoopbackRpc {
        fn set_access_token(&self, token: Option<String>) {
            self.token_present.store(token.is_some(), Ordering::SeqCst);
        }

        fn abort_pending(&self) {}

        async fn sync(&self, _request: SyncRequest) -> Result<SyncResponse, RpcError> {
            let next = self.sync_results.lock().expect("results lock").pop_front();
            match next {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }

        async fn upload_keys(
            &self,
            _request: KeyUploadRequest,
        ) -> Result<OneTimeKeyCounts, RpcError> {
            Ok(OneTimeKeyCounts::new())
        }

        async fn claim_keys(&self, _request: KeyClaimRequest) -> Result<(), RpcError> {
            Ok(())
        }

        async fn get_versions(&self) -> Result<(), RpcError> {
            Ok(())
        }
    }

    fn initial_response() -> SyncResponse {
        SyncResponse {
            joined: vec![JoinedRoomUpdate {
                room_id: "!r1:example.org".to_owned(),
                name: Some("Reading Group".to_owned()),
                events: vec![TimelineEvent {
                    event_id: "$1".to_owned(),
                    sender: "@bob:example.org".to_owned(),
                    origin_ts_ms: 1,
                    txn_id: None,
                    payload: EventPayload::Message {
                        body: "welcome".to_owned(),
                        msgtype: MessageType::Text,
                    },
                }],
                encrypted: false,
                unread_notifications: 0,
                highlight_count: 0,
            }],
            ..SyncResponse::empty(SyncToken::new("s1"))
        }
    }

    fn handle_with(rpc: Arc<LoopbackRpc>) -> EngineHandle {
        spawn_engine(EngineContext {
            rpc,
            cache: Arc::new(MemoryStateCache::default()),
            crypto: Arc::new(PlaintextCrypto::default()),
            config: EngineConfig::default(),
        })
    }

    async fn wait_for(
        events: &mut EventStream,
        mut predicate: impl FnMut(&EngineEvent) -> bool,
    ) -> EngineEvent {
        loop {
            let event = timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event timeout")
                .expect("event receive");
            if predicate(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn runs_bootstrap_initial_sync_steady_and_logout() {
        let rpc = Arc::new(LoopbackRpc::scripted(vec![Ok(initial_response())]));
        let handle = handle_with(Arc::clone(&rpc));
        let mut events = handle.subscribe();

        handle
            .send(EngineCommand::Bootstrap {
                account_id: "@alice:example.org".to_owned(),
                homeserver: "https://chat.example.org".to_owned(),
                access_token: "syt_secret".to_owned(),
            })
            .await
            .expect("command should enqueue");

        wait_for(&mut events, |event| {
            matches!(
                event,
                EngineEvent::StateChanged {
                    state: EngineLifecycleState::InitialSync
                }
            )
        })
        .await;

        let ready = wait_for(&mut events, |event| {
            matches!(event, EngineEvent::RoomListReady { .. })
        })
        .await;
        match ready {
            EngineEvent::RoomListReady { rooms } => {
                assert_eq!(rooms.len(), 1);
                assert_eq!(rooms[0].room_id, "!r1:example.org");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        wait_for(&mut events, |event| {
            matches!(
                event,
                EngineEvent::StateChanged {
                    state: EngineLifecycleState::Syncing
                }
            )
        })
        .await;

        handle
            .send(EngineCommand::Logout)
            .await
            .expect("logout should enqueue");
        wait_for(&mut events, |event| {
            matches!(
                event,
                EngineEvent::StateChanged {
                    state: EngineLifecycleState::LoggedOut
                }
            )
        })
        .await;
        assert!(!rpc.token_present.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn send_without_a_session_fails_with_stable_code() {
        let rpc = Arc::new(LoopbackRpc::scripted(Vec::new()));
        let handle = handle_with(rpc);
        let mut events = handle.subscribe();

        handle
            .send(EngineCommand::SendMessage {
                room_id: "!r1:example.org".to_owned(),
                content: json!({"body": "hello"}),
            })
            .await
            .expect("command should enqueue");

        let event = wait_for(&mut events, |event| {
            matches!(event, EngineEvent::SendFailed { .. })
        })
        .await;
        match event {
            EngineEvent::SendFailed { code, .. } => {
                assert_eq!(code, "invalid_state_transition");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_to_synced_room_is_queued() {
        let rpc = Arc::new(LoopbackRpc::scripted(vec![Ok(initial_response())]));
        let handle = handle_with(rpc);
        let mut events = handle.subscribe();

        handle
            .send(EngineCommand::Bootstrap {
                account_id: "@alice:example.org".to_owned(),
                homeserver: "https://chat.example.org".to_owned(),
                access_token: "syt_secret".to_owned(),
            })
            .await
            .expect("command should enqueue");
        wait_for(&mut events, |event| {
            matches!(
                event,
                EngineEvent::StateChanged {
                    state: EngineLifecycleState::Syncing
                }
            )
        })
        .await;

        handle
            .send(EngineCommand::SendMessage {
                room_id: "!r1:example.org".to_owned(),
                content: json!({"body": "hello"}),
            })
            .await
            .expect("command should enqueue");

        let event = wait_for(&mut events, |event| {
            matches!(event, EngineEvent::SendQueued { .. })
        })
        .await;
        match event {
            EngineEvent::SendQueued { room_id, .. } => {
                assert_eq!(room_id, "!r1:example.org");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_token_on_initial_sync_demands_login() {
        let rpc = Arc::new(LoopbackRpc::scripted(vec![Err(RpcError::server(
            401,
            Some("M_UNKNOWN_TOKEN"),
            "token expired",
        ))]));
        let handle = handle_with(rpc);
        let mut events = handle.subscribe();

        handle
            .send(EngineCommand::Bootstrap {
                account_id: "@alice:example.org".to_owned(),
                homeserver: "https://chat.example.org".to_owned(),
                access_token: "syt_stale".to_owned(),
            })
            .await
            .expect("command should enqueue");

        wait_for(&mut events, |event| {
            matches!(
                event,
                EngineEvent::StateChanged {
                    state: EngineLifecycleState::Fatal
                }
            )
        })
        .await;
        wait_for(&mut events, |event| {
            matches!(event, EngineEvent::LoginRequired { .. })
        })
        .await;
    }
}
