use std::{future::Future, pin::Pin, sync::Arc};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use backend_core::{
    EngineCommand, EngineConfig, EngineError, EngineErrorCategory, EngineEvent,
    EngineStateMachine, OneTimeKeyCounts, RetryPolicy, SyncFailureClass, SyncToken,
};

use crate::{
    EngineContext,
    cache::{CacheOpenReport, StateCache, StateCacheExt},
    crypto::SessionCrypto,
    keys::KeyLifecycleManager,
    rpc::{PresenceState, RpcError, SyncRequest, SyncRpc, SyncResponse},
    timeline::RoomTimelineRegistry,
};

/// In-flight long poll; resolves on the RPC client's I/O context and is
/// consumed back on the worker's single sequence.
pub type SyncPollFuture = Pin<Box<dyn Future<Output = Result<SyncResponse, RpcError>> + Send>>;

/// How an initial-sync attempt resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialOutcome {
    /// State persisted and fed to the registry; move to the steady loop.
    Completed,
    /// Gateway warm-up failure; reissue the identical request.
    RetrySame,
    /// Any other server error; the session must be re-established.
    MustReauthenticate(String),
}

/// How an incremental cycle resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Batch processed and cursor advanced.
    Applied,
    /// Another cycle already advanced the cursor past this request's
    /// snapshot; the response was dropped.
    DiscardedStale,
    /// The poll itself failed; classification decides the re-arm.
    Failed(SyncFailureClass, String),
}

/// Owns all mutable sync state: the registry, the key manager, the cursor
/// bookkeeping, and the collaborator handles. Driven by [`SyncWorker`] on a
/// single logical sequence.
pub struct SyncEngine {
    rpc: Arc<dyn SyncRpc>,
    cache: Arc<dyn StateCache>,
    crypto: Arc<dyn SessionCrypto>,
    config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
    cancel: CancellationToken,
    keys: KeyLifecycleManager,
    registry: RoomTimelineRegistry,
    account_id: String,
    cycles_since_compaction: u64,
}

impl SyncEngine {
    pub fn new(
        context: &EngineContext,
        account_id: impl Into<String>,
        events: broadcast::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let account_id = account_id.into();
        Self {
            rpc: Arc::clone(&context.rpc),
            cache: Arc::clone(&context.cache),
            crypto: Arc::clone(&context.crypto),
            config: context.config.clone(),
            keys: KeyLifecycleManager::new(
                Arc::clone(&context.rpc),
                Arc::clone(&context.crypto),
                Arc::clone(&context.cache),
                &context.config,
            ),
            registry: RoomTimelineRegistry::new(account_id.clone(), &context.config),
            events,
            cancel,
            account_id,
            cycles_since_compaction: 0,
        }
    }

    pub fn registry(&self) -> &RoomTimelineRegistry {
        &self.registry
    }

    pub fn room_summaries(&self) -> Vec<backend_core::RoomSummary> {
        self.registry.room_summaries()
    }

    /// Validate the account, configure credentials, initialize the crypto
    /// identity, open the cache, and rebuild in-memory room state.
    ///
    /// Every failure here is fatal and surfaces to the caller; bootstrap is
    /// never retried automatically.
    pub async fn bootstrap(
        &mut self,
        homeserver: &str,
        access_token: &str,
    ) -> Result<(), EngineError> {
        validate_account_id(&self.account_id)?;
        if homeserver.trim().is_empty() {
            return Err(EngineError::new(
                EngineErrorCategory::Config,
                "invalid_homeserver",
                "homeserver URL is empty",
            ));
        }

        self.rpc.set_access_token(Some(access_token.to_owned()));

        let report = self
            .cache
            .open(&self.account_id)
            .await
            .map_err(EngineError::from)?;
        match report {
            CacheOpenReport::Fresh => {
                info!(account_id = %self.account_id, "fresh store; establishing new crypto identity");
                self.crypto
                    .initialize_identity(&self.account_id, true)
                    .map_err(EngineError::from)?;
            }
            CacheOpenReport::Current => {
                self.crypto
                    .initialize_identity(&self.account_id, false)
                    .map_err(EngineError::from)?;
            }
            CacheOpenReport::Older { version } => {
                info!(version, "migrating older store");
                self.cache.migrate(version).await.map_err(EngineError::from)?;
                self.crypto
                    .initialize_identity(&self.account_id, false)
                    .map_err(EngineError::from)?;
            }
            CacheOpenReport::Newer { version } => {
                return Err(EngineError::new(
                    EngineErrorCategory::Config,
                    "cache_from_future",
                    format!("store version {version} was written by a newer build"),
                ));
            }
        }

        for room_id in self.cache.list_rooms().await.map_err(EngineError::from)? {
            if let Some(snapshot) = self
                .cache
                .load_room_state(&room_id)
                .await
                .map_err(EngineError::from)?
            {
                self.registry.restore_room(&snapshot);
            }
        }

        self.keys.restore().await?;

        Ok(())
    }

    /// Pre-first-poll key work: announce identity keys (404 tolerated) and
    /// replenish unconditionally. Failures are logged, never fatal.
    pub async fn prepare_initial_keys(&mut self) {
        let counts = match self.keys.upload_initial_keys().await {
            Ok(Some(counts)) => counts,
            Ok(None) => OneTimeKeyCounts::new(),
            Err(err) => {
                warn!(error = %err, "initial key upload failed; continuing");
                OneTimeKeyCounts::new()
            }
        };

        if let Err(err) = self.keys.ensure_one_time_keys(&counts, &[]).await {
            warn!(error = %err, "pre-sync key replenishment failed; continuing");
        }
    }

    pub fn initial_request(&self) -> SyncRequest {
        SyncRequest {
            since: None,
            timeout_ms: self.config.initial_sync_timeout_ms,
            presence: PresenceState::Online,
        }
    }

    /// Hand the request to the RPC client without blocking the worker.
    pub fn start_poll(&self, request: SyncRequest) -> SyncPollFuture {
        let rpc = Arc::clone(&self.rpc);
        Box::pin(async move { rpc.sync(request).await })
    }

    pub async fn complete_initial(
        &mut self,
        result: Result<SyncResponse, RpcError>,
    ) -> Result<InitialOutcome, EngineError> {
        match result {
            Ok(response) => {
                let announced = self.apply_batch(response).await?;
                if !announced {
                    // Even an empty account announces its (empty) room list
                    // once the initial state is in.
                    self.emit(EngineEvent::RoomListReady {
                        rooms: self.registry.room_summaries(),
                    });
                }
                Ok(InitialOutcome::Completed)
            }
            Err(err) if err.classify() == SyncFailureClass::Transient => {
                debug!(error = %err, "initial sync treats gateway failure as warm-up; retrying");
                Ok(InitialOutcome::RetrySame)
            }
            Err(err) => Ok(InitialOutcome::MustReauthenticate(err.to_string())),
        }
    }

    /// Read the persisted cursor and start one incremental poll. A missing
    /// cursor is a fatal local-state error, never inferred around.
    pub async fn begin_incremental(&mut self) -> Result<(SyncToken, SyncPollFuture), EngineError> {
        let cursor = self
            .cache
            .load_cursor()
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| {
                EngineError::new(
                    EngineErrorCategory::StoreCorrupt,
                    "cursor_missing",
                    "no persisted sync cursor; local state cannot be trusted",
                )
            })?;

        let request = SyncRequest {
            since: Some(cursor.clone()),
            timeout_ms: self.config.incremental_sync_timeout_ms,
            presence: PresenceState::Online,
        };
        Ok((cursor, self.start_poll(request)))
    }

    pub async fn complete_incremental(
        &mut self,
        snapshot: SyncToken,
        result: Result<SyncResponse, RpcError>,
    ) -> Result<CycleOutcome, EngineError> {
        let response = match result {
            Ok(response) => response,
            Err(err) => return Ok(CycleOutcome::Failed(err.classify(), err.to_string())),
        };

        // Two overlapping cycles can race on a slow network: whoever
        // persists first wins, the straggler's response is dropped.
        let current = self.cache.load_cursor().await.map_err(EngineError::from)?;
        if current.as_ref() != Some(&snapshot) {
            warn!(snapshot = %snapshot, "discarding stale sync response; cursor already advanced");
            return Ok(CycleOutcome::DiscardedStale);
        }

        if let Err(err) = self
            .keys
            .ensure_one_time_keys(
                &response.one_time_key_counts,
                &response.unused_fallback_algorithms,
            )
            .await
        {
            warn!(error = %err, "key replenishment failed; continuing cycle");
        }

        self.apply_batch(response).await?;

        self.cycles_since_compaction += 1;
        if self.cycles_since_compaction >= self.config.compaction_interval_cycles {
            debug!(
                cycles = self.cycles_since_compaction,
                "compaction interval reached"
            );
            if let Err(err) = self.cache.compact().await {
                warn!(error = %err, "cache compaction failed");
            }
            self.cycles_since_compaction = 0;
        }

        Ok(CycleOutcome::Applied)
    }

    /// Queue a message as pending (stored and persisted before any network
    /// traffic) and announce it.
    pub async fn queue_send(&mut self, room_id: &str, content: &Value) -> Result<(), EngineError> {
        let pending = self
            .registry
            .queue_pending(self.crypto.as_ref(), room_id, content)?;
        self.emit(EngineEvent::SendQueued {
            room_id: room_id.to_owned(),
            txn_id: pending.txn_id.clone(),
        });

        if let Some(snapshot) = self.registry.snapshot_for(room_id) {
            self.cache
                .save_room_state_compacting(&snapshot)
                .await
                .map_err(EngineError::from)?;
        }
        Ok(())
    }

    pub fn abort_requests(&self) {
        self.rpc.abort_pending();
    }

    /// Disarm timers; called once the worker leaves its loop.
    pub fn shutdown(&mut self) {
        self.keys.disarm();
    }

    /// Persist and apply one successful batch, then advance the cursor.
    /// Returns whether a `RoomListReady` announcement went out.
    ///
    /// Checked against the cancellation token so nothing is written once
    /// logout has begun.
    async fn apply_batch(&mut self, response: SyncResponse) -> Result<bool, EngineError> {
        if self.cancel.is_cancelled() {
            return Err(cancelled_error());
        }

        self.cache
            .save_state_compacting(&response)
            .await
            .map_err(EngineError::from)?;

        let outcome = self.registry.apply_batch(
            self.crypto.as_ref(),
            &response.joined,
            &response.invited,
            &response.left,
        );

        for room_id in &outcome.removed_rooms {
            self.cache
                .remove_room_state(room_id)
                .await
                .map_err(EngineError::from)?;
        }
        for room_id in &outcome.touched_rooms {
            if let Some(snapshot) = self.registry.snapshot_for(room_id) {
                self.cache
                    .save_room_state_compacting(&snapshot)
                    .await
                    .map_err(EngineError::from)?;
            }
        }

        for event in outcome.events {
            self.emit(event);
        }
        if outcome.membership_changed {
            self.emit(EngineEvent::RoomListReady {
                rooms: self.registry.room_summaries(),
            });
        }

        if self.cancel.is_cancelled() {
            return Err(cancelled_error());
        }
        self.cache
            .save_cursor_compacting(&response.next_token)
            .await
            .map_err(EngineError::from)?;

        Ok(outcome.membership_changed)
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

fn cancelled_error() -> EngineError {
    EngineError::new(
        EngineErrorCategory::Internal,
        "cancelled",
        "logout began; batch dropped without touching the cache",
    )
}

fn validate_account_id(account_id: &str) -> Result<(), EngineError> {
    let well_formed = account_id
        .strip_prefix('@')
        .and_then(|rest| rest.split_once(':'))
        .is_some_and(|(localpart, domain)| !localpart.is_empty() && !domain.is_empty());

    if well_formed {
        Ok(())
    } else {
        Err(EngineError::new(
            EngineErrorCategory::Config,
            "invalid_account_id",
            format!("invalid account id '{account_id}'"),
        ))
    }
}

/// Messages marshaled onto the worker's sequence from the runtime and the
/// connectivity monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkerMsg {
    Send { room_id: String, content: Value },
    ConnectivityLost,
    ConnectivityRestored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    Steady,
}

/// What one `select!` round resolved to; applied after every armed future
/// has been dropped so the loop state can be mutated freely.
enum LoopAction {
    Shutdown,
    Msg(Option<WorkerMsg>),
    Completed(Option<SyncToken>, Result<SyncResponse, RpcError>),
    Arm,
}

/// The engine's single logical sequence: one task selecting over the
/// at-most-one in-flight poll, the internal message channel, the re-arm
/// timer, and the cancellation token.
pub(crate) struct SyncWorker {
    engine: SyncEngine,
    machine: EngineStateMachine,
    events: broadcast::Sender<EngineEvent>,
    cancel: CancellationToken,
    retry: RetryPolicy,
    homeserver: String,
    access_token: String,
    connectivity_lost: bool,
}

impl SyncWorker {
    pub(crate) fn new(
        context: &EngineContext,
        account_id: String,
        homeserver: String,
        access_token: String,
        events: broadcast::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let retry = RetryPolicy::new(0, context.config.protocol_retry_delay_ms);
        let engine = SyncEngine::new(context, account_id, events.clone(), cancel.clone());
        Self {
            engine,
            machine: EngineStateMachine::default(),
            events,
            cancel,
            retry,
            homeserver,
            access_token,
            connectivity_lost: false,
        }
    }

    pub(crate) async fn run(mut self, mut msg_rx: mpsc::Receiver<WorkerMsg>) {
        if !self.run_bootstrap().await {
            self.engine.shutdown();
            return;
        }

        self.engine.prepare_initial_keys().await;

        let cancel = self.cancel.clone();
        let mut phase = Phase::Initial;
        let mut inflight: Option<(Option<SyncToken>, SyncPollFuture)> =
            Some((None, self.engine.start_poll(self.engine.initial_request())));
        let mut wake_at: Option<Instant> = None;

        loop {
            let action = tokio::select! {
                _ = cancel.cancelled() => LoopAction::Shutdown,
                msg = msg_rx.recv() => LoopAction::Msg(msg),
                (snapshot, result) = poll_inflight(&mut inflight) => {
                    LoopAction::Completed(snapshot, result)
                }
                _ = wait_until(wake_at) => LoopAction::Arm,
            };

            match action {
                LoopAction::Shutdown | LoopAction::Msg(None) => break,
                LoopAction::Msg(Some(msg)) => {
                    self.handle_msg(msg, phase, &mut inflight, &mut wake_at).await;
                }
                LoopAction::Completed(snapshot, result) => {
                    inflight = None;
                    let proceed = match phase {
                        Phase::Initial => {
                            self.on_initial_result(result, &mut phase, &mut inflight, &mut wake_at)
                                .await
                        }
                        Phase::Steady => {
                            self.on_cycle_result(snapshot, result, &mut wake_at).await
                        }
                    };
                    if !proceed {
                        break;
                    }
                }
                LoopAction::Arm => {
                    wake_at = None;
                    if inflight.is_none() && !self.arm_cycle(&mut inflight).await {
                        break;
                    }
                }
            }
        }

        self.engine.shutdown();
    }

    async fn run_bootstrap(&mut self) -> bool {
        let accepted = self.machine.apply(&EngineCommand::Bootstrap {
            account_id: String::new(),
            homeserver: String::new(),
            access_token: String::new(),
        });
        match accepted {
            Ok(events) => {
                for event in events {
                    self.emit(event);
                }
            }
            Err(err) => {
                self.emit(EngineEvent::FatalError {
                    code: err.code,
                    message: err.message,
                });
                return false;
            }
        }

        let token = std::mem::take(&mut self.access_token);
        match self.engine.bootstrap(&self.homeserver, &token).await {
            Ok(()) => match self.machine.on_bootstrap_complete() {
                Ok(event) => {
                    self.emit(event);
                    true
                }
                Err(err) => {
                    self.fatal(err);
                    false
                }
            },
            Err(err) => {
                self.fatal(err);
                false
            }
        }
    }

    async fn on_initial_result(
        &mut self,
        result: Result<SyncResponse, RpcError>,
        phase: &mut Phase,
        inflight: &mut Option<(Option<SyncToken>, SyncPollFuture)>,
        wake_at: &mut Option<Instant>,
    ) -> bool {
        match self.engine.complete_initial(result).await {
            Ok(InitialOutcome::Completed) => {
                if let Ok(event) = self.machine.on_initial_sync_complete() {
                    self.emit(event);
                }
                self.emit(EngineEvent::SyncStatus {
                    running: true,
                    backoff_ms: None,
                });
                *phase = Phase::Steady;
                *wake_at = Some(Instant::now());
                true
            }
            Ok(InitialOutcome::RetrySame) => {
                if !self.connectivity_lost {
                    *inflight = Some((None, self.engine.start_poll(self.engine.initial_request())));
                }
                true
            }
            Ok(InitialOutcome::MustReauthenticate(reason)) => {
                self.login_required(reason);
                false
            }
            Err(err) => {
                self.fatal(err);
                false
            }
        }
    }

    async fn on_cycle_result(
        &mut self,
        snapshot: Option<SyncToken>,
        result: Result<SyncResponse, RpcError>,
        wake_at: &mut Option<Instant>,
    ) -> bool {
        let Some(snapshot) = snapshot else {
            return true;
        };

        match self.engine.complete_incremental(snapshot, result).await {
            Ok(CycleOutcome::Applied) | Ok(CycleOutcome::DiscardedStale) => {
                if !self.connectivity_lost {
                    *wake_at = Some(Instant::now());
                }
                true
            }
            Ok(CycleOutcome::Failed(class, message)) => match class {
                SyncFailureClass::Transient => {
                    debug!(message, "transient sync failure; retrying the same request");
                    if !self.connectivity_lost {
                        *wake_at = Some(Instant::now());
                    }
                    true
                }
                SyncFailureClass::AuthInvalid => {
                    self.login_required(message);
                    false
                }
                SyncFailureClass::Protocol => {
                    warn!(message, "sync cycle failed; rescheduling after fixed delay");
                    self.schedule_backoff(wake_at);
                    true
                }
            },
            Err(err) => match err.category {
                EngineErrorCategory::StoreCorrupt | EngineErrorCategory::Auth => {
                    self.login_required(err.message);
                    false
                }
                EngineErrorCategory::Internal if err.code == "cancelled" => false,
                _ => {
                    // Processing errors never kill the loop; the next cycle
                    // is re-armed behind the fixed delay.
                    warn!(error = %err, "cycle processing failed; rescheduling");
                    self.schedule_backoff(wake_at);
                    true
                }
            },
        }
    }

    async fn arm_cycle(
        &mut self,
        inflight: &mut Option<(Option<SyncToken>, SyncPollFuture)>,
    ) -> bool {
        if self.machine.state() == backend_core::EngineLifecycleState::RetryBackoff
            && let Ok(event) = self.machine.on_retry_elapsed()
        {
            self.emit(event);
        }

        match self.engine.begin_incremental().await {
            Ok((snapshot, poll)) => {
                *inflight = Some((Some(snapshot), poll));
                true
            }
            Err(err) => {
                self.login_required(err.message);
                false
            }
        }
    }

    async fn handle_msg(
        &mut self,
        msg: WorkerMsg,
        phase: Phase,
        inflight: &mut Option<(Option<SyncToken>, SyncPollFuture)>,
        wake_at: &mut Option<Instant>,
    ) {
        match msg {
            WorkerMsg::Send { room_id, content } => {
                let allowed = self.machine.apply(&EngineCommand::SendMessage {
                    room_id: String::new(),
                    content: Value::Null,
                });
                if let Err(err) = allowed {
                    self.emit(EngineEvent::SendFailed {
                        room_id,
                        txn_id: None,
                        code: err.code,
                    });
                    return;
                }

                if let Err(err) = self.engine.queue_send(&room_id, &content).await {
                    self.emit(EngineEvent::SendFailed {
                        room_id,
                        txn_id: None,
                        code: err.code,
                    });
                }
            }
            WorkerMsg::ConnectivityLost => {
                if self.connectivity_lost {
                    return;
                }
                info!("connectivity lost; abandoning in-flight requests");
                self.connectivity_lost = true;
                self.engine.abort_requests();
                *inflight = None;
                *wake_at = None;
                self.emit(EngineEvent::ConnectivityChanged { online: false });
                self.emit(EngineEvent::SyncStatus {
                    running: false,
                    backoff_ms: None,
                });
            }
            WorkerMsg::ConnectivityRestored => {
                if !self.connectivity_lost {
                    return;
                }
                info!("connectivity restored; re-arming sync");
                self.connectivity_lost = false;
                self.emit(EngineEvent::ConnectivityChanged { online: true });
                self.emit(EngineEvent::SyncStatus {
                    running: true,
                    backoff_ms: None,
                });
                match phase {
                    Phase::Initial => {
                        *inflight =
                            Some((None, self.engine.start_poll(self.engine.initial_request())));
                    }
                    Phase::Steady => {
                        *wake_at = Some(Instant::now());
                    }
                }
            }
        }
    }

    fn schedule_backoff(&mut self, wake_at: &mut Option<Instant>) {
        if let Some(event) = self.machine.on_cycle_failure(SyncFailureClass::Protocol) {
            self.emit(event);
        }
        let delay = self
            .retry
            .delay_for(SyncFailureClass::Protocol)
            .unwrap_or_default();
        self.emit(EngineEvent::SyncStatus {
            running: true,
            backoff_ms: Some(delay.as_millis() as u64),
        });
        if !self.connectivity_lost {
            *wake_at = Some(Instant::now() + delay);
        }
    }

    fn login_required(&mut self, reason: String) {
        let event = self.machine.on_fatal();
        self.emit(event);
        self.emit(EngineEvent::LoginRequired { reason });
    }

    fn fatal(&mut self, err: EngineError) {
        match err.category {
            EngineErrorCategory::StoreCorrupt | EngineErrorCategory::Auth => {
                self.login_required(err.message);
            }
            _ => {
                let event = self.machine.on_fatal();
                self.emit(event);
                self.emit(EngineEvent::FatalError {
                    code: err.code,
                    message: err.message,
                });
            }
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

async fn poll_inflight(
    inflight: &mut Option<(Option<SyncToken>, SyncPollFuture)>,
) -> (Option<SyncToken>, Result<SyncResponse, RpcError>) {
    match inflight {
        Some((snapshot, poll)) => {
            let result = poll.as_mut().await;
            (snapshot.clone(), result)
        }
        None => std::future::pending().await,
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::Mutex,
        sync::atomic::{AtomicU64, Ordering},
    };

    use async_trait::async_trait;
    use serde_json::json;

    use backend_core::{EventPayload, LastMessage, MessageType, TimelineEvent};

    use crate::{
        cache::{CacheError, KeyLifecycleState, MemoryStateCache, RoomSnapshot},
        crypto::PlaintextCrypto,
        rpc::{
            InvitedRoomUpdate, JoinedRoomUpdate, KeyClaimRequest, KeyUploadRequest,
            LeftRoomUpdate,
        },
    };

    use super::*;

    const ACCOUNT: &str = "@alice:example.org";
    const HOMESERVER: &str = "https://chat.example.org";

    #[derive(Default)]
    struct ScriptedRpc {
        sync_results: Mutex<VecDeque<Result<SyncResponse, RpcError>>>,
        sync_requests: Mutex<Vec<SyncRequest>>,
        upload_count: AtomicU64,
    }

    impl ScriptedRpc {
        fn scripted(results: Vec<Result<SyncResponse, RpcError>>) -> Self {
            Self {
                sync_results: Mutex::new(results.into()),
                ..Self::default()
            }
        }

        fn requests(&self) -> Vec<SyncRequest> {
            self.sync_requests.lock().expect("requests lock").clone()
        }
    }

    #[async_trait]
    impl SyncRpc for ScriptedRpc {
        fn set_access_token(&self, _token: Option<String>) {}

        fn abort_pending(&self) {}

        async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, RpcError> {
            self.sync_requests
                .lock()
                .expect("requests lock")
                .push(request);
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
            self.upload_count.fetch_add(1, Ordering::SeqCst);
            Ok(OneTimeKeyCounts::new())
        }

        async fn claim_keys(&self, _request: KeyClaimRequest) -> Result<(), RpcError> {
            Ok(())
        }

        async fn get_versions(&self) -> Result<(), RpcError> {
            Ok(())
        }
    }

    /// Memory cache with a scriptable open report and call counters.
    struct InstrumentedCache {
        inner: MemoryStateCache,
        open_report: Mutex<Option<CacheOpenReport>>,
        migrations: Mutex<Vec<u32>>,
        compactions: AtomicU64,
    }

    impl InstrumentedCache {
        fn new() -> Self {
            Self {
                inner: MemoryStateCache::default(),
                open_report: Mutex::new(None),
                migrations: Mutex::new(Vec::new()),
                compactions: AtomicU64::new(0),
            }
        }

        fn reporting(report: CacheOpenReport) -> Self {
            let cache = Self::new();
            *cache.open_report.lock().expect("report lock") = Some(report);
            cache
        }
    }

    #[async_trait]
    impl StateCache for InstrumentedCache {
        async fn open(&self, account_id: &str) -> Result<CacheOpenReport, CacheError> {
            let report = *self.open_report.lock().expect("report lock");
            match report {
                Some(report) => Ok(report),
                None => self.inner.open(account_id).await,
            }
        }

        async fn migrate(&self, from_version: u32) -> Result<(), CacheError> {
            self.migrations
                .lock()
                .expect("migrations lock")
                .push(from_version);
            Ok(())
        }

        async fn load_cursor(&self) -> Result<Option<SyncToken>, CacheError> {
            self.inner.load_cursor().await
        }

        async fn save_cursor(&self, token: &SyncToken) -> Result<(), CacheError> {
            self.inner.save_cursor(token).await
        }

        async fn save_state(&self, batch: &SyncResponse) -> Result<(), CacheError> {
            self.inner.save_state(batch).await
        }

        async fn save_room_state(&self, snapshot: &RoomSnapshot) -> Result<(), CacheError> {
            self.inner.save_room_state(snapshot).await
        }

        async fn load_room_state(
            &self,
            room_id: &str,
        ) -> Result<Option<RoomSnapshot>, CacheError> {
            self.inner.load_room_state(room_id).await
        }

        async fn list_rooms(&self) -> Result<Vec<String>, CacheError> {
            self.inner.list_rooms().await
        }

        async fn load_key_state(&self) -> Result<Option<KeyLifecycleState>, CacheError> {
            self.inner.load_key_state().await
        }

        async fn save_key_state(&self, state: &KeyLifecycleState) -> Result<(), CacheError> {
            self.inner.save_key_state(state).await
        }

        async fn remove_room_state(&self, room_id: &str) -> Result<(), CacheError> {
            self.inner.remove_room_state(room_id).await
        }

        async fn compact(&self) -> Result<(), CacheError> {
            self.compactions.fetch_add(1, Ordering::SeqCst);
            self.inner.compact().await
        }
    }

    fn context(rpc: Arc<ScriptedRpc>, cache: Arc<InstrumentedCache>) -> EngineContext {
        EngineContext {
            rpc,
            cache,
            crypto: Arc::new(PlaintextCrypto::default()),
            config: EngineConfig::default(),
        }
    }

    fn engine(context: &EngineContext) -> (SyncEngine, broadcast::Receiver<EngineEvent>) {
        let (events, rx) = broadcast::channel(64);
        (
            SyncEngine::new(context, ACCOUNT, events, CancellationToken::new()),
            rx,
        )
    }

    fn message_event(event_id: &str, body: &str, ts: u64) -> TimelineEvent {
        TimelineEvent {
            event_id: event_id.to_owned(),
            sender: "@bob:example.org".to_owned(),
            origin_ts_ms: ts,
            txn_id: None,
            payload: EventPayload::Message {
                body: body.to_owned(),
                msgtype: MessageType::Text,
            },
        }
    }

    fn one_room_response(token: &str) -> SyncResponse {
        SyncResponse {
            joined: vec![JoinedRoomUpdate {
                room_id: "!r1:example.org".to_owned(),
                name: Some("Reading Group".to_owned()),
                events: vec![
                    message_event("$1", "first", 1),
                    message_event("$2", "second", 2),
                    message_event("$3", "third", 3),
                ],
                encrypted: false,
                unread_notifications: 0,
                highlight_count: 0,
            }],
            ..SyncResponse::empty(SyncToken::new(token))
        }
    }

    #[tokio::test]
    async fn fresh_account_bootstrap_and_initial_sync_scenario() {
        let rpc = Arc::new(ScriptedRpc::default());
        let cache = Arc::new(InstrumentedCache::new());
        let ctx = context(Arc::clone(&rpc), Arc::clone(&cache));
        let (mut engine, _rx) = engine(&ctx);

        engine
            .bootstrap(HOMESERVER, "syt_secret")
            .await
            .expect("bootstrap should work");
        engine.prepare_initial_keys().await;
        assert!(rpc.upload_count.load(Ordering::SeqCst) >= 1);

        let outcome = engine
            .complete_initial(Ok(one_room_response("s1")))
            .await
            .expect("initial completion should work");
        assert_eq!(outcome, InitialOutcome::Completed);

        let room = engine
            .registry()
            .room("!r1:example.org")
            .expect("room must exist");
        assert_eq!(room.events().len(), 3);
        assert_eq!(
            room.last_message(),
            Some(&LastMessage::Message {
                sender: "@bob:example.org".to_owned(),
                body: "third".to_owned(),
                origin_ts_ms: 3,
            })
        );
        assert_eq!(
            cache.load_cursor().await.expect("cursor load"),
            Some(SyncToken::new("s1"))
        );
    }

    #[tokio::test]
    async fn gateway_failure_on_initial_sync_retries_without_cursor_change() {
        let rpc = Arc::new(ScriptedRpc::default());
        let cache = Arc::new(InstrumentedCache::new());
        let ctx = context(Arc::clone(&rpc), Arc::clone(&cache));
        let (mut engine, _rx) = engine(&ctx);
        engine
            .bootstrap(HOMESERVER, "syt_secret")
            .await
            .expect("bootstrap should work");

        let outcome = engine
            .complete_initial(Err(RpcError::server(504, None, "gateway timeout")))
            .await
            .expect("transient failure must not error");

        assert_eq!(outcome, InitialOutcome::RetrySame);
        assert_eq!(cache.load_cursor().await.expect("cursor load"), None);
    }

    #[tokio::test]
    async fn non_gateway_initial_failure_demands_reauthentication() {
        let rpc = Arc::new(ScriptedRpc::default());
        let cache = Arc::new(InstrumentedCache::new());
        let ctx = context(Arc::clone(&rpc), Arc::clone(&cache));
        let (mut engine, _rx) = engine(&ctx);
        engine
            .bootstrap(HOMESERVER, "syt_secret")
            .await
            .expect("bootstrap should work");

        let outcome = engine
            .complete_initial(Err(RpcError::server(500, Some("M_UNKNOWN"), "boom")))
            .await
            .expect("completion itself must not error");

        assert!(matches!(outcome, InitialOutcome::MustReauthenticate(_)));
    }

    #[tokio::test]
    async fn stale_response_is_discarded_without_corrupting_state() {
        let rpc = Arc::new(ScriptedRpc::scripted(vec![Ok(one_room_response("s3"))]));
        let cache = Arc::new(InstrumentedCache::new());
        let ctx = context(Arc::clone(&rpc), Arc::clone(&cache));
        let (mut engine, _rx) = engine(&ctx);
        engine
            .bootstrap(HOMESERVER, "syt_secret")
            .await
            .expect("bootstrap should work");

        cache
            .save_cursor(&SyncToken::new("c1"))
            .await
            .expect("seed cursor");
        let (snapshot, poll) = engine
            .begin_incremental()
            .await
            .expect("begin should work");
        assert_eq!(snapshot, SyncToken::new("c1"));

        // A competing cycle advances the cursor while this one is in flight.
        cache
            .save_cursor(&SyncToken::new("c2"))
            .await
            .expect("advance cursor");

        let result = poll.await;
        let outcome = engine
            .complete_incremental(snapshot, result)
            .await
            .expect("completion should work");

        assert_eq!(outcome, CycleOutcome::DiscardedStale);
        assert!(engine.registry().is_empty());
        assert_eq!(
            cache.load_cursor().await.expect("cursor load"),
            Some(SyncToken::new("c2"))
        );
    }

    #[tokio::test]
    async fn compaction_runs_exactly_once_at_the_interval() {
        let rpc = Arc::new(ScriptedRpc::default());
        let cache = Arc::new(InstrumentedCache::new());
        let ctx = context(Arc::clone(&rpc), Arc::clone(&cache));
        let (mut engine, _rx) = engine(&ctx);
        engine
            .bootstrap(HOMESERVER, "syt_secret")
            .await
            .expect("bootstrap should work");
        cache
            .save_cursor(&SyncToken::new("c0"))
            .await
            .expect("seed cursor");

        for cycle in 0..600u64 {
            let cursor = cache
                .load_cursor()
                .await
                .expect("cursor load")
                .expect("cursor must exist");
            let response = SyncResponse::empty(SyncToken::new(format!("c{}", cycle + 1)));
            let outcome = engine
                .complete_incremental(cursor, Ok(response))
                .await
                .expect("cycle should work");
            assert_eq!(outcome, CycleOutcome::Applied);
        }

        assert_eq!(cache.compactions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_cursor_is_a_fatal_local_state_error() {
        let rpc = Arc::new(ScriptedRpc::default());
        let cache = Arc::new(InstrumentedCache::new());
        let ctx = context(Arc::clone(&rpc), Arc::clone(&cache));
        let (mut engine, _rx) = engine(&ctx);
        engine
            .bootstrap(HOMESERVER, "syt_secret")
            .await
            .expect("bootstrap should work");

        let err = engine
            .begin_incremental()
            .await
            .err()
            .expect("missing cursor must fail");
        assert_eq!(err.code, "cursor_missing");
        assert_eq!(err.category, EngineErrorCategory::StoreCorrupt);
    }

    #[tokio::test]
    async fn bootstrap_rejects_malformed_account_ids() {
        let rpc = Arc::new(ScriptedRpc::default());
        let cache = Arc::new(InstrumentedCache::new());
        let ctx = context(Arc::clone(&rpc), Arc::clone(&cache));
        let (events, _rx) = broadcast::channel(16);
        let mut engine = SyncEngine::new(&ctx, "alice", events, CancellationToken::new());

        let err = engine
            .bootstrap(HOMESERVER, "syt_secret")
            .await
            .expect_err("malformed id must fail");
        assert_eq!(err.code, "invalid_account_id");
    }

    #[tokio::test]
    async fn bootstrap_fails_permanently_on_future_store() {
        let rpc = Arc::new(ScriptedRpc::default());
        let cache = Arc::new(InstrumentedCache::reporting(CacheOpenReport::Newer {
            version: 9,
        }));
        let ctx = context(Arc::clone(&rpc), Arc::clone(&cache));
        let (mut engine, _rx) = engine(&ctx);

        let err = engine
            .bootstrap(HOMESERVER, "syt_secret")
            .await
            .expect_err("future store must fail");
        assert_eq!(err.code, "cache_from_future");
    }

    #[tokio::test]
    async fn bootstrap_migrates_older_stores_before_proceeding() {
        let rpc = Arc::new(ScriptedRpc::default());
        let cache = Arc::new(InstrumentedCache::reporting(CacheOpenReport::Older {
            version: 2,
        }));
        let ctx = context(Arc::clone(&rpc), Arc::clone(&cache));
        let (mut engine, _rx) = engine(&ctx);

        engine
            .bootstrap(HOMESERVER, "syt_secret")
            .await
            .expect("bootstrap should work");
        assert_eq!(
            cache.migrations.lock().expect("migrations lock").clone(),
            vec![2]
        );
    }

    #[tokio::test]
    async fn queued_send_is_persisted_before_any_network_traffic() {
        let rpc = Arc::new(ScriptedRpc::default());
        let cache = Arc::new(InstrumentedCache::new());
        let ctx = context(Arc::clone(&rpc), Arc::clone(&cache));
        let (mut engine, mut rx) = engine(&ctx);
        engine
            .bootstrap(HOMESERVER, "syt_secret")
            .await
            .expect("bootstrap should work");
        engine
            .complete_initial(Ok(one_room_response("s1")))
            .await
            .expect("initial completion should work");

        engine
            .queue_send("!r1:example.org", &json!({"body": "hello"}))
            .await
            .expect("queue should work");

        let snapshot = cache
            .load_room_state("!r1:example.org")
            .await
            .expect("room load")
            .expect("room must be persisted");
        assert_eq!(snapshot.pending.len(), 1);

        let mut saw_queued = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::SendQueued { .. }) {
                saw_queued = true;
            }
        }
        assert!(saw_queued);
    }

    #[tokio::test]
    async fn cancelled_engine_refuses_to_write_the_cache() {
        let rpc = Arc::new(ScriptedRpc::default());
        let cache = Arc::new(InstrumentedCache::new());
        let ctx = context(Arc::clone(&rpc), Arc::clone(&cache));
        let (events, _rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let mut engine = SyncEngine::new(&ctx, ACCOUNT, events, cancel.clone());
        engine
            .bootstrap(HOMESERVER, "syt_secret")
            .await
            .expect("bootstrap should work");

        cancel.cancel();
        let err = engine
            .complete_initial(Ok(one_room_response("s1")))
            .await
            .expect_err("cancelled batch must not apply");
        assert_eq!(err.code, "cancelled");
        assert_eq!(cache.load_cursor().await.expect("cursor load"), None);
    }

    #[tokio::test]
    async fn incremental_poll_carries_cursor_and_long_wait() {
        let rpc = Arc::new(ScriptedRpc::scripted(vec![Ok(SyncResponse::empty(
            SyncToken::new("c1"),
        ))]));
        let cache = Arc::new(InstrumentedCache::new());
        let ctx = context(Arc::clone(&rpc), Arc::clone(&cache));
        let (mut engine, _rx) = engine(&ctx);
        engine
            .bootstrap(HOMESERVER, "syt_secret")
            .await
            .expect("bootstrap should work");
        cache
            .save_cursor(&SyncToken::new("c0"))
            .await
            .expect("seed cursor");

        let (_snapshot, poll) = engine
            .begin_incremental()
            .await
            .expect("begin should work");
        poll.await.expect("scripted poll should resolve");

        let requests = rpc.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].since, Some(SyncToken::new("c0")));
        assert_eq!(requests[0].timeout_ms, 30_000);
    }

    #[tokio::test]
    async fn left_rooms_lose_their_durable_state() {
        let rpc = Arc::new(ScriptedRpc::default());
        let cache = Arc::new(InstrumentedCache::new());
        let ctx = context(Arc::clone(&rpc), Arc::clone(&cache));
        let (mut engine, _rx) = engine(&ctx);
        engine
            .bootstrap(HOMESERVER, "syt_secret")
            .await
            .expect("bootstrap should work");
        engine
            .complete_initial(Ok(one_room_response("s1")))
            .await
            .expect("initial completion should work");

        let departure = SyncResponse {
            left: vec![LeftRoomUpdate {
                room_id: "!r1:example.org".to_owned(),
            }],
            ..SyncResponse::empty(SyncToken::new("s2"))
        };
        engine
            .complete_incremental(SyncToken::new("s1"), Ok(departure))
            .await
            .expect("cycle should work");

        assert!(engine.registry().is_empty());
        assert_eq!(
            cache
                .load_room_state("!r1:example.org")
                .await
                .expect("room load"),
            None
        );
    }

    #[tokio::test]
    async fn invited_rooms_get_timelines_without_events() {
        let rpc = Arc::new(ScriptedRpc::default());
        let cache = Arc::new(InstrumentedCache::new());
        let ctx = context(Arc::clone(&rpc), Arc::clone(&cache));
        let (mut engine, _rx) = engine(&ctx);
        engine
            .bootstrap(HOMESERVER, "syt_secret")
            .await
            .expect("bootstrap should work");

        let response = SyncResponse {
            invited: vec![InvitedRoomUpdate {
                room_id: "!inv:example.org".to_owned(),
                name: Some("Garden Club".to_owned()),
            }],
            ..SyncResponse::empty(SyncToken::new("s1"))
        };
        engine
            .complete_initial(Ok(response))
            .await
            .expect("initial completion should work");

        let room = engine
            .registry()
            .room("!inv:example.org")
            .expect("invited room must exist");
        assert!(room.events().is_empty());
    }
}
