use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use backend_core::{EngineConfig, EngineError, OneTimeKeyCounts, PRIMARY_KEY_ALGORITHM};

use crate::{
    cache::{KeyLifecycleState, StateCache},
    crypto::SessionCrypto,
    rpc::{KeyClaimRequest, KeyUploadRequest, SyncRpc},
};

/// Generates, uploads, trims, and rotates pre-keys.
///
/// Driven by the sync engine before the first poll and after each
/// incremental batch; never calls the network outside those points. The
/// publication flag and rotation deadline are mirrored into the cache so a
/// pending rotation survives restarts.
pub struct KeyLifecycleManager {
    rpc: Arc<dyn SyncRpc>,
    crypto: Arc<dyn SessionCrypto>,
    cache: Arc<dyn StateCache>,
    watermark: u64,
    rotation_grace: Duration,
    rotation_timer: Option<JoinHandle<()>>,
    durable: KeyLifecycleState,
}

impl KeyLifecycleManager {
    pub fn new(
        rpc: Arc<dyn SyncRpc>,
        crypto: Arc<dyn SessionCrypto>,
        cache: Arc<dyn StateCache>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            rpc,
            crypto,
            cache,
            watermark: config.one_time_key_watermark,
            rotation_grace: Duration::from_millis(config.fallback_rotation_grace_ms),
            rotation_timer: None,
            durable: KeyLifecycleState::default(),
        }
    }

    /// Reload durable key bookkeeping at bootstrap. A rotation deadline
    /// that passed while the process was down is honored immediately; a
    /// future one is re-armed for the remaining window.
    pub async fn restore(&mut self) -> Result<(), EngineError> {
        let Some(state) = self.cache.load_key_state().await.map_err(EngineError::from)? else {
            return Ok(());
        };
        self.durable = state;

        if let Some(deadline_ms) = self.durable.rotation_deadline_ms {
            let now = unix_time_ms();
            if deadline_ms <= now {
                debug!("stored rotation deadline already passed; forgetting old fallback key");
                self.crypto.forget_old_fallback_key();
                self.durable.rotation_deadline_ms = None;
                self.persist_durable().await;
            } else {
                self.arm_fallback_rotation(Duration::from_millis(deadline_ms - now));
            }
        }
        Ok(())
    }

    /// One-time bootstrap upload announcing this device's identity keys.
    ///
    /// A 404 means the server does not support key upload and is treated as
    /// success with nothing to do. Returns the server-side counts when the
    /// upload went through.
    pub async fn upload_initial_keys(&mut self) -> Result<Option<OneTimeKeyCounts>, EngineError> {
        match self.rpc.upload_keys(KeyUploadRequest::default()).await {
            Ok(counts) => Ok(Some(counts)),
            Err(err) if err.is_not_found() => {
                debug!("server does not support key upload");
                Ok(None)
            }
            Err(err) => Err(err.to_engine_error("initial_key_upload_failed")),
        }
    }

    /// Bring the server-side key supply back to the watermark.
    ///
    /// Below the watermark, `watermark - count` one-time keys are generated;
    /// a missing unused fallback key produces one new fallback key; a count
    /// above twice the watermark is answered with a single claim-and-discard
    /// to trim runaway supply. Everything generated goes up in one request.
    pub async fn ensure_one_time_keys(
        &mut self,
        counts: &OneTimeKeyCounts,
        unused_fallback_algorithms: &[String],
    ) -> Result<(), EngineError> {
        let current = counts.get(PRIMARY_KEY_ALGORITHM).copied().unwrap_or(0);

        if current > self.watermark * 2 {
            debug!(current, watermark = self.watermark, "trimming one-time key surplus");
            self.rpc
                .claim_keys(KeyClaimRequest {
                    algorithm: PRIMARY_KEY_ALGORITHM.to_owned(),
                    count: 1,
                })
                .await
                .map_err(|err| err.to_engine_error("key_claim_failed"))?;
        }

        let one_time_keys = if current < self.watermark {
            self.crypto
                .generate_one_time_keys(self.watermark - current)
                .map_err(EngineError::from)?
        } else {
            Vec::new()
        };

        let fallback_key = if unused_fallback_algorithms
            .iter()
            .any(|algorithm| algorithm == PRIMARY_KEY_ALGORITHM)
        {
            None
        } else {
            Some(self.crypto.generate_fallback_key().map_err(EngineError::from)?)
        };

        let request = KeyUploadRequest {
            one_time_keys,
            fallback_key,
        };
        if request.is_empty() {
            return Ok(());
        }
        let rotating = request.fallback_key.is_some();

        match self.rpc.upload_keys(request).await {
            Ok(_counts) => {
                self.crypto.mark_keys_published();
                self.durable.keys_published = true;
                if rotating {
                    self.durable.rotation_deadline_ms =
                        Some(unix_time_ms() + self.rotation_grace.as_millis() as u64);
                    self.arm_fallback_rotation(self.rotation_grace);
                }
                self.persist_durable().await;
                Ok(())
            }
            Err(err) if err.is_transport() => Err(err.to_engine_error("key_upload_failed")),
            Err(err) => {
                // The server may never have stored these keys, but marking
                // them published stops the next cycle from regenerating the
                // same batch forever.
                warn!(error = %err, "key upload rejected; marking keys published anyway");
                self.crypto.mark_keys_published();
                self.durable.keys_published = true;
                self.persist_durable().await;
                Ok(())
            }
        }
    }

    /// Whether a fallback rotation timer is currently outstanding.
    pub fn rotation_armed(&self) -> bool {
        self.rotation_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Disarm the rotation timer (logout teardown).
    pub fn disarm(&mut self) {
        if let Some(timer) = self.rotation_timer.take() {
            timer.abort();
        }
    }

    fn arm_fallback_rotation(&mut self, grace: Duration) {
        if let Some(previous) = self.rotation_timer.take() {
            previous.abort();
        }

        let crypto = Arc::clone(&self.crypto);
        debug!(grace_ms = grace.as_millis() as u64, "arming fallback key rotation");
        self.rotation_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            debug!("grace window elapsed; forgetting previous fallback key");
            crypto.forget_old_fallback_key();
        }));
    }

    /// Key bookkeeping is best-effort durable; a failed write must not
    /// abort the cycle that produced it.
    async fn persist_durable(&self) {
        if let Err(err) = self.cache.save_key_state(&self.durable).await {
            warn!(error = %err, "failed to persist key lifecycle state");
        }
    }
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

impl Drop for KeyLifecycleManager {
    fn drop(&mut self) {
        self.disarm();
    }
}
