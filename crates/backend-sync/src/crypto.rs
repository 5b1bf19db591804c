use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use backend_core::{EngineError, EngineErrorCategory, PRIMARY_KEY_ALGORITHM};

/// A public pre-key ready for upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreKey {
    /// Locally assigned key identifier.
    pub key_id: String,
    /// Key algorithm identifier.
    pub algorithm: String,
    /// Encoded public key material.
    pub key: String,
    /// Whether this is a use-until-replaced fallback key.
    pub fallback: bool,
}

/// Errors reported by the session crypto module.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Identity material could not be created or loaded.
    #[error("crypto identity failure: {0}")]
    Identity(String),
    /// Key generation failed.
    #[error("pre-key generation failure: {0}")]
    KeyGeneration(String),
    /// A per-room group session could not be created or used.
    #[error("group session failure for {room_id}: {message}")]
    Session { room_id: String, message: String },
    /// An event could not be decrypted (missing session key, bad index).
    #[error("decryption failed for session {session_id}: {message}")]
    Decrypt {
        session_id: String,
        message: String,
    },
}

impl From<CryptoError> for EngineError {
    fn from(err: CryptoError) -> Self {
        let code = match &err {
            CryptoError::Identity(_) => "crypto_identity_error",
            CryptoError::KeyGeneration(_) => "crypto_keygen_error",
            CryptoError::Session { .. } => "crypto_session_error",
            CryptoError::Decrypt { .. } => "crypto_decrypt_error",
        };
        EngineError::new(EngineErrorCategory::Crypto, code, err.to_string())
    }
}

/// The session crypto module, reduced to the operations the engine drives.
///
/// Implementations own the ratchet, pickling, and key storage; the engine
/// only sequences the calls.
pub trait SessionCrypto: Send + Sync {
    /// Prepare the crypto identity for an account. `fresh` is set when the
    /// cache reported a newly created store, in which case a brand-new
    /// identity must be established and persisted.
    fn initialize_identity(&self, account_id: &str, fresh: bool) -> Result<(), CryptoError>;

    /// Generate `count` new one-time keys.
    fn generate_one_time_keys(&self, count: u64) -> Result<Vec<PreKey>, CryptoError>;

    /// Generate a new fallback key; the previous one stays usable until
    /// `forget_old_fallback_key` is called.
    fn generate_fallback_key(&self) -> Result<PreKey, CryptoError>;

    /// Drop the previous fallback key after its grace window.
    fn forget_old_fallback_key(&self);

    /// Mark all generated-but-unpublished keys as published.
    fn mark_keys_published(&self);

    /// Encrypt outgoing content with the room's group session; returns the
    /// session ID and ciphertext payload.
    fn encrypt_group_message(
        &self,
        room_id: &str,
        content: &Value,
    ) -> Result<(String, Value), CryptoError>;

    /// Decrypt one event with the given per-room-per-session index.
    fn decrypt_event(
        &self,
        session_index: u64,
        session_id: &str,
        ciphertext: &Value,
    ) -> Result<Value, CryptoError>;
}

/// Call counters exposed by [`PlaintextCrypto`] for assertions and smoke
/// output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CryptoStats {
    pub one_time_keys_generated: u64,
    pub fallback_keys_generated: u64,
    pub old_fallback_keys_forgotten: u64,
    pub publish_marks: u64,
}

/// No-op crypto for tests and the smoke binary: "ciphertext" is the
/// plaintext wrapped in a marker object.
#[derive(Debug, Default)]
pub struct PlaintextCrypto {
    stats: Mutex<CryptoStats>,
}

impl PlaintextCrypto {
    pub fn stats(&self) -> CryptoStats {
        self.stats.lock().map(|stats| *stats).unwrap_or_default()
    }

    fn with_stats(&self, update: impl FnOnce(&mut CryptoStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }
}

impl SessionCrypto for PlaintextCrypto {
    fn initialize_identity(&self, _account_id: &str, _fresh: bool) -> Result<(), CryptoError> {
        Ok(())
    }

    fn generate_one_time_keys(&self, count: u64) -> Result<Vec<PreKey>, CryptoError> {
        self.with_stats(|stats| stats.one_time_keys_generated += count);
        Ok((0..count)
            .map(|_| PreKey {
                key_id: Uuid::new_v4().to_string(),
                algorithm: PRIMARY_KEY_ALGORITHM.to_owned(),
                key: Uuid::new_v4().simple().to_string(),
                fallback: false,
            })
            .collect())
    }

    fn generate_fallback_key(&self) -> Result<PreKey, CryptoError> {
        self.with_stats(|stats| stats.fallback_keys_generated += 1);
        Ok(PreKey {
            key_id: Uuid::new_v4().to_string(),
            algorithm: PRIMARY_KEY_ALGORITHM.to_owned(),
            key: Uuid::new_v4().simple().to_string(),
            fallback: true,
        })
    }

    fn forget_old_fallback_key(&self) {
        self.with_stats(|stats| stats.old_fallback_keys_forgotten += 1);
    }

    fn mark_keys_published(&self) {
        self.with_stats(|stats| stats.publish_marks += 1);
    }

    fn encrypt_group_message(
        &self,
        room_id: &str,
        content: &Value,
    ) -> Result<(String, Value), CryptoError> {
        let session_id = format!("plain-session:{room_id}");
        Ok((
            session_id,
            serde_json::json!({ "plaintext": content.clone() }),
        ))
    }

    fn decrypt_event(
        &self,
        _session_index: u64,
        session_id: &str,
        ciphertext: &Value,
    ) -> Result<Value, CryptoError> {
        ciphertext
            .get("plaintext")
            .cloned()
            .ok_or_else(|| CryptoError::Decrypt {
                session_id: session_id.to_owned(),
                message: "payload is not a plaintext wrapper".to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_requested_key_counts() {
        let crypto = PlaintextCrypto::default();
        let keys = crypto.generate_one_time_keys(40).expect("generation");
        assert_eq!(keys.len(), 40);
        assert!(keys.iter().all(|key| !key.fallback));
        assert_eq!(crypto.stats().one_time_keys_generated, 40);
    }

    #[test]
    fn roundtrips_group_message_content() {
        let crypto = PlaintextCrypto::default();
        let content = serde_json::json!({"body": "hello", "msgtype": "m.text"});

        let (session_id, ciphertext) = crypto
            .encrypt_group_message("!r1:example.org", &content)
            .expect("encrypt");
        let decrypted = crypto
            .decrypt_event(0, &session_id, &ciphertext)
            .expect("decrypt");

        assert_eq!(decrypted, content);
    }

    #[test]
    fn rejects_foreign_ciphertext() {
        let crypto = PlaintextCrypto::default();
        let err = crypto
            .decrypt_event(0, "megolm-session", &serde_json::json!({"ciphertext": "AwgA..."}))
            .expect_err("foreign payload must fail");
        assert!(matches!(err, CryptoError::Decrypt { .. }));
    }
}
