//! Symmetric payload encryption.
//!
//! Payloads are wrapped in AES-256-GCM envelopes. The key is derived once at
//! login from the user's credentials via PBKDF2 (deliberately slow, run off
//! the async runtime) and held only in memory for the session lifetime.
//!
//! Encryption is all-or-nothing across the fleet: if any device has the
//! cipher disabled while others have it enabled, inbound payloads will not
//! parse as envelopes. That case surfaces as
//! [`DecodeError::EncryptionMismatch`], not as a generic failure.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::DecodeError;

const KEY_LEN: usize = 32; // AES-256
const NONCE_LEN: usize = 12; // 96-bit, unique per encryption
const TAG_LEN: usize = 16;

/// Default PBKDF2 round count, matching the server's advertised work factor.
pub const DEFAULT_HASH_ROUNDS: u32 = 664_937;

/// In-memory session key. Never persisted by the engine.
#[derive(Clone)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        write!(f, "SessionKey(..)")
    }
}

/// Derive the session key from login credentials.
///
/// PBKDF2-HMAC-SHA256 with the salt being the concatenation of username,
/// password and the configured extra salt. The iteration count is high by
/// design; the work runs on the blocking pool so the event loop never stalls.
pub async fn derive_session_key(
    username: &str,
    password: &str,
    salt: &str,
    rounds: u32,
) -> Result<SessionKey> {
    let password_bytes = password.as_bytes().to_vec();
    let salt_bytes = format!("{}{}{}", username, password, salt).into_bytes();

    let key = tokio::task::spawn_blocking(move || {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(&password_bytes, &salt_bytes, rounds, &mut key);
        key
    })
    .await
    .map_err(|e| anyhow!("key derivation task failed: {}", e))?;

    Ok(SessionKey(key))
}

/// Wire representation of one encrypted payload: all fields base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub nonce: String,
    pub ciphertext: String,
    pub tag: String,
}

impl EncryptedEnvelope {
    pub fn to_json(&self) -> String {
        // Serialization of three strings cannot fail.
        serde_json::to_string(self).expect("envelope serialization")
    }

    pub fn from_json(s: &str) -> Result<Self, DecodeError> {
        // A payload that is not valid envelope JSON almost always means the
        // sender has the cipher disabled.
        serde_json::from_str(s).map_err(|_| DecodeError::EncryptionMismatch)
    }
}

/// Encrypt a plaintext payload string into an envelope.
///
/// A fresh 96-bit nonce is generated per call; a nonce never repeats under
/// the same key.
pub fn encrypt(plaintext: &str, key: &SessionKey) -> Result<EncryptedEnvelope> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let sealed = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| anyhow!("encryption failed"))?;

    // aes-gcm appends the tag; the wire shape keeps it as a separate field.
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    Ok(EncryptedEnvelope {
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
        tag: BASE64.encode(tag),
    })
}

/// Decrypt an envelope back to the payload string.
///
/// Failures are per-message and recoverable: a corrupt or undecryptable
/// message must not terminate the sync session.
pub fn decrypt(envelope: &EncryptedEnvelope, key: &SessionKey) -> Result<String, DecodeError> {
    let nonce_bytes = BASE64.decode(&envelope.nonce)?;
    let ciphertext = BASE64.decode(&envelope.ciphertext)?;
    let tag = BASE64.decode(&envelope.tag)?;

    if nonce_bytes.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(DecodeError::DecryptFailed);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), sealed.as_ref())
        .map_err(|_| DecodeError::DecryptFailed)?;

    String::from_utf8(plaintext).map_err(|_| DecodeError::DecryptFailed)
}

/// Encrypt and frame as the JSON string that replaces the payload on the wire.
pub fn encrypt_to_payload(plaintext: &str, key: &SessionKey) -> Result<String> {
    Ok(encrypt(plaintext, key)?.to_json())
}

/// Parse an inbound payload as an envelope and decrypt it.
pub fn decrypt_payload(payload: &str, key: &SessionKey) -> Result<String, DecodeError> {
    let envelope = EncryptedEnvelope::from_json(payload)?;
    decrypt(&envelope, key)
}
