//! Pluggable codec for posterior state at rest.
//!
//! Posterior rows leave the process boundary as opaque blobs; the store
//! never inspects them. The production codec is AES-256-GCM, the JSON
//! codec exists for local debugging and tests.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use uplift_core::types::VariantState;
use uplift_core::{UpliftError, UpliftResult};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Bijective mapping between posterior state and the stored blob.
pub trait StateCodec: Send + Sync {
    fn encode(&self, state: &VariantState) -> UpliftResult<Vec<u8>>;
    fn decode(&self, blob: &[u8]) -> UpliftResult<VariantState>;
    /// Short label for logs and error contexts.
    fn name(&self) -> &'static str;
}

// ─── AES-256-GCM codec ──────────────────────────────────────────────────

/// AES-256-GCM over the JSON serialization of the state. The random
/// 12-byte nonce is prepended to the ciphertext, so equal states never
/// produce equal blobs.
pub struct AesGcmCodec {
    cipher: Aes256Gcm,
}

impl AesGcmCodec {
    pub fn from_key_bytes(key: &[u8]) -> UpliftResult<Self> {
        if key.len() != KEY_LEN {
            return Err(UpliftError::Codec(format!(
                "state key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| UpliftError::Codec("invalid state key".to_string()))?;
        Ok(Self { cipher })
    }

    pub fn from_base64(key_b64: &str) -> UpliftResult<Self> {
        let key = BASE64
            .decode(key_b64)
            .map_err(|e| UpliftError::Codec(format!("state key is not valid base64: {e}")))?;
        Self::from_key_bytes(&key)
    }
}

impl StateCodec for AesGcmCodec {
    fn encode(&self, state: &VariantState) -> UpliftResult<Vec<u8>> {
        let plaintext = serde_json::to_vec(state)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| UpliftError::Codec("state encrypt failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decode(&self, blob: &[u8]) -> UpliftResult<VariantState> {
        if blob.len() <= NONCE_LEN {
            return Err(UpliftError::Codec("state blob too short".to_string()));
        }
        let (nonce_raw, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_raw);
        // Wrong key and corrupted blob are indistinguishable here.
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| UpliftError::Codec("state decrypt failed".to_string()))?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn name(&self) -> &'static str {
        "aes_gcm"
    }
}

// ─── JSON codec ─────────────────────────────────────────────────────────

/// Plaintext JSON codec for local development.
pub struct JsonCodec;

impl StateCodec for JsonCodec {
    fn encode(&self, state: &VariantState) -> UpliftResult<Vec<u8>> {
        Ok(serde_json::to_vec(state)?)
    }

    fn decode(&self, blob: &[u8]) -> UpliftResult<VariantState> {
        Ok(serde_json::from_slice(blob)?)
    }

    fn name(&self) -> &'static str {
        "json"
    }
}
