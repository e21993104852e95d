#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use formvault_contracts::submission::FieldEnvelope;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

pub const ENV_FIELD_KEYS: &str = "FORMVAULT_FIELD_KEYS";
pub const ENV_ACTIVE_KEY_ID: &str = "FORMVAULT_ACTIVE_KEY_ID";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncryptionError {
    #[error("unknown encryption key id: {0}")]
    UnknownKeyId(String),
    #[error("invalid encryption key material")]
    InvalidKey,
    #[error("malformed field envelope")]
    MalformedEnvelope,
    #[error("field envelope failed authentication")]
    Authentication,
}

#[derive(Clone)]
pub struct FieldKey {
    id: String,
    bytes: [u8; KEY_LEN],
}

impl FieldKey {
    pub fn new(id: impl Into<String>, bytes: [u8; KEY_LEN]) -> Result<Self, EncryptionError> {
        let id = id.into();
        if id.trim().is_empty() || id.len() > 64 || id.contains([':', ',']) {
            return Err(EncryptionError::InvalidKey);
        }
        Ok(Self { id, bytes })
    }

    pub fn from_base64(id: impl Into<String>, encoded: &str) -> Result<Self, EncryptionError> {
        let decoded = BASE64
            .decode(encoded.trim().as_bytes())
            .map_err(|_| EncryptionError::InvalidKey)?;
        if decoded.len() != KEY_LEN {
            return Err(EncryptionError::InvalidKey);
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&decoded);
        Self::new(id, bytes)
    }

    pub fn generate(id: impl Into<String>) -> Result<Self, EncryptionError> {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self::new(id, bytes)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn cipher(&self) -> Result<Aes256Gcm, EncryptionError> {
        Aes256Gcm::new_from_slice(&self.bytes).map_err(|_| EncryptionError::InvalidKey)
    }
}

impl std::fmt::Debug for FieldKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldKey")
            .field("id", &self.id)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

/// Source of key material. The active key seals new values; prior keys stay
/// resolvable so older envelopes can still be opened.
pub trait KeyProvider: Send + Sync {
    fn active_key(&self) -> &FieldKey;
    fn key_by_id(&self, key_id: &str) -> Option<&FieldKey>;
}

#[derive(Debug, Clone)]
pub struct KeyRing {
    active: FieldKey,
    prior: BTreeMap<String, FieldKey>,
}

impl KeyRing {
    pub fn new(active: FieldKey) -> Self {
        Self {
            active,
            prior: BTreeMap::new(),
        }
    }

    pub fn with_prior_key(mut self, key: FieldKey) -> Self {
        if key.id != self.active.id {
            self.prior.insert(key.id.clone(), key);
        }
        self
    }

    /// Reads `id:base64,id:base64` from `FORMVAULT_FIELD_KEYS` and the active id from
    /// `FORMVAULT_ACTIVE_KEY_ID` (defaults to the first listed key).
    pub fn from_env_map<F>(get: F) -> Result<Self, EncryptionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = get(ENV_FIELD_KEYS).ok_or(EncryptionError::InvalidKey)?;
        let mut keys = BTreeMap::new();
        let mut first_id = None;
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (id, encoded) = entry.split_once(':').ok_or(EncryptionError::InvalidKey)?;
            let key = FieldKey::from_base64(id.trim(), encoded)?;
            first_id.get_or_insert_with(|| key.id.clone());
            keys.insert(key.id.clone(), key);
        }
        let first_id = first_id.ok_or(EncryptionError::InvalidKey)?;
        let active_id = get(ENV_ACTIVE_KEY_ID)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(first_id);

        let active = keys
            .remove(&active_id)
            .ok_or(EncryptionError::UnknownKeyId(active_id))?;
        debug!(active_key_id = active.id.as_str(), prior_keys = keys.len(), "field key ring loaded");
        Ok(Self {
            active,
            prior: keys,
        })
    }
}

impl KeyProvider for KeyRing {
    fn active_key(&self) -> &FieldKey {
        &self.active
    }

    fn key_by_id(&self, key_id: &str) -> Option<&FieldKey> {
        if self.active.id == key_id {
            return Some(&self.active);
        }
        self.prior.get(key_id)
    }
}

/// AES-256-GCM sealing of single field values. Holds no key state.
#[derive(Debug, Default, Clone, Copy)]
pub struct EncryptionCodec;

impl EncryptionCodec {
    pub fn encrypt_field(
        plaintext: &[u8],
        key: &FieldKey,
    ) -> Result<FieldEnvelope, EncryptionError> {
        let cipher = key.cipher()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| EncryptionError::InvalidKey)?;
        if ciphertext.len() < TAG_LEN {
            return Err(EncryptionError::MalformedEnvelope);
        }
        let tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);
        Ok(FieldEnvelope {
            key_id: key.id.clone(),
            nonce: nonce_bytes.to_vec(),
            ciphertext,
            tag,
        })
    }

    pub fn decrypt_field(
        envelope: &FieldEnvelope,
        key: &FieldKey,
    ) -> Result<Vec<u8>, EncryptionError> {
        if envelope.key_id != key.id {
            return Err(EncryptionError::UnknownKeyId(envelope.key_id.clone()));
        }
        if envelope.nonce.len() != NONCE_LEN || envelope.tag.len() != TAG_LEN {
            return Err(EncryptionError::MalformedEnvelope);
        }
        let cipher = key.cipher()?;
        let nonce = Nonce::from_slice(&envelope.nonce);
        let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(&envelope.ciphertext);
        sealed.extend_from_slice(&envelope.tag);
        cipher
            .decrypt(nonce, sealed.as_ref())
            .map_err(|_| EncryptionError::Authentication)
    }

    pub fn seal(
        provider: &dyn KeyProvider,
        plaintext: &[u8],
    ) -> Result<FieldEnvelope, EncryptionError> {
        Self::encrypt_field(plaintext, provider.active_key())
    }

    pub fn open(
        provider: &dyn KeyProvider,
        envelope: &FieldEnvelope,
    ) -> Result<Vec<u8>, EncryptionError> {
        let Some(key) = provider.key_by_id(&envelope.key_id) else {
            warn!(key_id = envelope.key_id.as_str(), "envelope sealed with a key that is not loaded");
            return Err(EncryptionError::UnknownKeyId(envelope.key_id.clone()));
        };
        Self::decrypt_field(envelope, key)
    }
}
