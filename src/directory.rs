//! JSON payload types for the key-distribution directory.
//!
//! The HTTP client itself is the host's concern; these types pin the
//! shapes exchanged with `POST /keys/upload`, `GET /keys/count` and
//! `GET /keys/:user_id`. Binary fields travel base64-encoded.

use crate::crypto::{b64_decode, b64_encode};
use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::x3dh::PreKeyBundle;
use serde::{Deserialize, Serialize};

/// Body of `POST /keys/upload`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadKeysRequest {
    /// Identity DH public key, base64
    pub identity_public: String,

    /// Identity Ed25519 verifying key, base64
    pub identity_signing_public: String,

    /// Current signed pre-key
    pub signed_pre_key: SignedPreKeyEntry,

    /// Fresh one-time pre-keys to append to the server pool
    pub one_time_pre_keys: Vec<OneTimePreKeyEntry>,
}

/// Signed pre-key as uploaded and served
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyEntry {
    /// Key id
    pub id: u32,

    /// Public half, base64
    #[serde(rename = "pub")]
    pub public_key: String,

    /// Identity signature over the public half, base64
    pub sig: String,
}

/// One-time pre-key as uploaded and served
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyEntry {
    /// Key id
    pub id: u32,

    /// Public half, base64
    #[serde(rename = "pub")]
    pub public_key: String,
}

/// Body of `GET /keys/count`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KeyCountResponse {
    /// One-time pre-keys remaining in the server pool
    pub count: u32,
}

/// Body of `GET /keys/:user_id`.
///
/// The server removes the returned one-time pre-key from the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedBundle {
    /// Identity DH public key, base64
    pub identity_public: String,

    /// Identity Ed25519 verifying key, base64
    pub identity_signing_public: String,

    /// Current signed pre-key
    pub signed_pre_key: SignedPreKeyEntry,

    /// One-time pre-key, absent when the pool is exhausted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key: Option<OneTimePreKeyEntry>,
}

impl UploadKeysRequest {
    /// Assemble an upload body from key material.
    #[must_use]
    pub fn new(
        identity_public: &PublicKey,
        identity_signing_public: &[u8; 32],
        signed_pre_key_id: u32,
        signed_pre_key: &PublicKey,
        signed_pre_key_signature: &[u8; 64],
        one_time_pre_keys: &[(u32, PublicKey)],
    ) -> Self {
        Self {
            identity_public: b64_encode(identity_public.as_bytes()),
            identity_signing_public: b64_encode(identity_signing_public),
            signed_pre_key: SignedPreKeyEntry {
                id: signed_pre_key_id,
                public_key: b64_encode(signed_pre_key.as_bytes()),
                sig: b64_encode(signed_pre_key_signature),
            },
            one_time_pre_keys: one_time_pre_keys
                .iter()
                .map(|(id, key)| OneTimePreKeyEntry {
                    id: *id,
                    public_key: b64_encode(key.as_bytes()),
                })
                .collect(),
        }
    }
}

impl FetchedBundle {
    /// Decode into the bundle the handshake consumes.
    pub fn into_bundle(self) -> Result<PreKeyBundle> {
        let one_time_prekey = self
            .one_time_pre_key
            .map(|entry| Ok::<_, Error>((entry.id, decode_key(&entry.public_key)?)))
            .transpose()?;

        Ok(PreKeyBundle {
            identity_key: decode_key(&self.identity_public)?,
            identity_signing_key: decode_array::<32>(&self.identity_signing_public)?,
            signed_prekey_id: self.signed_pre_key.id,
            signed_prekey: decode_key(&self.signed_pre_key.public_key)?,
            signed_prekey_signature: decode_array::<64>(&self.signed_pre_key.sig)?,
            one_time_prekey,
        })
    }
}

fn decode_key(encoded: &str) -> Result<PublicKey> {
    Ok(PublicKey::from_bytes(decode_array::<32>(encoded)?))
}

fn decode_array<const N: usize>(encoded: &str) -> Result<[u8; N]> {
    b64_decode(encoded)?
        .try_into()
        .map_err(|_| Error::InvalidBundle)
}
