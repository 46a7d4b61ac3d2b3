//! Secure-store abstraction for key material and session records.
//!
//! The core never talks to a concrete storage backend; it depends on the
//! [`SecureStore`] capability set only. The host supplies an
//! implementation backed by its platform keystore; tests and examples
//! use [`MemorySecureStore`].

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zeroize::Zeroize;

/// Flat key/value store with confidentiality at rest.
///
/// Implementations must be thread-safe; the core serializes access per
/// logical resource (session, pre-key pool) above this interface, but
/// different resources are read and written concurrently.
pub trait SecureStore: Send + Sync {
    /// Store a value under `name`, replacing any previous value.
    fn set(&self, name: &str, value: &[u8]) -> Result<()>;

    /// Fetch the value stored under `name`, if any.
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Remove the value stored under `name`. Removing a missing name is
    /// not an error.
    fn remove(&self, name: &str) -> Result<()>;

    /// Erase every stored value.
    fn clear(&self) -> Result<()>;
}

/// Store-key naming scheme.
///
/// `ik/*` for the identity pair, `spk/*` for signed pre-keys and their
/// rotation bookkeeping, `opk/*` for the one-time pool, `session/*` for
/// per-device ratchet records and `identity/*` for TOFU pins.
pub(crate) mod names {
    /// Identity X25519 private key
    pub(crate) const IK_PRIVATE: &str = "ik/private";
    /// Identity X25519 public key
    pub(crate) const IK_PUBLIC: &str = "ik/public";
    /// Identity Ed25519 seed
    pub(crate) const IK_SIGN_PRIVATE: &str = "ik/sign_private";
    /// Identity Ed25519 verifying key
    pub(crate) const IK_SIGN_PUBLIC: &str = "ik/sign_public";
    /// Currently active signed pre-key id
    pub(crate) const SPK_CURRENT_ID: &str = "spk/current_id";
    /// Timestamp of the last signed pre-key rotation
    pub(crate) const SPK_ROTATION_TS: &str = "spk/rotation_ts";
    /// Next signed pre-key id
    pub(crate) const SPK_INDEX: &str = "spk/index";
    /// Next one-time pre-key id
    pub(crate) const OPK_INDEX: &str = "opk/index";

    pub(crate) fn spk(id: u32) -> String {
        format!("spk/{id}")
    }

    pub(crate) fn opk(id: u32) -> String {
        format!("opk/{id}")
    }

    pub(crate) fn session(peer_id: &str, device_id: u32) -> String {
        format!("session/{peer_id}/{device_id}")
    }

    pub(crate) fn session_index(peer_id: &str) -> String {
        format!("session/{peer_id}/index")
    }

    pub(crate) fn identity_pin(peer_id: &str) -> String {
        format!("identity/{peer_id}")
    }
}

/// Thread-safe in-memory secure store.
///
/// Values are overwritten with zeroes before removal so wiped key
/// material does not linger in freed buffers.
#[derive(Clone, Default)]
pub struct MemorySecureStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemorySecureStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemorySecureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.entries.lock().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("MemorySecureStore")
            .field("entries", &len)
            .finish()
    }
}

impl SecureStore for MemorySecureStore {
    fn set(&self, name: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| Error::StorageFailure)?;
        if let Some(mut old) = entries.insert(name.to_owned(), value.to_vec()) {
            old.zeroize();
        }
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().map_err(|_| Error::StorageFailure)?;
        Ok(entries.get(name).cloned())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| Error::StorageFailure)?;
        if let Some(mut old) = entries.remove(name) {
            old.zeroize();
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| Error::StorageFailure)?;
        for (_, value) in entries.iter_mut() {
            value.zeroize();
        }
        entries.clear();
        Ok(())
    }
}
