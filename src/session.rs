//! Per-peer session lifecycle on top of X3DH and the Double Ratchet.
//!
//! The manager owns one session per `(peer_id, device_id)`, runs the
//! handshake on first send, frames ciphertexts for the transport,
//! detects identity-key changes and persists ratchet state through the
//! secure store. Operations on one session are strictly serialized;
//! different sessions proceed in parallel.

use crate::config::Config;
use crate::double_ratchet::RatchetState;
use crate::error::{Error, Result};
use crate::fingerprint::safety_number;
use crate::key_manager::KeyManager;
use crate::keys::PublicKey;
use crate::store::{names, SecureStore};
use crate::wire::{WireMessage, WireType};
use crate::x3dh::{self, HandshakeHeader, PreKeyBundle, HEADER_SIZE as HANDSHAKE_HEADER_SIZE};
use rand_core::OsRng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Result of an identity verification against the stored pin
#[derive(Debug, Clone)]
pub struct IdentityCheck {
    /// True when the observed key differs from the pinned one
    pub changed: bool,

    /// Safety number over our identity and the observed key, for
    /// display and out-of-band comparison
    pub safety_number: String,
}

/// One established (or establishing) session with a peer device
struct Session {
    remote_identity: PublicKey,
    created_at: u64,
    /// Set on the initiating side until the peer acknowledges with a
    /// Whisper-type message
    pending_handshake: Option<HandshakeHeader>,
    /// Ephemeral key of the inbound handshake that created this session,
    /// used to recognize redelivered PreKey frames
    inbound_ephemeral: Option<PublicKey>,
    /// `IK_initiator || IK_responder`, bound into every AEAD tag
    associated_data: Vec<u8>,
    ratchet: RatchetState,
}

impl Session {
    fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(256);
        data.extend_from_slice(self.remote_identity.as_bytes());
        data.extend_from_slice(&self.created_at.to_be_bytes());

        let mut flags = 0u8;
        if self.pending_handshake.is_some() {
            flags |= 1;
        }
        if self.inbound_ephemeral.is_some() {
            flags |= 2;
        }
        data.push(flags);

        if let Some(handshake) = &self.pending_handshake {
            data.extend_from_slice(&handshake.to_bytes());
        }
        if let Some(ephemeral) = &self.inbound_ephemeral {
            data.extend_from_slice(ephemeral.as_bytes());
        }
        data.extend_from_slice(&self.associated_data);
        data.extend_from_slice(&self.ratchet.to_bytes());
        data
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let take = |offset: &mut usize, len: usize| -> Result<&[u8]> {
            let end = offset.checked_add(len).ok_or(Error::StorageFailure)?;
            if end > data.len() {
                return Err(Error::StorageFailure);
            }
            let slice = &data[*offset..end];
            *offset = end;
            Ok(slice)
        };

        let remote_identity = PublicKey::from_bytes(
            take(&mut offset, 32)?
                .try_into()
                .map_err(|_| Error::StorageFailure)?,
        );
        let created_at = u64::from_be_bytes(
            take(&mut offset, 8)?
                .try_into()
                .map_err(|_| Error::StorageFailure)?,
        );
        let flags = take(&mut offset, 1)?[0];

        let pending_handshake = if flags & 1 != 0 {
            Some(
                HandshakeHeader::from_bytes(take(&mut offset, HANDSHAKE_HEADER_SIZE)?)
                    .map_err(|_| Error::StorageFailure)?,
            )
        } else {
            None
        };
        let inbound_ephemeral = if flags & 2 != 0 {
            Some(PublicKey::from_bytes(
                take(&mut offset, 32)?
                    .try_into()
                    .map_err(|_| Error::StorageFailure)?,
            ))
        } else {
            None
        };
        let associated_data = take(&mut offset, 64)?.to_vec();
        let ratchet =
            RatchetState::from_bytes(&data[offset..]).map_err(|_| Error::StorageFailure)?;

        Ok(Self {
            remote_identity,
            created_at,
            pending_handshake,
            inbound_ephemeral,
            associated_data,
            ratchet,
        })
    }
}

/// Manages sessions for all peers of this device.
pub struct SessionManager {
    store: Arc<dyn SecureStore>,
    keys: Arc<KeyManager>,
    config: Config,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    /// Create a manager sharing the key manager's secure store.
    #[must_use]
    pub fn new(store: Arc<dyn SecureStore>, keys: Arc<KeyManager>, config: Config) -> Self {
        Self {
            store,
            keys,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a persisted session exists for the peer device
    pub fn has_session(&self, peer_id: &str, device_id: u32) -> Result<bool> {
        Ok(self
            .store
            .get(&names::session(peer_id, device_id))?
            .is_some())
    }

    /// Encrypt a message for a peer device.
    ///
    /// Without an existing session a `bundle` must be supplied; the
    /// handshake then runs and the first frames carry the `PreKey` tag
    /// until the peer acknowledges. State is persisted only after the
    /// AEAD succeeds.
    pub fn encrypt(
        &self,
        peer_id: &str,
        device_id: u32,
        plaintext: &[u8],
        bundle: Option<&PreKeyBundle>,
    ) -> Result<(WireType, Vec<u8>)> {
        let lock = self.session_lock(peer_id, device_id);
        let _guard = lock.lock().map_err(|_| Error::StorageFailure)?;

        let mut session = match self.load_session(peer_id, device_id)? {
            Some(session) => session,
            None => {
                let bundle = bundle.ok_or(Error::NoSession)?;
                self.establish_outbound(peer_id, bundle)?
            }
        };

        let message = session.ratchet.encrypt(plaintext, &session.associated_data)?;

        let frame = match &session.pending_handshake {
            Some(handshake) => WireMessage::pre_key(handshake.clone(), message),
            None => WireMessage::whisper(message),
        };
        let wire_type = frame.wire_type;
        let bytes = frame.to_bytes();

        self.persist_session(peer_id, device_id, &session)?;
        Ok((wire_type, bytes))
    }

    /// Decrypt a frame received from the transport.
    ///
    /// `wire_type` is the tag the transport announced; it must match the
    /// frame. A `PreKey` frame runs the responder handshake when it
    /// carries an ephemeral key we have not processed; the referenced
    /// one-time pre-key is consumed atomically and restored if
    /// decryption fails, so nothing commits on a bad frame.
    pub fn decrypt(
        &self,
        peer_id: &str,
        device_id: u32,
        wire_type: WireType,
        bytes: &[u8],
    ) -> Result<Vec<u8>> {
        let frame = WireMessage::from_bytes(bytes)?;
        if frame.wire_type != wire_type {
            return Err(Error::InvalidMessageFormat);
        }

        let lock = self.session_lock(peer_id, device_id);
        let _guard = lock.lock().map_err(|_| Error::StorageFailure)?;

        match frame.wire_type {
            WireType::Whisper => self.decrypt_whisper(peer_id, device_id, &frame),
            WireType::PreKey => self.decrypt_pre_key(peer_id, device_id, &frame),
        }
    }

    /// Compare an observed identity key against the stored pin.
    ///
    /// First contact records the key (trust on first use) and reports no
    /// change. A mismatch is a signal for the host, not an error; no
    /// state beyond the annotation is touched.
    pub fn verify_remote_identity(
        &self,
        peer_id: &str,
        observed: &PublicKey,
    ) -> Result<IdentityCheck> {
        let ours = self.keys.identity()?.public_key();
        let number = safety_number(&ours, observed, &self.config.app_id);

        let pin_name = names::identity_pin(peer_id);
        match self.store.get(&pin_name)? {
            None => {
                self.store.set(&pin_name, observed.as_bytes())?;
                debug!(peer_id, "pinned identity on first use");
                Ok(IdentityCheck {
                    changed: false,
                    safety_number: number,
                })
            }
            Some(pinned) => {
                let changed = !crate::crypto::ct_eq(&pinned, observed.as_bytes());
                if changed {
                    warn!(peer_id, "remote identity key changed");
                }
                Ok(IdentityCheck {
                    changed,
                    safety_number: number,
                })
            }
        }
    }

    /// Erase every device-indexed session for a peer, along with the
    /// identity pin. Called after the host accepts a new identity key;
    /// the next handshake re-pins.
    pub fn delete_all_sessions(&self, peer_id: &str) -> Result<()> {
        let index_name = names::session_index(peer_id);
        if let Some(index) = self.store.get(&index_name)? {
            for device_id in parse_device_index(&index) {
                self.store.remove(&names::session(peer_id, device_id))?;
            }
            self.store.remove(&index_name)?;
        }
        self.store.remove(&names::identity_pin(peer_id))?;
        self.locks
            .lock()
            .map_err(|_| Error::StorageFailure)?
            .retain(|key, _| !key.starts_with(&format!("{peer_id}/")));
        debug!(peer_id, "deleted all sessions");
        Ok(())
    }

    fn establish_outbound(&self, peer_id: &str, bundle: &PreKeyBundle) -> Result<Session> {
        let identity = self.keys.identity()?;
        let init = x3dh::initiate(&mut OsRng, &identity, bundle)?;
        let ratchet = RatchetState::init_sender(
            &mut OsRng,
            init.master,
            bundle.signed_prekey,
            self.config.max_skip,
            self.config.max_cached_keys,
        )?;

        self.pin_on_first_use(peer_id, &bundle.identity_key)?;
        debug!(peer_id, "established outbound session");

        Ok(Session {
            remote_identity: bundle.identity_key,
            created_at: now_secs(),
            pending_handshake: Some(init.header),
            inbound_ephemeral: None,
            associated_data: init.associated_data,
            ratchet,
        })
    }

    fn decrypt_whisper(&self, peer_id: &str, device_id: u32, frame: &WireMessage) -> Result<Vec<u8>> {
        let mut session = self
            .load_session(peer_id, device_id)?
            .ok_or(Error::NoSession)?;

        let plaintext =
            session
                .ratchet
                .decrypt(&mut OsRng, &frame.message(), &session.associated_data)?;

        // A Whisper from the peer proves the handshake arrived.
        session.pending_handshake = None;

        self.persist_session(peer_id, device_id, &session)?;
        Ok(plaintext)
    }

    fn decrypt_pre_key(&self, peer_id: &str, device_id: u32, frame: &WireMessage) -> Result<Vec<u8>> {
        let handshake = frame
            .handshake
            .as_ref()
            .ok_or(Error::InvalidMessageFormat)?;

        // A redelivered PreKey frame for a session we already built is
        // served by that session; its skipped-key cache resolves gaps and
        // exact replays surface as duplicates.
        if let Some(mut session) = self.load_session(peer_id, device_id)? {
            if session.inbound_ephemeral == Some(handshake.ephemeral_key) {
                let plaintext = session.ratchet.decrypt(
                    &mut OsRng,
                    &frame.message(),
                    &session.associated_data,
                )?;
                self.persist_session(peer_id, device_id, &session)?;
                return Ok(plaintext);
            }
        }

        let identity = self.keys.identity()?;
        let signed_prekey = self.keys.signed_pre_key(handshake.signed_prekey_id)?;

        // Consume the referenced one-time key up front so a concurrent
        // handshake for the same id loses cleanly; restore on any
        // failure below. A key that is already gone downgrades the
        // handshake to the no-OPK form.
        let one_time = match handshake.one_time_prekey_id {
            Some(id) => match self.keys.consume_one_time_pre_key(id) {
                Ok(opk) => Some(opk),
                Err(Error::NotFound) => {
                    warn!(peer_id, opk_id = id, "one-time pre-key already consumed");
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let result = self.run_inbound_handshake(
            peer_id,
            device_id,
            &identity,
            &signed_prekey.key,
            one_time.as_ref().map(|opk| &opk.key),
            handshake,
            frame,
        );

        if result.is_err() {
            if let Some(opk) = &one_time {
                let _ = self.keys.restore_one_time_pre_key(opk);
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run_inbound_handshake(
        &self,
        peer_id: &str,
        device_id: u32,
        identity: &crate::keys::IdentityKeyPair,
        signed_prekey: &crate::keys::SecretKey,
        one_time_prekey: Option<&crate::keys::SecretKey>,
        handshake: &HandshakeHeader,
        frame: &WireMessage,
    ) -> Result<Vec<u8>> {
        let resp = x3dh::respond(identity, signed_prekey, one_time_prekey, handshake)?;
        let mut ratchet = RatchetState::init_receiver(
            resp.master,
            signed_prekey.clone(),
            self.config.max_skip,
            self.config.max_cached_keys,
        );

        let plaintext = ratchet.decrypt(&mut OsRng, &frame.message(), &resp.associated_data)?;

        self.pin_on_first_use(peer_id, &handshake.identity_key)?;

        let session = Session {
            remote_identity: handshake.identity_key,
            created_at: now_secs(),
            pending_handshake: None,
            inbound_ephemeral: Some(handshake.ephemeral_key),
            associated_data: resp.associated_data,
            ratchet,
        };
        self.persist_session(peer_id, device_id, &session)?;
        debug!(peer_id, device_id, "established inbound session");

        Ok(plaintext)
    }

    fn pin_on_first_use(&self, peer_id: &str, observed: &PublicKey) -> Result<()> {
        let pin_name = names::identity_pin(peer_id);
        match self.store.get(&pin_name)? {
            None => self.store.set(&pin_name, observed.as_bytes()),
            Some(pinned) => {
                if !crate::crypto::ct_eq(&pinned, observed.as_bytes()) {
                    // Signal only; the pin stays until the host accepts
                    // the new key through delete_all_sessions.
                    warn!(peer_id, "handshake with changed identity key");
                }
                Ok(())
            }
        }
    }

    fn load_session(&self, peer_id: &str, device_id: u32) -> Result<Option<Session>> {
        match self.store.get(&names::session(peer_id, device_id))? {
            Some(bytes) => Ok(Some(Session::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn persist_session(&self, peer_id: &str, device_id: u32, session: &Session) -> Result<()> {
        self.store
            .set(&names::session(peer_id, device_id), &session.to_bytes())?;

        let index_name = names::session_index(peer_id);
        let mut devices = match self.store.get(&index_name)? {
            Some(index) => parse_device_index(&index),
            None => Vec::new(),
        };
        if !devices.contains(&device_id) {
            devices.push(device_id);
            let mut encoded = Vec::with_capacity(devices.len() * 4);
            for id in &devices {
                encoded.extend_from_slice(&id.to_be_bytes());
            }
            self.store.set(&index_name, &encoded)?;
        }
        Ok(())
    }

    fn session_lock(&self, peer_id: &str, device_id: u32) -> Arc<Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            locks
                .entry(format!("{peer_id}/{device_id}"))
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}

fn parse_device_index(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|chunk| u32::from_be_bytes(chunk.try_into().expect("4-byte chunk")))
        .collect()
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
