//! Double Ratchet protocol for forward-secure encryption
//!
//! Combines a symmetric-key ratchet (new key per message, forward
//! secrecy) with a DH ratchet (fresh key agreement per round trip,
//! post-compromise healing), tolerating out-of-order and lost
//! ciphertexts through a bounded skipped-key cache.
//!
//! ## State
//!
//! Each party maintains:
//! - Root key (`RK`): updated on every DH ratchet step
//! - Sending/receiving chain keys (`CKs`/`CKr`): updated per message
//! - Current DH key pair, rotated on DH ratchet steps
//! - Message counters `Ns`, `Nr` and previous-chain length `PN`
//! - Skipped message keys for late arrivals, indexed by
//!   `(remote_dh_public, message_number)`
//!
//! Decryption is transactional: a failed authentication leaves the
//! state bitwise identical to what it was before the attempt.

use crate::crypto::{
    aead_open, aead_seal, derive_message_keys, kdf_ck, kdf_rk, SymmetricKey, KEY_SIZE_32,
};
use crate::error::{Error, Result};
use crate::keys::{PublicKey, SecretKey};
use rand_core::CryptoRngCore;
use std::collections::HashMap;
use std::collections::VecDeque;
use zeroize::Zeroize;

/// Serialized header length: dh(32) + pn(4) + n(4)
pub const HEADER_SIZE: usize = 40;

/// Message header containing ratchet public key and counters.
///
/// Authenticated (via AEAD associated data) but not encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Sender's current DH ratchet public key
    pub dh_public: PublicKey,

    /// Number of messages in the sender's previous sending chain
    pub previous_chain_length: u32,

    /// Message number in the current sending chain
    pub message_number: u32,
}

impl Header {
    /// Serialize for the wire and for AEAD associated data.
    ///
    /// Layout: `dh(32) | pn_u32_be(4) | n_u32_be(4)`.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..32].copy_from_slice(self.dh_public.as_bytes());
        bytes[32..36].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.message_number.to_be_bytes());
        bytes
    }

    /// Deserialize header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader);
        }

        let dh_public =
            PublicKey::from_bytes(bytes[..32].try_into().map_err(|_| Error::InvalidHeader)?);
        let previous_chain_length =
            u32::from_be_bytes(bytes[32..36].try_into().map_err(|_| Error::InvalidHeader)?);
        let message_number =
            u32::from_be_bytes(bytes[36..40].try_into().map_err(|_| Error::InvalidHeader)?);

        Ok(Self {
            dh_public,
            previous_chain_length,
            message_number,
        })
    }
}

/// Encrypted ratchet message: header plus AEAD ciphertext
#[derive(Debug, Clone)]
pub struct Message {
    /// Message header (plaintext, but bound into the AEAD tag)
    pub header: Header,

    /// Encrypted payload with appended tag
    pub ciphertext: Vec<u8>,
}

/// Bounded cache of message keys for out-of-order arrivals.
///
/// Keys are indexed by `(remote_dh_public, message_number)` and evicted
/// in insertion order once the cache exceeds its bound. A decrypt that
/// needs an evicted key permanently fails; the bound is a denial-of-
/// service defense.
struct SkippedKeys {
    keys: HashMap<(PublicKey, u32), SymmetricKey>,
    order: VecDeque<(PublicKey, u32)>,
    max_entries: usize,
}

impl SkippedKeys {
    fn new(max_entries: usize) -> Self {
        Self {
            keys: HashMap::new(),
            order: VecDeque::new(),
            max_entries,
        }
    }

    /// Insert a key, evicting oldest entries to stay within bound
    fn insert(&mut self, index: (PublicKey, u32), key: SymmetricKey) {
        if self.keys.insert(index, key).is_none() {
            self.order.push_back(index);
        }
        while self.keys.len() > self.max_entries {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.keys.remove(&oldest);
        }
    }

    fn get(&self, index: &(PublicKey, u32)) -> Option<&SymmetricKey> {
        self.keys.get(index)
    }

    fn remove(&mut self, index: &(PublicKey, u32)) {
        if self.keys.remove(index).is_some() {
            self.order.retain(|entry| entry != index);
        }
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    /// Entries in insertion order, for persistence
    fn iter_ordered(&self) -> impl Iterator<Item = (&(PublicKey, u32), &SymmetricKey)> {
        self.order.iter().filter_map(|k| self.keys.get(k).map(|v| (k, v)))
    }

    fn clear(&mut self) {
        self.keys.clear();
        self.order.clear();
    }
}

/// Double Ratchet session state for one direction pair with one peer device
pub struct RatchetState {
    /// Our current DH ratchet key pair (`DHs`)
    dh_self: SecretKey,

    /// Remote DH ratchet public key (`DHr`); absent on the receiver side
    /// until the first message arrives
    dh_remote: Option<PublicKey>,

    /// Root key (`RK`)
    root_key: SymmetricKey,

    /// Sending chain key (`CKs`)
    send_chain_key: Option<SymmetricKey>,

    /// Receiving chain key (`CKr`)
    recv_chain_key: Option<SymmetricKey>,

    /// Messages sent in the current chain (`Ns`)
    send_count: u32,

    /// Messages received in the current chain (`Nr`)
    recv_count: u32,

    /// Length of the previous sending chain (`PN`)
    prev_chain_length: u32,

    /// Cached keys for skipped messages
    skipped: SkippedKeys,

    /// Ceiling on chain advance within a single decrypt
    max_skip: u32,
}

/// Staged receiving-side state, committed only after AEAD success
struct StagedRecv {
    root_key: SymmetricKey,
    recv_chain_key: Option<SymmetricKey>,
    recv_count: u32,
    dh_remote: Option<PublicKey>,
    new_dh_self: Option<SecretKey>,
    new_send_chain: Option<SymmetricKey>,
    skipped: Vec<((PublicKey, u32), SymmetricKey)>,
}

impl StagedRecv {
    /// Derive and stash message keys for `recv_count..until` on the
    /// current receiving chain. No-op when no receiving chain exists yet.
    fn skip_message_keys(&mut self, until: u32, max_skip: u32) -> Result<()> {
        let Some(chain_key) = self.recv_chain_key.as_ref() else {
            return Ok(());
        };
        if until <= self.recv_count {
            return Ok(());
        }
        if until - self.recv_count > max_skip {
            return Err(Error::TooManySkipped);
        }

        let Some(dh_remote) = self.dh_remote else {
            return Ok(());
        };

        let mut current = chain_key.clone();
        while self.recv_count < until {
            let (message_key, next) = kdf_ck(&current);
            self.skipped.push(((dh_remote, self.recv_count), message_key));
            current = next;
            self.recv_count += 1;
        }
        self.recv_chain_key = Some(current);
        Ok(())
    }
}

impl RatchetState {
    /// Initialize as the handshake initiator.
    ///
    /// Performs the first DH ratchet step against the responder's signed
    /// prekey, establishing the sending chain immediately.
    pub fn init_sender<R: CryptoRngCore>(
        rng: &mut R,
        master: SymmetricKey,
        remote_signed_prekey: PublicKey,
        max_skip: u32,
        max_cached_keys: usize,
    ) -> Result<Self> {
        let dh_self = SecretKey::generate(rng);
        let dh_output = dh_self.diffie_hellman(&remote_signed_prekey)?;
        let (root_key, send_chain_key) = kdf_rk(&master, &dh_output);

        Ok(Self {
            dh_self,
            dh_remote: Some(remote_signed_prekey),
            root_key,
            send_chain_key: Some(send_chain_key),
            recv_chain_key: None,
            send_count: 0,
            recv_count: 0,
            prev_chain_length: 0,
            skipped: SkippedKeys::new(max_cached_keys),
            max_skip,
        })
    }

    /// Initialize as the handshake responder.
    ///
    /// The signed prekey pair used in the handshake becomes the first
    /// ratchet key; chains are established by the first received message.
    #[must_use]
    pub fn init_receiver(
        master: SymmetricKey,
        signed_prekey: SecretKey,
        max_skip: u32,
        max_cached_keys: usize,
    ) -> Self {
        Self {
            dh_self: signed_prekey,
            dh_remote: None,
            root_key: master,
            send_chain_key: None,
            recv_chain_key: None,
            send_count: 0,
            recv_count: 0,
            prev_chain_length: 0,
            skipped: SkippedKeys::new(max_cached_keys),
            max_skip,
        }
    }

    /// Our current DH ratchet public key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.dh_self.public_key()
    }

    /// Number of cached skipped-message keys
    #[must_use]
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Whether a sending chain exists, i.e. `encrypt` can succeed
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.send_chain_key.is_some()
    }

    /// Encrypt a message, advancing the sending chain.
    ///
    /// Fails with [`Error::NotReady`] before the sending chain exists:
    /// on the responder side that is any point before the first received
    /// message completes a DH ratchet step.
    pub fn encrypt(&mut self, plaintext: &[u8], associated_data: &[u8]) -> Result<Message> {
        let chain_key = self.send_chain_key.as_ref().ok_or(Error::NotReady)?;
        let (message_key, next_chain_key) = kdf_ck(chain_key);

        let header = Header {
            dh_public: self.dh_self.public_key(),
            previous_chain_length: self.prev_chain_length,
            message_number: self.send_count,
        };

        let keys = derive_message_keys(&message_key);
        let mut aad = Vec::with_capacity(associated_data.len() + HEADER_SIZE);
        aad.extend_from_slice(associated_data);
        aad.extend_from_slice(&header.to_bytes());

        let ciphertext = aead_seal(&keys.cipher_key, &keys.iv, plaintext, &aad)?;

        self.send_chain_key = Some(next_chain_key);
        self.send_count += 1;

        Ok(Message { header, ciphertext })
    }

    /// Decrypt a message.
    ///
    /// Tries the skipped-key cache first, then performs any pending DH
    /// ratchet step and in-chain advance on a staged copy of the state.
    /// The staged state is committed only after the AEAD opens; on
    /// [`Error::AuthFailed`] the ratchet is untouched.
    pub fn decrypt<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        message: &Message,
        associated_data: &[u8],
    ) -> Result<Vec<u8>> {
        let header = &message.header;
        let mut aad = Vec::with_capacity(associated_data.len() + HEADER_SIZE);
        aad.extend_from_slice(associated_data);
        aad.extend_from_slice(&header.to_bytes());

        // Late arrival: a previously skipped key may already exist.
        let index = (header.dh_public, header.message_number);
        if let Some(message_key) = self.skipped.get(&index) {
            let keys = derive_message_keys(message_key);
            if let Ok(plaintext) = aead_open(&keys.cipher_key, &keys.iv, &message.ciphertext, &aad)
            {
                self.skipped.remove(&index);
                return Ok(plaintext);
            }
        }

        let mut staged = StagedRecv {
            root_key: self.root_key.clone(),
            recv_chain_key: self.recv_chain_key.clone(),
            recv_count: self.recv_count,
            dh_remote: self.dh_remote,
            new_dh_self: None,
            new_send_chain: None,
            skipped: Vec::new(),
        };

        if staged.dh_remote != Some(header.dh_public) {
            // Finish the previous receiving chain, then ratchet.
            staged.skip_message_keys(header.previous_chain_length, self.max_skip)?;

            let dh_recv = self.dh_self.diffie_hellman(&header.dh_public)?;
            let (root_key, recv_chain_key) = kdf_rk(&staged.root_key, &dh_recv);

            let new_dh_self = SecretKey::generate(rng);
            let dh_send = new_dh_self.diffie_hellman(&header.dh_public)?;
            let (root_key, send_chain_key) = kdf_rk(&root_key, &dh_send);

            staged.root_key = root_key;
            staged.recv_chain_key = Some(recv_chain_key);
            staged.recv_count = 0;
            staged.dh_remote = Some(header.dh_public);
            staged.new_dh_self = Some(new_dh_self);
            staged.new_send_chain = Some(send_chain_key);
        } else if header.message_number < staged.recv_count {
            // Key already consumed and no longer cached.
            return Err(Error::DuplicateMessage);
        }

        // The advance for this call counts the key consumed below.
        if u64::from(header.message_number - staged.recv_count) + 1 > u64::from(self.max_skip) {
            return Err(Error::TooManySkipped);
        }
        staged.skip_message_keys(header.message_number, self.max_skip)?;

        let chain_key = staged.recv_chain_key.as_ref().ok_or(Error::NotReady)?;
        let (message_key, next_chain_key) = kdf_ck(chain_key);
        let keys = derive_message_keys(&message_key);

        let plaintext = aead_open(&keys.cipher_key, &keys.iv, &message.ciphertext, &aad)?;

        // Commit.
        self.root_key = staged.root_key;
        self.recv_chain_key = Some(next_chain_key);
        self.recv_count = staged.recv_count + 1;
        self.dh_remote = staged.dh_remote;
        if let Some(dh_self) = staged.new_dh_self {
            self.dh_self = dh_self;
        }
        if let Some(send_chain_key) = staged.new_send_chain {
            self.prev_chain_length = self.send_count;
            self.send_count = 0;
            self.send_chain_key = Some(send_chain_key);
        }
        for (index, key) in staged.skipped {
            self.skipped.insert(index, key);
        }

        Ok(plaintext)
    }

    /// Serialize for the session store.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(256);
        data.extend_from_slice(&self.dh_self.to_bytes());

        let mut flags = 0u8;
        if self.dh_remote.is_some() {
            flags |= 1;
        }
        if self.send_chain_key.is_some() {
            flags |= 2;
        }
        if self.recv_chain_key.is_some() {
            flags |= 4;
        }
        data.push(flags);

        if let Some(dh_remote) = &self.dh_remote {
            data.extend_from_slice(dh_remote.as_bytes());
        }
        data.extend_from_slice(self.root_key.as_bytes());
        if let Some(ck) = &self.send_chain_key {
            data.extend_from_slice(ck.as_bytes());
        }
        if let Some(ck) = &self.recv_chain_key {
            data.extend_from_slice(ck.as_bytes());
        }
        data.extend_from_slice(&self.send_count.to_be_bytes());
        data.extend_from_slice(&self.recv_count.to_be_bytes());
        data.extend_from_slice(&self.prev_chain_length.to_be_bytes());
        data.extend_from_slice(&self.max_skip.to_be_bytes());
        data.extend_from_slice(&(self.skipped.max_entries as u32).to_be_bytes());

        data.extend_from_slice(&(self.skipped.len() as u32).to_be_bytes());
        for ((dh, n), key) in self.skipped.iter_ordered() {
            data.extend_from_slice(dh.as_bytes());
            data.extend_from_slice(&n.to_be_bytes());
            data.extend_from_slice(key.as_bytes());
        }

        data
    }

    /// Deserialize from the session store.
    pub(crate) fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let dh_self = SecretKey::from_bytes(cursor.take_32()?);
        let flags = cursor.take_u8()?;

        let dh_remote = if flags & 1 != 0 {
            Some(PublicKey::from_bytes(cursor.take_32()?))
        } else {
            None
        };
        let root_key = SymmetricKey::from_bytes(cursor.take_32()?);
        let send_chain_key = if flags & 2 != 0 {
            Some(SymmetricKey::from_bytes(cursor.take_32()?))
        } else {
            None
        };
        let recv_chain_key = if flags & 4 != 0 {
            Some(SymmetricKey::from_bytes(cursor.take_32()?))
        } else {
            None
        };
        let send_count = cursor.take_u32()?;
        let recv_count = cursor.take_u32()?;
        let prev_chain_length = cursor.take_u32()?;
        let max_skip = cursor.take_u32()?;
        let max_cached_keys = cursor.take_u32()? as usize;

        let mut skipped = SkippedKeys::new(max_cached_keys);
        let skipped_count = cursor.take_u32()?;
        for _ in 0..skipped_count {
            let dh = PublicKey::from_bytes(cursor.take_32()?);
            let n = cursor.take_u32()?;
            let key = SymmetricKey::from_bytes(cursor.take_32()?);
            skipped.insert((dh, n), key);
        }

        Ok(Self {
            dh_self,
            dh_remote,
            root_key,
            send_chain_key,
            recv_chain_key,
            send_count,
            recv_count,
            prev_chain_length,
            skipped,
            max_skip,
        })
    }
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("send_count", &self.send_count)
            .field("recv_count", &self.recv_count)
            .field("prev_chain_length", &self.prev_chain_length)
            .field("skipped_keys", &self.skipped.len())
            .finish()
    }
}

impl Zeroize for RatchetState {
    fn zeroize(&mut self) {
        self.root_key.zeroize();
        self.send_chain_key.zeroize();
        self.recv_chain_key.zeroize();
        self.skipped.clear();
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Bounds-checked reader for the persisted ratchet layout
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(Error::InvalidMessageFormat)?;
        if end > self.data.len() {
            return Err(Error::InvalidMessageFormat);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(
            self.take(4)?.try_into().map_err(|_| Error::InvalidMessageFormat)?,
        ))
    }

    fn take_32(&mut self) -> Result<[u8; KEY_SIZE_32]> {
        self.take(32)?
            .try_into()
            .map_err(|_| Error::InvalidMessageFormat)
    }
}
