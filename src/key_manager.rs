//! Long-lived key material management.
//!
//! Owns the device identity, signed pre-key rotation and the one-time
//! pre-key pool, all persisted through the [`SecureStore`] capability.
//! Pre-key ids are monotonically increasing across the device lifetime
//! and never reused; the counters live in the store so they survive
//! restarts.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::keys::{IdentityKeyPair, OneTimePreKey, PublicKey, SecretKey, SignedPreKey, SigningKeyPair};
use crate::store::{names, SecureStore};
use crate::x3dh::PreKeyBundle;
use rand_core::CryptoRngCore;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Result of [`KeyManager::initialize`]
#[derive(Debug)]
pub struct InitializeOutcome {
    /// True when key material was created for the first time
    pub new_device: bool,

    /// Bundle to publish for a new device, absent otherwise
    pub bundle: Option<PreKeyBundle>,
}

/// Public part of a freshly rotated signed pre-key, ready for upload
#[derive(Debug, Clone)]
pub struct SignedPreKeyUpdate {
    /// New signed pre-key id
    pub id: u32,
    /// New signed pre-key public half
    pub public_key: PublicKey,
    /// Identity signature over the public half
    pub signature: [u8; 64],
}

/// Manages identity, signed pre-keys and the one-time pre-key pool.
///
/// The identity is read-only after [`initialize`](Self::initialize); the
/// one-time pool is mutated under a pool-level lock so consumption is
/// exactly-once even under concurrent inbound handshakes.
pub struct KeyManager {
    store: Arc<dyn SecureStore>,
    config: Config,
    identity: RwLock<Option<IdentityKeyPair>>,
    pool: Mutex<()>,
}

impl KeyManager {
    /// Create a manager over the given store. Call
    /// [`initialize`](Self::initialize) before any other operation.
    #[must_use]
    pub fn new(store: Arc<dyn SecureStore>, config: Config) -> Self {
        Self {
            store,
            config,
            identity: RwLock::new(None),
            pool: Mutex::new(()),
        }
    }

    /// Idempotent device initialization.
    ///
    /// On a fresh store this creates the identity pair, the first signed
    /// pre-key and the first one-time pre-key batch, persists everything
    /// and returns the bundle to publish. On an already-initialized
    /// store it only loads the identity into memory.
    pub fn initialize<R: CryptoRngCore>(&self, rng: &mut R, now: u64) -> Result<InitializeOutcome> {
        if self.store.get(names::IK_PRIVATE)?.is_some() {
            let identity = self.load_identity()?;
            *self.identity.write().map_err(|_| Error::StorageFailure)? = Some(identity);
            return Ok(InitializeOutcome {
                new_device: false,
                bundle: None,
            });
        }

        let identity = IdentityKeyPair::generate(rng);
        self.store
            .set(names::IK_PRIVATE, &identity.dh_key.to_bytes())?;
        self.store
            .set(names::IK_PUBLIC, identity.public_key().as_bytes())?;
        self.store
            .set(names::IK_SIGN_PRIVATE, &identity.signing_key.to_bytes())?;
        self.store.set(
            names::IK_SIGN_PUBLIC,
            &identity.signing_key.verifying_key_bytes(),
        )?;

        // Ids start at 1: a zero one-time id means "absent" on the wire.
        let spk = SignedPreKey::generate(rng, 1, &identity);
        self.persist_signed_prekey(&spk)?;
        self.store.set(names::SPK_CURRENT_ID, &spk.id.to_be_bytes())?;
        self.store.set(names::SPK_ROTATION_TS, &now.to_be_bytes())?;
        self.store.set(names::SPK_INDEX, &2u32.to_be_bytes())?;
        self.store.set(names::OPK_INDEX, &1u32.to_be_bytes())?;

        let opks = self.generate_one_time_pre_keys(rng, self.config.opk_batch_size)?;

        let bundle = PreKeyBundle {
            identity_key: identity.public_key(),
            identity_signing_key: identity.signing_key.verifying_key_bytes(),
            signed_prekey_id: spk.id,
            signed_prekey: spk.public_key(),
            signed_prekey_signature: spk.signature,
            one_time_prekey: opks.first().copied(),
        };

        *self.identity.write().map_err(|_| Error::StorageFailure)? = Some(identity);
        debug!(opk_count = opks.len(), "initialized new device key material");

        Ok(InitializeOutcome {
            new_device: true,
            bundle: Some(bundle),
        })
    }

    /// The device identity pair. Fails with [`Error::NotFound`] before
    /// initialization.
    pub fn identity(&self) -> Result<IdentityKeyPair> {
        if let Some(identity) = self
            .identity
            .read()
            .map_err(|_| Error::StorageFailure)?
            .as_ref()
        {
            return Ok(identity.clone());
        }
        let identity = self.load_identity()?;
        *self.identity.write().map_err(|_| Error::StorageFailure)? = Some(identity.clone());
        Ok(identity)
    }

    /// Currently active signed pre-key pair with its signature
    pub fn current_signed_pre_key(&self) -> Result<SignedPreKey> {
        let id_bytes = self
            .store
            .get(names::SPK_CURRENT_ID)?
            .ok_or(Error::NotFound)?;
        let id = u32::from_be_bytes(id_bytes.try_into().map_err(|_| Error::StorageFailure)?);
        self.signed_pre_key(id)
    }

    /// A signed pre-key still retained under its id.
    ///
    /// Previous keys are kept after rotation so in-flight first messages
    /// that reference them remain decryptable.
    pub fn signed_pre_key(&self, id: u32) -> Result<SignedPreKey> {
        let record = self.store.get(&names::spk(id))?.ok_or(Error::NotFound)?;
        if record.len() != 96 {
            return Err(Error::StorageFailure);
        }
        let key = SecretKey::from_bytes(record[..32].try_into().map_err(|_| Error::StorageFailure)?);
        let signature: [u8; 64] = record[32..96]
            .try_into()
            .map_err(|_| Error::StorageFailure)?;
        Ok(SignedPreKey { id, key, signature })
    }

    /// Rotate the signed pre-key when the current one is old enough.
    ///
    /// Returns the new public material for upload when a rotation
    /// happened, `None` otherwise. The previous key stays retained under
    /// its id.
    pub fn rotate_signed_pre_key_if_needed<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        now: u64,
    ) -> Result<Option<SignedPreKeyUpdate>> {
        let ts_bytes = self
            .store
            .get(names::SPK_ROTATION_TS)?
            .ok_or(Error::NotFound)?;
        let last_rotation =
            u64::from_be_bytes(ts_bytes.try_into().map_err(|_| Error::StorageFailure)?);

        if now.saturating_sub(last_rotation) < self.config.spk_rotation_secs() {
            return Ok(None);
        }

        let identity = self.identity()?;
        let id = self.next_id(names::SPK_INDEX)?;
        let spk = SignedPreKey::generate(rng, id, &identity);
        self.persist_signed_prekey(&spk)?;
        self.store.set(names::SPK_CURRENT_ID, &id.to_be_bytes())?;
        self.store.set(names::SPK_ROTATION_TS, &now.to_be_bytes())?;

        debug!(id, "rotated signed pre-key");
        Ok(Some(SignedPreKeyUpdate {
            id,
            public_key: spk.public_key(),
            signature: spk.signature,
        }))
    }

    /// Atomically remove and return a one-time pre-key.
    ///
    /// Exactly one of any number of concurrent callers for the same id
    /// succeeds; the rest observe [`Error::NotFound`].
    pub fn consume_one_time_pre_key(&self, id: u32) -> Result<OneTimePreKey> {
        let _pool = self.pool.lock().map_err(|_| Error::StorageFailure)?;
        let name = names::opk(id);
        let record = self.store.get(&name)?.ok_or(Error::NotFound)?;
        let key = SecretKey::from_bytes(
            record
                .as_slice()
                .try_into()
                .map_err(|_| Error::StorageFailure)?,
        );
        self.store.remove(&name)?;
        debug!(id, "consumed one-time pre-key");
        Ok(OneTimePreKey { id, key })
    }

    /// Put a consumed one-time pre-key back.
    ///
    /// Rollback path for an inbound handshake whose decryption failed:
    /// the consumption must not commit in that case.
    pub(crate) fn restore_one_time_pre_key(&self, opk: &OneTimePreKey) -> Result<()> {
        let _pool = self.pool.lock().map_err(|_| Error::StorageFailure)?;
        self.store.set(&names::opk(opk.id), &opk.key.to_bytes())
    }

    /// Append `count` fresh one-time pre-keys to the pool.
    ///
    /// Ids are dense and ascending, drawn from the persistent counter.
    /// Returns the public halves for upload.
    pub fn generate_one_time_pre_keys<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        count: u32,
    ) -> Result<Vec<(u32, PublicKey)>> {
        let _pool = self.pool.lock().map_err(|_| Error::StorageFailure)?;
        let first = self.read_counter(names::OPK_INDEX)?;

        let mut publics = Vec::with_capacity(count as usize);
        for id in first..first + count {
            let opk = OneTimePreKey::generate(rng, id);
            self.store.set(&names::opk(id), &opk.key.to_bytes())?;
            publics.push((id, opk.public_key()));
        }
        self.store
            .set(names::OPK_INDEX, &(first + count).to_be_bytes())?;

        debug!(count, first_id = first, "generated one-time pre-keys");
        Ok(publics)
    }

    /// Assemble a publishable bundle from the current signed pre-key and
    /// the given one-time pre-key, when that id is still in the pool.
    ///
    /// This is what the directory serves to initiators; tests use it to
    /// stand in for a bundle fetch.
    pub fn pre_key_bundle(&self, one_time_id: Option<u32>) -> Result<PreKeyBundle> {
        let identity = self.identity()?;
        let spk = self.current_signed_pre_key()?;

        let one_time_prekey = one_time_id
            .map(|id| -> Result<(u32, PublicKey)> {
                let record = self.store.get(&names::opk(id))?.ok_or(Error::NotFound)?;
                let key = SecretKey::from_bytes(
                    record
                        .as_slice()
                        .try_into()
                        .map_err(|_| Error::StorageFailure)?,
                );
                Ok((id, key.public_key()))
            })
            .transpose()?;

        Ok(PreKeyBundle {
            identity_key: identity.public_key(),
            identity_signing_key: identity.signing_key.verifying_key_bytes(),
            signed_prekey_id: spk.id,
            signed_prekey: spk.public_key(),
            signed_prekey_signature: spk.signature,
            one_time_prekey,
        })
    }

    /// Whether the server-visible pool has fallen below the refill mark
    #[must_use]
    pub fn needs_opk_refill(&self, server_count: u32) -> bool {
        server_count < self.config.opk_refill_threshold
    }

    /// Erase every persisted key and the in-memory identity.
    pub fn wipe_all(&self) -> Result<()> {
        self.store.clear()?;
        *self.identity.write().map_err(|_| Error::StorageFailure)? = None;
        debug!("wiped all key material");
        Ok(())
    }

    fn load_identity(&self) -> Result<IdentityKeyPair> {
        let dh_bytes = self.store.get(names::IK_PRIVATE)?.ok_or(Error::NotFound)?;
        let sign_bytes = self
            .store
            .get(names::IK_SIGN_PRIVATE)?
            .ok_or(Error::NotFound)?;

        let dh_key = SecretKey::from_bytes(
            dh_bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::StorageFailure)?,
        );
        let signing_key = SigningKeyPair::from_bytes(
            sign_bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::StorageFailure)?,
        );
        Ok(IdentityKeyPair { dh_key, signing_key })
    }

    fn persist_signed_prekey(&self, spk: &SignedPreKey) -> Result<()> {
        let mut record = Vec::with_capacity(96);
        record.extend_from_slice(&spk.key.to_bytes());
        record.extend_from_slice(&spk.signature);
        self.store.set(&names::spk(spk.id), &record)
    }

    fn read_counter(&self, name: &str) -> Result<u32> {
        match self.store.get(name)? {
            Some(bytes) => Ok(u32::from_be_bytes(
                bytes.try_into().map_err(|_| Error::StorageFailure)?,
            )),
            None => Ok(1),
        }
    }

    fn next_id(&self, name: &str) -> Result<u32> {
        let id = self.read_counter(name)?;
        self.store.set(name, &(id + 1).to_be_bytes())?;
        Ok(id)
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySecureStore;
    use rand_core::OsRng;

    fn manager() -> KeyManager {
        KeyManager::new(Arc::new(MemorySecureStore::new()), Config::default())
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let km = manager();

        let first = km.initialize(&mut OsRng, 1_000).unwrap();
        assert!(first.new_device);
        let bundle = first.bundle.expect("new device publishes a bundle");
        bundle.verify().unwrap();
        assert_eq!(bundle.signed_prekey_id, 1);
        assert_eq!(bundle.one_time_prekey.map(|(id, _)| id), Some(1));

        let second = km.initialize(&mut OsRng, 2_000).unwrap();
        assert!(!second.new_device);
        assert!(second.bundle.is_none());
    }

    #[test]
    fn test_identity_survives_reload() {
        let store: Arc<dyn SecureStore> = Arc::new(MemorySecureStore::new());
        let km = KeyManager::new(Arc::clone(&store), Config::default());
        km.initialize(&mut OsRng, 0).unwrap();
        let public = km.identity().unwrap().public_key();

        // A second manager over the same store sees the same identity.
        let km2 = KeyManager::new(store, Config::default());
        km2.initialize(&mut OsRng, 0).unwrap();
        assert_eq!(km2.identity().unwrap().public_key(), public);
    }

    #[test]
    fn test_rotation_respects_interval() {
        let km = manager();
        km.initialize(&mut OsRng, 0).unwrap();

        let thirty_days = 30 * 86_400;

        // One second short of the interval: no rotation.
        assert!(km
            .rotate_signed_pre_key_if_needed(&mut OsRng, thirty_days - 1)
            .unwrap()
            .is_none());

        let update = km
            .rotate_signed_pre_key_if_needed(&mut OsRng, thirty_days)
            .unwrap()
            .expect("rotation due");
        assert_eq!(update.id, 2);
        assert_eq!(km.current_signed_pre_key().unwrap().id, 2);

        // Previous key retained for in-flight handshakes.
        assert_eq!(km.signed_pre_key(1).unwrap().id, 1);
    }

    #[test]
    fn test_rotated_ids_are_monotonic() {
        let km = manager();
        km.initialize(&mut OsRng, 0).unwrap();

        let day = 86_400u64;
        for round in 1..4u64 {
            let update = km
                .rotate_signed_pre_key_if_needed(&mut OsRng, round * 30 * day)
                .unwrap()
                .expect("rotation due");
            assert_eq!(u64::from(update.id), round + 1);
        }
    }

    #[test]
    fn test_consume_is_exactly_once() {
        let km = manager();
        km.initialize(&mut OsRng, 0).unwrap();

        let opk = km.consume_one_time_pre_key(1).unwrap();
        assert_eq!(opk.id, 1);

        assert_eq!(
            km.consume_one_time_pre_key(1).unwrap_err(),
            Error::NotFound
        );
    }

    #[test]
    fn test_concurrent_consume_single_winner() {
        let km = Arc::new(manager());
        km.initialize(&mut OsRng, 0).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let km = Arc::clone(&km);
                std::thread::spawn(move || km.consume_one_time_pre_key(5))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| r.as_ref().unwrap_err() == &Error::NotFound));
    }

    #[test]
    fn test_restore_after_rollback() {
        let km = manager();
        km.initialize(&mut OsRng, 0).unwrap();

        let opk = km.consume_one_time_pre_key(3).unwrap();
        km.restore_one_time_pre_key(&opk).unwrap();

        // Available again exactly once.
        km.consume_one_time_pre_key(3).unwrap();
        assert_eq!(
            km.consume_one_time_pre_key(3).unwrap_err(),
            Error::NotFound
        );
    }

    #[test]
    fn test_opk_ids_dense_and_never_reused() {
        let km = manager();
        km.initialize(&mut OsRng, 0).unwrap();

        let batch = km.generate_one_time_pre_keys(&mut OsRng, 10).unwrap();
        let first = batch.first().unwrap().0;
        let last = batch.last().unwrap().0;
        assert_eq!(first, 101); // after the initial batch of 100
        assert_eq!(last, 110);

        // Consuming does not free ids for reuse.
        km.consume_one_time_pre_key(101).unwrap();
        let next = km.generate_one_time_pre_keys(&mut OsRng, 1).unwrap();
        assert_eq!(next[0].0, 111);
    }

    #[test]
    fn test_pre_key_bundle_assembly() {
        let km = manager();
        km.initialize(&mut OsRng, 0).unwrap();

        let bundle = km.pre_key_bundle(Some(10)).unwrap();
        bundle.verify().unwrap();
        assert_eq!(bundle.one_time_prekey.map(|(id, _)| id), Some(10));

        let without = km.pre_key_bundle(None).unwrap();
        assert!(without.one_time_prekey.is_none());

        km.consume_one_time_pre_key(10).unwrap();
        assert_eq!(km.pre_key_bundle(Some(10)).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn test_needs_opk_refill() {
        let km = manager();
        assert!(km.needs_opk_refill(19));
        assert!(!km.needs_opk_refill(20));
        assert!(!km.needs_opk_refill(100));
    }

    #[test]
    fn test_wipe_all() {
        let km = manager();
        km.initialize(&mut OsRng, 0).unwrap();
        km.wipe_all().unwrap();

        assert_eq!(km.identity().unwrap_err(), Error::NotFound);
        assert_eq!(km.current_signed_pre_key().unwrap_err(), Error::NotFound);
        assert_eq!(
            km.consume_one_time_pre_key(1).unwrap_err(),
            Error::NotFound
        );
    }
}
