//! Cryptographic key types with memory safety guarantees.

use crate::{
    crypto::KEY_SIZE_32,
    error::{Error, Result},
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::CryptoRngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// X25519 public key (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_SIZE_32]);

impl PublicKey {
    /// Size in bytes
    pub const SIZE: usize = KEY_SIZE_32;

    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }

    /// Convert to X25519 public key
    pub(crate) fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey([REDACTED])")
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(pk: X25519PublicKey) -> Self {
        Self(*pk.as_bytes())
    }
}

impl From<&StaticSecret> for PublicKey {
    fn from(secret: &StaticSecret) -> Self {
        PublicKey::from(X25519PublicKey::from(secret))
    }
}

/// X25519 secret key with automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(StaticSecret);

impl SecretKey {
    /// Generate a new random secret key
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self(StaticSecret::random_from_rng(rng))
    }

    /// Create from raw bytes (must be 32 bytes)
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Get raw secret bytes for persistence to the secure store
    #[must_use]
    pub fn to_bytes(&self) -> [u8; KEY_SIZE_32] {
        self.0.to_bytes()
    }

    /// Get the corresponding public key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.0)
    }

    /// Perform Diffie-Hellman key agreement.
    ///
    /// Fails with [`Error::InvalidKey`] when the peer key is a low-order
    /// point, i.e. the shared secret would be all zeroes and the peer
    /// contributed nothing to it.
    pub fn diffie_hellman(&self, public: &PublicKey) -> Result<DhOutput> {
        let shared = self.0.diffie_hellman(&public.to_x25519());
        if !shared.was_contributory() {
            return Err(Error::InvalidKey);
        }
        Ok(DhOutput(*shared.as_bytes()))
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// Output of Diffie-Hellman operation (32 bytes)
/// Automatically zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhOutput([u8; KEY_SIZE_32]);

impl DhOutput {
    /// Returns a byte slice of the Diffie-Hellman operation output
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }
}

impl std::fmt::Debug for DhOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhOutput([REDACTED])")
    }
}

/// Ed25519 signing key for identity signatures
pub struct SigningKeyPair {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl SigningKeyPair {
    /// Generate a new random signing key pair
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        let signing = SigningKey::generate(rng);
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    /// Restore from the 32-byte seed
    #[must_use]
    pub fn from_bytes(bytes: &[u8; KEY_SIZE_32]) -> Self {
        let signing = SigningKey::from_bytes(bytes);
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    /// Get the 32-byte seed for persistence to the secure store
    #[must_use]
    pub fn to_bytes(&self) -> [u8; KEY_SIZE_32] {
        self.signing.to_bytes()
    }

    /// Get the verifying (public) key
    #[must_use]
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying
    }

    /// Sign a message
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Get verifying key as bytes
    #[must_use]
    pub fn verifying_key_bytes(&self) -> [u8; KEY_SIZE_32] {
        self.verifying.to_bytes()
    }
}

impl Clone for SigningKeyPair {
    fn clone(&self) -> Self {
        Self::from_bytes(&self.signing.to_bytes())
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKeyPair {{ verifying: {:?} }}", self.verifying)
    }
}

/// Verify an Ed25519 signature
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<()> {
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| Error::InvalidKey)?;
    let sig = Signature::from_bytes(signature);
    verifying_key
        .verify(message, &sig)
        .map_err(|_| Error::InvalidSignature)
}

/// Identity key pair combining X25519 and Ed25519
///
/// Long-lived per-account material. The DH half participates in X3DH;
/// the signing half certifies signed pre-keys.
#[derive(Clone, Debug)]
pub struct IdentityKeyPair {
    /// X25519 key for key agreement
    pub dh_key: SecretKey,
    /// Ed25519 key for signing
    pub signing_key: SigningKeyPair,
}

impl IdentityKeyPair {
    /// Generate a new identity key pair
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self {
            dh_key: SecretKey::generate(rng),
            signing_key: SigningKeyPair::generate(rng),
        }
    }

    /// Get the public identity key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.dh_key.public_key()
    }

    /// Get the verifying key
    #[must_use]
    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing_key.verifying_key()
    }
}

/// Signed pre-key pair: mid-lived X25519 key certified by the identity key
pub struct SignedPreKey {
    /// Key id, unique and monotonically increasing per device
    pub id: u32,
    /// X25519 key pair
    pub key: SecretKey,
    /// Ed25519 signature over the public half
    pub signature: [u8; 64],
}

impl SignedPreKey {
    /// Generate a new signed pre-key certified by `identity`
    pub fn generate<R: CryptoRngCore>(rng: &mut R, id: u32, identity: &IdentityKeyPair) -> Self {
        let key = SecretKey::generate(rng);
        let signature = identity.signing_key.sign(key.public_key().as_bytes());
        Self {
            id,
            key,
            signature: signature.to_bytes(),
        }
    }

    /// Public half
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }
}

impl std::fmt::Debug for SignedPreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedPreKey").field("id", &self.id).finish()
    }
}

/// One-time pre-key pair, consumed at most once during an inbound handshake
pub struct OneTimePreKey {
    /// Key id, unique and monotonically increasing per device
    pub id: u32,
    /// X25519 key pair
    pub key: SecretKey,
}

impl OneTimePreKey {
    /// Generate a fresh one-time pre-key
    pub fn generate<R: CryptoRngCore>(rng: &mut R, id: u32) -> Self {
        Self {
            id,
            key: SecretKey::generate(rng),
        }
    }

    /// Public half
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }
}

impl std::fmt::Debug for OneTimePreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneTimePreKey").field("id", &self.id).finish()
    }
}
