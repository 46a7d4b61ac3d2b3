//! Cryptographic primitives for key derivation and encryption.
//!
//! Everything secret-bearing in this module zeroizes on drop, and no
//! function here logs its inputs. Constant-time discipline for curve
//! operations and tag comparisons lives in this layer and in [`crate::keys`];
//! the layers above never touch raw secret bytes directly.

use crate::error::{Error, Result};
use crate::keys::DhOutput;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// HKDF info string for the X3DH master secret
const HANDSHAKE_INFO: &[u8] = b"WhisperText";

/// HKDF info string for the root-key ratchet
const ROOT_INFO: &[u8] = b"WhisperRatchet";

/// HKDF info string for per-message key material
const MESSAGE_INFO: &[u8] = b"WhisperMessageKeys";

/// Curve-domain-separation prefix for the X3DH input keying material
const DOMAIN_SEPARATOR: [u8; 32] = [0xFF; 32];

/// Size of derived keys (32 bytes for 256-bit security)
pub const KEY_SIZE_32: usize = 32;

/// Size of authentication tags for AEAD
pub const TAG_SIZE: usize = 16;

/// Size of nonce for ChaCha20-Poly1305
pub const NONCE_SIZE: usize = 12;

/// Maximum HKDF output per RFC 5869 (255 blocks of SHA-256)
const HKDF_MAX_OUTPUT: usize = 255 * 32;

/// Derived symmetric key with automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE_32]);

impl SymmetricKey {
    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(bytes)
    }

    /// Get key as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// Per-message key material derived from a message key.
///
/// 80-byte HKDF output: cipher key (32), authentication key (32), IV (16,
/// truncated to the 12-byte AEAD nonce). The authentication key is part of
/// the derived block; the AEAD construction carries its own tag.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MessageKeys {
    /// AEAD cipher key
    pub cipher_key: [u8; KEY_SIZE_32],
    /// Authentication key from the derived block
    pub auth_key: [u8; KEY_SIZE_32],
    /// AEAD nonce
    pub iv: [u8; NONCE_SIZE],
}

impl std::fmt::Debug for MessageKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageKeys([REDACTED])")
    }
}

/// HMAC-SHA-256 of `data` under `key`
#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; KEY_SIZE_32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// RFC 5869 HKDF-SHA-256.
///
/// An empty `salt` is treated as 32 zero bytes. Fails with
/// [`Error::InvalidKey`] when `out_len` exceeds the RFC 5869 bound of
/// 255 hash blocks.
pub fn hkdf(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>> {
    if out_len > HKDF_MAX_OUTPUT {
        return Err(Error::InvalidKey);
    }
    let zero_salt = [0u8; KEY_SIZE_32];
    let salt = if salt.is_empty() { &zero_salt[..] } else { salt };

    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = vec![0u8; out_len];
    hk.expand(info, &mut out).map_err(|_| Error::InvalidKey)?;
    Ok(out)
}

/// X3DH master secret derivation.
///
/// `master = HKDF(F || DH1 || DH2 || DH3 [|| DH4], salt = zero32,
/// info = "WhisperText", len = 32)` where `F` is 32 bytes of `0xFF`.
#[must_use]
pub fn derive_master_secret(
    dh1: &DhOutput,
    dh2: &DhOutput,
    dh3: &DhOutput,
    dh4: Option<&DhOutput>,
) -> SymmetricKey {
    let mut ikm = Vec::with_capacity(160);
    ikm.extend_from_slice(&DOMAIN_SEPARATOR);
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let zero_salt = [0u8; KEY_SIZE_32];
    let hk = Hkdf::<Sha256>::new(Some(&zero_salt), &ikm);
    let mut output = [0u8; KEY_SIZE_32];
    hk.expand(HANDSHAKE_INFO, &mut output)
        .expect("output size is valid");

    ikm.zeroize();
    SymmetricKey(output)
}

/// Root-key ratchet step.
///
/// `(rk', ck) = HKDF(ikm = dh_out, salt = rk, info = "WhisperRatchet", len = 64)`
#[must_use]
pub fn kdf_rk(root_key: &SymmetricKey, dh_output: &DhOutput) -> (SymmetricKey, SymmetricKey) {
    let hk = Hkdf::<Sha256>::new(Some(root_key.as_bytes()), dh_output.as_bytes());

    let mut output = [0u8; 64];
    hk.expand(ROOT_INFO, &mut output)
        .expect("output size is valid");

    let new_root = SymmetricKey::from_bytes(output[..KEY_SIZE_32].try_into().expect("32 bytes"));
    let chain = SymmetricKey::from_bytes(output[KEY_SIZE_32..].try_into().expect("32 bytes"));

    output.zeroize();
    (new_root, chain)
}

/// Chain-key ratchet step.
///
/// `mk = HMAC(ck, 0x01)`, `ck' = HMAC(ck, 0x02)`
#[must_use]
pub fn kdf_ck(chain_key: &SymmetricKey) -> (SymmetricKey, SymmetricKey) {
    let message_key = SymmetricKey(hmac_sha256(chain_key.as_bytes(), &[0x01]));
    let next_chain_key = SymmetricKey(hmac_sha256(chain_key.as_bytes(), &[0x02]));
    (message_key, next_chain_key)
}

/// Expand a message key into the per-message cipher key, auth key and IV.
///
/// `HKDF(ikm = mk, salt = zero32, info = "WhisperMessageKeys", len = 80)`
#[must_use]
pub fn derive_message_keys(message_key: &SymmetricKey) -> MessageKeys {
    let zero_salt = [0u8; KEY_SIZE_32];
    let hk = Hkdf::<Sha256>::new(Some(&zero_salt), message_key.as_bytes());

    let mut output = [0u8; 80];
    hk.expand(MESSAGE_INFO, &mut output)
        .expect("output size is valid");

    let keys = MessageKeys {
        cipher_key: output[..32].try_into().expect("32 bytes"),
        auth_key: output[32..64].try_into().expect("32 bytes"),
        iv: output[64..76].try_into().expect("12 bytes"),
    };

    output.zeroize();
    keys
}

/// AEAD seal: ChaCha20-Poly1305, 12-byte nonce, 16-byte tag appended.
pub fn aead_seal(
    key: &[u8; KEY_SIZE_32],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::AuthFailed)
}

/// AEAD open. Fails with [`Error::AuthFailed`] on tag mismatch.
pub fn aead_open(
    key: &[u8; KEY_SIZE_32],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::AuthFailed);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::AuthFailed)
}

/// Fill a fresh buffer with `n` bytes from the OS CSPRNG
#[must_use]
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Constant-time byte comparison.
///
/// Execution time depends only on slice length, never on content.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Base64 (standard alphabet) encode
#[must_use]
pub fn b64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Base64 (standard alphabet) decode
pub fn b64_decode(data: &str) -> Result<Vec<u8>> {
    BASE64.decode(data).map_err(|_| Error::InvalidMessageFormat)
}
