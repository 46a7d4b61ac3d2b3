//! X3DH (Extended Triple Diffie-Hellman) key agreement protocol
//!
//! Asynchronous key agreement: the initiator derives a shared master
//! secret from a published pre-key bundle without the responder being
//! online.
//!
//! ## Protocol Flow
//!
//! 1. **Responder** publishes a prekey bundle containing:
//!    - Identity key (long-term, DH + signing halves)
//!    - Signed prekey (medium-term, rotated periodically)
//!    - Optionally a one-time prekey (consumed on use)
//!
//! 2. **Initiator** fetches the bundle, verifies the signed-prekey
//!    signature, and computes:
//!    - DH1 = `DH(IK_A, SPK_B)`
//!    - DH2 = `DH(EK_A, IK_B)`
//!    - DH3 = `DH(EK_A, SPK_B)`
//!    - DH4 = `DH(EK_A, OPK_B)` [if OPK available]
//!    - `master = KDF(F || DH1 || DH2 || DH3 || DH4?)`
//!
//! 3. **Responder** receives the handshake header and computes the same
//!    master secret with the mirrored private keys.

use crate::crypto::{derive_master_secret, SymmetricKey};
use crate::error::{Error, Result};
use crate::keys::{verify_signature, IdentityKeyPair, PublicKey, SecretKey};
use rand_core::CryptoRngCore;

/// Serialized handshake header length: ik(32) + ek(32) + spk_id(4) + opk_id(4)
pub const HEADER_SIZE: usize = 72;

/// Prekey bundle published by a responder through the key directory.
///
/// Contains all public material an initiator needs to perform X3DH.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    /// Responder's identity DH key (X25519)
    pub identity_key: PublicKey,

    /// Responder's identity signing key (Ed25519 verifying key bytes)
    pub identity_signing_key: [u8; 32],

    /// Id of the signed prekey below
    pub signed_prekey_id: u32,

    /// Responder's signed prekey (rotated periodically)
    pub signed_prekey: PublicKey,

    /// Signature over the signed prekey by the identity signing key
    pub signed_prekey_signature: [u8; 64],

    /// Optional one-time prekey with its id
    pub one_time_prekey: Option<(u32, PublicKey)>,
}

impl PreKeyBundle {
    /// Verify the signed prekey signature.
    ///
    /// Fails with [`Error::InvalidBundle`] when the signature does not
    /// verify under the bundle's identity signing key.
    pub fn verify(&self) -> Result<()> {
        verify_signature(
            &self.identity_signing_key,
            self.signed_prekey.as_bytes(),
            &self.signed_prekey_signature,
        )
        .map_err(|_| Error::InvalidBundle)
    }
}

/// Handshake header the initiator prepends to its first message.
///
/// Wire layout (big-endian): `ik(32) | ek(32) | spk_id(4) | opk_id(4)`,
/// where an `opk_id` of zero means no one-time prekey was used. One-time
/// prekey ids therefore start at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeHeader {
    /// Initiator's identity DH key
    pub identity_key: PublicKey,

    /// Initiator's ephemeral key
    pub ephemeral_key: PublicKey,

    /// Which signed prekey of the responder was used
    pub signed_prekey_id: u32,

    /// Which one-time prekey was consumed, if any
    pub one_time_prekey_id: Option<u32>,
}

impl HandshakeHeader {
    /// Serialize for the wire
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..32].copy_from_slice(self.identity_key.as_bytes());
        bytes[32..64].copy_from_slice(self.ephemeral_key.as_bytes());
        bytes[64..68].copy_from_slice(&self.signed_prekey_id.to_be_bytes());
        bytes[68..72].copy_from_slice(&self.one_time_prekey_id.unwrap_or(0).to_be_bytes());
        bytes
    }

    /// Deserialize from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidMessageFormat);
        }

        let identity_key =
            PublicKey::from_bytes(bytes[..32].try_into().map_err(|_| Error::InvalidMessageFormat)?);
        let ephemeral_key = PublicKey::from_bytes(
            bytes[32..64]
                .try_into()
                .map_err(|_| Error::InvalidMessageFormat)?,
        );
        let signed_prekey_id = u32::from_be_bytes(
            bytes[64..68]
                .try_into()
                .map_err(|_| Error::InvalidMessageFormat)?,
        );
        let opk_raw = u32::from_be_bytes(
            bytes[68..72]
                .try_into()
                .map_err(|_| Error::InvalidMessageFormat)?,
        );

        Ok(Self {
            identity_key,
            ephemeral_key,
            signed_prekey_id,
            one_time_prekey_id: (opk_raw != 0).then_some(opk_raw),
        })
    }
}

/// Result of the initiator's X3DH computation
pub struct InitiatorResult {
    /// Shared master secret
    pub master: SymmetricKey,

    /// Associated data binding both identities: `IK_initiator || IK_responder`
    pub associated_data: Vec<u8>,

    /// Header to prepend to the first message
    pub header: HandshakeHeader,
}

impl std::fmt::Debug for InitiatorResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitiatorResult")
            .field("header", &self.header)
            .finish()
    }
}

/// Result of the responder's X3DH computation
pub struct ResponderResult {
    /// Shared master secret
    pub master: SymmetricKey,

    /// Associated data binding both identities: `IK_initiator || IK_responder`
    pub associated_data: Vec<u8>,
}

impl std::fmt::Debug for ResponderResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponderResult").finish()
    }
}

/// Initiator side of the X3DH handshake.
///
/// Verifies the bundle signature, generates an ephemeral key and derives
/// the master secret. All DH outputs and the ephemeral secret are
/// zeroized before this function returns.
pub fn initiate<R: CryptoRngCore>(
    rng: &mut R,
    initiator_identity: &IdentityKeyPair,
    bundle: &PreKeyBundle,
) -> Result<InitiatorResult> {
    bundle.verify()?;

    let ephemeral = SecretKey::generate(rng);

    let dh1 = initiator_identity
        .dh_key
        .diffie_hellman(&bundle.signed_prekey)?;
    let dh2 = ephemeral.diffie_hellman(&bundle.identity_key)?;
    let dh3 = ephemeral.diffie_hellman(&bundle.signed_prekey)?;
    let dh4 = bundle
        .one_time_prekey
        .as_ref()
        .map(|(_, opk)| ephemeral.diffie_hellman(opk))
        .transpose()?;

    let master = derive_master_secret(&dh1, &dh2, &dh3, dh4.as_ref());

    let header = HandshakeHeader {
        identity_key: initiator_identity.public_key(),
        ephemeral_key: ephemeral.public_key(),
        signed_prekey_id: bundle.signed_prekey_id,
        one_time_prekey_id: bundle.one_time_prekey.as_ref().map(|(id, _)| *id),
    };

    let mut associated_data = Vec::with_capacity(64);
    associated_data.extend_from_slice(initiator_identity.public_key().as_bytes());
    associated_data.extend_from_slice(bundle.identity_key.as_bytes());

    Ok(InitiatorResult {
        master,
        associated_data,
        header,
    })
}

/// Responder side of the X3DH handshake.
///
/// Recomputes the master secret with the mirrored private keys. Any
/// low-order input surfaces as [`Error::InvalidKey`] from the DH
/// primitive.
pub fn respond(
    responder_identity: &IdentityKeyPair,
    signed_prekey: &SecretKey,
    one_time_prekey: Option<&SecretKey>,
    header: &HandshakeHeader,
) -> Result<ResponderResult> {
    let dh1 = signed_prekey.diffie_hellman(&header.identity_key)?;
    let dh2 = responder_identity
        .dh_key
        .diffie_hellman(&header.ephemeral_key)?;
    let dh3 = signed_prekey.diffie_hellman(&header.ephemeral_key)?;
    let dh4 = one_time_prekey
        .map(|opk| opk.diffie_hellman(&header.ephemeral_key))
        .transpose()?;

    let master = derive_master_secret(&dh1, &dh2, &dh3, dh4.as_ref());

    let mut associated_data = Vec::with_capacity(64);
    associated_data.extend_from_slice(header.identity_key.as_bytes());
    associated_data.extend_from_slice(responder_identity.public_key().as_bytes());

    Ok(ResponderResult {
        master,
        associated_data,
    })
}
