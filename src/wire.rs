//! Wire frame for ciphertexts handed to the transport.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! type_tag(1) | version(1) | [handshake header if type == PreKey] | header | ciphertext
//! handshake header: ik_sender(32) | ek(32) | spk_id(4) | opk_id(4, 0 = absent)
//! header:           dh(32) | pn(4) | n(4)
//! ```

use crate::double_ratchet::{Header, Message, HEADER_SIZE};
use crate::error::{Error, Result};
use crate::x3dh::{HandshakeHeader, HEADER_SIZE as HANDSHAKE_HEADER_SIZE};

/// Current frame version
pub const WIRE_VERSION: u8 = 1;

/// Frame type: whether the ciphertext carries an X3DH handshake header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    /// First message(s) of a session, handshake header prepended
    PreKey = 1,
    /// Steady-state ratchet message
    Whisper = 2,
}

impl TryFrom<u8> for WireType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WireType::PreKey),
            2 => Ok(WireType::Whisper),
            _ => Err(Error::InvalidMessageFormat),
        }
    }
}

/// A complete frame as handed to (or received from) the transport
#[derive(Debug, Clone)]
pub struct WireMessage {
    /// Frame type tag
    pub wire_type: WireType,

    /// Handshake header, present exactly when `wire_type` is `PreKey`
    pub handshake: Option<HandshakeHeader>,

    /// Ratchet message header
    pub header: Header,

    /// AEAD ciphertext with appended tag
    pub ciphertext: Vec<u8>,
}

impl WireMessage {
    /// Frame a steady-state ratchet message
    #[must_use]
    pub fn whisper(message: Message) -> Self {
        Self {
            wire_type: WireType::Whisper,
            handshake: None,
            header: message.header,
            ciphertext: message.ciphertext,
        }
    }

    /// Frame a session-establishing message
    #[must_use]
    pub fn pre_key(handshake: HandshakeHeader, message: Message) -> Self {
        Self {
            wire_type: WireType::PreKey,
            handshake: Some(handshake),
            header: message.header,
            ciphertext: message.ciphertext,
        }
    }

    /// The embedded ratchet message
    #[must_use]
    pub fn message(&self) -> Message {
        Message {
            header: self.header.clone(),
            ciphertext: self.ciphertext.clone(),
        }
    }

    /// Serialize for the transport
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let handshake_len = if self.handshake.is_some() {
            HANDSHAKE_HEADER_SIZE
        } else {
            0
        };
        let mut bytes =
            Vec::with_capacity(2 + handshake_len + HEADER_SIZE + self.ciphertext.len());

        bytes.push(self.wire_type as u8);
        bytes.push(WIRE_VERSION);
        if let Some(handshake) = &self.handshake {
            bytes.extend_from_slice(&handshake.to_bytes());
        }
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Parse a frame received from the transport.
    ///
    /// Unknown type tags and versions are rejected before any state is
    /// touched.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::InvalidMessageFormat);
        }
        let wire_type = WireType::try_from(bytes[0])?;
        if bytes[1] != WIRE_VERSION {
            return Err(Error::InvalidMessageFormat);
        }

        let mut offset = 2;
        let handshake = match wire_type {
            WireType::PreKey => {
                let handshake = HandshakeHeader::from_bytes(&bytes[offset..])?;
                offset += HANDSHAKE_HEADER_SIZE;
                Some(handshake)
            }
            WireType::Whisper => None,
        };

        if bytes.len() < offset + HEADER_SIZE {
            return Err(Error::InvalidMessageFormat);
        }
        let header = Header::from_bytes(&bytes[offset..offset + HEADER_SIZE])?;
        offset += HEADER_SIZE;

        Ok(Self {
            wire_type,
            handshake,
            header,
            ciphertext: bytes[offset..].to_vec(),
        })
    }
}
