//! Error types for the messaging core.

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during protocol operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No established session for the peer and no bundle supplied
    #[error("no session for peer")]
    NoSession,

    /// Pre-key bundle failed signature verification or is malformed
    #[error("invalid prekey bundle")]
    InvalidBundle,

    /// Invalid or non-contributory public key (low-order point)
    #[error("invalid key")]
    InvalidKey,

    /// Invalid signature detected
    #[error("invalid signature")]
    InvalidSignature,

    /// Message authentication failed
    #[error("authentication failed")]
    AuthFailed,

    /// Skipped-key advance exceeded the configured ceiling
    #[error("too many skipped messages")]
    TooManySkipped,

    /// Requested key material does not exist or was already consumed
    #[error("not found")]
    NotFound,

    /// Message key for this counter was already used
    #[error("duplicate message")]
    DuplicateMessage,

    /// Secure store operation failed
    #[error("storage failure")]
    StorageFailure,

    /// Ratchet cannot encrypt yet (no sending chain)
    #[error("session not ready")]
    NotReady,

    /// Invalid wire frame or message encoding
    #[error("invalid message format")]
    InvalidMessageFormat,

    /// Invalid ratchet message header
    #[error("invalid message header")]
    InvalidHeader,
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        Error::InvalidSignature
    }
}
