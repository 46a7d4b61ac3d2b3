//! # Whispercore
//!
//! Secure-messaging cryptographic core: X3DH asynchronous key agreement
//! and Double Ratchet sessions, with key-material management, per-peer
//! session lifecycle and identity-change detection.
//!
//! ## Security Properties
//!
//! - **Forward Secrecy**: past messages stay secret if current keys leak
//! - **Post-Compromise Security**: a round trip heals a compromised session
//! - **Asynchronous**: the sender encrypts while the recipient is offline
//! - **Out-of-order tolerant**: late and dropped ciphertexts are handled
//!   through a bounded skipped-key cache
//!
//! ## Threat Model
//!
//! This implementation assumes:
//! - The adversary can inject, modify, delay, or drop messages
//! - The adversary cannot break X25519, HKDF-SHA256, or the AEAD
//! - The secure store guarantees confidentiality at rest
//! - Side-channel attacks are mitigated but not formally verified
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rand_core::OsRng;
//! use whispercore::{Config, KeyManager, MemorySecureStore, SecureStore, SessionManager};
//!
//! # fn main() -> whispercore::Result<()> {
//! let store: Arc<dyn SecureStore> = Arc::new(MemorySecureStore::new());
//! let keys = Arc::new(KeyManager::new(Arc::clone(&store), Config::default()));
//! let outcome = keys.initialize(&mut OsRng, 0)?;
//! // publish outcome.bundle through the key directory...
//!
//! let sessions = SessionManager::new(store, keys, Config::default());
//! // first send runs X3DH against the peer's fetched bundle
//! // let (wire_type, frame) = sessions.encrypt("peer", 1, b"hello", Some(&bundle))?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![warn(clippy::all, clippy::pedantic, clippy::cargo)]

pub mod config;
pub mod crypto;
pub mod directory;
pub mod double_ratchet;
pub mod error;
pub mod fingerprint;
pub mod key_manager;
pub mod keys;
pub mod session;
pub mod store;
pub mod wire;
pub mod x3dh;

// Re-export main types
pub use config::Config;
pub use double_ratchet::{Header, Message, RatchetState};
pub use error::{Error, Result};
pub use fingerprint::safety_number;
pub use key_manager::{InitializeOutcome, KeyManager, SignedPreKeyUpdate};
pub use keys::{IdentityKeyPair, PublicKey, SecretKey, SigningKeyPair};
pub use session::{IdentityCheck, SessionManager};
pub use store::{MemorySecureStore, SecureStore};
pub use wire::{WireMessage, WireType};
pub use x3dh::{HandshakeHeader, InitiatorResult, PreKeyBundle, ResponderResult};
