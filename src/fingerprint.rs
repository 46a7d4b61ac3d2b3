//! Safety-number fingerprints for manual identity verification.
//!
//! Two peers comparing the displayed number out of band detect a
//! machine-in-the-middle: the number is derived from both identity keys,
//! is identical on both ends and stays stable across sessions.

use crate::keys::PublicKey;
use sha2::{Digest, Sha256};

/// Hash iterations for the fingerprint derivation
pub const FINGERPRINT_ITERATIONS: u32 = 5200;

/// Displayed digits, grouped five at a time
const DIGIT_GROUPS: usize = 12;
const GROUP_BYTES: usize = 5;

/// Derive the safety number for a pair of identity keys.
///
/// The two keys are ordered bytewise so both endpoints hash the same
/// input: `SHA-256^5200(low_key || high_key || app_id || iterations_be)`.
/// The digest is stretched by chained re-hashing and formatted as 60
/// decimal digits in 12 groups of 5.
#[must_use]
pub fn safety_number(ours: &PublicKey, theirs: &PublicKey, app_id: &[u8]) -> String {
    let (low, high) = if ours.as_bytes() <= theirs.as_bytes() {
        (ours, theirs)
    } else {
        (theirs, ours)
    };

    let mut input = Vec::with_capacity(64 + app_id.len() + 4);
    input.extend_from_slice(low.as_bytes());
    input.extend_from_slice(high.as_bytes());
    input.extend_from_slice(app_id);
    input.extend_from_slice(&FINGERPRINT_ITERATIONS.to_be_bytes());

    let mut digest: [u8; 32] = Sha256::digest(&input).into();
    for _ in 1..FINGERPRINT_ITERATIONS {
        digest = Sha256::digest(digest).into();
    }

    // Stretch the 32-byte digest to the 60 bytes the display needs.
    let mut material = Vec::with_capacity(DIGIT_GROUPS * GROUP_BYTES);
    material.extend_from_slice(&digest);
    let mut block = digest;
    while material.len() < DIGIT_GROUPS * GROUP_BYTES {
        block = Sha256::digest(block).into();
        material.extend_from_slice(&block);
    }

    let mut groups = Vec::with_capacity(DIGIT_GROUPS);
    for chunk in material.chunks_exact(GROUP_BYTES).take(DIGIT_GROUPS) {
        let mut value = 0u64;
        for &byte in chunk {
            value = (value << 8) | u64::from(byte);
        }
        groups.push(format!("{:05}", value % 100_000));
    }

    groups.join(" ")
}
