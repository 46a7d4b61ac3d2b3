//! Fuzz target for AEAD seal/open with corrupted inputs
//!
//! Ensures authentication failures surface as errors, never as panics
//! or silent corruption.

#![no_main]

use libfuzzer_sys::fuzz_target;
use whispercore::crypto::{aead_open, aead_seal, NONCE_SIZE};

fuzz_target!(|data: &[u8]| {
    if data.len() < 32 + NONCE_SIZE + 1 {
        return;
    }

    let key: [u8; 32] = data[..32].try_into().unwrap();
    let nonce: [u8; NONCE_SIZE] = data[32..32 + NONCE_SIZE].try_into().unwrap();
    let plaintext = &data[32 + NONCE_SIZE..];

    let ciphertext = aead_seal(&key, &nonce, plaintext, b"aad").expect("seal never fails");

    let opened = aead_open(&key, &nonce, &ciphertext, b"aad").expect("open should succeed");
    assert_eq!(&opened, plaintext);

    // Any single-byte corruption must fail authentication.
    let mut corrupted = ciphertext.clone();
    corrupted[0] ^= 0x01;
    assert!(aead_open(&key, &nonce, &corrupted, b"aad").is_err());

    // As must a different associated-data binding.
    assert!(aead_open(&key, &nonce, &ciphertext, b"other").is_err());
});
