//! Property-based tests for the messaging core
//!
//! Uses proptest to verify protocol invariants across random inputs

use proptest::prelude::*;
use rand_core::OsRng;
use whispercore::double_ratchet::RatchetState;
use whispercore::fingerprint::safety_number;
use whispercore::keys::{IdentityKeyPair, OneTimePreKey, SecretKey, SignedPreKey};
use whispercore::x3dh::{initiate, respond, PreKeyBundle};

const MAX_SKIP: u32 = 1000;
const MAX_CACHED: usize = 2000;

fn bundle_for(
    identity: &IdentityKeyPair,
    spk: &SignedPreKey,
    opk: Option<&OneTimePreKey>,
) -> PreKeyBundle {
    PreKeyBundle {
        identity_key: identity.public_key(),
        identity_signing_key: identity.signing_key.verifying_key_bytes(),
        signed_prekey_id: spk.id,
        signed_prekey: spk.public_key(),
        signed_prekey_signature: spk.signature,
        one_time_prekey: opk.map(|k| (k.id, k.public_key())),
    }
}

fn ratchet_pair<R: rand_core::CryptoRngCore>(rng: &mut R) -> (RatchetState, RatchetState) {
    let alice_identity = IdentityKeyPair::generate(rng);
    let bob_identity = IdentityKeyPair::generate(rng);
    let bob_spk = SignedPreKey::generate(rng, 1, &bob_identity);
    let bob_opk = OneTimePreKey::generate(rng, 1);

    let bundle = bundle_for(&bob_identity, &bob_spk, Some(&bob_opk));
    let init = initiate(rng, &alice_identity, &bundle).unwrap();
    let resp = respond(&bob_identity, &bob_spk.key, Some(&bob_opk.key), &init.header).unwrap();

    let alice = RatchetState::init_sender(
        rng,
        init.master,
        bob_spk.public_key(),
        MAX_SKIP,
        MAX_CACHED,
    )
    .unwrap();
    let bob = RatchetState::init_receiver(resp.master, bob_spk.key, MAX_SKIP, MAX_CACHED);

    (alice, bob)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn test_x3dh_always_produces_same_secret(seed in any::<u64>()) {
        // X3DH must always produce identical master secrets for both parties
        use rand::SeedableRng;
        use rand::rngs::StdRng;

        let mut rng = StdRng::seed_from_u64(seed);

        let alice_identity = IdentityKeyPair::generate(&mut rng);
        let bob_identity = IdentityKeyPair::generate(&mut rng);
        let bob_spk = SignedPreKey::generate(&mut rng, 1, &bob_identity);
        let bob_opk = OneTimePreKey::generate(&mut rng, 1);

        let bundle = bundle_for(&bob_identity, &bob_spk, Some(&bob_opk));
        let init = initiate(&mut rng, &alice_identity, &bundle).unwrap();
        let resp = respond(&bob_identity, &bob_spk.key, Some(&bob_opk.key), &init.header).unwrap();

        prop_assert_eq!(init.master.as_bytes(), resp.master.as_bytes());
        prop_assert_eq!(init.associated_data, resp.associated_data);
    }

    #[test]
    fn test_ratchet_encrypt_decrypt_roundtrip(
        message in prop::collection::vec(any::<u8>(), 0..1000)
    ) {
        // Any message encrypted then decrypted should match original
        let (mut alice, mut bob) = ratchet_pair(&mut OsRng);

        let encrypted = alice.encrypt(&message, b"").unwrap();
        let decrypted = bob.decrypt(&mut OsRng, &encrypted, b"").unwrap();

        prop_assert_eq!(decrypted, message);
    }

    #[test]
    fn test_different_messages_different_ciphertexts(
        msg1 in prop::collection::vec(any::<u8>(), 10..100),
        msg2 in prop::collection::vec(any::<u8>(), 10..100)
    ) {
        // Different plaintexts should produce different ciphertexts
        if msg1 == msg2 {
            return Ok(());
        }

        let (mut alice, _) = ratchet_pair(&mut OsRng);

        let ct1 = alice.encrypt(&msg1, b"").unwrap();
        let ct2 = alice.encrypt(&msg2, b"").unwrap();

        prop_assert_ne!(ct1.ciphertext, ct2.ciphertext);
    }

    #[test]
    fn test_out_of_order_delivery_any_order(
        permutation in Just((0..10usize).collect::<Vec<_>>()).prop_shuffle()
    ) {
        // Messages should decrypt correctly in any order
        let (mut alice, mut bob) = ratchet_pair(&mut OsRng);

        // encrypt messages in order
        let mut messages = Vec::new();
        for i in 0..10 {
            let msg = format!("Message {i}");
            messages.push((alice.encrypt(msg.as_bytes(), b"").unwrap(), msg));
        }

        // decrypt in permuted order
        for &idx in &permutation {
            let (ref encrypted, ref expected) = messages[idx];
            let decrypted = bob.decrypt(&mut OsRng, encrypted, b"").unwrap();
            prop_assert_eq!(&decrypted, expected.as_bytes());
        }
    }

    #[test]
    fn test_tampering_never_mutates_state(
        flip_byte in 0usize..16,
        message in prop::collection::vec(any::<u8>(), 16..64)
    ) {
        let (mut alice, mut bob) = ratchet_pair(&mut OsRng);

        let mut encrypted = alice.encrypt(&message, b"").unwrap();
        let idx = flip_byte % encrypted.ciphertext.len();
        encrypted.ciphertext[idx] ^= 0x01;

        prop_assert!(bob.decrypt(&mut OsRng, &encrypted, b"").is_err());

        // The untampered stream still decrypts afterwards.
        let next = alice.encrypt(b"still fine", b"").unwrap();
        // The tampered first message consumed nothing, so this is
        // delivered out of order relative to the (lost) original.
        let decrypted = bob.decrypt(&mut OsRng, &next, b"").unwrap();
        prop_assert_eq!(&decrypted, b"still fine");
    }

    #[test]
    fn test_safety_number_symmetric(seed in any::<u64>()) {
        use rand::SeedableRng;
        use rand::rngs::StdRng;

        let mut rng = StdRng::seed_from_u64(seed);
        let a = SecretKey::generate(&mut rng).public_key();
        let b = SecretKey::generate(&mut rng).public_key();

        prop_assert_eq!(
            safety_number(&a, &b, b"app"),
            safety_number(&b, &a, b"app")
        );
    }
}

#[cfg(test)]
mod deterministic_tests {
    use whispercore::crypto::{kdf_ck, SymmetricKey};

    #[test]
    fn test_kdf_deterministic() {
        // same inputs should always produce same outputs
        let key = SymmetricKey::from_bytes([42u8; 32]);
        let (mk1, ck1) = kdf_ck(&key);
        let (mk2, ck2) = kdf_ck(&key);

        assert_eq!(mk1.as_bytes(), mk2.as_bytes());
        assert_eq!(ck1.as_bytes(), ck2.as_bytes());
    }
}
