//! Integration tests for X3DH and the Double Ratchet
//!
//! Tests complete protocol flows including:
//! - Full X3DH handshake
//! - Double Ratchet initialization and message exchange
//! - Out-of-order message delivery
//! - Error conditions

use rand_core::OsRng;
use whispercore::double_ratchet::{Message, RatchetState};
use whispercore::keys::{IdentityKeyPair, OneTimePreKey, SecretKey, SignedPreKey};
use whispercore::x3dh::{initiate, respond, PreKeyBundle};
use whispercore::Error;

const MAX_SKIP: u32 = 1000;
const MAX_CACHED: usize = 2000;

struct Responder {
    identity: IdentityKeyPair,
    spk: SignedPreKey,
    opk: OneTimePreKey,
}

impl Responder {
    fn generate() -> Self {
        let identity = IdentityKeyPair::generate(&mut OsRng);
        let spk = SignedPreKey::generate(&mut OsRng, 1, &identity);
        let opk = OneTimePreKey::generate(&mut OsRng, 10);
        Self { identity, spk, opk }
    }

    fn bundle(&self) -> PreKeyBundle {
        PreKeyBundle {
            identity_key: self.identity.public_key(),
            identity_signing_key: self.identity.signing_key.verifying_key_bytes(),
            signed_prekey_id: self.spk.id,
            signed_prekey: self.spk.public_key(),
            signed_prekey_signature: self.spk.signature,
            one_time_prekey: Some((self.opk.id, self.opk.public_key())),
        }
    }
}

fn ratchet_pair() -> (RatchetState, RatchetState) {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob = Responder::generate();

    let init = initiate(&mut OsRng, &alice_identity, &bob.bundle()).expect("X3DH initiation");
    let resp = respond(&bob.identity, &bob.spk.key, Some(&bob.opk.key), &init.header)
        .expect("X3DH response");

    assert_eq!(
        init.master.as_bytes(),
        resp.master.as_bytes(),
        "X3DH master secrets must match"
    );

    let alice = RatchetState::init_sender(
        &mut OsRng,
        init.master,
        bob.spk.public_key(),
        MAX_SKIP,
        MAX_CACHED,
    )
    .expect("sender init");
    let bob_ratchet = RatchetState::init_receiver(resp.master, bob.spk.key, MAX_SKIP, MAX_CACHED);

    (alice, bob_ratchet)
}

#[test]
fn test_full_protocol_flow() {
    let (mut alice, mut bob) = ratchet_pair();

    let messages = vec![
        b"Hello Bob!".as_slice(),
        b"How are you?".as_slice(),
        b"This is a secure message".as_slice(),
    ];

    for msg in &messages {
        let encrypted = alice.encrypt(msg, b"").expect("encryption");
        let decrypted = bob.decrypt(&mut OsRng, &encrypted, b"").expect("decryption");
        assert_eq!(&decrypted, msg, "decrypted message must match original");
    }

    let response = b"Hello Alice! I'm good!";
    let encrypted = bob.encrypt(response, b"").unwrap();
    let decrypted = alice.decrypt(&mut OsRng, &encrypted, b"").unwrap();
    assert_eq!(&decrypted, response);
}

#[test]
fn test_out_of_order_messages() {
    let (mut alice, mut bob) = ratchet_pair();

    let msg1 = alice.encrypt(b"Message 1", b"").unwrap();
    let msg2 = alice.encrypt(b"Message 2", b"").unwrap();
    let msg3 = alice.encrypt(b"Message 3", b"").unwrap();

    // Bob receives out of order: 3, 1, 2
    let plain3 = bob.decrypt(&mut OsRng, &msg3, b"").unwrap();
    assert_eq!(&plain3, b"Message 3");

    let plain1 = bob.decrypt(&mut OsRng, &msg1, b"").unwrap();
    assert_eq!(&plain1, b"Message 1");

    let plain2 = bob.decrypt(&mut OsRng, &msg2, b"").unwrap();
    assert_eq!(&plain2, b"Message 2");
}

#[test]
fn test_bidirectional_messaging() {
    let (mut alice, mut bob) = ratchet_pair();

    let a1 = alice.encrypt(b"Alice 1", b"").unwrap();
    let b1 = bob.decrypt(&mut OsRng, &a1, b"").unwrap();
    assert_eq!(&b1, b"Alice 1");

    let b2 = bob.encrypt(b"Bob 1", b"").unwrap();
    let a2 = alice.decrypt(&mut OsRng, &b2, b"").unwrap();
    assert_eq!(&a2, b"Bob 1");

    let a3 = alice.encrypt(b"Alice 2", b"").unwrap();
    let b3 = bob.decrypt(&mut OsRng, &a3, b"").unwrap();
    assert_eq!(&b3, b"Alice 2");
}

#[test]
fn test_invalid_signature_rejected() {
    let bob = Responder::generate();
    let mut bundle = bob.bundle();

    bundle.signed_prekey_signature[0] ^= 1; // Corrupt signature

    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let result = initiate(&mut OsRng, &alice_identity, &bundle);

    assert!(result.is_err());
    assert_eq!(result.unwrap_err(), Error::InvalidBundle);
}

#[test]
fn test_associated_data_integrity() {
    let (mut alice, mut bob) = ratchet_pair();

    let ad = b"important context";
    let encrypted = alice.encrypt(b"secret", ad).unwrap();

    // correct AD
    let decrypted = bob.decrypt(&mut OsRng, &encrypted, ad).unwrap();
    assert_eq!(&decrypted, b"secret");

    // Decrypt with wrong AD should fail
    let encrypted2 = alice.encrypt(b"secret2", ad).unwrap();
    let result = bob.decrypt(&mut OsRng, &encrypted2, b"wrong AD");
    assert_eq!(result.unwrap_err(), Error::AuthFailed);
}

#[test]
fn test_tampered_header_rejected() {
    let (mut alice, mut bob) = ratchet_pair();

    let mut message = alice.encrypt(b"bound to header", b"").unwrap();
    // Lie about the message number: the AEAD tag covers the header.
    message.header.message_number = 5;

    let result = bob.decrypt(&mut OsRng, &message, b"");
    assert!(result.is_err());
}

#[test]
fn test_tamper_then_recover() {
    let (mut alice, mut bob) = ratchet_pair();

    let m1 = alice.encrypt(b"first", b"").unwrap();
    bob.decrypt(&mut OsRng, &m1, b"").unwrap();

    let m2 = alice.encrypt(b"second", b"").unwrap();
    let mut tampered = Message {
        header: m2.header.clone(),
        ciphertext: m2.ciphertext.clone(),
    };
    tampered.ciphertext[0] ^= 0x01;

    assert_eq!(
        bob.decrypt(&mut OsRng, &tampered, b"").unwrap_err(),
        Error::AuthFailed
    );

    // The failure must not have consumed the message key.
    assert_eq!(bob.decrypt(&mut OsRng, &m2, b"").unwrap(), b"second");

    // And the session keeps working afterwards.
    let m3 = alice.encrypt(b"third", b"").unwrap();
    assert_eq!(bob.decrypt(&mut OsRng, &m3, b"").unwrap(), b"third");
}

#[test]
fn test_ratchet_advances_across_round_trips() {
    let (mut alice, mut bob) = ratchet_pair();

    let mut seen_dh_keys = Vec::new();
    for round in 0..5 {
        let msg = alice
            .encrypt(format!("ping {round}").as_bytes(), b"")
            .unwrap();
        seen_dh_keys.push(*msg.header.dh_public.as_bytes());
        bob.decrypt(&mut OsRng, &msg, b"").unwrap();

        let reply = bob
            .encrypt(format!("pong {round}").as_bytes(), b"")
            .unwrap();
        alice.decrypt(&mut OsRng, &reply, b"").unwrap();
    }

    // Every round trip rotated Alice's ratchet key.
    for pair in seen_dh_keys.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
}

#[test]
fn test_large_messages() {
    let (mut alice, mut bob) = ratchet_pair();

    // 1 MB message
    let large_message = vec![42u8; 1_000_000];
    let encrypted = alice.encrypt(&large_message, b"").unwrap();
    let decrypted = bob.decrypt(&mut OsRng, &encrypted, b"").unwrap();

    assert_eq!(decrypted, large_message);
}

#[test]
fn test_skipped_cache_bound_holds() {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob = Responder::generate();

    let init = initiate(&mut OsRng, &alice_identity, &bob.bundle()).unwrap();
    let resp = respond(&bob.identity, &bob.spk.key, Some(&bob.opk.key), &init.header).unwrap();

    let mut alice =
        RatchetState::init_sender(&mut OsRng, init.master, bob.spk.public_key(), 200, 16).unwrap();
    let mut bob_ratchet = RatchetState::init_receiver(resp.master, bob.spk.key, 200, 16);

    let mut msgs = Vec::new();
    for i in 0..100u32 {
        msgs.push(alice.encrypt(format!("m{i}").as_bytes(), b"").unwrap());
    }

    // Deliver every tenth message: each delivery stores skipped keys but
    // the cache never exceeds its bound.
    for msg in msgs.iter().skip(9).step_by(10) {
        bob_ratchet.decrypt(&mut OsRng, msg, b"").unwrap();
        assert!(bob_ratchet.skipped_len() <= 16);
    }
}

#[test]
fn test_low_order_ephemeral_rejected() {
    let bob = Responder::generate();

    let header = whispercore::x3dh::HandshakeHeader {
        identity_key: IdentityKeyPair::generate(&mut OsRng).public_key(),
        ephemeral_key: whispercore::PublicKey::from_bytes([0u8; 32]),
        signed_prekey_id: 1,
        one_time_prekey_id: None,
    };

    let result = respond(&bob.identity, &bob.spk.key, None, &header);
    assert_eq!(result.unwrap_err(), Error::InvalidKey);
}

#[test]
fn test_message_key_uniqueness() {
    let (mut alice, _) = ratchet_pair();

    let mut ciphertexts = Vec::new();
    for _ in 0..10 {
        let msg = alice.encrypt(b"identical plaintext", b"").unwrap();
        ciphertexts.push(msg.ciphertext);
    }

    for i in 0..ciphertexts.len() {
        for j in (i + 1)..ciphertexts.len() {
            assert_ne!(ciphertexts[i], ciphertexts[j]);
        }
    }
}

#[test]
fn test_fresh_ephemeral_each_handshake() {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob = Responder::generate();
    let bundle = bob.bundle();

    let first = initiate(&mut OsRng, &alice_identity, &bundle).unwrap();
    let second = initiate(&mut OsRng, &alice_identity, &bundle).unwrap();

    assert_ne!(
        first.header.ephemeral_key.as_bytes(),
        second.header.ephemeral_key.as_bytes()
    );
    assert_ne!(first.master.as_bytes(), second.master.as_bytes());
}

#[test]
fn test_dh_commutativity() {
    let a = SecretKey::generate(&mut OsRng);
    let b = SecretKey::generate(&mut OsRng);

    let shared1 = a.diffie_hellman(&b.public_key()).unwrap();
    let shared2 = b.diffie_hellman(&a.public_key()).unwrap();

    assert_eq!(shared1.as_bytes(), shared2.as_bytes());
}
