//! Fuzz target for transport frame parsing
//!
//! Arbitrary frames must parse or fail cleanly, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use whispercore::WireMessage;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = WireMessage::from_bytes(data) {
        let serialized = frame.to_bytes();
        let roundtrip = WireMessage::from_bytes(&serialized).expect("roundtrip should succeed");

        assert_eq!(frame.wire_type, roundtrip.wire_type);
        assert_eq!(frame.handshake, roundtrip.handshake);
        assert_eq!(frame.header, roundtrip.header);
        assert_eq!(frame.ciphertext, roundtrip.ciphertext);
    }
});
