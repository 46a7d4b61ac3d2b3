//! Fuzz target for X3DH handshake header parsing

#![no_main]

use libfuzzer_sys::fuzz_target;
use whispercore::x3dh::HandshakeHeader;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = HandshakeHeader::from_bytes(data) {
        let serialized = header.to_bytes();
        let roundtrip =
            HandshakeHeader::from_bytes(&serialized).expect("roundtrip should succeed");

        assert_eq!(header, roundtrip);
        // A zero id on the wire must parse back as "no one-time key"
        assert_ne!(header.one_time_prekey_id, Some(0));
    }
});
