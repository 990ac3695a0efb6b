//! Fuzz target for packet parsing
//!
//! The header parser and the codec must reject arbitrary input without
//! panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use plait_core::{PacketCodec, PacketHeader, PeerIdentity};

fuzz_target!(|data: &[u8]| {
    let id = PeerIdentity::from_passphrase("fuzz");
    if let Ok(header) = PacketHeader::parse(data) {
        let _ = header.verify_crc(&id.unique_id);
    }

    let codec = PacketCodec::new(id.unique_id, &id.secret);
    let _ = codec.decode(data);
});
