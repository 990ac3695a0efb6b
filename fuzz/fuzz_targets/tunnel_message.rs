//! Fuzz target for tunnel message decoding

#![no_main]

use libfuzzer_sys::fuzz_target;
use plait_core::tunnel::TunnelMessage;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = TunnelMessage::decode(data) {
        // anything that decodes must encode again
        let _ = message.encode();
    }
});
