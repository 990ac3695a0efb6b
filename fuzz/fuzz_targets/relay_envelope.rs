//! Fuzz target for relay envelope decoding

#![no_main]

use libfuzzer_sys::fuzz_target;
use plait_transport::RelayEnvelope;

fuzz_target!(|data: &[u8]| {
    let _ = RelayEnvelope::decode(data);
});
