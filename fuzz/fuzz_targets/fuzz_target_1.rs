#![no_main]

use libfuzzer_sys::fuzz_target;
use relaynet::core::codec::Framing;
use relaynet::Packet;

fuzz_target!(|data: &[u8]| {
    // Relay messages are untrusted: decoding must never panic
    let _ = Packet::decode(data);
    if let Ok(body) = Framing::Fenced.unwrap(data) {
        let _ = Packet::decode(body);
    }
});
