//! RTU response decoding must never panic on arbitrary input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_relay::protocol::rtu_response_len;
use voltage_relay::Framing;

fuzz_target!(|data: &[u8]| {
    if let Some(head) = data.get(..3) {
        let head = [head[0], head[1], head[2]];
        if let Ok(len) = rtu_response_len(&head) {
            if let Some(frame) = data.get(..len) {
                let _ = Framing::Rtu.decode(frame);
            }
        }
    }
    let _ = Framing::Rtu.decode(data);
});
