//! Feeds arbitrary bytes through the serve-mode request path.

#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_relay::protocol::mbap_frame_len;
use voltage_relay::{detect_write, reply_to_request, Framing, RegisterMap};

fuzz_target!(|data: &[u8]| {
    let mut map = RegisterMap::new(64);
    let mut rest = data;

    while let Ok(Some(len)) = mbap_frame_len(rest) {
        if rest.len() < len {
            break;
        }
        let (frame, tail) = rest.split_at(len);
        if let Ok(reply) = reply_to_request(Framing::Tcp, frame, &mut map) {
            assert!(reply.len() >= Framing::Tcp.header_length() + 2);
            if let Some(range) = detect_write(frame, Framing::Tcp.header_length()) {
                let _ = map.slice(range.address, range.count);
            }
        }
        rest = tail;
    }
});
