#![no_main]

use libfuzzer_sys::fuzz_target;
use murmur::message::Message;

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    match Message::from_json(line) {
        // whatever parses must survive a round trip through the wire format
        Ok(msg) => assert_eq!(Message::from_json(&msg.to_json()).unwrap(), msg),
        Err(err) => {
            let _reply = err.error_reply();
        }
    }
});
