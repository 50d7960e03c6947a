#![no_main]
use libfuzzer_sys::fuzz_target;
use positron_net::networking::wire::message::Message;

fuzz_target!(|data: &[u8]| {
    // Message::from_bytes is the boundary between the network and everything else; it must never
    // panic, and a message it accepts must re-encode to something it accepts again.
    if let Ok(message) = Message::from_bytes(data) {
        let reencoded = message.to_bytes().expect("a decoded message must re-encode");
        let roundtripped = Message::from_bytes(&reencoded).expect("a message we just encoded must decode");
        assert_eq!(message.message_id, roundtripped.message_id);
    }
});
