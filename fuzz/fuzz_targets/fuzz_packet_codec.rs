#![no_main]
use libfuzzer_sys::fuzz_target;
use positron_net::networking::wire::packet::Packet;

fuzz_target!(|data: &[u8]| {
    // Packet::from_bytes must never panic on arbitrary input, and must always reject anything it
    // didn't itself just encode.
    if let Ok(packet) = Packet::from_bytes(data) {
        let reencoded = packet.to_bytes();
        let roundtripped = Packet::from_bytes(&reencoded).expect("a packet we just encoded must decode");
        assert_eq!(packet, roundtripped);
    }
});
