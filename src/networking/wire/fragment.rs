// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Fragmentation of oversize payloads into MTU-sized packets, and reassembly on the receiving
//! side.

use std::collections::BTreeMap;
use std::time::Instant;

use rand::RngCore;

use super::packet::{Packet, PacketFlags, PacketHeader, PacketType};

/// Default MTU-safe payload size (1472 typical Ethernet MTU minus IP/UDP/header overhead).
pub const DEFAULT_MTU: usize = 1472 - super::packet::HEADER_SIZE;

struct ReassemblyBuffer {
    fragments: BTreeMap<u16, Vec<u8>>,
    total: u16,
    started_at: Instant,
}

/// Splits oversize payloads into fragment packets and reassembles them on receipt.
pub struct Fragmenter {
    mtu: usize,
    reassembly: BTreeMap<u16, ReassemblyBuffer>,
}

impl Fragmenter {
    /// Build a fragmenter with the given MTU-safe payload size.
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            reassembly: BTreeMap::new(),
        }
    }

    /// Split `payload` into one or more packets. A single `DATA` packet when it already fits; a
    /// `FRAGMENT` sequence tagged with a single, randomly chosen fragment id otherwise. The
    /// fragment id is a random/counter value, deliberately not a hash of the payload, so that two
    /// fragmented messages with identical content never collide in the reassembly buffer.
    pub fn fragment(&self, payload: &[u8], sequence: u32) -> Vec<Packet> {
        if payload.len() <= self.mtu {
            return vec![Packet::data(sequence, payload.to_vec(), 0, true)];
        }

        let fragment_id = rand::thread_rng().next_u32() as u16;
        let total_fragments = (payload.len() + self.mtu - 1) / self.mtu;
        let mut out = Vec::with_capacity(total_fragments);

        for (i, chunk) in payload.chunks(self.mtu).enumerate() {
            let mut flags = PacketFlags::FRAGMENTED;
            if i == total_fragments - 1 {
                flags |= PacketFlags::LAST_FRAGMENT;
            }
            let mut header = PacketHeader::new(PacketType::Fragment, sequence + i as u32);
            header.flags = flags;
            header.fragment_id = fragment_id;
            header.fragment_offset = i as u16;
            header.fragment_total = total_fragments as u16;
            out.push(Packet::new(header, chunk.to_vec()));
        }
        out
    }

    /// Feed one packet into the reassembly buffer. Returns the complete payload once every
    /// fragment for its fragment id has arrived; unfragmented `DATA`/other packets pass through
    /// immediately. Out-of-range `fragment_offset` (`>= fragment_total`) is dropped as malformed.
    pub fn add_fragment(&mut self, packet: &Packet) -> Option<Vec<u8>> {
        if !packet.header.flags.contains(PacketFlags::FRAGMENTED) {
            return Some(packet.payload.clone());
        }

        let id = packet.header.fragment_id;
        let total = packet.header.fragment_total;
        let offset = packet.header.fragment_offset;
        if total == 0 || offset >= total {
            return None;
        }

        let buffer = self.reassembly.entry(id).or_insert_with(|| ReassemblyBuffer {
            fragments: BTreeMap::new(),
            total,
            started_at: Instant::now(),
        });
        buffer.fragments.insert(offset, packet.payload.clone());

        if buffer.fragments.len() as u16 == buffer.total {
            let buffer = self.reassembly.remove(&id).unwrap();
            let mut whole = Vec::new();
            for i in 0..buffer.total {
                match buffer.fragments.get(&i) {
                    Some(chunk) => whole.extend_from_slice(chunk),
                    None => return None,
                }
            }
            return Some(whole);
        }
        None
    }

    /// Drop reassembly buffers older than `timeout`.
    pub fn cleanup_stale(&mut self, timeout: std::time::Duration) {
        self.reassembly
            .retain(|_, buf| buf.started_at.elapsed() <= timeout);
    }

    /// Count of in-flight (incomplete) reassembly buffers.
    pub fn pending_count(&self) -> usize {
        self.reassembly.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_is_a_single_packet() {
        let fragmenter = Fragmenter::new(1024);
        let packets = fragmenter.fragment(b"short", 0);
        assert_eq!(packets.len(), 1);
        assert!(!packets[0].header.flags.contains(PacketFlags::FRAGMENTED));
    }

    #[test]
    fn large_payload_reassembles_in_order() {
        let mtu = 16;
        let fragmenter = Fragmenter::new(mtu);
        let payload: Vec<u8> = (0..200u16).map(|i| (i % 251) as u8).collect();
        let packets = fragmenter.fragment(&payload, 0);
        assert!(packets.len() > 1);

        let mut receiver = Fragmenter::new(mtu);
        let mut result = None;
        // feed out of order to exercise the offset-keyed buffer
        let mut shuffled = packets.clone();
        shuffled.reverse();
        for packet in &shuffled {
            if let Some(whole) = receiver.add_fragment(packet) {
                result = Some(whole);
            }
        }
        assert_eq!(result.unwrap(), payload);
    }

    #[test]
    fn two_identical_messages_get_distinct_fragment_ids() {
        let fragmenter = Fragmenter::new(4);
        let payload = vec![1u8; 100];
        let a = fragmenter.fragment(&payload, 0);
        let b = fragmenter.fragment(&payload, 0);
        assert_ne!(a[0].header.fragment_id, b[0].header.fragment_id);
    }

    #[test]
    fn stale_buffers_are_cleaned_up() {
        let mtu = 4;
        let mut receiver = Fragmenter::new(mtu);
        let fragmenter = Fragmenter::new(mtu);
        let packets = fragmenter.fragment(&vec![1u8; 40], 0);
        // deliver all but one fragment, leaving an incomplete buffer
        for packet in &packets[..packets.len() - 1] {
            receiver.add_fragment(packet);
        }
        assert_eq!(receiver.pending_count(), 1);
        receiver.cleanup_stale(std::time::Duration::from_secs(0));
        assert_eq!(receiver.pending_count(), 0);
    }
}
