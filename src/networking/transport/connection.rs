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

//! Per-peer reliability state machine: connection setup/teardown, in-order delivery with
//! out-of-order buffering, and retransmission timing.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::networking::transport::flow::{AdaptiveFlowController, CongestionStats, RttEstimator};
use crate::networking::wire::packet::{Packet, PacketFlags, PacketHeader, PacketType};

/// Connection lifecycle states, mirroring a TCP-like handshake/teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection established.
    Closed,
    /// Active open sent, awaiting `SYN-ACK`.
    SynSent,
    /// Passive open received `SYN`, `SYN-ACK` sent.
    SynReceived,
    /// Handshake complete; data may flow both ways.
    Established,
    /// Local `FIN` sent, awaiting ACK.
    FinWait1,
    /// Local `FIN` acknowledged, awaiting peer's `FIN`.
    FinWait2,
    /// Simultaneous close in progress.
    Closing,
    /// Waiting out the maximum segment lifetime after a clean close.
    TimeWait,
    /// Peer closed first; local close still pending.
    CloseWait,
    /// Local close sent after `CloseWait`, awaiting final ACK.
    LastAck,
}

struct SentPacket {
    packet: Packet,
    sent_at: Instant,
}

/// Per-connection statistics, for logging/metrics.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectionStats {
    /// Packets handed to the transport.
    pub packets_sent: u64,
    /// Packets received and processed.
    pub packets_received: u64,
    /// Packets retransmitted due to RTO expiry.
    pub packets_retransmitted: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
}

/// Maximum segment size assumed for congestion-window arithmetic.
const MSS: u32 = 1400;

/// Outcome of feeding one packet through [`Connection::handle_packet`].
#[derive(Debug, Default)]
pub struct PacketOutcome {
    /// A packet to send back immediately (an ACK, SYN-ACK, PONG, ...), if any.
    pub response: Option<Packet>,
    /// Application payload(s) now deliverable in sender-sequence order: the packet just
    /// received, if in-order, followed by any previously buffered packets it made contiguous.
    pub deliverable: Vec<Vec<u8>>,
}

/// A single peer connection's reliability state.
pub struct Connection {
    state: ConnectionState,
    send_sequence: u32,
    recv_sequence: u32,
    send_window: u16,
    recv_window: u16,
    send_buffer: VecDeque<Packet>,
    recv_buffer: BTreeMap<u32, Packet>,
    unacked: BTreeMap<u32, SentPacket>,
    rtt: RttEstimator,
    flow: AdaptiveFlowController,
    last_activity: Instant,
    stats: ConnectionStats,
}

impl Connection {
    /// Build a fresh, closed connection with the given initial send sequence number.
    pub fn new(initial_sequence: u32) -> Self {
        Self {
            state: ConnectionState::Closed,
            send_sequence: initial_sequence,
            recv_sequence: 0,
            send_window: 65535,
            recv_window: 65535,
            send_buffer: VecDeque::new(),
            recv_buffer: BTreeMap::new(),
            unacked: BTreeMap::new(),
            rtt: RttEstimator::default(),
            flow: AdaptiveFlowController::new(MSS, 65535),
            last_activity: Instant::now(),
            stats: ConnectionStats::default(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current stats snapshot.
    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Current congestion-control stats, for logging/metrics.
    pub fn congestion_stats(&self) -> CongestionStats {
        self.flow.congestion_stats()
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rtt.rto()
    }

    fn next_sequence(&mut self) -> u32 {
        let seq = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        seq
    }

    fn set_state(&mut self, new: ConnectionState) {
        self.state = new;
    }

    /// Active-open: move to `SynSent` and return the `SYN` to send.
    pub fn initiate(&mut self) -> Packet {
        self.set_state(ConnectionState::SynSent);
        Packet::syn(self.next_sequence())
    }

    /// Begin a graceful close from `Established` or `CloseWait`.
    pub fn close(&mut self) -> Packet {
        match self.state {
            ConnectionState::Established => self.set_state(ConnectionState::FinWait1),
            ConnectionState::CloseWait => self.set_state(ConnectionState::LastAck),
            _ => {}
        }
        Packet::fin(self.next_sequence())
    }

    /// Build a reliable data packet and enqueue it for sending.
    pub fn send_data(&mut self, payload: Vec<u8>) -> Packet {
        self.send_payload(payload, true)
    }

    /// Build a data packet and enqueue it for sending; unreliable packets are never retransmitted
    /// or tracked for ACK, but still consume a sequence number.
    pub fn send_payload(&mut self, payload: Vec<u8>, reliable: bool) -> Packet {
        let seq = self.next_sequence();
        let packet = Packet::data(seq, payload, self.recv_sequence, reliable);
        self.enqueue(packet.clone());
        packet
    }

    fn enqueue(&mut self, mut packet: Packet) {
        if packet.requires_ack() {
            self.unacked.insert(
                packet.header.sequence,
                SentPacket {
                    packet: packet.clone(),
                    sent_at: Instant::now(),
                },
            );
        }
        packet.header.ack_number = self.recv_sequence;
        self.send_buffer.push_back(packet);
    }

    /// Drain up to `max` packets ready to send, respecting both the advertised send window and
    /// the congestion window. Only packets requiring an ACK consume congestion-window budget;
    /// unreliable packets are never tracked for retransmission so they would otherwise never
    /// free up the budget they occupied.
    pub fn packets_to_send(&mut self, max: usize) -> Vec<Packet> {
        let mut out = Vec::new();
        while out.len() < max {
            if self.unacked.len() as u16 >= self.send_window {
                break;
            }
            let (size, reliable) = match self.send_buffer.front() {
                Some(packet) => (packet.payload.len() as u32, packet.requires_ack()),
                None => break,
            };
            if reliable && !self.flow.can_send(size) {
                break;
            }
            let packet = self.send_buffer.pop_front().expect("checked above");
            if reliable {
                self.flow.on_send(size);
            }
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += size as u64;
            out.push(packet);
        }
        out
    }

    /// Packets whose RTO has expired and must be retransmitted. Any expiry is treated as a
    /// congestion signal: the congestion window collapses and slow start restarts.
    pub fn packets_to_retransmit(&mut self) -> Vec<Packet> {
        let rto = self.rto();
        let now = Instant::now();
        let mut due = Vec::new();
        for sent in self.unacked.values_mut() {
            if now.duration_since(sent.sent_at) > rto {
                sent.sent_at = now;
                due.push(sent.packet.clone());
                self.stats.packets_retransmitted += 1;
            }
        }
        if !due.is_empty() {
            self.flow.on_timeout();
        }
        due
    }

    /// Feed a received packet through the state machine.
    pub fn handle_packet(&mut self, packet: &Packet) -> PacketOutcome {
        self.last_activity = Instant::now();
        self.stats.packets_received += 1;
        self.stats.bytes_received += packet.payload.len() as u64;

        let (response, deliverable) = match packet.header.packet_type {
            PacketType::Syn => (self.handle_syn(packet), Vec::new()),
            PacketType::SynAck => (self.handle_syn_ack(packet), Vec::new()),
            PacketType::Ack => (self.handle_ack(packet), Vec::new()),
            PacketType::Data | PacketType::Fragment => self.handle_data(packet),
            PacketType::Fin => (self.handle_fin(packet), Vec::new()),
            PacketType::FinAck => (self.handle_fin_ack(), Vec::new()),
            PacketType::Ping => (Some(self.handle_ping(packet)), Vec::new()),
            PacketType::Pong => {
                self.handle_pong(packet);
                (None, Vec::new())
            }
            _ => (None, Vec::new()),
        };
        PacketOutcome { response, deliverable }
    }

    fn handle_syn(&mut self, packet: &Packet) -> Option<Packet> {
        if self.state == ConnectionState::Closed {
            self.recv_sequence = packet.header.sequence.wrapping_add(1);
            self.set_state(ConnectionState::SynReceived);
            let seq = self.next_sequence();
            return Some(Packet::syn_ack(seq, self.recv_sequence));
        }
        None
    }

    fn handle_syn_ack(&mut self, packet: &Packet) -> Option<Packet> {
        if self.state == ConnectionState::SynSent {
            self.recv_sequence = packet.header.sequence.wrapping_add(1);
            self.set_state(ConnectionState::Established);
            return Some(Packet::ack(self.recv_sequence, self.recv_window));
        }
        None
    }

    fn handle_ack(&mut self, packet: &Packet) -> Option<Packet> {
        let ack_num = packet.header.ack_number;
        let acked: Vec<u32> = self
            .unacked
            .range(..ack_num)
            .map(|(seq, _)| *seq)
            .collect();

        if acked.is_empty() {
            self.flow.on_duplicate_ack(ack_num);
        } else {
            let mut acked_bytes = 0u32;
            let mut last_rtt = None;
            for seq in acked {
                if let Some(sent) = self.unacked.remove(&seq) {
                    let rtt = sent.sent_at.elapsed();
                    self.rtt.sample(rtt);
                    last_rtt = Some(rtt);
                    acked_bytes += sent.packet.payload.len() as u32;
                }
            }
            self.flow
                .on_ack(acked_bytes, packet.header.window_size as u32, last_rtt);
        }
        self.send_window = packet.header.window_size;

        match self.state {
            ConnectionState::SynReceived => self.set_state(ConnectionState::Established),
            ConnectionState::FinWait1 => self.set_state(ConnectionState::FinWait2),
            ConnectionState::Closing => self.set_state(ConnectionState::TimeWait),
            ConnectionState::LastAck => self.set_state(ConnectionState::Closed),
            _ => {}
        }
        None
    }

    /// Deliver in-order payloads (including any now-contiguous buffered ones). Returns the
    /// optional ACK to send and the payload(s) now deliverable, in sender-sequence order.
    fn handle_data(&mut self, packet: &Packet) -> (Option<Packet>, Vec<Vec<u8>>) {
        let seq = packet.header.sequence;
        let mut deliverable = Vec::new();
        if seq == self.recv_sequence {
            deliverable.push(packet.payload.clone());
            self.recv_sequence = self.recv_sequence.wrapping_add(1);
            while let Some(buffered) = self.recv_buffer.remove(&self.recv_sequence) {
                deliverable.push(buffered.payload);
                self.recv_sequence = self.recv_sequence.wrapping_add(1);
            }
        } else if seq > self.recv_sequence {
            self.recv_buffer.insert(seq, packet.clone());
        }
        // seq < recv_sequence: already delivered, silently discarded.

        let response = if packet.requires_ack() {
            Some(Packet::ack(self.recv_sequence, self.recv_window))
        } else {
            None
        };
        (response, deliverable)
    }

    fn handle_fin(&mut self, packet: &Packet) -> Option<Packet> {
        self.recv_sequence = packet.header.sequence.wrapping_add(1);
        match self.state {
            ConnectionState::Established => {
                self.set_state(ConnectionState::CloseWait);
                Some(Packet::ack(self.recv_sequence, self.recv_window))
            }
            ConnectionState::FinWait1 => {
                self.set_state(ConnectionState::Closing);
                Some(Packet::ack(self.recv_sequence, self.recv_window))
            }
            ConnectionState::FinWait2 => {
                self.set_state(ConnectionState::TimeWait);
                Some(Packet::ack(self.recv_sequence, self.recv_window))
            }
            _ => None,
        }
    }

    fn handle_fin_ack(&mut self) -> Option<Packet> {
        if self.state == ConnectionState::FinWait1 {
            self.set_state(ConnectionState::TimeWait);
        }
        None
    }

    fn handle_ping(&mut self, packet: &Packet) -> Packet {
        let seq = self.next_sequence();
        let mut header = PacketHeader::new(PacketType::Pong, seq);
        header.flags = PacketFlags::NONE;
        Packet::new(header, packet.payload.clone())
    }

    fn handle_pong(&mut self, packet: &Packet) {
        if packet.payload.len() >= 8 {
            let bits = u64::from_be_bytes(packet.payload[..8].try_into().unwrap());
            let sent_at = f64::from_bits(bits);
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();
            if now > sent_at {
                self.rtt.sample(Duration::from_secs_f64(now - sent_at));
            }
        }
    }

    /// Whether the connection has seen no activity for longer than `timeout`.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    /// True when in `Established`.
    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_way_handshake_reaches_established_both_sides() {
        let mut client = Connection::new(1000);
        let mut server = Connection::new(2000);

        let syn = client.initiate();
        assert_eq!(client.state(), ConnectionState::SynSent);

        let syn_ack = server.handle_packet(&syn).response.unwrap();
        assert_eq!(server.state(), ConnectionState::SynReceived);

        let ack = client.handle_packet(&syn_ack).response.unwrap();
        assert_eq!(client.state(), ConnectionState::Established);

        assert!(server.handle_packet(&ack).response.is_none());
        assert_eq!(server.state(), ConnectionState::Established);
    }

    #[test]
    fn out_of_order_data_buffers_until_gap_fills() {
        let mut conn = Connection::new(0);
        conn.set_state(ConnectionState::Established);
        conn.recv_sequence = 5;

        let p6 = Packet::data(6, b"b".to_vec(), 0, false);
        let out6 = conn.handle_packet(&p6);
        assert_eq!(conn.recv_sequence, 5);
        assert!(out6.deliverable.is_empty());

        let p5 = Packet::data(5, b"a".to_vec(), 0, false);
        let out5 = conn.handle_packet(&p5);
        assert_eq!(conn.recv_sequence, 7);
        assert_eq!(out5.deliverable, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn graceful_close_sequence() {
        let mut a = Connection::new(0);
        a.set_state(ConnectionState::Established);
        let fin = a.close();
        assert_eq!(a.state(), ConnectionState::FinWait1);

        let mut b = Connection::new(0);
        b.set_state(ConnectionState::Established);
        let ack = b.handle_packet(&fin).response.unwrap();
        assert_eq!(b.state(), ConnectionState::CloseWait);

        a.handle_packet(&ack);
        assert_eq!(a.state(), ConnectionState::FinWait2);
    }

    #[test]
    fn retransmit_only_after_rto_elapses() {
        let mut conn = Connection::new(0);
        conn.set_state(ConnectionState::Established);
        conn.send_data(b"x".to_vec());
        conn.packets_to_send(10);
        assert!(conn.packets_to_retransmit().is_empty());
    }

    #[test]
    fn acks_grow_the_congestion_window() {
        let mut conn = Connection::new(0);
        conn.set_state(ConnectionState::Established);
        let initial_cwnd = conn.congestion_stats().cwnd;

        let packet = conn.send_data(b"x".to_vec());
        conn.packets_to_send(10);
        let ack = Packet::ack(packet.header.sequence.wrapping_add(1), 65535);
        conn.handle_ack(&ack);

        assert!(conn.congestion_stats().cwnd > initial_cwnd);
    }

    #[test]
    fn retransmit_timeout_collapses_congestion_window() {
        let mut conn = Connection::new(0);
        conn.set_state(ConnectionState::Established);
        for _ in 0..10 {
            let packet = conn.send_data(b"x".to_vec());
            conn.packets_to_send(10);
            let ack = Packet::ack(packet.header.sequence.wrapping_add(1), 65535);
            conn.handle_ack(&ack);
        }
        assert!(!conn.congestion_stats().in_slow_start);

        conn.send_data(b"y".to_vec());
        conn.packets_to_send(10);
        for sent in conn.unacked.values_mut() {
            sent.sent_at = Instant::now() - Duration::from_secs(120);
        }
        let due = conn.packets_to_retransmit();
        assert!(!due.is_empty());
        assert!(conn.congestion_stats().in_slow_start);
    }
}
