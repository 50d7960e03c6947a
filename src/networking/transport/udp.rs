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

//! UDP datagram transport: one [`Connection`] per remote address, demultiplexed off a single
//! bound socket, with fragmentation/reassembly and periodic retransmission.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use crate::networking::transport::connection::{Connection, ConnectionState};
use crate::networking::wire::fragment::Fragmenter;
use crate::networking::wire::packet::{Packet, PacketError};

/// UDP transport errors.
#[derive(Debug, Error)]
pub enum UdpError {
    /// Failed to bind the local socket.
    #[error("bind failed")]
    Bind,
    /// Send failed at the OS socket layer.
    #[error("send failed")]
    Send,
}

/// A datagram delivered to the application: the deframed, reassembled payload and who sent it.
#[derive(Debug)]
pub struct Inbound {
    /// Sending address.
    pub from: SocketAddr,
    /// Application payload, already reassembled from any fragments.
    pub payload: Vec<u8>,
}

struct Session {
    connection: Connection,
    fragmenter: Fragmenter,
    next_fragment_seq: u32,
}

impl Session {
    fn new(mtu: usize) -> Self {
        Self {
            connection: Connection::new(rand::random()),
            fragmenter: Fragmenter::new(mtu),
            next_fragment_seq: 0,
        }
    }
}

/// UDP datagram transport. Hand the handle to a long-running task via [`UdpTransport::run`]; use
/// the cloneable [`UdpTransport`] itself to send.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    sessions: Arc<Mutex<HashMap<SocketAddr, Session>>>,
    mtu: usize,
    peer_timeout: Duration,
}

impl Clone for UdpTransport {
    fn clone(&self) -> Self {
        Self {
            socket: self.socket.clone(),
            sessions: self.sessions.clone(),
            mtu: self.mtu,
            peer_timeout: self.peer_timeout,
        }
    }
}

impl UdpTransport {
    /// Bind a UDP socket at `addr` and build a transport over it.
    pub async fn bind(addr: &str, mtu: usize, peer_timeout: Duration) -> Result<Self, UdpError> {
        let socket = UdpSocket::bind(addr).await.map_err(|_| UdpError::Bind)?;
        Ok(Self {
            socket: Arc::new(socket),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            mtu,
            peer_timeout,
        })
    }

    /// The address actually bound (useful when `addr` used port `0`).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn send_packet(&self, to: SocketAddr, packet: &Packet) -> Result<(), UdpError> {
        self.socket
            .send_to(&packet.to_bytes(), to)
            .await
            .map(|_| ())
            .map_err(|_| UdpError::Send)
    }

    /// Send an application payload to `to`, fragmenting if needed and marking it reliable.
    pub async fn send_reliable(&self, to: SocketAddr, payload: Vec<u8>) -> Result<(), UdpError> {
        self.send(to, payload, true).await
    }

    /// Send an application payload to `to` without requesting acknowledgment.
    pub async fn send_unreliable(&self, to: SocketAddr, payload: Vec<u8>) -> Result<(), UdpError> {
        self.send(to, payload, false).await
    }

    /// Build and send the datagram(s) for `payload`. A payload that fits the MTU goes through
    /// the connection's full reliability pipeline (sequencing, ACK tracking, retransmission) as
    /// a single `DATA` packet. A larger payload is split by the fragmenter and sent directly,
    /// each fragment carrying its own sequence number from a per-session counter; fragment
    /// retransmission is left to the sender retrying at the application level, matching the
    /// distilled source's own scope.
    async fn send(&self, to: SocketAddr, payload: Vec<u8>, reliable: bool) -> Result<(), UdpError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(to).or_insert_with(|| Session::new(self.mtu));

        if payload.len() <= self.mtu {
            session.connection.send_payload(payload, reliable);
            for packet in session.connection.packets_to_send(usize::MAX) {
                self.send_packet(to, &packet).await?;
            }
            return Ok(());
        }

        let base = session.next_fragment_seq;
        session.next_fragment_seq = session.next_fragment_seq.wrapping_add(
            ((payload.len() + self.mtu - 1) / self.mtu) as u32,
        );
        let fragments = session.fragmenter.fragment(&payload, base);
        for mut fragment in fragments {
            if reliable {
                fragment.header.flags |= crate::networking::wire::packet::PacketFlags::RELIABLE;
            }
            self.send_packet(to, &fragment).await?;
        }
        Ok(())
    }

    /// Open a reliable session toward `to`, sending a `SYN` and returning once a response has
    /// been observed via [`Self::run`]'s dispatch (callers typically race this against a timeout).
    pub async fn connect(&self, to: SocketAddr) -> Result<(), UdpError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(to).or_insert_with(|| Session::new(self.mtu));
        let syn = session.connection.initiate();
        self.send_packet(to, &syn).await
    }

    /// Whether an established connection exists for `addr`.
    pub async fn is_connected(&self, addr: SocketAddr) -> bool {
        self.sessions
            .lock()
            .await
            .get(&addr)
            .map(|s| s.connection.state() == ConnectionState::Established)
            .unwrap_or(false)
    }

    /// Run the receive loop and periodic maintenance tick until the socket errors out. Deframed,
    /// reassembled application payloads are pushed to `inbound`.
    pub async fn run(self, inbound: mpsc::Sender<Inbound>) {
        let mut buf = vec![0u8; 64 * 1024];
        let mut maintenance = tokio::time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from, &inbound).await,
                        Err(e) => {
                            warn!(err = %e, "udp recv failed; stopping transport loop");
                            return;
                        }
                    }
                }
                _ = maintenance.tick() => {
                    self.run_maintenance().await;
                }
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr, inbound: &mpsc::Sender<Inbound>) {
        let packet = match Packet::from_bytes(data) {
            Ok(p) => p,
            Err(PacketError::ChecksumMismatch) => {
                debug!(%from, "dropped packet with bad checksum");
                return;
            }
            Err(e) => {
                trace!(%from, err = ?e, "dropped malformed packet");
                return;
            }
        };

        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(from).or_insert_with(|| Session::new(self.mtu));

        // Fragments live in their own sequence space (assigned by the sender's fragmenter, not
        // the connection's sequencing), so they bypass in-order delivery and go straight to
        // reassembly.
        if matches!(packet.header.packet_type, crate::networking::wire::packet::PacketType::Fragment) {
            if let Some(whole) = session.fragmenter.add_fragment(&packet) {
                let _ = inbound.send(Inbound { from, payload: whole }).await;
            }
            return;
        }

        let outcome = session.connection.handle_packet(&packet);
        if let Some(response) = &outcome.response {
            if self.send_packet(from, response).await.is_err() {
                warn!(%from, "failed to send response packet");
            }
        }
        for payload in outcome.deliverable {
            let _ = inbound.send(Inbound { from, payload }).await;
        }
    }

    async fn run_maintenance(&self) {
        let mut sessions = self.sessions.lock().await;
        let mut dead = Vec::new();
        for (addr, session) in sessions.iter_mut() {
            for packet in session.connection.packets_to_retransmit() {
                let _ = self.socket.send_to(&packet.to_bytes(), *addr).await;
            }
            for packet in session.connection.packets_to_send(16) {
                let _ = self.socket.send_to(&packet.to_bytes(), *addr).await;
            }
            session.fragmenter.cleanup_stale(Duration::from_secs(30));
            if session.connection.is_timed_out(self.peer_timeout) {
                dead.push(*addr);
            }
        }
        for addr in dead {
            sessions.remove(&addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn two_transports_exchange_an_unreliable_datagram() {
        let a = UdpTransport::bind("127.0.0.1:0", 1400, Duration::from_secs(60))
            .await
            .unwrap();
        let b = UdpTransport::bind("127.0.0.1:0", 1400, Duration::from_secs(60))
            .await
            .unwrap();
        let b_addr = b.local_addr().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(b.run(tx));

        a.send_unreliable(b_addr, b"hello".to_vec()).await.unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.payload, b"hello");
    }
}
