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

//! TCP-framed transport: one persistent, length-prefixed stream per peer, with a signed
//! handshake establishing the peer's node id before any other message is accepted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{tcp::OwnedReadHalf, tcp::OwnedWriteHalf, TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::core::identity::Identity;
use crate::core::types::{NodeId, Value};
use crate::networking::wire::message::{Message, MessageFactory, MessageType};

const LENGTH_PREFIX_SIZE: usize = 4;
const MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

/// TCP transport errors.
#[derive(Debug, Error)]
pub enum TcpError {
    /// Underlying socket I/O failed.
    #[error("io error")]
    Io,
    /// The peer sent a frame declaring a length above [`MAX_FRAME_SIZE`].
    #[error("frame too large")]
    FrameTooLarge,
    /// The peer closed the connection before completing the handshake, or with an unexpected
    /// first message.
    #[error("handshake failed")]
    HandshakeFailed,
    /// A message failed to encode or decode.
    #[error("message codec error")]
    Codec,
    /// No open connection to the requested peer.
    #[error("not connected")]
    NotConnected,
}

impl From<std::io::Error> for TcpError {
    fn from(_: std::io::Error) -> Self {
        TcpError::Io
    }
}

/// A message delivered over an established connection, together with the sender's verified node
/// id and address.
#[derive(Debug)]
pub struct Inbound {
    /// The peer that sent it (verified during handshake).
    pub from_node: NodeId,
    /// The peer's socket address.
    pub from_addr: SocketAddr,
    /// The message itself.
    pub message: Message,
}

struct Outbound {
    write_half: OwnedWriteHalf,
    addr: SocketAddr,
}

async fn write_frame(write_half: &mut OwnedWriteHalf, bytes: &[u8]) -> Result<(), TcpError> {
    let len = bytes.len() as u32;
    write_half.write_all(&len.to_be_bytes()).await?;
    write_half.write_all(bytes).await?;
    write_half.flush().await?;
    Ok(())
}

async fn read_frame(read_half: &mut OwnedReadHalf) -> Result<Option<Vec<u8>>, TcpError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match read_half.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(_) => return Err(TcpError::Io),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(TcpError::FrameTooLarge);
    }
    let mut buf = vec![0u8; len as usize];
    read_half
        .read_exact(&mut buf)
        .await
        .map_err(|_| TcpError::Io)?;
    Ok(Some(buf))
}

async fn send_message(write_half: &mut OwnedWriteHalf, message: &Message) -> Result<(), TcpError> {
    let bytes = message.to_bytes().map_err(|_| TcpError::Codec)?;
    write_frame(write_half, &bytes).await
}

async fn recv_message(read_half: &mut OwnedReadHalf) -> Result<Option<Message>, TcpError> {
    match read_frame(read_half).await? {
        Some(bytes) => Message::from_bytes(&bytes).map(Some).map_err(|_| TcpError::Codec),
        None => Ok(None),
    }
}

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// TCP-framed transport for a single local identity. Accepts inbound streams, dials outbound
/// ones, performs the signed handshake on both sides, and demultiplexes subsequent frames by the
/// verified sender node id.
pub struct TcpTransport {
    identity: Arc<Identity>,
    local_addr_str: String,
    connections: Arc<Mutex<HashMap<NodeId, Outbound>>>,
    handshake_timeout: Duration,
}

impl TcpTransport {
    /// Build a transport for `identity`, advertising `local_addr_str` (e.g. `"1.2.3.4:8888"`) in
    /// its handshakes.
    pub fn new(identity: Arc<Identity>, local_addr_str: String, handshake_timeout: Duration) -> Self {
        Self {
            identity,
            local_addr_str,
            connections: Arc::new(Mutex::new(HashMap::new())),
            handshake_timeout,
        }
    }

    /// Bind a listener and run the accept loop until it errors, dispatching verified inbound
    /// frames to `inbound`. Runs forever; spawn it as a background task.
    pub async fn listen(&self, bind_addr: &str, inbound: mpsc::Sender<Inbound>) -> Result<(), TcpError> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(%bind_addr, "tcp transport listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            let this = self.clone_handles();
            let inbound = inbound.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_incoming(stream, addr, inbound).await {
                    debug!(%addr, err = ?e, "inbound connection ended");
                }
            });
        }
    }

    fn clone_handles(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            local_addr_str: self.local_addr_str.clone(),
            connections: self.connections.clone(),
            handshake_timeout: self.handshake_timeout,
        }
    }

    async fn handle_incoming(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        inbound: mpsc::Sender<Inbound>,
    ) -> Result<(), TcpError> {
        let (mut read_half, mut write_half) = stream.into_split();

        let handshake = tokio::time::timeout(self.handshake_timeout, recv_message(&mut read_half))
            .await
            .map_err(|_| TcpError::HandshakeFailed)??
            .ok_or(TcpError::HandshakeFailed)?;

        if handshake.msg_type != MessageType::Handshake {
            return Err(TcpError::HandshakeFailed);
        }
        let public_key = handshake
            .payload
            .get("public_key")
            .and_then(Value::as_bytes)
            .ok_or(TcpError::HandshakeFailed)?;
        if !handshake.verify(public_key) {
            return Err(TcpError::HandshakeFailed);
        }
        let peer_node_id = handshake.sender_id;

        let mut ack = MessageFactory::handshake_ack(
            self.identity.node_id(),
            now_unix(),
            &self.identity.public_key_bytes(),
            Value::List(Vec::new()),
        );
        ack.sign(&self.identity).map_err(|_| TcpError::Codec)?;
        send_message(&mut write_half, &ack).await?;

        self.connections.lock().await.insert(
            peer_node_id,
            Outbound {
                write_half,
                addr,
            },
        );
        info!(%addr, peer = %peer_node_id.to_hex(), "tcp handshake complete (inbound)");

        let result = self.receive_loop(&mut read_half, peer_node_id, addr, &inbound).await;
        self.connections.lock().await.remove(&peer_node_id);
        result
    }

    /// Dial `addr`, perform the handshake as initiator, and keep the connection registered for
    /// [`Self::send_to_peer`]. Spawns a background receive task that pushes frames to `inbound`.
    pub async fn connect(
        &self,
        addr: &str,
        inbound: mpsc::Sender<Inbound>,
    ) -> Result<NodeId, TcpError> {
        let stream = tokio::time::timeout(self.handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TcpError::HandshakeFailed)??;
        let socket_addr: SocketAddr = stream.peer_addr()?;
        let (mut read_half, mut write_half) = stream.into_split();

        let mut handshake = MessageFactory::handshake(
            self.identity.node_id(),
            now_unix(),
            &self.identity.public_key_bytes(),
            &self.local_addr_str,
        );
        handshake.sign(&self.identity).map_err(|_| TcpError::Codec)?;
        send_message(&mut write_half, &handshake).await?;

        let ack = tokio::time::timeout(self.handshake_timeout, recv_message(&mut read_half))
            .await
            .map_err(|_| TcpError::HandshakeFailed)??
            .ok_or(TcpError::HandshakeFailed)?;
        if ack.msg_type != MessageType::HandshakeAck {
            return Err(TcpError::HandshakeFailed);
        }
        let public_key = ack
            .payload
            .get("public_key")
            .and_then(Value::as_bytes)
            .ok_or(TcpError::HandshakeFailed)?;
        if !ack.verify(public_key) {
            return Err(TcpError::HandshakeFailed);
        }
        let peer_node_id = ack.sender_id;

        self.connections.lock().await.insert(
            peer_node_id,
            Outbound {
                write_half,
                addr: socket_addr,
            },
        );
        info!(%addr, peer = %peer_node_id.to_hex(), "tcp handshake complete (outbound)");

        let this = self.clone_handles();
        tokio::spawn(async move {
            let _ = this
                .receive_loop(&mut read_half, peer_node_id, socket_addr, &inbound)
                .await;
            this.connections.lock().await.remove(&peer_node_id);
        });

        Ok(peer_node_id)
    }

    async fn receive_loop(
        &self,
        read_half: &mut OwnedReadHalf,
        peer_node_id: NodeId,
        addr: SocketAddr,
        inbound: &mpsc::Sender<Inbound>,
    ) -> Result<(), TcpError> {
        loop {
            match recv_message(read_half).await {
                Ok(Some(message)) => {
                    if inbound
                        .send(Inbound {
                            from_node: peer_node_id,
                            from_addr: addr,
                            message,
                        })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(%addr, err = ?e, "tcp receive loop error");
                    return Err(e);
                }
            }
        }
    }

    /// Sign and send `message` to an already-connected peer.
    pub async fn send_to_peer(&self, node_id: NodeId, mut message: Message) -> Result<(), TcpError> {
        message.sign(&self.identity).map_err(|_| TcpError::Codec)?;
        let mut connections = self.connections.lock().await;
        let conn = connections.get_mut(&node_id).ok_or(TcpError::NotConnected)?;
        if let Err(e) = send_message(&mut conn.write_half, &message).await {
            connections.remove(&node_id);
            return Err(e);
        }
        Ok(())
    }

    /// Sign `message` once and send it to every connected peer in `targets` (or all connected
    /// peers if `targets` is `None`).
    pub async fn broadcast(&self, message: Message, targets: Option<&[NodeId]>) {
        let mut message = message;
        if message.sign(&self.identity).is_err() {
            return;
        }
        let mut connections = self.connections.lock().await;
        let ids: Vec<NodeId> = match targets {
            Some(t) => t.to_vec(),
            None => connections.keys().copied().collect(),
        };
        let mut dead = Vec::new();
        for id in ids {
            if let Some(conn) = connections.get_mut(&id) {
                if send_message(&mut conn.write_half, &message).await.is_err() {
                    dead.push(id);
                }
            }
        }
        for id in dead {
            connections.remove(&id);
        }
    }

    /// Number of currently open peer connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Whether a connection to `node_id` is currently open.
    pub async fn is_connected_to(&self, node_id: NodeId) -> bool {
        self.connections.lock().await.contains_key(&node_id)
    }

    /// Close and drop the connection to `node_id`, if any.
    pub async fn disconnect(&self, node_id: NodeId) {
        if let Some(mut conn) = self.connections.lock().await.remove(&node_id) {
            let _ = conn.write_half.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn identity() -> Arc<Identity> {
        let dir = tempdir().unwrap();
        Arc::new(Identity::load_or_generate(&dir.path().join("id.key")).unwrap())
    }

    #[tokio::test]
    async fn handshake_exchanges_node_ids_and_messages_flow_both_ways() {
        let server_identity = identity();
        let server = Arc::new(TcpTransport::new(
            server_identity.clone(),
            "127.0.0.1:0".to_string(),
            Duration::from_secs(5),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bind_addr = listener.local_addr().unwrap();
        drop(listener);

        let (server_tx, mut server_rx) = mpsc::channel(8);
        let server_task = server.clone();
        tokio::spawn(async move {
            let _ = server_task
                .listen(&bind_addr.to_string(), server_tx)
                .await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client_identity = identity();
        let client = TcpTransport::new(
            client_identity.clone(),
            "127.0.0.1:0".to_string(),
            Duration::from_secs(5),
        );
        let (client_tx, _client_rx) = mpsc::channel(8);
        let server_node_id = client
            .connect(&bind_addr.to_string(), client_tx)
            .await
            .unwrap();
        assert_eq!(server_node_id, server_identity.node_id());

        let hello = MessageFactory::heartbeat(client_identity.node_id(), 1000.0);
        client.send_to_peer(server_node_id, hello).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), server_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.from_node, client_identity.node_id());
        assert_eq!(got.message.msg_type, MessageType::Heartbeat);
    }
}
