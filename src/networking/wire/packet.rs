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

//! Fixed-size packet header and framing, independent of any one transport.

use thiserror::Error;

/// Protocol magic number.
pub const MAGIC: u16 = 0xBEEF;
/// Current wire protocol version.
pub const VERSION: u8 = 1;
/// Fixed header size in bytes, matching the original implementation's on-wire frame
/// (`transport/packet.py`'s `HEADER_SIZE`).
pub const HEADER_SIZE: usize = 28;
/// Hard cap on a decoded payload, independent of MTU; guards against hostile length fields.
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Packet framing/decode errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Fewer bytes than a full header.
    #[error("short buffer")]
    ShortBuffer,
    /// Magic number did not match.
    #[error("bad magic")]
    BadMagic,
    /// Unsupported protocol version.
    #[error("unsupported version")]
    BadVersion,
    /// Declared payload length ran past the buffer or the hard cap.
    #[error("payload length invalid")]
    BadPayloadLength,
    /// CRC32 did not match the computed checksum.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// Unrecognized packet type byte.
    #[error("unknown packet type")]
    UnknownType,
}

/// Packet types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Regular data payload.
    Data = 0x01,
    /// Acknowledgment.
    Ack = 0x02,
    /// Connection open.
    Syn = 0x03,
    /// Connection open, acknowledged.
    SynAck = 0x04,
    /// Connection close.
    Fin = 0x05,
    /// Connection close, acknowledged.
    FinAck = 0x06,
    /// Keepalive probe.
    Ping = 0x07,
    /// Keepalive probe response.
    Pong = 0x08,
    /// One fragment of a larger message.
    Fragment = 0x09,
    /// Request for retransmission of a sequence range.
    Retransmit = 0x0A,
    /// Flow-control window update.
    FlowControl = 0x0B,
    /// Error notification.
    Error = 0x0C,
}

impl PacketType {
    fn from_u8(b: u8) -> Option<Self> {
        use PacketType::*;
        Some(match b {
            0x01 => Data,
            0x02 => Ack,
            0x03 => Syn,
            0x04 => SynAck,
            0x05 => Fin,
            0x06 => FinAck,
            0x07 => Ping,
            0x08 => Pong,
            0x09 => Fragment,
            0x0A => Retransmit,
            0x0B => FlowControl,
            0x0C => Error,
            _ => return None,
        })
    }

    /// True for packet types that carry transport bookkeeping rather than application payload.
    pub fn is_control(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            Syn | SynAck | Fin | FinAck | Ack | Ping | Pong | FlowControl | Error
        )
    }
}

/// Packet behavior flags, packed into a single byte. Hand-rolled rather than pulling in the
/// `bitflags` crate for one 8-bit field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PacketFlags(pub u8);

impl PacketFlags {
    /// No flags set.
    pub const NONE: PacketFlags = PacketFlags(0x00);
    /// Payload is compressed.
    pub const COMPRESSED: PacketFlags = PacketFlags(0x01);
    /// Payload is encrypted.
    pub const ENCRYPTED: PacketFlags = PacketFlags(0x02);
    /// Requires acknowledgment.
    pub const RELIABLE: PacketFlags = PacketFlags(0x04);
    /// Must be delivered in order.
    pub const ORDERED: PacketFlags = PacketFlags(0x08);
    /// Part of a fragmented message.
    pub const FRAGMENTED: PacketFlags = PacketFlags(0x10);
    /// High priority.
    pub const PRIORITY: PacketFlags = PacketFlags(0x20);
    /// Last fragment in its sequence.
    pub const LAST_FRAGMENT: PacketFlags = PacketFlags(0x40);
    /// Connection close.
    pub const FIN: PacketFlags = PacketFlags(0x80);

    /// True if every bit set in `other` is also set in `self`.
    pub fn contains(&self, other: PacketFlags) -> bool {
        (self.0 & other.0) == other.0 && other.0 != 0
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;
    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: PacketFlags) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for PacketFlags {
    type Output = PacketFlags;
    fn bitand(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 & rhs.0)
    }
}

/// 28-byte fixed packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet type.
    pub packet_type: PacketType,
    /// Behavior flags.
    pub flags: PacketFlags,
    /// Sequence number.
    pub sequence: u32,
    /// Cumulative acknowledgment number.
    pub ack_number: u32,
    /// Advertised receive window, in bytes.
    pub window_size: u16,
    /// CRC32 checksum of header-with-zeroed-checksum + payload.
    pub checksum: u32,
    /// Payload length in bytes. Bounded to `u16` (every packet this crate emits is already
    /// MTU-bound by the fragmenter), which is what the 28-byte frame has room for once
    /// `sequence`/`ack_number`/`checksum` keep their full 4-byte width for the connection FSM and
    /// CRC32. The 10 MiB hard cap a declared length is checked against on decode is therefore
    /// enforced in practice by [`crate::networking::wire::message`]'s own message-size limit,
    /// where an oversize value is actually reachable.
    pub payload_length: u16,
    /// Fragment id (0 when not fragmented).
    pub fragment_id: u16,
    /// Index of this fragment within the original message.
    pub fragment_offset: u16,
    /// Total number of fragments in the original message.
    pub fragment_total: u16,
}

impl PacketHeader {
    /// Build a header with the given type and sequence, all other fields zeroed/defaulted.
    pub fn new(packet_type: PacketType, sequence: u32) -> Self {
        Self {
            packet_type,
            flags: PacketFlags::NONE,
            sequence,
            ack_number: 0,
            window_size: 65535,
            checksum: 0,
            payload_length: 0,
            fragment_id: 0,
            fragment_offset: 0,
            fragment_total: 0,
        }
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&MAGIC.to_be_bytes());
        out[2] = VERSION;
        out[3] = self.packet_type as u8;
        out[4] = self.flags.0;
        out[5] = 0; // reserved
        out[6..10].copy_from_slice(&self.sequence.to_be_bytes());
        out[10..14].copy_from_slice(&self.ack_number.to_be_bytes());
        out[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        out[16..20].copy_from_slice(&self.checksum.to_be_bytes());
        out[20..22].copy_from_slice(&self.payload_length.to_be_bytes());
        out[22..24].copy_from_slice(&self.fragment_id.to_be_bytes());
        out[24..26].copy_from_slice(&self.fragment_offset.to_be_bytes());
        out[26..28].copy_from_slice(&self.fragment_total.to_be_bytes());
        out
    }

    fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::ShortBuffer);
        }
        let magic = u16::from_be_bytes([data[0], data[1]]);
        if magic != MAGIC {
            return Err(PacketError::BadMagic);
        }
        let version = data[2];
        if version != VERSION {
            return Err(PacketError::BadVersion);
        }
        let packet_type = PacketType::from_u8(data[3]).ok_or(PacketError::UnknownType)?;
        let flags = PacketFlags(data[4]);
        let sequence = u32::from_be_bytes(data[6..10].try_into().unwrap());
        let ack_number = u32::from_be_bytes(data[10..14].try_into().unwrap());
        let window_size = u16::from_be_bytes(data[14..16].try_into().unwrap());
        let checksum = u32::from_be_bytes(data[16..20].try_into().unwrap());
        let payload_length = u16::from_be_bytes(data[20..22].try_into().unwrap());
        let fragment_id = u16::from_be_bytes(data[22..24].try_into().unwrap());
        let fragment_offset = u16::from_be_bytes(data[24..26].try_into().unwrap());
        let fragment_total = u16::from_be_bytes(data[26..28].try_into().unwrap());
        Ok(Self {
            packet_type,
            flags,
            sequence,
            ack_number,
            window_size,
            checksum,
            payload_length,
            fragment_id,
            fragment_offset,
            fragment_total,
        })
    }
}

/// A complete packet: header plus payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Header.
    pub header: PacketHeader,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet, stamping `header.payload_length` from the given payload. Callers keep
    /// payloads MTU-bound (the fragmenter never hands this a chunk anywhere near `u16::MAX`).
    pub fn new(mut header: PacketHeader, payload: Vec<u8>) -> Self {
        header.payload_length = payload.len() as u16;
        Self { header, payload }
    }

    fn compute_checksum(&self) -> u32 {
        let mut header = self.header;
        header.checksum = 0;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header.to_bytes());
        hasher.update(&self.payload);
        hasher.finalize()
    }

    /// Serialize header + payload, stamping a freshly computed checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header = self.header;
        header.checksum = self.compute_checksum();
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse and checksum-verify a packet from raw bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        let header = PacketHeader::from_bytes(data)?;
        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(PacketError::BadPayloadLength);
        }
        let end = HEADER_SIZE
            .checked_add(payload_len)
            .ok_or(PacketError::BadPayloadLength)?;
        if data.len() < end {
            return Err(PacketError::BadPayloadLength);
        }
        let payload = data[HEADER_SIZE..end].to_vec();
        let packet = Packet { header, payload };
        if packet.compute_checksum() != header.checksum {
            return Err(PacketError::ChecksumMismatch);
        }
        Ok(packet)
    }

    /// True if this packet type/flags require an acknowledgment.
    pub fn requires_ack(&self) -> bool {
        self.header.flags.contains(PacketFlags::RELIABLE)
    }

    /// Build a `SYN` packet.
    pub fn syn(sequence: u32) -> Self {
        let mut header = PacketHeader::new(PacketType::Syn, sequence);
        header.flags |= PacketFlags::RELIABLE;
        Packet::new(header, Vec::new())
    }

    /// Build a `SYN-ACK` packet.
    pub fn syn_ack(sequence: u32, ack_number: u32) -> Self {
        let mut header = PacketHeader::new(PacketType::SynAck, sequence);
        header.flags |= PacketFlags::RELIABLE;
        header.ack_number = ack_number;
        Packet::new(header, Vec::new())
    }

    /// Build an `ACK` packet.
    pub fn ack(ack_number: u32, window_size: u16) -> Self {
        let mut header = PacketHeader::new(PacketType::Ack, 0);
        header.ack_number = ack_number;
        header.window_size = window_size;
        Packet::new(header, Vec::new())
    }

    /// Build a `DATA` packet.
    pub fn data(sequence: u32, payload: Vec<u8>, ack_number: u32, reliable: bool) -> Self {
        let mut header = PacketHeader::new(PacketType::Data, sequence);
        header.ack_number = ack_number;
        if reliable {
            header.flags |= PacketFlags::RELIABLE;
        }
        Packet::new(header, payload)
    }

    /// Build a `FIN` packet.
    pub fn fin(sequence: u32) -> Self {
        let mut header = PacketHeader::new(PacketType::Fin, sequence);
        header.flags |= PacketFlags::RELIABLE | PacketFlags::FIN;
        Packet::new(header, Vec::new())
    }
}
