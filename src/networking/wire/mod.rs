//! Wire codec: packet framing, the message envelope, and fragmentation/reassembly.

pub mod fragment;
pub mod message;
pub mod packet;

pub use fragment::Fragmenter;
pub use message::{Message, MessageType};
pub use packet::{Packet, PacketFlags, PacketHeader, PacketType};
