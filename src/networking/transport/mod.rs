//! Transport: per-connection reliability state, flow/congestion control, and the UDP and
//! TCP-framed wire-level transports built on top of them.

pub mod connection;
pub mod flow;
pub mod tcp;
pub mod udp;

pub use connection::{Connection, ConnectionState, ConnectionStats, PacketOutcome};
pub use flow::{AdaptiveFlowController, CongestionStats};
