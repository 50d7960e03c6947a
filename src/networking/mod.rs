#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! The peer-to-peer networking substrate: wire codec, reliable/unreliable transports, trust
//! scoring, peer management, gossip propagation, and the distributed hash table built on top of
//! them.

pub mod wire;

pub mod transport;

pub mod trust;

pub mod peer_store;

pub mod gossip;

pub mod dht;

pub mod nat;
