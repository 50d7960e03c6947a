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

//! The NAT traversal contract the orchestrator dials through: public-endpoint discovery and
//! ICE-style candidate exchange. No STUN client or hole-punching wire format lives in this crate;
//! [`NatCollaborator`] is a trait boundary a deployment plugs a real implementation into, and
//! [`NullNat`] is the no-op default for nodes that don't need traversal.

use async_trait::async_trait;

/// How a peer classified its own NAT behavior, as reported by whichever [`NatCollaborator`] ran
/// discovery. Coarser than full STUN NAT-type taxonomy by design: the orchestrator only needs to
/// know whether a direct dial is likely to work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatType {
    /// Discovery has not run, or the collaborator does not classify behavior.
    Unknown,
    /// No NAT: the bound local address is already publicly reachable.
    OpenInternet,
    /// A cone NAT: any peer can reach us at the discovered public endpoint.
    Cone,
    /// A symmetric NAT: the public mapping differs per destination, so hole punching is
    /// required and not guaranteed to succeed.
    Symmetric,
    /// Discovery failed outright.
    Blocked,
}

/// This node's externally-visible endpoint and NAT classification.
#[derive(Clone, Debug, PartialEq)]
pub struct PublicEndpoint {
    /// Publicly reachable IP address, if discovery succeeded.
    pub public_ip: Option<String>,
    /// Publicly reachable port, if discovery succeeded.
    pub public_port: Option<u16>,
    /// Coarse NAT behavior classification.
    pub nat_type: NatType,
}

/// A connectivity option offered to or received from a peer, in the vocabulary ICE uses for
/// WebRTC candidate exchange: a kind, an address, and a priority the far side uses to pick which
/// candidate to dial first.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// `"host"` (directly bound local address), `"srflx"` (server-reflexive, i.e. the publicly
    /// mapped address a STUN-like lookup discovered), or `"relay"` (routed through a third party).
    pub kind: String,
    /// IP address.
    pub ip: String,
    /// Port.
    pub port: u16,
    /// Higher priority candidates should be attempted first.
    pub priority: u32,
}

/// The contract a NAT traversal implementation fulfills for the node orchestrator: report this
/// node's public endpoint on demand, and gather the candidates a peer should try when dialing in.
/// A successful exchange hands the orchestrator an ordinary `host:port` to dial through the
/// existing transport; traversal itself is opaque to the rest of the crate.
#[async_trait]
pub trait NatCollaborator: Send + Sync {
    /// Discover (or return a cached) public endpoint and NAT classification.
    async fn discover(&self) -> PublicEndpoint;

    /// Connectivity candidates this node offers to a peer trying to reach it.
    async fn local_candidates(&self) -> Vec<Candidate>;
}

/// No-op [`NatCollaborator`]: reports no public endpoint beyond the bound local address and
/// offers a single host candidate built from it. Suitable for nodes reachable directly (a public
/// server, or peers on the same LAN) that don't need traversal.
pub struct NullNat {
    local_ip: String,
    local_port: u16,
}

impl NullNat {
    /// Build a collaborator that always reports `local_ip:local_port` as the only candidate.
    pub fn new(local_ip: impl Into<String>, local_port: u16) -> Self {
        Self {
            local_ip: local_ip.into(),
            local_port,
        }
    }
}

#[async_trait]
impl NatCollaborator for NullNat {
    async fn discover(&self) -> PublicEndpoint {
        PublicEndpoint {
            public_ip: Some(self.local_ip.clone()),
            public_port: Some(self.local_port),
            nat_type: NatType::Unknown,
        }
    }

    async fn local_candidates(&self) -> Vec<Candidate> {
        vec![Candidate {
            kind: "host".to_string(),
            ip: self.local_ip.clone(),
            port: self.local_port,
            priority: 1000,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_nat_reports_the_bound_address_as_its_only_host_candidate() {
        let nat = NullNat::new("203.0.113.5", 4001);

        let endpoint = nat.discover().await;
        assert_eq!(endpoint.public_ip.as_deref(), Some("203.0.113.5"));
        assert_eq!(endpoint.public_port, Some(4001));
        assert_eq!(endpoint.nat_type, NatType::Unknown);

        let candidates = nat.local_candidates().await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].kind, "host");
        assert_eq!(candidates[0].ip, "203.0.113.5");
        assert_eq!(candidates[0].port, 4001);
    }
}
