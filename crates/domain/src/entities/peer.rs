use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Where a peer address was learned. Ordering doubles as trust: later
/// variants are preferred when the reserve must shed entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PeerSource {
    Pex,
    Dht,
    Tracker,
    Incoming,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub trusted: bool,
}

impl Peer {
    pub fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            addr,
            source,
            trusted: false,
        }
    }

    pub fn trusted(mut self) -> Self {
        self.trusted = true;
        self
    }
}
