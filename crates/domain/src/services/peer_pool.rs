use crate::entities::{Peer, PeerSource};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

type PoolKey = (bool, PeerSource, u64);

/// Reserve of known but unconnected peers, ordered so the most trusted and
/// most recently learned peer is dialed first and the least valuable one is
/// shed first.
#[derive(Debug, Default)]
pub struct PeerPool {
    by_priority: BTreeMap<PoolKey, Peer>,
    by_addr: HashMap<SocketAddr, PoolKey>,
    sequence: u64,
}

impl PeerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer, replacing any entry with the same address. Returns `true`
    /// when an older entry was replaced.
    pub fn add(&mut self, peer: Peer) -> bool {
        let replaced = self.remove(&peer.addr).is_some();
        self.sequence += 1;
        let key = (peer.trusted, peer.source, self.sequence);
        self.by_addr.insert(peer.addr, key);
        self.by_priority.insert(key, peer);
        replaced
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<Peer> {
        let key = self.by_addr.remove(addr)?;
        self.by_priority.remove(&key)
    }

    pub fn pop_max(&mut self) -> Option<Peer> {
        let (_, peer) = self.by_priority.pop_last()?;
        self.by_addr.remove(&peer.addr);
        Some(peer)
    }

    pub fn delete_min(&mut self) -> Option<Peer> {
        let (_, peer) = self.by_priority.pop_first()?;
        self.by_addr.remove(&peer.addr);
        Some(peer)
    }

    /// Shed the lowest-priority peers until at most `high_water` remain.
    pub fn trim(&mut self, high_water: usize) -> usize {
        let mut dropped = 0;
        while self.len() > high_water {
            if self.delete_min().is_none() {
                break;
            }
            dropped += 1;
        }
        dropped
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.by_addr.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.by_priority.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_priority.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_priority.clear();
        self.by_addr.clear();
    }
}
