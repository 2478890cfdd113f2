use crate::entities::{ConnStats, Peer, PeerSource};
use crate::services::peer_pool::PeerPool;
use crate::services::priority_scheduler::piece_inclination;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub type ConnectionId = u64;

/// A live, handshaked session as seen by the core. The transport owns the
/// socket; the core only asks it to re-plan requests or to go away.
pub trait PeerConnection: Send + Sync {
    fn remote_addr(&self) -> SocketAddr;

    fn peer_id(&self) -> Option<[u8; 20]> {
        None
    }

    /// Piece priorities changed; re-plan outstanding requests.
    fn update_requests(&self);

    fn close(&self);
}

/// Asked to open connections to reserve peers. Outcomes come back through
/// `add_connection` or `dial_failed`.
pub trait Dialer: Send + Sync {
    fn dial(&self, peer: Peer);
}

/// Hands dial requests to whatever task drives the transport.
#[derive(Debug, Clone)]
pub struct ChannelDialer {
    tx: mpsc::UnboundedSender<Peer>,
}

impl ChannelDialer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Peer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Dialer for ChannelDialer {
    fn dial(&self, peer: Peer) {
        if self.tx.send(peer).is_err() {
            debug!("dial requested with no transport listening");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub max_established: usize,
    pub half_open_ceiling: usize,
    pub peers_high_water: usize,
    pub peers_low_water: usize,
    pub grace: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_established: 50,
            half_open_ceiling: 25,
            peers_high_water: 500,
            peers_low_water: 50,
            grace: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Closed,
    /// At the cap with no connection bad enough to evict.
    AtCapacity,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted {
        id: ConnectionId,
        evicted: Option<SocketAddr>,
    },
    Rejected(RejectReason),
}

/// Read-only view of a connection for snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub stats: ConnStats,
}

struct ConnectionEntry {
    conn: Arc<dyn PeerConnection>,
    source: PeerSource,
    handshake_at: Instant,
    stats: ConnStats,
    touched: HashSet<usize>,
    inclination: Arc<Vec<usize>>,
}

/// Worse-first ordering: a higher wasted/useful ratio is worse, ties go to
/// the older handshake. Ratios are compared by cross-multiplication.
fn worse(a: &ConnectionEntry, b: &ConnectionEntry) -> Ordering {
    let a_score = a.stats.chunks_read_wasted as u128 * (b.stats.chunks_read_useful as u128 + 1);
    let b_score = b.stats.chunks_read_wasted as u128 * (a.stats.chunks_read_useful as u128 + 1);
    b_score
        .cmp(&a_score)
        .then(a.handshake_at.cmp(&b.handshake_at))
}

fn is_wasteful(stats: &ConnStats) -> bool {
    stats.chunks_read_wasted >= 6 && stats.chunks_read_wasted > stats.chunks_read_useful
}

/// Owns the established set, the half-open set and the peer reserve of one
/// torrent.
pub struct ConnectionManager {
    limits: ConnectionLimits,
    conns: HashMap<ConnectionId, ConnectionEntry>,
    next_id: ConnectionId,
    half_open: HashSet<SocketAddr>,
    reserve: PeerPool,
    received: usize,
    num_pieces: usize,
    totals: ConnStats,
    closed: bool,
}

impl ConnectionManager {
    pub fn new(limits: ConnectionLimits, num_pieces: usize) -> Self {
        Self {
            limits,
            conns: HashMap::new(),
            next_id: 0,
            half_open: HashSet::new(),
            reserve: PeerPool::new(),
            received: 0,
            num_pieces,
            totals: ConnStats::default(),
            closed: false,
        }
    }

    pub fn limits(&self) -> &ConnectionLimits {
        &self.limits
    }

    pub fn num_active(&self) -> usize {
        self.conns.len()
    }

    pub fn num_half_open(&self) -> usize {
        self.half_open.len()
    }

    pub fn num_reserve(&self) -> usize {
        self.reserve.len()
    }

    pub fn totals(&self) -> ConnStats {
        self.totals
    }

    pub fn is_active(&self, addr: &SocketAddr) -> bool {
        self.conns.values().any(|e| e.conn.remote_addr() == *addr)
    }

    /// Admit a handshaked connection, evicting the worst bad one at the cap.
    pub fn admit(
        &mut self,
        conn: Arc<dyn PeerConnection>,
        source: PeerSource,
        now: Instant,
    ) -> Admission {
        if self.closed {
            return Admission::Rejected(RejectReason::Closed);
        }

        let addr = conn.remote_addr();
        let peer_id = conn.peer_id();
        let duplicate = self.conns.values().any(|e| {
            e.conn.remote_addr() == addr || (peer_id.is_some() && e.conn.peer_id() == peer_id)
        });
        if duplicate {
            return Admission::Rejected(RejectReason::Duplicate);
        }

        let mut evicted = None;
        if self.conns.len() >= self.limits.max_established {
            match self.worst_bad_conn(now) {
                Some(worst) => evicted = self.drop_connection(worst),
                None => return Admission::Rejected(RejectReason::AtCapacity),
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        if source == PeerSource::Incoming {
            self.received += 1;
        }
        self.reserve.remove(&addr);
        self.conns.insert(
            id,
            ConnectionEntry {
                conn,
                source,
                handshake_at: now,
                stats: ConnStats::default(),
                touched: HashSet::new(),
                inclination: Arc::new(piece_inclination(self.num_pieces)),
            },
        );
        debug!(id, addr = %addr, ?source, "connection admitted");

        Admission::Accepted { id, evicted }
    }

    /// Established connections, worst first.
    pub fn ranked_worst_first(&self) -> Vec<ConnectionId> {
        let mut entries: Vec<(&ConnectionId, &ConnectionEntry)> = self.conns.iter().collect();
        entries.sort_by(|(a_id, a), (b_id, b)| worse(a, b).then(a_id.cmp(b_id)));
        entries.into_iter().map(|(id, _)| *id).collect()
    }

    /// The first connection in worst-first order that is wasteful, or that
    /// sits in the bottom half of the quota past its grace period.
    pub fn worst_bad_conn(&self, now: Instant) -> Option<ConnectionId> {
        let ranked = self.ranked_worst_first();
        let half = (self.limits.max_established + 1) / 2;
        for (position, id) in ranked.iter().enumerate() {
            let entry = &self.conns[id];
            if is_wasteful(&entry.stats) {
                return Some(*id);
            }

            let remaining = ranked.len() - position - 1;
            if remaining >= half
                && now.saturating_duration_since(entry.handshake_at) > self.limits.grace
            {
                return Some(*id);
            }
        }
        None
    }

    /// Remove and close a connection. Returns its address.
    pub fn drop_connection(&mut self, id: ConnectionId) -> Option<SocketAddr> {
        let entry = self.conns.remove(&id)?;
        if entry.source == PeerSource::Incoming {
            self.received = self.received.saturating_sub(1);
        }
        let addr = entry.conn.remote_addr();
        entry.conn.close();
        debug!(id, addr = %addr, "connection dropped");
        Some(addr)
    }

    /// Half-open budget: established headroom plus some room to explore,
    /// reduced by surplus incoming connections.
    pub fn max_half_open(&self) -> usize {
        let max = self.limits.max_established as i64;
        let headroom = max - self.conns.len() as i64;
        let extra_incoming = (self.received as i64 - max / 2).max(0);
        let budget = headroom + 5 - extra_incoming;
        budget.clamp(0, self.limits.half_open_ceiling as i64) as usize
    }

    pub fn want_conns(&self, want_data: bool) -> bool {
        !self.closed && want_data && self.conns.len() < self.limits.max_established
    }

    pub fn want_peers(&self, want_data: bool) -> bool {
        !self.closed && want_data && self.reserve.len() <= self.limits.peers_low_water
    }

    /// Add discovered peers to the reserve, shedding past the high-water
    /// mark. Returns how many were added.
    pub fn add_peers(&mut self, peers: Vec<Peer>) -> usize {
        if self.closed {
            return 0;
        }
        let mut added = 0;
        for peer in peers {
            if self.is_active(&peer.addr) || self.half_open.contains(&peer.addr) {
                continue;
            }
            self.reserve.add(peer);
            added += 1;
        }
        let shed = self.reserve.trim(self.limits.peers_high_water);
        if shed > 0 {
            debug!(shed, "excess reserve peers discarded");
        }
        added
    }

    /// Move peers from the reserve to the half-open set while the budget
    /// allows. The caller dials them.
    pub fn next_dials(&mut self, want_data: bool) -> Vec<Peer> {
        let mut dials = Vec::new();
        while self.want_conns(want_data) && self.half_open.len() < self.max_half_open() {
            let Some(peer) = self.reserve.pop_max() else {
                break;
            };
            if self.is_active(&peer.addr) || !self.half_open.insert(peer.addr) {
                continue;
            }
            dials.push(peer);
        }
        dials
    }

    pub fn is_half_open(&self, addr: &SocketAddr) -> bool {
        self.half_open.contains(addr)
    }

    /// Forget a half-open address. Panics when the address is not tracked.
    pub fn drop_half_open(&mut self, addr: &SocketAddr) {
        if !self.half_open.remove(addr) {
            panic!("half-open set does not track {}", addr);
        }
    }

    /// Account a chunk read from a connection.
    pub fn record_chunk(&mut self, id: ConnectionId, piece: usize, useful: bool, bytes: u64) {
        let delta = if useful {
            ConnStats {
                chunks_read_useful: 1,
                bytes_read_useful: bytes,
                ..Default::default()
            }
        } else {
            ConnStats {
                chunks_read_wasted: 1,
                bytes_read_wasted: bytes,
                ..Default::default()
            }
        };

        self.totals.add(&delta);
        if let Some(entry) = self.conns.get_mut(&id) {
            entry.stats.add(&delta);
            if useful {
                entry.touched.insert(piece);
            }
        }
    }

    /// Credit or blame the connections that contributed to a hashed piece.
    pub fn piece_hashed(&mut self, piece: usize, correct: bool) {
        if correct {
            self.totals.pieces_dirtied_good += 1;
        } else {
            self.totals.pieces_dirtied_bad += 1;
        }
        for entry in self.conns.values_mut() {
            if entry.touched.remove(&piece) {
                if correct {
                    entry.stats.pieces_dirtied_good += 1;
                } else {
                    entry.stats.pieces_dirtied_bad += 1;
                }
            }
        }
    }

    /// Change the cap, dropping the worst connections beyond it.
    pub fn set_max_established(&mut self, max: usize) -> (usize, Vec<SocketAddr>) {
        let old = self.limits.max_established;
        self.limits.max_established = max;

        let mut dropped = Vec::new();
        let excess = self.conns.len().saturating_sub(max);
        for id in self.ranked_worst_first().into_iter().take(excess) {
            if let Some(addr) = self.drop_connection(id) {
                dropped.push(addr);
            }
        }
        (old, dropped)
    }

    pub fn update_requests_all(&self) {
        for entry in self.conns.values() {
            entry.conn.update_requests();
        }
    }

    pub fn inclination(&self, id: ConnectionId) -> Option<Arc<Vec<usize>>> {
        self.conns.get(&id).map(|e| e.inclination.clone())
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .conns
            .iter()
            .map(|(id, e)| ConnectionInfo {
                id: *id,
                addr: e.conn.remote_addr(),
                source: e.source,
                stats: e.stats,
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Terminal: close every connection and forget the reserve.
    pub fn close_all(&mut self) -> usize {
        self.closed = true;
        let ids: Vec<ConnectionId> = self.conns.keys().copied().collect();
        let count = ids.len();
        for id in ids {
            self.drop_connection(id);
        }
        self.half_open.clear();
        self.reserve.clear();
        info!(closed = count, "connections closed");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};

    struct FakeConn {
        addr: SocketAddr,
        peer_id: Option<[u8; 20]>,
        closed: AtomicBool,
        updates: AtomicUsize,
    }

    impl FakeConn {
        fn new(port: u16) -> Arc<Self> {
            Arc::new(Self {
                addr: SocketAddr::from(([192, 168, 1, 1], port)),
                peer_id: None,
                closed: AtomicBool::new(false),
                updates: AtomicUsize::new(0),
            })
        }
    }

    impl PeerConnection for FakeConn {
        fn remote_addr(&self) -> SocketAddr {
            self.addr
        }

        fn peer_id(&self) -> Option<[u8; 20]> {
            self.peer_id
        }

        fn update_requests(&self) {
            self.updates.fetch_add(1, AtomicOrdering::SeqCst);
        }

        fn close(&self) {
            self.closed.store(true, AtomicOrdering::SeqCst);
        }
    }

    fn limits(max: usize) -> ConnectionLimits {
        ConnectionLimits {
            max_established: max,
            ..Default::default()
        }
    }

    fn accepted(admission: Admission) -> ConnectionId {
        match admission {
            Admission::Accepted { id, .. } => id,
            other => panic!("expected accepted, got {:?}", other),
        }
    }

    fn feed(manager: &mut ConnectionManager, id: ConnectionId, useful: u64, wasted: u64) {
        for _ in 0..useful {
            manager.record_chunk(id, 0, true, 16);
        }
        for _ in 0..wasted {
            manager.record_chunk(id, 0, false, 16);
        }
    }

    #[test]
    fn wasteful_connection_is_evicted_for_newcomer() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(limits(2), 4);
        let a = FakeConn::new(1);
        let b = FakeConn::new(2);
        let c = FakeConn::new(3);

        let a_id = accepted(manager.admit(a.clone(), PeerSource::Tracker, now));
        let b_id = accepted(manager.admit(b.clone(), PeerSource::Tracker, now));
        feed(&mut manager, a_id, 10, 0);
        feed(&mut manager, b_id, 1, 8);

        let admission = manager.admit(c.clone(), PeerSource::Tracker, now);
        assert!(matches!(
            admission,
            Admission::Accepted { evicted: Some(addr), .. } if addr == b.addr
        ));
        assert!(b.closed.load(AtomicOrdering::SeqCst));
        assert!(!a.closed.load(AtomicOrdering::SeqCst));
        assert_eq!(manager.num_active(), 2);
    }

    #[test]
    fn full_of_good_connections_rejects() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(limits(2), 4);
        let a_id = accepted(manager.admit(FakeConn::new(1), PeerSource::Tracker, now));
        let b_id = accepted(manager.admit(FakeConn::new(2), PeerSource::Tracker, now));
        feed(&mut manager, a_id, 5, 1);
        feed(&mut manager, b_id, 5, 0);

        assert_eq!(
            manager.admit(FakeConn::new(3), PeerSource::Tracker, now),
            Admission::Rejected(RejectReason::AtCapacity)
        );
    }

    #[test]
    fn old_connection_in_bottom_half_is_evicted() {
        let start = Instant::now();
        let mut manager = ConnectionManager::new(limits(2), 4);
        let old = FakeConn::new(1);
        accepted(manager.admit(old.clone(), PeerSource::Tracker, start));
        accepted(manager.admit(FakeConn::new(2), PeerSource::Tracker, start + Duration::from_secs(1)));

        // Inside the grace period nobody is bad.
        assert_eq!(manager.worst_bad_conn(start + Duration::from_secs(30)), None);

        let later = start + Duration::from_secs(120);
        let admission = manager.admit(FakeConn::new(3), PeerSource::Tracker, later);
        assert!(matches!(
            admission,
            Admission::Accepted { evicted: Some(addr), .. } if addr == old.addr
        ));
    }

    #[test]
    fn ranking_uses_ratio_then_handshake_age() {
        let start = Instant::now();
        let mut manager = ConnectionManager::new(limits(10), 4);
        let first = accepted(manager.admit(FakeConn::new(1), PeerSource::Tracker, start));
        let second = accepted(manager.admit(FakeConn::new(2), PeerSource::Tracker, start + Duration::from_secs(1)));
        let third = accepted(manager.admit(FakeConn::new(3), PeerSource::Tracker, start + Duration::from_secs(2)));
        feed(&mut manager, third, 1, 3);

        assert_eq!(manager.ranked_worst_first(), vec![third, first, second]);
    }

    #[test]
    fn duplicates_and_closed_are_rejected() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(limits(5), 4);
        accepted(manager.admit(FakeConn::new(1), PeerSource::Tracker, now));
        assert_eq!(
            manager.admit(FakeConn::new(1), PeerSource::Incoming, now),
            Admission::Rejected(RejectReason::Duplicate)
        );

        assert_eq!(manager.close_all(), 1);
        assert_eq!(
            manager.admit(FakeConn::new(2), PeerSource::Tracker, now),
            Admission::Rejected(RejectReason::Closed)
        );
    }

    #[test]
    fn half_open_budget() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(
            ConnectionLimits {
                max_established: 4,
                half_open_ceiling: 25,
                ..Default::default()
            },
            4,
        );
        // Headroom 4 + 5.
        assert_eq!(manager.max_half_open(), 9);

        for port in 0..4 {
            accepted(manager.admit(FakeConn::new(port), PeerSource::Incoming, now));
        }
        // Headroom 0 + 5 - (4 incoming - 2).
        assert_eq!(manager.max_half_open(), 3);

        let mut capped = ConnectionManager::new(
            ConnectionLimits {
                max_established: 100,
                half_open_ceiling: 25,
                ..Default::default()
            },
            4,
        );
        assert_eq!(capped.max_half_open(), 25);
        capped.set_max_established(0);
        assert_eq!(capped.max_half_open(), 5);
    }

    #[test]
    fn dials_come_from_reserve_within_budget() {
        let mut manager = ConnectionManager::new(
            ConnectionLimits {
                max_established: 2,
                half_open_ceiling: 3,
                peers_low_water: 1,
                ..Default::default()
            },
            4,
        );
        let peers: Vec<Peer> = (0..5)
            .map(|port| Peer::new(SocketAddr::from(([10, 0, 0, 2], port)), PeerSource::Tracker))
            .collect();
        assert_eq!(manager.add_peers(peers), 5);
        assert!(!manager.want_peers(true));

        let dials = manager.next_dials(true);
        assert_eq!(dials.len(), 3);
        assert_eq!(manager.num_half_open(), 3);
        assert_eq!(manager.num_reserve(), 2);
        assert!(manager.next_dials(true).is_empty());

        manager.drop_half_open(&dials[0].addr);
        assert_eq!(manager.next_dials(true).len(), 1);
        assert!(manager.want_peers(true));
        assert!(manager.next_dials(false).is_empty());
    }

    #[test]
    #[should_panic(expected = "half-open set does not track")]
    fn dropping_untracked_half_open_panics() {
        let mut manager = ConnectionManager::new(ConnectionLimits::default(), 4);
        manager.drop_half_open(&SocketAddr::from(([10, 0, 0, 9], 1)));
    }

    #[test]
    fn lowering_cap_drops_worst_first() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(limits(3), 4);
        let good = accepted(manager.admit(FakeConn::new(1), PeerSource::Tracker, now));
        let bad = accepted(manager.admit(FakeConn::new(2), PeerSource::Tracker, now));
        let idle = accepted(manager.admit(FakeConn::new(3), PeerSource::Tracker, now));
        feed(&mut manager, good, 4, 0);
        feed(&mut manager, bad, 0, 4);
        feed(&mut manager, idle, 0, 1);

        let (old, dropped) = manager.set_max_established(1);
        assert_eq!(old, 3);
        assert_eq!(dropped.len(), 2);
        assert_eq!(manager.connections().iter().map(|c| c.id).collect::<Vec<_>>(), vec![good]);
    }

    #[test]
    fn hashed_pieces_credit_contributors() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(limits(3), 4);
        let a = accepted(manager.admit(FakeConn::new(1), PeerSource::Tracker, now));
        let b = accepted(manager.admit(FakeConn::new(2), PeerSource::Tracker, now));
        manager.record_chunk(a, 1, true, 16);
        manager.record_chunk(b, 2, true, 16);

        manager.piece_hashed(1, true);
        manager.piece_hashed(2, false);

        let infos = manager.connections();
        assert_eq!(infos[0].stats.pieces_dirtied_good, 1);
        assert_eq!(infos[1].stats.pieces_dirtied_bad, 1);
        assert_eq!(manager.totals().chunks_read_useful, 2);
        assert_eq!(manager.inclination(a).map(|i| i.len()), Some(4));
    }
}
