use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Which wire dialect a peer speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Dukto,
    NitroShare,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Dukto => write!(f, "Dukto"),
            Protocol::NitroShare => write!(f, "NitroShare"),
        }
    }
}

/// A remote host observed via UDP discovery.
#[derive(Debug, Clone)]
pub struct Peer {
    pub addr: IpAddr,
    /// TCP port the peer accepts transfers on.
    pub port: u16,
    /// Human-readable identity, e.g. `alice at ember (Linux)`.
    pub signature: String,
    pub protocol: Protocol,
    pub last_seen: Instant,
}

impl Peer {
    pub fn new(addr: IpAddr, port: u16, signature: String, protocol: Protocol) -> Self {
        Self {
            addr,
            port,
            signature,
            protocol,
            last_seen: Instant::now(),
        }
    }
}

/// Who we are on the network, derived once at startup.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub user: String,
    pub host: String,
    pub os: String,
}

impl LocalIdentity {
    pub fn detect() -> Self {
        let host = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string());
        Self {
            user: whoami::username(),
            host,
            os: whoami::platform().to_string(),
        }
    }

    /// The signature string carried in discovery frames.
    pub fn signature(&self) -> String {
        format!("{} at {} ({})", self.user, self.host, self.os)
    }
}

/// Shared table of discovered peers, keyed `(address, protocol)`.
///
/// The table is the only mutable structure shared between tasks; every
/// access goes through the mutex here rather than ad-hoc locking at call
/// sites. Add/remove *events* are emitted by the discovery task that owns
/// the corresponding protocol, so observers see a consistent sequence.
#[derive(Default)]
pub struct PeerTable {
    inner: Mutex<HashMap<(IpAddr, Protocol), Peer>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. Returns `true` when the peer is new;
    /// repeat hellos only update the port, signature and liveness stamp.
    pub fn add_or_refresh(&self, peer: Peer) -> bool {
        let mut map = self.inner.lock().unwrap();
        map.insert((peer.addr, peer.protocol), peer).is_none()
    }

    /// Remove a peer. A goodbye from an address we never saw is a no-op.
    pub fn remove(&self, addr: IpAddr, protocol: Protocol) -> Option<Peer> {
        let mut map = self.inner.lock().unwrap();
        map.remove(&(addr, protocol))
    }

    pub fn get(&self, addr: IpAddr, protocol: Protocol) -> Option<Peer> {
        let map = self.inner.lock().unwrap();
        map.get(&(addr, protocol)).cloned()
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        let map = self.inner.lock().unwrap();
        let mut peers: Vec<Peer> = map.values().cloned().collect();
        peers.sort_by(|a, b| (a.addr, a.protocol as u8).cmp(&(b.addr, b.protocol as u8)));
        peers
    }

    /// Drop peers of `protocol` not heard from within `max_idle` and
    /// return them so the caller can emit removal events.
    pub fn evict_idle(&self, protocol: Protocol, max_idle: Duration) -> Vec<Peer> {
        let mut map = self.inner.lock().unwrap();
        let cutoff = Instant::now();
        let stale: Vec<(IpAddr, Protocol)> = map
            .iter()
            .filter(|((_, proto), peer)| {
                *proto == protocol && cutoff.duration_since(peer.last_seen) > max_idle
            })
            .map(|(key, _)| *key)
            .collect();
        stale.into_iter().filter_map(|key| map.remove(&key)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer(last_octet: u8, protocol: Protocol) -> Peer {
        Peer::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, last_octet)),
            4644,
            format!("user at host-{last_octet} (Linux)"),
            protocol,
        )
    }

    #[test]
    fn duplicate_hello_refreshes_without_duplicating() {
        let table = PeerTable::new();
        assert!(table.add_or_refresh(peer(5, Protocol::Dukto)));
        assert!(!table.add_or_refresh(peer(5, Protocol::Dukto)));
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn same_address_different_protocol_is_distinct() {
        let table = PeerTable::new();
        assert!(table.add_or_refresh(peer(5, Protocol::Dukto)));
        assert!(table.add_or_refresh(peer(5, Protocol::NitroShare)));
        assert_eq!(table.snapshot().len(), 2);
    }

    #[test]
    fn goodbye_for_unknown_peer_is_noop() {
        let table = PeerTable::new();
        let gone = table.remove(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), Protocol::Dukto);
        assert!(gone.is_none());
    }

    #[test]
    fn refresh_updates_port() {
        let table = PeerTable::new();
        table.add_or_refresh(peer(5, Protocol::Dukto));
        let mut updated = peer(5, Protocol::Dukto);
        updated.port = 9999;
        table.add_or_refresh(updated);
        let got = table
            .get(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)), Protocol::Dukto)
            .unwrap();
        assert_eq!(got.port, 9999);
    }
}
