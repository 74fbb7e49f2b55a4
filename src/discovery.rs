//! Peer discovery: one UDP receive loop and one periodic beacon per
//! protocol, both feeding the shared peer table.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dukto;
use crate::error::{Error, Result};
use crate::nitroshare;
use crate::peer::{LocalIdentity, Peer, PeerTable, Protocol};
use crate::sink::EventSink;

/// Interval between presence beacons.
pub const HELLO_INTERVAL: Duration = Duration::from_secs(30);

/// Largest discovery datagram we accept.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Discovery endpoint for one protocol. The receive loop and the beacon
/// task are the only writers of this protocol's peer entries, so add and
/// remove events reach the sink in a consistent order.
pub struct Discovery {
    protocol: Protocol,
    socket: UdpSocket,
    udp_port: u16,
    tcp_port: u16,
    identity: LocalIdentity,
    signature: String,
    device_uuid: String,
    uses_tls: bool,
    broadcasts: Vec<Ipv4Addr>,
    peers: Arc<PeerTable>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    peer_timeout: Option<Duration>,
}

impl Discovery {
    /// Bind the discovery socket. `broadcasts` lists the directed
    /// broadcast addresses to beacon on; empty falls back to the
    /// limited broadcast address.
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        protocol: Protocol,
        listen: Option<Ipv4Addr>,
        udp_port: u16,
        tcp_port: u16,
        identity: LocalIdentity,
        device_uuid: String,
        uses_tls: bool,
        broadcasts: Vec<Ipv4Addr>,
        peers: Arc<PeerTable>,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
        peer_timeout: Option<Duration>,
    ) -> Result<Self> {
        let socket = bind_broadcast_socket(listen, udp_port)?;
        let udp_port = socket.local_addr()?.port();
        let broadcasts = if broadcasts.is_empty() {
            vec![Ipv4Addr::BROADCAST]
        } else {
            broadcasts
        };
        let signature = identity.signature();
        Ok(Self {
            protocol,
            socket,
            udp_port,
            tcp_port,
            identity,
            signature,
            device_uuid,
            uses_tls,
            broadcasts,
            peers,
            sink,
            cancel,
            peer_timeout,
        })
    }

    pub fn local_udp_port(&self) -> u16 {
        self.udp_port
    }

    /// Spawn the receive loop and the beacon task.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let recv = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.recv_loop().await })
        };
        let beacon = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.beacon_loop().await })
        };
        vec![recv, beacon]
    }

    async fn recv_loop(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((n, src)) => {
                        if let Err(e) = self.handle_datagram(&buf[..n], src).await {
                            log::debug!("[{}] bad datagram from {src}: {e}", self.protocol);
                        }
                    }
                    Err(e) => {
                        log::warn!("[{}] discovery recv failed: {e}", self.protocol);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    async fn beacon_loop(&self) {
        loop {
            self.say_hello_broadcast().await;
            if let Some(max_idle) = self.peer_timeout {
                for peer in self.peers.evict_idle(self.protocol, max_idle) {
                    log::info!(
                        "offline: [{}] {}:{} - {} (idle)",
                        self.protocol,
                        peer.addr,
                        peer.port,
                        peer.signature
                    );
                    self.sink.on_peer_removed(&peer);
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(HELLO_INTERVAL) => {}
            }
        }
    }

    pub(crate) async fn handle_datagram(&self, data: &[u8], src: SocketAddr) -> Result<()> {
        match self.protocol {
            Protocol::Dukto => self.handle_dukto(data, src).await,
            Protocol::NitroShare => self.handle_nitroshare(data, src),
        }
    }

    async fn handle_dukto(&self, data: &[u8], src: SocketAddr) -> Result<()> {
        match dukto::decode_udp(data)? {
            dukto::UdpFrame::Goodbye => {
                if let Some(peer) = self.peers.remove(src.ip(), Protocol::Dukto) {
                    log::info!(
                        "offline: [Dukto] {}:{} - {}",
                        peer.addr,
                        peer.port,
                        peer.signature
                    );
                    self.sink.on_peer_removed(&peer);
                }
                Ok(())
            }
            dukto::UdpFrame::Hello {
                port,
                signature,
                broadcast,
            } => {
                if signature == self.signature {
                    return Ok(());
                }
                if broadcast {
                    // Broadcast hellos expect a unicast introduction back
                    // on the shared discovery port.
                    self.say_hello_unicast(SocketAddr::new(src.ip(), self.udp_port))
                        .await;
                }
                self.add_peer(src.ip(), port, signature, Protocol::Dukto);
                Ok(())
            }
        }
    }

    fn handle_nitroshare(&self, data: &[u8], src: SocketAddr) -> Result<()> {
        let ping = nitroshare::decode_ping(data)?;
        if ping.uuid == self.device_uuid {
            return Ok(());
        }
        self.add_peer(src.ip(), ping.tcp_port(), ping.signature(), Protocol::NitroShare);
        Ok(())
    }

    fn add_peer(&self, addr: IpAddr, port: u16, signature: String, protocol: Protocol) {
        let peer = Peer::new(addr, port, signature, protocol);
        if self.peers.add_or_refresh(peer.clone()) {
            log::info!(
                "online : [{}] {}:{} - {}",
                protocol,
                peer.addr,
                peer.port,
                peer.signature
            );
            self.sink.on_peer_added(&peer);
        }
    }

    fn hello_payload(&self, broadcast: bool) -> Vec<u8> {
        match self.protocol {
            Protocol::Dukto => dukto::encode_hello(&self.signature, self.tcp_port, broadcast),
            Protocol::NitroShare => nitroshare::encode_ping(&nitroshare::Ping {
                uuid: self.device_uuid.clone(),
                operating_system: self.identity.os.clone(),
                port: self.tcp_port.to_string(),
                uses_tls: self.uses_tls,
                username: self.identity.user.clone(),
                hostname: self.identity.host.clone(),
            }),
        }
    }

    async fn say_hello_broadcast(&self) {
        let data = self.hello_payload(true);
        for broadcast in &self.broadcasts {
            let dest = SocketAddr::from((*broadcast, self.udp_port));
            if let Err(e) = self.socket.send_to(&data, dest).await {
                log::warn!("[{}] hello to {dest} failed: {e}", self.protocol);
            }
        }
    }

    async fn say_hello_unicast(&self, dest: SocketAddr) {
        let data = self.hello_payload(false);
        if let Err(e) = self.socket.send_to(&data, dest).await {
            log::warn!("[{}] hello reply to {dest} failed: {e}", self.protocol);
        }
    }

    /// Broadcast a goodbye so peers drop us promptly. Only Dukto has a
    /// goodbye frame.
    pub async fn say_goodbye(&self) {
        if self.protocol != Protocol::Dukto {
            return;
        }
        let data = dukto::encode_goodbye();
        for broadcast in &self.broadcasts {
            let dest = SocketAddr::from((*broadcast, self.udp_port));
            if let Err(e) = self.socket.send_to(&data, dest).await {
                log::warn!("[Dukto] goodbye to {dest} failed: {e}");
            }
        }
    }
}

/// UDP socket prepared for discovery duty: address reuse so several
/// instances coexist on one host, broadcast permission, nonblocking
/// before tokio takes it over.
fn bind_broadcast_socket(listen: Option<Ipv4Addr>, port: u16) -> Result<UdpSocket> {
    let raw = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    raw.set_reuse_address(true)?;
    raw.set_broadcast(true)?;
    let addr = SocketAddr::from((listen.unwrap_or(Ipv4Addr::UNSPECIFIED), port));
    raw.bind(&addr.into())
        .map_err(|e| Error::Config(format!("cannot bind discovery socket {addr}: {e}")))?;
    raw.set_nonblocking(true)?;
    let std_sock: std::net::UdpSocket = raw.into();
    Ok(UdpSocket::from_std(std_sock)?)
}
