//! Ties discovery and streaming together under one lifecycle: both
//! protocols on one address, one peer list, one event sink.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

use crate::client::StreamClient;
use crate::config::Config;
use crate::discovery::Discovery;
use crate::error::{Error, Result};
use crate::netinfo;
use crate::nitroshare;
use crate::peer::{LocalIdentity, Peer, PeerTable, Protocol};
use crate::plan;
use crate::server::StreamServer;
use crate::sink::EventSink;
use crate::tls;

/// The protocol engine. Owns the peer table, the listeners and the
/// workers; the host talks to it through this surface and hears back
/// through its [`EventSink`].
pub struct NetDrop {
    config: Config,
    identity: LocalIdentity,
    device_uuid: String,
    peers: Arc<PeerTable>,
    sink: Arc<dyn EventSink>,
    target_dir: Arc<RwLock<PathBuf>>,
    chunk_size: usize,
    tls_acceptor: Option<TlsAcceptor>,
    tls_connector: Option<TlsConnector>,
    cancel: CancellationToken,
    discoveries: Vec<Arc<Discovery>>,
    tasks: Vec<JoinHandle<()>>,
    stream_addrs: Vec<(Protocol, SocketAddr)>,
    udp_ports: Vec<(Protocol, u16)>,
    running: bool,
}

impl NetDrop {
    /// Validate the configuration and prepare the engine. TLS material
    /// is loaded here so a bad certificate fails before anything binds.
    pub fn new(config: Config, sink: Arc<dyn EventSink>) -> Result<Self> {
        let (tls_acceptor, tls_connector) = match &config.tls {
            Some(paths) => {
                let server = tls::server_config(&paths.cert, &paths.key)?;
                (
                    Some(TlsAcceptor::from(Arc::new(server))),
                    Some(TlsConnector::from(Arc::new(tls::client_config()))),
                )
            }
            None => (None, None),
        };
        let target_dir = Arc::new(RwLock::new(config.target_dir.clone()));
        Ok(Self {
            config,
            identity: LocalIdentity::detect(),
            device_uuid: uuid::Uuid::new_v4().to_string(),
            peers: Arc::new(PeerTable::new()),
            sink,
            target_dir,
            chunk_size: plan::chunk_size(),
            tls_acceptor,
            tls_connector,
            cancel: CancellationToken::new(),
            discoveries: Vec::new(),
            tasks: Vec::new(),
            stream_addrs: Vec::new(),
            udp_ports: Vec::new(),
            running: false,
        })
    }

    pub fn signature(&self) -> String {
        self.identity.signature()
    }

    pub fn snapshot_peers(&self) -> Vec<Peer> {
        self.peers.snapshot()
    }

    pub fn find_peer(&self, addr: IpAddr, protocol: Protocol) -> Option<Peer> {
        self.peers.get(addr, protocol)
    }

    /// Where the stream listeners actually bound, per protocol.
    pub fn listen_addrs(&self) -> &[(Protocol, SocketAddr)] {
        &self.stream_addrs
    }

    /// Where the discovery sockets actually bound, per protocol.
    pub fn discovery_ports(&self) -> &[(Protocol, u16)] {
        &self.udp_ports
    }

    pub fn set_target_dir(&self, path: PathBuf) {
        *self.target_dir.write().unwrap() = path;
    }

    /// Bind and go online. Everything binds before anything spawns, so
    /// a failure here leaves no partial listeners behind.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::Config("engine already started".into()));
        }
        let info = netinfo::enumerate(self.config.listen)?;
        log::info!("my node: {}", self.signature());

        self.cancel = CancellationToken::new();
        let mut discoveries = Vec::new();
        let mut servers = Vec::new();
        let mut stream_addrs = Vec::new();
        let mut udp_ports = Vec::new();

        for protocol in self.config.protocols() {
            let tcp_port = self.config.tcp_port_for(protocol);
            let udp_port = self.config.udp_port_for(protocol);

            let discovery = Discovery::bind(
                protocol,
                self.config.listen,
                udp_port,
                tcp_port,
                self.identity.clone(),
                self.device_uuid.clone(),
                self.tls_acceptor.is_some(),
                info.broadcasts.clone(),
                Arc::clone(&self.peers),
                Arc::clone(&self.sink),
                self.cancel.clone(),
                self.config.peer_timeout,
            )?;
            let server = StreamServer::bind(
                protocol,
                self.config.listen,
                tcp_port,
                self.tls_acceptor.clone(),
                Arc::clone(&self.target_dir),
                Arc::clone(&self.sink),
                self.chunk_size,
                self.cancel.clone(),
            )
            .await?;

            let addr = server.local_addr()?;
            log::info!(
                "[{protocol}] listening on {addr} (tcp) / {} (udp)",
                discovery.local_udp_port()
            );
            stream_addrs.push((protocol, addr));
            udp_ports.push((protocol, discovery.local_udp_port()));
            discoveries.push(Arc::new(discovery));
            servers.push(server);
        }

        for discovery in &discoveries {
            self.tasks.extend(discovery.spawn());
        }
        for server in servers {
            self.tasks.push(server.spawn());
        }
        self.discoveries = discoveries;
        self.stream_addrs = stream_addrs;
        self.udp_ports = udp_ports;
        self.running = true;
        Ok(())
    }

    /// Go offline: broadcast goodbyes, cancel every task, wait for the
    /// workers to wind down.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        for discovery in &self.discoveries {
            discovery.say_goodbye().await;
        }
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.discoveries.clear();
        self.stream_addrs.clear();
        self.udp_ports.clear();
        self.running = false;
        log::info!("engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Build a sender towards `peer`, TLS and chunk sizing included.
    pub fn client_for(&self, peer: &Peer) -> StreamClient {
        let chunk_size = match peer.protocol {
            Protocol::Dukto => self.chunk_size,
            Protocol::NitroShare => nitroshare::CHUNK_SIZE,
        };
        StreamClient::for_peer(
            peer,
            self.tls_connector.clone(),
            chunk_size,
            self.identity.host.clone(),
            Arc::clone(&self.sink),
        )
    }

    /// Send text to a Dukto peer on a dedicated worker. A text send to
    /// a NitroShare peer is refused here, before any socket activity.
    pub fn send_text(&self, peer: &Peer, text: &str) -> Result<()> {
        if peer.protocol != Protocol::Dukto {
            return Err(Error::ProtocolMismatch(format!(
                "{} peers do not accept text",
                peer.protocol
            )));
        }
        let client = self.client_for(peer);
        let text = text.to_string();
        let label = format!("{}:{}", peer.addr, peer.port);
        tokio::spawn(async move {
            if let Err(e) = client.send_text(&text).await {
                log::error!("text send to {label} failed: {e}");
            }
        });
        Ok(())
    }

    /// Stream files/directories to any peer on a dedicated worker.
    pub fn send_files(&self, peer: &Peer, roots: Vec<PathBuf>) -> Result<()> {
        if roots.is_empty() {
            return Err(Error::Config("nothing to send".into()));
        }
        let client = self.client_for(peer);
        let label = format!("{}:{}", peer.addr, peer.port);
        tokio::spawn(async move {
            if let Err(e) = client.send_files(&roots).await {
                log::error!("file send to {label} failed: {e}");
            }
        });
        Ok(())
    }
}
