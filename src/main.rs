use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use netdrop::{Config, EventSink, Mode, NetDrop, Peer, TlsPaths, TransferReport};

/// A LAN file and text drop daemon speaking Dukto and NitroShare.
#[derive(Parser, Debug)]
#[command(name = "netdrop", version, about)]
struct Cli {
    /// IP address to bind; all interfaces when omitted.
    #[arg(short, long)]
    listen: Option<Ipv4Addr>,

    /// Protocol to speak: dukto, nitroshare or both.
    #[arg(short, long, default_value = "both")]
    mode: Mode,

    /// Directory to receive files into.
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// TLS certificate (PEM); requires --key.
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// TLS private key (PEM); requires --cert.
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Override the TCP transfer port for every protocol.
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Override the UDP discovery port for every protocol.
    #[arg(long)]
    udp_port: Option<u16>,

    /// Drop peers silent for this many seconds.
    #[arg(long)]
    peer_timeout: Option<u64>,
}

/// Sink that narrates engine events to the log.
struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn on_peer_added(&self, peer: &Peer) {
        log::info!(
            "peer online: [{}] {} - {}",
            peer.protocol,
            peer.addr,
            peer.signature
        );
    }

    fn on_peer_removed(&self, peer: &Peer) {
        log::info!("peer offline: [{}] {}", peer.protocol, peer.addr);
    }

    fn on_recv_file_begin(&self, path: &str, size: i64) {
        if size < 0 {
            log::info!("recv dir  {path}");
        } else {
            log::info!("recv file {path} ({size} bytes)");
        }
    }

    fn on_recv_file_chunk(&self, report: &TransferReport, _chunk: &[u8]) {
        log::debug!(
            "recv {} {}/{} (total {}/{})",
            report.path,
            report.bytes_in_file,
            report.file_size,
            report.bytes_total,
            report.total_size
        );
    }

    fn on_recv_file_finish(&self, path: &str) {
        log::info!("recv done {path}");
    }

    fn on_recv_text(&self, text: &str) {
        println!("{text}");
    }

    fn on_send_file_chunk(&self, report: &TransferReport) {
        log::debug!(
            "send {} {}/{} (total {}/{})",
            report.path,
            report.bytes_in_file,
            report.file_size,
            report.bytes_total,
            report.total_size
        );
    }

    fn on_send_finish(&self) {
        log::info!("send finished");
    }

    fn on_request_finish(&self) {
        log::info!("request finished");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let tls = match (cli.cert, cli.key) {
        (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
        _ => None,
    };
    let config = Config {
        listen: cli.listen,
        mode: cli.mode,
        target_dir: std::fs::canonicalize(&cli.dir)?,
        tls,
        tcp_port: cli.tcp_port,
        udp_port: cli.udp_port,
        peer_timeout: cli.peer_timeout.map(Duration::from_secs),
    };

    let mut engine = NetDrop::new(config, Arc::new(ConsoleSink))?;
    engine.start().await?;

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    engine.stop().await;
    Ok(())
}
