//! Outbound transfers: connect, frame, stream, report progress.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::AsyncStream;
use crate::dukto;
use crate::error::{Error, Result};
use crate::nitroshare;
use crate::peer::{Peer, Protocol};
use crate::plan::TransferPlan;
use crate::sink::EventSink;

/// One-shot sender towards a single peer. A client never retries; a
/// caller that wants a retry issues a new send.
pub struct StreamClient {
    protocol: Protocol,
    addr: IpAddr,
    port: u16,
    tls: Option<TlsConnector>,
    chunk_size: usize,
    /// Device name announced in NitroShare transfer headers.
    local_name: String,
    sink: Arc<dyn EventSink>,
}

impl StreamClient {
    pub fn new(
        protocol: Protocol,
        addr: IpAddr,
        port: u16,
        tls: Option<TlsConnector>,
        chunk_size: usize,
        local_name: String,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            protocol,
            addr,
            port,
            tls,
            chunk_size,
            local_name,
            sink,
        }
    }

    /// Target a discovered peer at the port it advertised.
    pub fn for_peer(
        peer: &Peer,
        tls: Option<TlsConnector>,
        chunk_size: usize,
        local_name: String,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::new(
            peer.protocol,
            peer.addr,
            peer.port,
            tls,
            chunk_size,
            local_name,
            sink,
        )
    }

    /// Send a plain-text message. Only Dukto carries text; the check
    /// fires before any socket activity.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        if self.protocol != Protocol::Dukto {
            return Err(Error::ProtocolMismatch(format!(
                "{} peers do not accept text",
                self.protocol
            )));
        }
        let mut stream = self.connect().await?;
        stream.write_all(&dukto::encode_text(text)).await?;
        stream.flush().await?;
        let _ = stream.shutdown().await;
        self.sink.on_send_finish();
        Ok(())
    }

    /// Walk `roots` and stream the resulting plan.
    pub async fn send_files(&self, roots: &[PathBuf]) -> Result<()> {
        let plan = TransferPlan::from_roots(roots)?;
        self.send_plan(&plan).await
    }

    pub async fn send_plan(&self, plan: &TransferPlan) -> Result<()> {
        let mut stream = self.connect().await?;
        let sink = Arc::clone(&self.sink);
        match self.protocol {
            Protocol::Dukto => {
                dukto::send_files(&mut stream, plan, self.chunk_size, &mut |report| {
                    sink.on_send_file_chunk(&report)
                })
                .await?;
                let _ = stream.shutdown().await;
            }
            Protocol::NitroShare => {
                nitroshare::send_files(
                    &mut stream,
                    plan,
                    &self.local_name,
                    self.chunk_size,
                    &mut |report| sink.on_send_file_chunk(&report),
                )
                .await?;
                nitroshare::read_ack(&mut stream).await?;
                let _ = stream.shutdown().await;
            }
        }
        self.sink.on_send_finish();
        Ok(())
    }

    async fn connect(&self) -> Result<Box<dyn AsyncStream>> {
        let tcp = TcpStream::connect((self.addr, self.port))
            .await
            .map_err(|e| Error::Network(format!("connect {}:{}: {e}", self.addr, self.port)))?;
        match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(self.addr.to_string())
                    .map_err(|e| Error::Config(format!("bad TLS server name: {e}")))?;
                let stream = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| Error::Network(format!("TLS handshake: {e}")))?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(tcp)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NullSink;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn text_to_nitroshare_is_refused_before_connecting() {
        // The port is unbound; a mismatch must fail without touching it.
        let client = StreamClient::new(
            Protocol::NitroShare,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            1,
            None,
            8192,
            "tester".into(),
            Arc::new(NullSink),
        );
        let err = client.send_text("nope").await.unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        let client = StreamClient::new(
            Protocol::Dukto,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            1,
            None,
            8192,
            "tester".into(),
            Arc::new(NullSink),
        );
        let err = client.send_text("hi").await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }
}
