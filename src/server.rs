//! Inbound transfer server: one TCP listener per protocol, one worker
//! per accepted connection.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::AsyncStream;
use crate::dukto::{self, DuktoDecoder};
use crate::error::{Error, Result};
use crate::nitroshare::{self, NitroDecoder};
use crate::peer::Protocol;
use crate::plan::DIR_SIZE;
use crate::sink::{EventSink, RecvEvent};

/// Per-connection decoder; state never outlives its connection.
enum FrameDecoder {
    Dukto(DuktoDecoder),
    NitroShare(NitroDecoder),
}

impl FrameDecoder {
    fn new(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Dukto => Self::Dukto(DuktoDecoder::new()),
            Protocol::NitroShare => Self::NitroShare(NitroDecoder::new()),
        }
    }

    fn feed(&mut self, data: &[u8], out: &mut Vec<RecvEvent>) -> Result<()> {
        match self {
            Self::Dukto(d) => d.feed(data, out),
            Self::NitroShare(d) => d.feed(data, out),
        }
    }

    fn is_idle(&self) -> bool {
        match self {
            Self::Dukto(d) => d.is_idle(),
            Self::NitroShare(d) => d.is_idle(),
        }
    }
}

/// TCP listener for one protocol, optionally TLS-wrapped.
pub struct StreamServer {
    protocol: Protocol,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    target_dir: Arc<RwLock<PathBuf>>,
    sink: Arc<dyn EventSink>,
    chunk_size: usize,
    cancel: CancellationToken,
}

impl StreamServer {
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        protocol: Protocol,
        listen: Option<Ipv4Addr>,
        port: u16,
        tls: Option<TlsAcceptor>,
        target_dir: Arc<RwLock<PathBuf>>,
        sink: Arc<dyn EventSink>,
        chunk_size: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let addr = SocketAddr::from((listen.unwrap_or(Ipv4Addr::UNSPECIFIED), port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("cannot bind stream socket {addr}: {e}")))?;
        Ok(Self {
            protocol,
            listener,
            tls,
            target_dir,
            sink,
            chunk_size,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop until cancelled, then wait for in-flight
    /// connection workers.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.accept_loop())
    }

    async fn accept_loop(self) {
        let mut workers = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        log::info!("[{}] connect from {peer}", self.protocol);
                        let conn = Connection {
                            protocol: self.protocol,
                            tls: self.tls.clone(),
                            target_dir: Arc::clone(&self.target_dir),
                            sink: Arc::clone(&self.sink),
                            chunk_size: self.chunk_size,
                            cancel: self.cancel.clone(),
                        };
                        workers.spawn(async move {
                            match conn.run(stream, peer).await {
                                Ok(()) => {}
                                Err(Error::Cancelled) => {
                                    log::debug!("[{}] {peer}: connection cancelled", conn.protocol);
                                }
                                Err(e) => log::error!("[{}] {peer}: {e}", conn.protocol),
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("[{}] accept failed: {e}", self.protocol);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        while workers.join_next().await.is_some() {}
    }
}

struct Connection {
    protocol: Protocol,
    tls: Option<TlsAcceptor>,
    target_dir: Arc<RwLock<PathBuf>>,
    sink: Arc<dyn EventSink>,
    chunk_size: usize,
    cancel: CancellationToken,
}

impl Connection {
    async fn run(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut stream: Box<dyn AsyncStream> = match &self.tls {
            Some(acceptor) => Box::new(
                acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| Error::Network(format!("TLS handshake with {peer}: {e}")))?,
            ),
            None => Box::new(stream),
        };

        let mut receiver = Receiver::new(
            self.protocol,
            Arc::clone(&self.target_dir),
            Arc::clone(&self.sink),
        );
        let mut buf = vec![0u8; self.chunk_size.max(4096)];

        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => {
                    if !receiver.is_idle() {
                        log::warn!("[{}] {peer}: shutdown with transfer in flight", self.protocol);
                    }
                    return Err(Error::Cancelled);
                }
                result = stream.read(&mut buf) => result?,
            };
            if n == 0 {
                if receiver.is_idle() {
                    log::info!("[{}] {peer}: request finished", self.protocol);
                    self.sink.on_request_finish();
                    return Ok(());
                }
                return Err(Error::Network(format!("{peer} closed mid-transfer")));
            }
            let completed = receiver.feed(&buf[..n]).await?;
            if completed && self.protocol == Protocol::NitroShare {
                stream.write_all(&nitroshare::encode_success()).await?;
                stream.flush().await?;
            }
        }
    }
}

/// Applies decoded events: directories and files materialize under the
/// target directory, text routes to the text sink, progress mirrors to
/// the application.
struct Receiver {
    decoder: FrameDecoder,
    target_dir: Arc<RwLock<PathBuf>>,
    sink: Arc<dyn EventSink>,
    current_file: Option<tokio::fs::File>,
    text_buf: Option<Vec<u8>>,
}

impl Receiver {
    fn new(protocol: Protocol, target_dir: Arc<RwLock<PathBuf>>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            decoder: FrameDecoder::new(protocol),
            target_dir,
            sink,
            current_file: None,
            text_buf: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.decoder.is_idle()
    }

    fn target_dir(&self) -> PathBuf {
        self.target_dir.read().unwrap().clone()
    }

    /// Feed raw bytes; returns whether a transfer completed in this
    /// batch. Events decoded before an error are still applied, so a
    /// stream that desyncs late leaves the completed records on disk.
    async fn feed(&mut self, data: &[u8]) -> Result<bool> {
        let mut events = Vec::new();
        let decode_result = self.decoder.feed(data, &mut events);

        let mut completed = false;
        for event in &events {
            self.apply(event, &mut completed).await?;
        }
        decode_result?;
        Ok(completed)
    }

    async fn apply(&mut self, event: &RecvEvent, completed: &mut bool) -> Result<()> {
        match event {
            RecvEvent::Directory { path } => {
                let dir = resolve_target(&self.target_dir(), path)?;
                tokio::fs::create_dir_all(&dir).await?;
                self.sink.on_recv_file_begin(path, DIR_SIZE);
            }
            RecvEvent::FileBegin { path, size } => {
                if path == dukto::TEXT_TAG {
                    self.text_buf = Some(Vec::with_capacity((*size).max(0) as usize));
                } else {
                    let full = resolve_target(&self.target_dir(), path)?;
                    if let Some(parent) = full.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    self.current_file = Some(tokio::fs::File::create(&full).await?);
                    self.sink.on_recv_file_begin(path, *size);
                }
            }
            RecvEvent::FileChunk { report, data } => {
                if let Some(text) = &mut self.text_buf {
                    text.extend_from_slice(data);
                } else {
                    if let Some(file) = &mut self.current_file {
                        file.write_all(data).await?;
                    }
                    self.sink.on_recv_file_chunk(report, data);
                }
            }
            RecvEvent::FileFinish { path } => {
                if let Some(text) = self.text_buf.take() {
                    let text = String::from_utf8(text)?;
                    log::info!("received text ({} chars)", text.chars().count());
                    self.sink.on_recv_text(&text);
                } else {
                    if let Some(mut file) = self.current_file.take() {
                        file.flush().await?;
                    }
                    self.sink.on_recv_file_finish(path);
                }
            }
            RecvEvent::TransferComplete => {
                *completed = true;
            }
        }
        Ok(())
    }
}

/// Map a wire-relative path into the target directory, rejecting
/// absolute paths and any traversal attempt.
pub(crate) fn resolve_target(dir: &Path, rel_path: &str) -> Result<PathBuf> {
    let normalized = rel_path.replace('\\', "/");

    if normalized.starts_with('/') {
        return Err(Error::Decode(format!(
            "absolute path in transfer: {rel_path:?}"
        )));
    }
    for component in normalized.split('/') {
        if component == ".." {
            return Err(Error::Decode(format!(
                "path traversal in transfer: {rel_path:?}"
            )));
        }
    }

    let clean: PathBuf = normalized
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    if clean.as_os_str().is_empty() {
        return Err(Error::Decode(format!(
            "empty path in transfer: {rel_path:?}"
        )));
    }

    Ok(dir.join(clean))
}
