//! netdrop — a LAN file and text drop engine speaking the Dukto and
//! NitroShare wire protocols.
//!
//! The crate discovers peers over UDP broadcast, announces itself with
//! periodic hellos, and exchanges file trees and plain text over framed
//! TCP streams, as both server and client at once. The host application
//! injects an [`EventSink`] and drives the engine through [`NetDrop`].

pub mod client;
pub mod config;
pub mod discovery;
pub mod dukto;
pub mod error;
pub mod netinfo;
pub mod nitroshare;
pub mod orchestrator;
pub mod peer;
pub mod plan;
pub mod server;
pub mod sink;
pub mod tls;

pub use client::StreamClient;
pub use config::{Config, Mode, TlsPaths};
pub use error::{Error, Result};
pub use orchestrator::NetDrop;
pub use peer::{LocalIdentity, Peer, PeerTable, Protocol};
pub use plan::TransferPlan;
pub use sink::{EventSink, NullSink, RecvEvent, TransferReport};

/// Byte stream over plain TCP or TLS, erased so both sides share one
/// code path.
pub(crate) trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
