use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::peer::Protocol;
use crate::{dukto, nitroshare};

/// Which protocol(s) the engine speaks. Unset means both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Dukto,
    NitroShare,
    #[default]
    Both,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dukto" => Ok(Mode::Dukto),
            "nitroshare" => Ok(Mode::NitroShare),
            "" | "both" => Ok(Mode::Both),
            other => Err(Error::Config(format!("unknown mode \"{other}\""))),
        }
    }
}

/// Certificate / key pair enabling TLS on the stream ports.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Engine configuration. Everything has a working default; an empty
/// config binds both protocols on all interfaces and receives into the
/// current directory.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind IP; `None` binds all interfaces.
    pub listen: Option<Ipv4Addr>,
    pub mode: Mode,
    /// Filesystem root for received files.
    pub target_dir: PathBuf,
    pub tls: Option<TlsPaths>,
    /// Override the per-protocol TCP transfer port.
    pub tcp_port: Option<u16>,
    /// Override the per-protocol UDP discovery port.
    pub udp_port: Option<u16>,
    /// Evict peers not heard from within this window. Disabled by
    /// default; not required for interoperability.
    pub peer_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: None,
            mode: Mode::Both,
            target_dir: PathBuf::from("."),
            tls: None,
            tcp_port: None,
            udp_port: None,
            peer_timeout: None,
        }
    }
}

impl Config {
    pub fn protocols(&self) -> Vec<Protocol> {
        match self.mode {
            Mode::Dukto => vec![Protocol::Dukto],
            Mode::NitroShare => vec![Protocol::NitroShare],
            Mode::Both => vec![Protocol::Dukto, Protocol::NitroShare],
        }
    }

    pub fn tcp_port_for(&self, protocol: Protocol) -> u16 {
        self.tcp_port.unwrap_or(match protocol {
            Protocol::Dukto => dukto::DEFAULT_TCP_PORT,
            Protocol::NitroShare => nitroshare::DEFAULT_TCP_PORT,
        })
    }

    pub fn udp_port_for(&self, protocol: Protocol) -> u16 {
        self.udp_port.unwrap_or(match protocol {
            Protocol::Dukto => dukto::DEFAULT_UDP_PORT,
            Protocol::NitroShare => nitroshare::DEFAULT_UDP_PORT,
        })
    }
}
