use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong inside the protocol engine.
///
/// The variants map onto containment rules: `Config` is fatal at startup,
/// `Decode` aborts the offending connection only, `Network` fails a single
/// send while discovery keeps running, and `Cancelled` is the normal
/// shutdown path.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Self::Config(format!("TLS: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(format!("JSON: {err}"))
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Self::Decode(format!("invalid UTF-8: {err}"))
    }
}
