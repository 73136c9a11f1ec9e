//! Error types for the proxy core.

use thiserror::Error;

use crate::socks::proto::Reply;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the proxy core.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed SOCKS5 message
    #[error("malformed SOCKS5 message: {0}")]
    MalformedSocks(String),

    /// SOCKS5 command other than CONNECT
    #[error("unsupported SOCKS5 command {0:#04x}")]
    UnsupportedCommand(u8),

    /// Destination could not be resolved or reached
    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    /// No usable route to the destination network
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Transport handshake failed
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Cryptographic primitive failure
    #[error("cryptographic failure: {0}")]
    CryptoFailed(String),

    /// Peer closed the connection
    #[error("peer closed the connection")]
    PeerClosed,

    /// Network I/O error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Managed-transport configuration error
    #[error("transport configuration error: {0}")]
    PtConfig(String),
}

impl Error {
    /// Create a new malformed-SOCKS error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedSocks(msg.into())
    }

    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::HandshakeFailed(msg.into())
    }

    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::CryptoFailed(msg.into())
    }

    /// Create a new managed-transport configuration error
    pub fn pt_config(msg: impl Into<String>) -> Self {
        Error::PtConfig(msg.into())
    }

    /// SOCKS5 reply code reported when this error aborts the CONNECTING
    /// phase. Post-handshake errors never reach the SOCKS client.
    pub fn reply(&self) -> Reply {
        match self {
            Error::UnsupportedCommand(_) => Reply::CommandNotSupported,
            Error::HostUnreachable(_) => Reply::HostUnreachable,
            Error::NetworkUnreachable(_) => Reply::NetworkUnreachable,
            _ => Reply::GeneralFailure,
        }
    }
}
