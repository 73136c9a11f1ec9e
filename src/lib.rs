//! # obfsclient
//!
//! A client-side pluggable transport proxy. One local SOCKS5 listener is
//! exposed per obfuscation method; each accepted connection is bridged,
//! through the obfuscation layer, to the remote bridge address the client
//! names as the SOCKS5 destination. The censor-observable TCP stream to the
//! bridge looks like uniformly random bytes while ordered byte-stream
//! semantics are preserved end to end.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  SOCKS5   ┌──────────────────────────┐  obfuscated  ┌────────┐
//! │ local client ├──────────►│ per-session state machine├─────────────►│ bridge │
//! │  (e.g. Tor)  │◄──────────┤ negotiate / handshake /  │◄─────────────┤        │
//! └──────────────┘           │ cipher splice            │              └────────┘
//!                            └──────────────────────────┘
//! ```
//!
//! The obfs2 transport ("The Twobfuscator") is wired in. Further transports
//! implement the same session hook set ([`session::Transport`]) and register
//! through the listener's transport table.
//!
//! This proxy only runs as a client; it speaks the managed-transport
//! environment protocol to its host (see [`pt`]).

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod crypto;
pub mod error;
pub mod obfs2;
pub mod pt;
pub mod session;
pub mod socks;

pub use error::{Error, Result};

use std::net::SocketAddr;
use std::time::Duration;

/// Default timeout for the outgoing TCP connect (milliseconds).
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default timeout for the transport handshake (milliseconds).
pub const HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

/// Per-listener client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local SOCKS5 bind address; port 0 picks an ephemeral port
    pub bind_addr: SocketAddr,
    /// Replace peer addresses in logs with a stable placeholder
    pub scrub_addrs: bool,
    /// Outgoing TCP connect timeout
    pub connect_timeout: Duration,
    /// Transport handshake timeout
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            scrub_addrs: true,
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ClientConfig::default();
        assert!(config.bind_addr.ip().is_loopback());
        assert_eq!(config.bind_addr.port(), 0);
        assert!(config.scrub_addrs);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }
}
