//! SOCKS5 front-end.
//!
//! One listener per transport method. Each accepted connection is negotiated
//! per RFC 1928 (plus RFC 1929 when the transport takes per-session
//! parameters), the destination is resolved and connected, and the two
//! endpoints are handed to a transport session for the splice.

pub mod proto;

mod listener;

pub use listener::{Socks5Server, TransportDescriptor, TransportFactory};
