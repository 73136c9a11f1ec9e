//! Per-method SOCKS5 listener and session orchestrator.
//!
//! A [`Socks5Server`] owns one local listener plus the set of live sessions
//! spawned from it. Shutdown is two-stage to match operator expectation:
//! [`close`](Socks5Server::close) stops accepting while existing flows
//! drain, [`close_sessions`](Socks5Server::close_sessions) tears the flows
//! down.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::session::{PeerAddr, Session, Transport};
use crate::socks::proto::{self, reply_record, DestAddr, Reply, SessionParams};
use crate::ClientConfig;

/// Factory producing one transport instance per session.
///
/// The argument carries decoded RFC 1929 fields for transports that take
/// per-session parameters; it is `None` under plain NO-AUTH negotiation.
pub type TransportFactory =
    Arc<dyn Fn(Option<SessionParams>) -> Box<dyn Transport> + Send + Sync>;

/// Everything the listener needs to know about one transport method.
pub struct TransportDescriptor {
    /// Method name, as announced to the host
    pub name: &'static str,
    /// Whether USERNAME/PASSWORD negotiation is required to carry
    /// per-session transport parameters
    pub needs_session_params: bool,
    /// Per-session transport factory
    pub factory: TransportFactory,
}

/// SOCKS5 listener for a single transport method.
///
/// Cheap to clone; clones share the listener and session set.
#[derive(Clone)]
pub struct Socks5Server {
    inner: Arc<Inner>,
}

struct Inner {
    descriptor: TransportDescriptor,
    config: ClientConfig,
    addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    stop_accept: Notify,
    sessions: Mutex<HashMap<u64, Arc<Notify>>>,
    next_id: AtomicU64,
}

/// Removes the session's registry entry when its task ends, whichever way
/// it ends. Removal is idempotent with respect to `close_session`.
struct SessionGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.inner.sessions.lock().remove(&self.id);
    }
}

impl Socks5Server {
    /// Reserve the local SOCKS5 port for this method.
    pub async fn bind(descriptor: TransportDescriptor, config: ClientConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let addr = listener.local_addr()?;

        Ok(Self {
            inner: Arc::new(Inner {
                descriptor,
                config,
                addr,
                listener: Mutex::new(Some(listener)),
                stop_accept: Notify::new(),
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// The bound address, for announcement to the host.
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// The transport method this listener serves.
    pub fn method(&self) -> &'static str {
        self.inner.descriptor.name
    }

    /// Accept connections until [`close`](Self::close) is called.
    ///
    /// Each accepted connection gets its own task for negotiation and the
    /// session splice; this loop never blocks on a client.
    pub async fn run(&self) {
        let listener = match self.inner.listener.lock().take() {
            Some(listener) => listener,
            None => return,
        };

        loop {
            tokio::select! {
                _ = self.inner.stop_accept.notified() => break,
                res = listener.accept() => match res {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(e) => {
                        tracing::warn!(method = self.method(), "accept error: {}", e);
                    }
                }
            }
        }

        // Dropping the listener releases the bound port; live sessions are
        // unaffected until close_sessions.
        tracing::info!(method = self.method(), "listener closed");
    }

    /// Stop accepting new connections. Existing sessions keep running.
    /// Idempotent.
    pub fn close(&self) {
        self.inner.stop_accept.notify_one();
    }

    /// Tear down every live session.
    pub fn close_sessions(&self) {
        let sessions: Vec<(u64, Arc<Notify>)> =
            self.inner.sessions.lock().drain().collect();
        tracing::info!(
            method = self.method(),
            "closing {} live sessions",
            sessions.len()
        );
        for (_, closed) in sessions {
            closed.notify_one();
        }
    }

    /// Tear down a single session. Idempotent; unknown ids are ignored.
    pub fn close_session(&self, id: u64) {
        if let Some(closed) = self.inner.sessions.lock().remove(&id) {
            closed.notify_one();
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let peer = PeerAddr::new(peer, inner.config.scrub_addrs);
            tracing::debug!(
                method = inner.descriptor.name,
                "SOCKS5 connection from {}",
                peer
            );
            if let Err(e) = handle_connection(Arc::clone(&inner), stream, peer).await {
                tracing::debug!("SOCKS5 connection from {} failed: {}", peer, e);
            }
        });
    }
}

/// Write a non-success reply (best effort) and hand back the error that
/// caused it.
async fn refuse(stream: &mut TcpStream, reply: Reply, err: Error) -> Error {
    let _ = stream.write_all(&reply_record(reply)).await;
    err
}

/// Negotiate, connect, and run one session to completion.
async fn handle_connection(
    inner: Arc<Inner>,
    mut stream: TcpStream,
    peer: PeerAddr,
) -> Result<()> {
    let params =
        negotiate_methods(&mut stream, inner.descriptor.needs_session_params).await?;
    let dest = read_connect_request(&mut stream).await?;

    let target = match resolve(&dest).await {
        Ok(target) => target,
        Err(e) => {
            let reply = e.reply();
            return Err(refuse(&mut stream, reply, e).await);
        }
    };

    let outgoing = match tokio::time::timeout(
        inner.config.connect_timeout,
        TcpStream::connect(target),
    )
    .await
    {
        Ok(Ok(outgoing)) => outgoing,
        Ok(Err(e)) => {
            let reply = match e.kind() {
                std::io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
                _ => Reply::GeneralFailure,
            };
            return Err(refuse(&mut stream, reply, Error::Io(e)).await);
        }
        Err(_) => {
            return Err(refuse(
                &mut stream,
                Reply::TtlExpired,
                Error::handshake("outgoing connect timed out"),
            )
            .await);
        }
    };

    stream.set_nodelay(true)?;
    outgoing.set_nodelay(true)?;

    let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
    let closed = Arc::new(Notify::new());
    inner.sessions.lock().insert(id, Arc::clone(&closed));
    let _guard = SessionGuard {
        inner: Arc::clone(&inner),
        id,
    };

    if inner.config.scrub_addrs {
        tracing::debug!(method = inner.descriptor.name, session = id, "session opened by {}", peer);
    } else {
        tracing::debug!(
            method = inner.descriptor.name,
            session = id,
            "session opened by {} toward {}",
            peer,
            dest
        );
    }

    let transport = (inner.descriptor.factory)(params);
    Session::new(
        id,
        stream,
        outgoing,
        transport,
        peer,
        closed,
        inner.config.handshake_timeout,
    )
    .run()
    .await;

    Ok(())
}

/// RFC 1928 method negotiation, plus the RFC 1929 subnegotiation when the
/// transport takes per-session parameters.
async fn negotiate_methods(
    stream: &mut TcpStream,
    needs_params: bool,
) -> Result<Option<SessionParams>> {
    let mut hdr = [0u8; 2];
    stream.read_exact(&mut hdr).await?;
    if hdr[0] != proto::VERSION {
        return Err(Error::malformed("bad version in method select"));
    }
    let nmethods = hdr[1] as usize;
    if nmethods == 0 {
        return Err(Error::malformed("empty method list"));
    }
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    let wanted = if needs_params {
        proto::AUTH_USERNAME_PASSWORD
    } else {
        proto::AUTH_NONE
    };
    if !methods.contains(&wanted) {
        let _ = stream
            .write_all(&[proto::VERSION, proto::AUTH_NO_ACCEPTABLE])
            .await;
        return Err(Error::malformed("no acceptable authentication method"));
    }
    stream.write_all(&[proto::VERSION, wanted]).await?;

    if !needs_params {
        return Ok(None);
    }

    // The decoded fields are opaque here; the transport interprets them.
    let mut hdr = [0u8; 2];
    stream.read_exact(&mut hdr).await?;
    if hdr[0] != proto::AUTH_SUBNEG_VERSION {
        return Err(Error::malformed("bad auth subnegotiation version"));
    }
    let mut username = vec![0u8; hdr[1] as usize];
    stream.read_exact(&mut username).await?;

    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut password = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut password).await?;

    stream
        .write_all(&[proto::AUTH_SUBNEG_VERSION, proto::AUTH_SUBNEG_SUCCESS])
        .await?;

    Ok(Some(SessionParams { username, password }))
}

/// Read and validate the CONNECT request, returning the destination.
async fn read_connect_request(stream: &mut TcpStream) -> Result<DestAddr> {
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    if req[0] != proto::VERSION {
        return Err(refuse(
            stream,
            Reply::GeneralFailure,
            Error::malformed("bad version in request"),
        )
        .await);
    }
    if req[1] != proto::CMD_CONNECT {
        return Err(refuse(
            stream,
            Reply::CommandNotSupported,
            Error::UnsupportedCommand(req[1]),
        )
        .await);
    }

    match req[3] {
        proto::ATYP_IPV4 => {
            let mut raw = [0u8; 6];
            stream.read_exact(&mut raw).await?;
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            let port = u16::from_be_bytes([raw[4], raw[5]]);
            Ok(DestAddr::Ip(SocketAddr::from((ip, port))))
        }
        proto::ATYP_IPV6 => {
            let mut raw = [0u8; 18];
            stream.read_exact(&mut raw).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[..16]);
            let port = u16::from_be_bytes([raw[16], raw[17]]);
            Ok(DestAddr::Ip(SocketAddr::from((Ipv6Addr::from(octets), port))))
        }
        proto::ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            if len[0] == 0 {
                return Err(refuse(
                    stream,
                    Reply::GeneralFailure,
                    Error::malformed("empty domain name"),
                )
                .await);
            }
            let mut raw = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut raw).await?;
            let port = u16::from_be_bytes([raw[len[0] as usize], raw[len[0] as usize + 1]]);
            raw.truncate(len[0] as usize);
            match String::from_utf8(raw) {
                Ok(host) => Ok(DestAddr::Domain(host, port)),
                Err(_) => Err(refuse(
                    stream,
                    Reply::GeneralFailure,
                    Error::malformed("domain name is not valid UTF-8"),
                )
                .await),
            }
        }
        other => Err(refuse(
            stream,
            Reply::AddressTypeNotSupported,
            Error::malformed(format!("unsupported address type {:#04x}", other)),
        )
        .await),
    }
}

/// Resolve the destination, preferring IPv4 results over IPv6.
async fn resolve(dest: &DestAddr) -> Result<SocketAddr> {
    match dest {
        DestAddr::Ip(addr) => Ok(*addr),
        DestAddr::Domain(host, port) => {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), *port))
                .await
                .map_err(|e| Error::HostUnreachable(format!("{}: {}", host, e)))?
                .collect();
            addrs
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| addrs.first())
                .copied()
                .ok_or_else(|| Error::HostUnreachable(host.clone()))
        }
    }
}
