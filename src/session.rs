//! Per-session state machine and splice driver.
//!
//! A [`Session`] owns the two endpoints of one bridged connection: the
//! incoming stream from the local SOCKS client and the outgoing stream to
//! the remote bridge. The concrete obfuscation logic lives behind the
//! [`Transport`] hook set; the driver here delivers readable bytes into the
//! hooks, flushes whatever they queue, and enforces the state machine:
//!
//! ```text
//! INVALID → CONNECTING → ESTABLISHED → FLUSHING_* → CLOSED
//! ```
//!
//! Transitions are monotonic except that any state may move to CLOSED.
//! Hooks are synchronous and non-blocking; each session runs on exactly one
//! task, so hooks are never re-entered and need no locking.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::socks::proto::{reply_record, Reply};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not yet attached to an outgoing connection
    Invalid,
    /// Outgoing TCP established, transport handshake in progress
    Connecting,
    /// Handshake complete, payload splice running
    Established,
    /// Draining queued bytes toward the SOCKS client before closing
    FlushingIncoming,
    /// Draining queued bytes toward the bridge before closing
    FlushingOutgoing,
    /// Torn down
    Closed,
}

/// Hooks a concrete transport implements.
///
/// `incoming` is always the SOCKS client side, `outgoing` the bridge side.
/// A hook returning an error while the session is CONNECTING produces the
/// mapped non-success SOCKS5 reply and a close; after the handshake it
/// closes the session silently.
pub trait Transport: Send {
    /// Called exactly once, after the outgoing TCP connect succeeds and
    /// strictly before any `on_outgoing_data*` hook. Transports without a
    /// handshake may call [`SessionIo::send_socks5_response`] directly.
    fn on_outgoing_connected(&mut self, io: &mut SessionIo) -> Result<()>;

    /// Called while CONNECTING whenever new bytes arrive from the bridge.
    /// May be invoked with a partial handshake; implementations consume no
    /// more than they need and return `Ok` to wait for more.
    fn on_outgoing_data_connecting(&mut self, io: &mut SessionIo) -> Result<()>;

    /// Called while ESTABLISHED for bytes from the bridge.
    fn on_outgoing_data(&mut self, io: &mut SessionIo) -> Result<()>;

    /// Called while ESTABLISHED for bytes from the SOCKS client.
    fn on_incoming_data(&mut self, io: &mut SessionIo) -> Result<()>;

    /// Called when the client-directed write queue drains to empty.
    fn on_incoming_drained(&mut self, _io: &mut SessionIo) -> Result<()> {
        Ok(())
    }

    /// Called when the bridge-directed write queue drains to empty.
    fn on_outgoing_drained(&mut self, _io: &mut SessionIo) -> Result<()> {
        Ok(())
    }
}

/// Buffered I/O surface handed to transport hooks.
///
/// Read queues hold bytes received but not yet consumed by the transport;
/// write queues hold bytes the transport produced, flushed by the driver
/// after the hook returns. Buffers are owned by the session and never
/// aliased.
pub struct SessionIo {
    state: State,
    incoming_rd: BytesMut,
    outgoing_rd: BytesMut,
    incoming_wr: BytesMut,
    outgoing_wr: BytesMut,
    reply: Option<Reply>,
}

impl SessionIo {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Invalid,
            incoming_rd: BytesMut::new(),
            outgoing_rd: BytesMut::new(),
            incoming_wr: BytesMut::new(),
            outgoing_wr: BytesMut::new(),
            reply: None,
        }
    }

    /// Current session state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Bytes received from the SOCKS client, awaiting the transport.
    pub fn incoming_buf(&mut self) -> &mut BytesMut {
        &mut self.incoming_rd
    }

    /// Bytes received from the bridge, awaiting the transport.
    pub fn outgoing_buf(&mut self) -> &mut BytesMut {
        &mut self.outgoing_rd
    }

    /// Queue bytes for delivery to the SOCKS client.
    pub fn write_incoming(&mut self, data: &[u8]) {
        self.incoming_wr.extend_from_slice(data);
    }

    /// Queue bytes for delivery to the bridge.
    pub fn write_outgoing(&mut self, data: &[u8]) {
        self.outgoing_wr.extend_from_slice(data);
    }

    /// Emit the SOCKS5 reply record toward the client.
    ///
    /// On [`Reply::Succeeded`] the session transitions to ESTABLISHED; any
    /// other reply arranges a flush-then-close. At most one reply is ever
    /// sent per session; later calls are ignored.
    ///
    /// Returns `true` iff the reply was `Succeeded`.
    pub fn send_socks5_response(&mut self, reply: Reply) -> bool {
        if self.reply.is_some() {
            tracing::warn!("suppressing duplicate SOCKS5 reply {:?}", reply);
            return false;
        }
        self.reply = Some(reply);
        self.incoming_wr.extend_from_slice(&reply_record(reply));
        if reply == Reply::Succeeded {
            self.state = State::Established;
            true
        } else {
            self.state = State::FlushingIncoming;
            false
        }
    }

    fn reply_sent(&self) -> bool {
        self.reply.is_some()
    }

    #[cfg(test)]
    pub(crate) fn take_queued_incoming(&mut self) -> BytesMut {
        self.incoming_wr.split()
    }

    #[cfg(test)]
    pub(crate) fn take_queued_outgoing(&mut self) -> BytesMut {
        self.outgoing_wr.split()
    }
}

/// Peer address formatter honoring the scrub flag.
///
/// When scrubbing is enabled the address renders as a stable placeholder so
/// log lines stay correlatable without recording who connected.
#[derive(Clone, Copy, Debug)]
pub struct PeerAddr {
    addr: SocketAddr,
    scrub: bool,
}

impl PeerAddr {
    /// Wrap a peer address; `scrub` controls whether it may appear in logs.
    pub fn new(addr: SocketAddr, scrub: bool) -> Self {
        Self { addr, scrub }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scrub {
            f.write_str("[scrubbed]")
        } else {
            self.addr.fmt(f)
        }
    }
}

/// One end-to-end bridged connection.
pub struct Session {
    id: u64,
    io: SessionIo,
    incoming: TcpStream,
    outgoing: TcpStream,
    transport: Box<dyn Transport>,
    peer: PeerAddr,
    closed: Arc<Notify>,
    handshake_timeout: Duration,
}

impl Session {
    /// Assemble a session around a connected endpoint pair.
    ///
    /// `closed` is the server's close handle; notifying it tears the
    /// session down at its next suspension point.
    pub(crate) fn new(
        id: u64,
        incoming: TcpStream,
        outgoing: TcpStream,
        transport: Box<dyn Transport>,
        peer: PeerAddr,
        closed: Arc<Notify>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            id,
            io: SessionIo::new(),
            incoming,
            outgoing,
            transport,
            peer,
            closed,
            handshake_timeout,
        }
    }

    /// Drive the session to completion.
    ///
    /// Consumes the session; endpoints and cipher state are released when
    /// this returns, and keying material zeroizes on drop.
    pub async fn run(mut self) {
        match self.drive().await {
            Ok(()) => {
                tracing::debug!(session = self.id, "session with {} done", self.peer);
            }
            Err(e) => {
                // A handshake-phase failure still owes the client a reply.
                if !self.io.reply_sent()
                    && matches!(self.io.state, State::Invalid | State::Connecting)
                {
                    self.io.send_socks5_response(e.reply());
                    let _ = self.flush().await;
                }
                tracing::debug!(session = self.id, "session with {} failed: {}", self.peer, e);
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        self.io.state = State::Connecting;
        let handshake_deadline = tokio::time::Instant::now() + self.handshake_timeout;

        self.transport.on_outgoing_connected(&mut self.io)?;

        loop {
            self.flush().await?;
            match self.io.state {
                State::FlushingIncoming | State::FlushingOutgoing | State::Closed => break,
                _ => {}
            }

            tokio::select! {
                _ = self.closed.notified() => {
                    self.io.state = State::Closed;
                    break;
                }
                _ = tokio::time::sleep_until(handshake_deadline),
                    if self.io.state == State::Connecting =>
                {
                    return Err(Error::handshake("timed out"));
                }
                res = self.incoming.read_buf(&mut self.io.incoming_rd) => {
                    if res? == 0 {
                        // Client went away; push out what the bridge is owed.
                        if self.io.state == State::Connecting {
                            self.io.state = State::Closed;
                        } else {
                            self.io.state = State::FlushingOutgoing;
                        }
                        break;
                    }
                    // Bytes arriving while CONNECTING stay queued until the
                    // handshake completes.
                    if self.io.state == State::Established {
                        self.transport.on_incoming_data(&mut self.io)?;
                    }
                }
                res = self.outgoing.read_buf(&mut self.io.outgoing_rd) => {
                    if res? == 0 {
                        if self.io.state == State::Connecting {
                            return Err(Error::handshake("bridge closed during handshake"));
                        }
                        self.io.state = State::FlushingIncoming;
                        break;
                    }
                    match self.io.state {
                        State::Connecting => {
                            self.transport.on_outgoing_data_connecting(&mut self.io)?;
                            // Bytes that rode in behind the handshake tail,
                            // in either direction, belong to the splice.
                            if self.io.state == State::Established {
                                if !self.io.outgoing_rd.is_empty() {
                                    self.transport.on_outgoing_data(&mut self.io)?;
                                }
                                if !self.io.incoming_rd.is_empty() {
                                    self.transport.on_incoming_data(&mut self.io)?;
                                }
                            }
                        }
                        State::Established => {
                            self.transport.on_outgoing_data(&mut self.io)?;
                        }
                        _ => {}
                    }
                }
            }
        }

        self.flush().await?;
        Ok(())
    }

    /// Flush both write queues, firing the drained hooks for queues that
    /// went from non-empty to empty. Loops until the hooks stop producing.
    async fn flush(&mut self) -> Result<()> {
        loop {
            if self.io.outgoing_wr.is_empty() && self.io.incoming_wr.is_empty() {
                return Ok(());
            }
            if !self.io.outgoing_wr.is_empty() {
                let buf = self.io.outgoing_wr.split();
                self.outgoing.write_all(&buf).await?;
                self.transport.on_outgoing_drained(&mut self.io)?;
            }
            if !self.io.incoming_wr.is_empty() {
                let buf = self.io.incoming_wr.split();
                self.incoming.write_all(&buf).await?;
                self.transport.on_incoming_drained(&mut self.io)?;
            }
        }
    }
}
