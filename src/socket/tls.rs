//! TLS layer over the TCP state machine
//!
//! A rustls [`Connection`] is consulted before and after every raw byte
//! operation. Ciphertext moves between the channel and the engine through
//! two fixed network buffers sized for the largest TLS record.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::{ClientConfig, ClientConnection, Connection, ProtocolVersion, ServerConfig, ServerConnection};
use tracing::{debug, trace, warn};

use crate::consts;
use crate::flow::FlowContext;
use crate::transport::{tls::server_name, TlsSettings, TransportContext};
use crate::{NetError, Result};
use super::status::{INBOUND_SHUT, OUTBOUND_SHUT};
use super::tcp::{would_block, TcpSocket};
use super::SocketContext;

/// Largest plaintext fragment wrapped per write
const MAX_PLAINTEXT: usize = 16 * 1024;

/// Fixed-capacity ciphertext buffer
struct NetBuffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl NetBuffer {
    fn new() -> Self {
        Self {
            data: vec![0u8; consts::TLS_PACKET_BUFFER_SIZE].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn is_full(&self) -> bool {
        self.start == 0 && self.end == self.data.len()
    }

    fn readable(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }

    /// Append bytes produced by `f` into the free tail
    fn fill<F>(&mut self, f: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        self.compact();
        let n = f(&mut self.data[self.end..])?;
        self.end += n;
        Ok(n)
    }

    fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }
}

/// Derived handshake state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeStatus {
    NotHandshaking,
    Finished,
    NeedTask,
    NeedWrap,
    NeedUnwrap,
}

/// Where a handshake pass stopped
#[derive(Debug)]
enum Progress {
    WantRead,
    WantWrite,
    Finished,
    Idle,
    Failed(NetError),
}

enum Fill {
    Fed,
    Blocked,
    Eof,
}

enum Unwrapped {
    Data(usize),
    Blocked,
    Eof,
}

struct Session {
    conn: Option<Connection>,
    inbound: NetBuffer,
    outbound: NetBuffer,
    plaintext: usize,
    unprocessed: bool,
    finished: bool,
    inbound_closed: bool,
    outbound_closing: bool,
}

impl Session {
    fn status(&mut self) -> HandshakeStatus {
        let Some(conn) = self.conn.as_ref() else {
            return HandshakeStatus::NotHandshaking;
        };
        if conn.wants_write() || !self.outbound.is_empty() {
            HandshakeStatus::NeedWrap
        } else if self.unprocessed {
            HandshakeStatus::NeedTask
        } else if conn.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else if !self.finished {
            self.finished = true;
            HandshakeStatus::Finished
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    /// Encrypt pending records into the send buffer and write them out.
    ///
    /// Returns false if the channel stopped accepting bytes first.
    fn wrap_and_flush(&mut self, socket: &TcpSocket) -> io::Result<bool> {
        loop {
            if let Some(conn) = self.conn.as_mut() {
                while conn.wants_write() && !self.outbound.is_full() {
                    let n = self.outbound.fill(|mut free| conn.write_tls(&mut free))?;
                    if n == 0 {
                        break;
                    }
                }
            }
            if self.outbound.is_empty() {
                return Ok(true);
            }
            let outbound = &self.outbound;
            match socket.with_channel(|mut stream| stream.write(outbound.readable())) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => self.outbound.consume(n),
                Err(e) if would_block(&e) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }

    /// Move ciphertext from the channel into the engine
    fn feed(&mut self, socket: &TcpSocket) -> Result<Fill> {
        let conn = self.conn.as_mut().ok_or(NetError::ConnectionClosed)?;
        if self.inbound.is_empty() {
            match self.inbound.fill(|free| socket.with_channel(|mut stream| stream.read(free))) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(_) => {}
                Err(e) if would_block(&e) => return Ok(Fill::Blocked),
                Err(e) => return Err(e.into()),
            }
        }
        let mut src = self.inbound.readable();
        let n = conn.read_tls(&mut src).map_err(|_| NetError::BufferOverflow)?;
        self.inbound.consume(n);
        self.unprocessed = true;
        Ok(Fill::Fed)
    }

    /// Run the engine over fed ciphertext; certificate checks happen here
    fn process(&mut self) -> Result<()> {
        self.unprocessed = false;
        let conn = self.conn.as_mut().ok_or(NetError::ConnectionClosed)?;
        let state = conn.process_new_packets()?;
        self.plaintext = state.plaintext_bytes_to_read();
        if state.peer_has_closed() {
            self.inbound_closed = true;
        }
        Ok(())
    }

    /// Check if input can be consumed without new bytes from the channel
    fn has_input(&self) -> bool {
        self.plaintext > 0 || !self.inbound.is_empty()
    }

    /// Flush alerts or close_notify when the outcome no longer matters
    fn flush_quietly(&mut self, socket: &TcpSocket) {
        if let Err(e) = self.wrap_and_flush(socket) {
            trace!("TLS flush failed: {}", e);
        }
    }
}

/// Configuration a session is created from
pub(crate) enum TlsRole {
    Client {
        config: Arc<ClientConfig>,
        settings: TlsSettings,
    },
    Server {
        config: Arc<ServerConfig>,
    },
}

/// Handshake engine and record layer of one secure socket
pub(crate) struct TlsEngine {
    role: TlsRole,
    session: Mutex<Session>,
    buffered: AtomicBool,
    pending: AtomicBool,
}

impl TlsEngine {
    pub(crate) fn client(settings: &TlsSettings) -> Result<Self> {
        let config = settings.client_config()?;
        Ok(Self::new(TlsRole::Client {
            config,
            settings: settings.clone(),
        }))
    }

    pub(crate) fn server(config: Arc<ServerConfig>) -> Self {
        Self::new(TlsRole::Server { config })
    }

    fn new(role: TlsRole) -> Self {
        Self {
            role,
            session: Mutex::new(Session {
                conn: None,
                inbound: NetBuffer::new(),
                outbound: NetBuffer::new(),
                plaintext: 0,
                unprocessed: false,
                finished: false,
                inbound_closed: false,
                outbound_closing: false,
            }),
            buffered: AtomicBool::new(false),
            pending: AtomicBool::new(false),
        }
    }

    /// Check if decrypted bytes or unread ciphertext wait in the engine
    pub(super) fn has_buffered(&self) -> bool {
        self.buffered.load(Ordering::Acquire)
    }

    /// Check if ciphertext waits for write readiness
    pub(super) fn has_pending_output(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Publish whether a read can make progress without channel readiness
    fn settle(&self, session: &Session) {
        self.buffered.store(session.has_input(), Ordering::Release);
    }

    fn connection(&self, socket: &TcpSocket) -> Result<Connection> {
        match &self.role {
            TlsRole::Server { config } => Ok(ServerConnection::new(Arc::clone(config))?.into()),
            TlsRole::Client { config, settings } => {
                let remote = socket.remote_address().ok_or(NetError::ConnectionClosed)?;
                let name = server_name(settings, remote.ip())?;
                Ok(ClientConnection::new(Arc::clone(config), name)?.into())
            }
        }
    }

    /// Create the session and start handshaking
    pub(super) fn begin(&self, socket: &TcpSocket) {
        match self.connection(socket) {
            Ok(conn) => {
                self.session.lock().conn = Some(conn);
                self.drive_handshake(socket);
            }
            Err(e) => {
                warn!("Failed to create TLS session: {}", e);
                socket.close();
            }
        }
    }

    /// Advance the handshake as far as current readiness allows
    pub(super) fn drive_handshake(&self, socket: &TcpSocket) {
        let progress = {
            let mut session = self.session.lock();
            let progress = self.handshake(&mut session, socket);
            self.settle(&session);
            progress
        };
        match progress {
            Progress::WantRead => socket.transport().request_read(),
            Progress::WantWrite => socket.transport().request_write(),
            Progress::Finished => {
                debug!(protocol = ?self.protocol(), suite = ?self.cipher_suite(), "TLS handshake finished");
                socket.request_open();
            }
            Progress::Idle => {}
            Progress::Failed(e) => {
                warn!(remote = ?socket.remote_address(), "TLS handshake failed: {}", e);
                socket.close();
            }
        }
    }

    fn handshake(&self, session: &mut Session, socket: &TcpSocket) -> Progress {
        loop {
            let status = session.status();
            trace!(?status, "handshake");
            match status {
                HandshakeStatus::NeedWrap => match session.wrap_and_flush(socket) {
                    Ok(true) => continue,
                    Ok(false) => return Progress::WantWrite,
                    Err(e) => return Progress::Failed(e.into()),
                },
                HandshakeStatus::NeedTask => {
                    if let Err(e) = session.process() {
                        session.flush_quietly(socket);
                        return Progress::Failed(e);
                    }
                }
                HandshakeStatus::NeedUnwrap => match session.feed(socket) {
                    Ok(Fill::Fed) => continue,
                    Ok(Fill::Blocked) => return Progress::WantRead,
                    Ok(Fill::Eof) => return Progress::Failed(NetError::ConnectionClosed),
                    Err(e) => return Progress::Failed(e),
                },
                HandshakeStatus::Finished => return Progress::Finished,
                HandshakeStatus::NotHandshaking => return Progress::Idle,
            }
        }
    }

    /// Decrypt into `buf`, pulling ciphertext from the channel as needed
    fn unwrap_into(&self, session: &mut Session, socket: &TcpSocket, buf: &mut [u8]) -> Result<Unwrapped> {
        loop {
            let conn = session.conn.as_mut().ok_or(NetError::ConnectionClosed)?;
            match conn.reader().read(buf) {
                Ok(0) => {
                    session.inbound_closed = true;
                    return Ok(Unwrapped::Eof);
                }
                Ok(n) => {
                    session.plaintext = session.plaintext.saturating_sub(n);
                    return Ok(Unwrapped::Data(n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    session.inbound_closed = true;
                    return Ok(Unwrapped::Eof);
                }
                Err(e) => return Err(e.into()),
            }
            session.plaintext = 0;
            if session.inbound_closed {
                return Ok(Unwrapped::Eof);
            }
            match session.feed(socket)? {
                Fill::Fed => {
                    if let Err(e) = session.process() {
                        session.flush_quietly(socket);
                        return Err(e);
                    }
                    // post-handshake messages may need an answer
                    if !session.wrap_and_flush(socket)? {
                        self.pending.store(true, Ordering::Release);
                    }
                }
                Fill::Blocked => return Ok(Unwrapped::Blocked),
                Fill::Eof => {
                    session.inbound_closed = true;
                    return Ok(Unwrapped::Eof);
                }
            }
        }
    }

    pub(super) fn read(&self, socket: &TcpSocket, buf: &mut [u8]) -> Result<Option<usize>> {
        if buf.is_empty() {
            return Ok(Some(0));
        }
        let outcome = {
            let mut session = self.session.lock();
            let outcome = self.unwrap_into(&mut session, socket, buf);
            self.settle(&session);
            outcome
        };
        if self.has_pending_output() {
            socket.transport().request_write();
        }
        match outcome? {
            Unwrapped::Data(n) => Ok(Some(n)),
            Unwrapped::Blocked => Ok(Some(0)),
            Unwrapped::Eof => {
                trace!("TLS end of stream");
                socket.done_reading();
                Ok(None)
            }
        }
    }

    pub(super) fn write(&self, socket: &TcpSocket, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (written, flushed) = {
            let mut session = self.session.lock();
            if session.outbound_closing {
                return Err(NetError::ConnectionClosed);
            }
            if !session.wrap_and_flush(socket)? {
                (0, false)
            } else {
                let conn = session.conn.as_mut().ok_or(NetError::ConnectionClosed)?;
                let chunk = &buf[..buf.len().min(MAX_PLAINTEXT)];
                let written = conn.writer().write(chunk)?;
                (written, session.wrap_and_flush(socket)?)
            }
        };
        self.pending.store(!flushed, Ordering::Release);
        if !flushed {
            socket.transport().request_write();
        }
        Ok(written)
    }

    /// Write out buffered ciphertext; false if write readiness was re-requested
    pub(super) fn flush(&self, socket: &TcpSocket) -> bool {
        let result = self.session.lock().wrap_and_flush(socket);
        match result {
            Ok(true) => {
                self.pending.store(false, Ordering::Release);
                true
            }
            Ok(false) => {
                self.pending.store(true, Ordering::Release);
                socket.transport().request_write();
                false
            }
            Err(e) => {
                debug!("TLS flush failed: {}", e);
                socket.close();
                false
            }
        }
    }

    /// Queue close_notify, then shut the outbound side once it is written
    pub(super) fn close_outbound(&self, socket: &TcpSocket) {
        {
            let mut session = self.session.lock();
            if !session.outbound_closing {
                session.outbound_closing = true;
                if let Some(conn) = session.conn.as_mut() {
                    conn.send_close_notify();
                }
            }
        }
        self.closing_write(socket);
    }

    pub(super) fn closing_write(&self, socket: &TcpSocket) {
        if !self.flush(socket) || socket.status() & OUTBOUND_SHUT != 0 {
            return;
        }
        socket.shutdown(Shutdown::Write);
        let inbound_closed = self.session.lock().inbound_closed;
        if inbound_closed {
            socket.shutdown(Shutdown::Read);
            socket.shut(INBOUND_SHUT);
        } else {
            socket.mark_done_reading();
            socket.forward_read();
        }
        socket.shut(OUTBOUND_SHUT);
    }

    /// Inbound side done: answer with close_notify and drain the peer's
    pub(super) fn close_inbound(&self, socket: &TcpSocket) {
        let inbound_closed = self.session.lock().inbound_closed;
        if inbound_closed {
            socket.shutdown(Shutdown::Read);
            socket.shut(INBOUND_SHUT);
        } else {
            socket.forward_read();
        }
        socket.done_writing();
    }

    /// Discard inbound records until the peer's close_notify or end of stream
    pub(super) fn closing_read(&self, socket: &TcpSocket) {
        let mut scratch = [0u8; consts::DISCARD_BUFFER_SIZE];
        let outcome = {
            let mut session = self.session.lock();
            let outcome = loop {
                match self.unwrap_into(&mut session, socket, &mut scratch) {
                    Ok(Unwrapped::Data(_)) => continue,
                    Ok(Unwrapped::Blocked) => break Ok(false),
                    Ok(Unwrapped::Eof) => break Ok(true),
                    Err(e) => break Err(e),
                }
            };
            self.settle(&session);
            outcome
        };
        match outcome {
            Ok(true) => {
                socket.shutdown(Shutdown::Read);
                socket.shut(INBOUND_SHUT);
            }
            Ok(false) => socket.transport().request_read(),
            Err(e) => {
                debug!("TLS closing read failed: {}", e);
                socket.close();
            }
        }
    }

    /// Best-effort close_notify, then drop session state
    pub(super) fn release(&self, socket: &TcpSocket) {
        let mut session = self.session.lock();
        if !session.outbound_closing {
            session.outbound_closing = true;
            if let Some(conn) = session.conn.as_mut() {
                conn.send_close_notify();
                session.flush_quietly(socket);
            }
        }
        session.inbound.clear();
        session.outbound.clear();
        session.plaintext = 0;
        self.buffered.store(false, Ordering::Release);
        self.pending.store(false, Ordering::Release);
    }

    pub(super) fn protocol(&self) -> Option<String> {
        let session = self.session.lock();
        let version = session.conn.as_ref()?.protocol_version()?;
        Some(match version {
            ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
            ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
            other => format!("{:?}", other),
        })
    }

    pub(super) fn cipher_suite(&self) -> Option<String> {
        let session = self.session.lock();
        let suite = session.conn.as_ref()?.negotiated_cipher_suite()?;
        Some(format!("{:?}", suite.suite()))
    }
}
