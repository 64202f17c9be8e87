//! # Socket Module
//!
//! Connection-oriented byte-stream transports.
//!
//! ## Components
//!
//! - **SocketHandler**: application callbacks invoked at lifecycle points
//! - **SocketContext**: operations a handler performs on its socket
//! - **SocketRef**: owning handle returned by the driver and listeners
//! - **TcpSocket**: the reader/writer state machine (`tcp.rs`)
//! - **TlsEngine**: handshake and record layer over the plain stream (`tls.rs`)

pub(crate) mod status;
mod tcp;
mod tls;

pub(crate) use tcp::TcpSocket;
pub(crate) use tls::TlsEngine;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::flow::{FlowContext, FlowControl};
use crate::Result;

/// Result of a handler callback; an error closes the socket
pub type HandlerResult = anyhow::Result<()>;

/// Application callbacks of a socket.
///
/// Every callback runs on one of the socket's two lanes: `do_write` on the
/// writer, everything else on the reader.
#[allow(unused_variables)]
pub trait SocketHandler: Send + 'static {
    /// Idle timeout in milliseconds: negative uses the selector default, 0 never expires
    fn idle_timeout(&self) -> i64 {
        -1
    }

    fn will_connect(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
        Ok(())
    }

    fn will_open(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
        Ok(())
    }

    fn did_open(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
        Ok(())
    }

    /// Read readiness after `request_read` or `trigger_read`
    fn do_read(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
        Ok(())
    }

    /// Write readiness after `request_write` or `trigger_write`
    fn do_write(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
        Ok(())
    }

    /// Called on the outgoing handler before a `become` swap
    fn will_become(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
        Ok(())
    }

    /// Called on the incoming handler after a `become` swap
    fn did_become(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
        Ok(())
    }

    /// Idle timeout expired; closes the socket unless overridden
    fn do_timeout(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
        ctx.close();
        Ok(())
    }

    fn will_close(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
        Ok(())
    }

    fn did_close(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
        Ok(())
    }
}

/// Operations a handler performs on its socket
pub trait SocketContext: FlowContext {
    /// Read available bytes; `None` at end of stream
    fn read(&self, buf: &mut [u8]) -> Result<Option<usize>>;

    /// Write as many bytes as the channel accepts without blocking
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Replace the handler; the swap happens on the reader lane
    fn become_handler(&self, handler: Box<dyn SocketHandler>);

    /// Request close; idempotent
    fn close(&self);

    fn state(&self) -> SocketState;

    fn local_address(&self) -> Option<SocketAddr>;

    fn remote_address(&self) -> Option<SocketAddr>;

    fn is_secure(&self) -> bool;

    /// Negotiated protocol version, e.g. "TLSv1.3"
    fn tls_protocol(&self) -> Result<Option<String>>;

    /// Negotiated cipher suite, e.g. "TLS13_AES_128_GCM_SHA256"
    fn tls_cipher_suite(&self) -> Result<Option<String>>;
}

/// Lifecycle state of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Initial,
    Connecting,
    Opening,
    Opened,
    Closing,
    Closed,
}

impl SocketState {
    pub fn is_open(self) -> bool {
        self == SocketState::Opened
    }

    pub fn is_closed(self) -> bool {
        self == SocketState::Closed
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SocketState::Initial => "initial",
            SocketState::Connecting => "connecting",
            SocketState::Opening => "opening",
            SocketState::Opened => "opened",
            SocketState::Closing => "closing",
            SocketState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Handle on a bound socket
#[derive(Clone)]
pub struct SocketRef {
    socket: Arc<TcpSocket>,
}

impl SocketRef {
    pub(crate) fn new(socket: Arc<TcpSocket>) -> Self {
        Self { socket }
    }

    /// Start connecting to `addr`.
    ///
    /// Returns false if the socket already connected, was accepted or is
    /// closing; fails with `Unbound` if the socket lost its selector.
    pub fn connect(&self, addr: SocketAddr) -> Result<bool> {
        self.socket.connect(addr)
    }

    pub fn state(&self) -> SocketState {
        SocketContext::state(&*self.socket)
    }

    pub fn close(&self) {
        SocketContext::close(&*self.socket)
    }

    pub fn become_handler(&self, handler: Box<dyn SocketHandler>) {
        self.socket.become_handler(handler)
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.socket.local_address()
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.socket.remote_address()
    }

    pub fn is_secure(&self) -> bool {
        self.socket.is_secure()
    }

    /// Context view for operating the socket outside its callbacks
    pub fn context(&self) -> &dyn SocketContext {
        &*self.socket
    }

    pub fn flow_control(&self) -> FlowControl {
        self.socket.flow_control()
    }
}

impl fmt::Debug for SocketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketRef")
            .field("state", &self.state())
            .field("remote", &self.remote_address())
            .field("secure", &self.is_secure())
            .finish()
    }
}

