//! # Listener Module
//!
//! Accept sockets: bind, listen, and hand inbound connections to
//! application handlers as opened [`SocketRef`]s.

mod tcp;

pub(crate) use tcp::TcpListener;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::socket::{HandlerResult, SocketHandler, SocketRef};
use crate::Result;

/// Application callbacks of a listener
#[allow(unused_variables)]
pub trait ListenerHandler: Send + 'static {
    fn will_listen(&mut self, ctx: &dyn ListenerContext) -> HandlerResult {
        Ok(())
    }

    fn did_listen(&mut self, ctx: &dyn ListenerContext) -> HandlerResult {
        Ok(())
    }

    /// An inbound connection is pending; call `ctx.accept` to take it
    fn do_accept(&mut self, ctx: &dyn ListenerContext) -> HandlerResult;

    fn will_close(&mut self, ctx: &dyn ListenerContext) -> HandlerResult {
        Ok(())
    }

    fn did_close(&mut self, ctx: &dyn ListenerContext) -> HandlerResult {
        Ok(())
    }
}

/// Operations a handler performs on its listener
pub trait ListenerContext: Send + Sync {
    /// Ask for one accept-readiness callback
    fn request_accept(&self);

    fn cancel_accept(&self);

    /// Take one pending connection, bind it and open it with `handler`.
    ///
    /// Returns `None` when the backlog is empty.
    fn accept(&self, handler: Box<dyn SocketHandler>) -> Result<Option<SocketRef>>;

    fn close(&self);

    fn state(&self) -> ListenerState;

    fn local_address(&self) -> Option<SocketAddr>;

    fn is_secure(&self) -> bool;
}

/// Lifecycle state of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Initial,
    Opening,
    Opened,
    Closing,
    Closed,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ListenerState::Initial => "initial",
            ListenerState::Opening => "opening",
            ListenerState::Opened => "opened",
            ListenerState::Closing => "closing",
            ListenerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Handle on a bound listener
#[derive(Clone)]
pub struct ListenerRef {
    listener: Arc<TcpListener>,
}

impl ListenerRef {
    pub(crate) fn new(listener: Arc<TcpListener>) -> Self {
        Self { listener }
    }

    /// Start listening on `addr`; false if already listening or closed
    pub fn listen(&self, addr: SocketAddr) -> Result<bool> {
        self.listener.listen(addr)
    }

    pub fn state(&self) -> ListenerState {
        self.listener.state()
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.listener.local_address()
    }

    pub fn is_secure(&self) -> bool {
        self.listener.is_secure()
    }

    pub fn close(&self) {
        ListenerContext::close(&*self.listener)
    }

    pub fn context(&self) -> &dyn ListenerContext {
        &*self.listener
    }
}

impl fmt::Debug for ListenerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRef")
            .field("state", &self.state())
            .field("local", &self.local_address())
            .field("secure", &self.is_secure())
            .finish()
    }
}
