//! Listener state machine driven by a single acceptor lane

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use mio::net::TcpListener as MioListener;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, RwLock};
use rustls::ServerConfig;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::selector::{Selector, TransportRef};
use crate::socket::{SocketHandler, SocketRef, TcpSocket, TlsEngine};
use crate::task::{Executor, TaskCell};
use crate::transport::{TcpSettings, Transport, TransportContext};
use crate::util::{display_address, StatusWord};
use crate::{NetError, Result};
use super::{HandlerResult, ListenerContext, ListenerHandler, ListenerState};

const INITIAL_STATE: u32 = 0;
const OPENING_STATE: u32 = 1;
const OPENED_STATE: u32 = 2;
const CLOSING_STATE: u32 = 3;
const CLOSED_STATE: u32 = 4;
const STATE_MASK: u32 = 0x7;

const OPEN_REQUEST: u32 = 1 << 3;
const ACCEPT_REQUEST: u32 = 1 << 4;
const CLOSE_REQUEST: u32 = 1 << 5;
const ACCEPT_READY: u32 = 1 << 6;

static UNBOUND: Lazy<TransportRef> = Lazy::new(TransportRef::unbound);

fn state_of(status: u32) -> ListenerState {
    match status & STATE_MASK {
        OPENING_STATE => ListenerState::Opening,
        OPENED_STATE => ListenerState::Opened,
        CLOSING_STATE => ListenerState::Closing,
        CLOSED_STATE => ListenerState::Closed,
        _ => ListenerState::Initial,
    }
}

fn with_state(status: u32, state: u32) -> u32 {
    (status & !STATE_MASK) | state
}

/// Accept errors after which the listener keeps going
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}

/// Bind a non-blocking listening socket
fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<MioListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(MioListener::from_std(socket.into()))
}

pub(crate) struct TcpListener {
    status: StatusWord,
    acceptor: Arc<TaskCell<TcpListener>>,
    transport: OnceCell<TransportRef>,
    channel: RwLock<Option<MioListener>>,
    handler: Mutex<Box<dyn ListenerHandler>>,
    bind_address: Mutex<Option<SocketAddr>>,
    local: Mutex<Option<SocketAddr>>,
    settings: TcpSettings,
    tls: Option<Arc<ServerConfig>>,
    selector: Weak<Selector>,
    executor: Arc<dyn Executor>,
}

impl TcpListener {
    pub(crate) fn new(
        handler: Box<dyn ListenerHandler>,
        settings: TcpSettings,
        tls: Option<Arc<ServerConfig>>,
        selector: &Arc<Selector>,
        executor: Arc<dyn Executor>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<TcpListener>| Self {
            status: StatusWord::new(INITIAL_STATE),
            acceptor: TaskCell::new(me.clone(), TcpListener::run_acceptor, Arc::clone(&executor)),
            transport: OnceCell::new(),
            channel: RwLock::new(None),
            handler: Mutex::new(handler),
            bind_address: Mutex::new(None),
            local: Mutex::new(None),
            settings,
            tls,
            selector: Arc::downgrade(selector),
            executor,
        })
    }

    /// Register with the selector this listener was created for
    pub(crate) fn bind(self: &Arc<Self>) -> Result<()> {
        let selector = self.selector.upgrade().ok_or(NetError::Unbound)?;
        let transport = selector.bind_transport(Arc::clone(self) as Arc<dyn Transport>)?;
        if self.transport.set(transport).is_err() {
            trace!("Listener bound twice, keeping first registration");
        }
        Ok(())
    }

    fn transport(&self) -> &TransportRef {
        self.transport.get().unwrap_or(&UNBOUND)
    }

    fn address(&self) -> String {
        let local = *self.local.lock();
        display_address(local.or(*self.bind_address.lock()))
    }

    pub(crate) fn listen(&self, addr: SocketAddr) -> Result<bool> {
        if !self.transport().is_bound() {
            return Err(NetError::Unbound);
        }
        let mut bind_address = self.bind_address.lock();
        let accepted = self
            .status
            .transition(|s| {
                let idle = s & STATE_MASK == INITIAL_STATE && s & (OPEN_REQUEST | CLOSE_REQUEST) == 0;
                idle.then(|| s | OPEN_REQUEST)
            })
            .is_some();
        if accepted {
            *bind_address = Some(addr);
        }
        drop(bind_address);
        if accepted {
            self.acceptor.cue();
        }
        Ok(accepted)
    }

    /// Run a handler callback; an error is logged and closes the listener
    fn invoke<F>(&self, callback: &'static str, f: F) -> bool
    where
        F: FnOnce(&mut dyn ListenerHandler, &dyn ListenerContext) -> HandlerResult,
    {
        let result = {
            let mut handler = self.handler.lock();
            f(handler.as_mut(), self)
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(local = %self.address(), "Listener {} failed: {:#}", callback, e);
                ListenerContext::close(self);
                false
            }
        }
    }

    fn run_acceptor(&self) {
        loop {
            let s = self.status.load();
            if s & CLOSE_REQUEST != 0 {
                if s & STATE_MASK != CLOSED_STATE {
                    self.acceptor_close();
                    continue;
                }
                return;
            }
            if s & OPEN_REQUEST != 0 {
                self.acceptor_open();
            } else if s & ACCEPT_READY != 0 && s & STATE_MASK == OPENED_STATE {
                self.acceptor_accept();
            } else {
                return;
            }
        }
    }

    fn acceptor_open(&self) {
        let opening = self
            .status
            .transition(|s| {
                (s & OPEN_REQUEST != 0 && s & STATE_MASK == INITIAL_STATE)
                    .then(|| with_state(s & !OPEN_REQUEST, OPENING_STATE))
            })
            .is_some();
        if !opening {
            self.status.clear(OPEN_REQUEST);
            return;
        }
        if !self.invoke("will_listen", |h, ctx| h.will_listen(ctx)) {
            return;
        }
        let Some(addr) = *self.bind_address.lock() else {
            ListenerContext::close(self);
            return;
        };
        match bind_listener(addr, self.settings.backlog) {
            Ok(listener) => {
                *self.local.lock() = listener.local_addr().ok();
                *self.channel.write() = Some(listener);
            }
            Err(e) => {
                warn!(local = %display_address(Some(addr)), "Failed to bind listener: {}", e);
                ListenerContext::close(self);
                return;
            }
        }
        let Some((_, new)) = self.status.transition(|s| {
            (s & STATE_MASK == OPENING_STATE && s & CLOSE_REQUEST == 0).then(|| with_state(s, OPENED_STATE))
        }) else {
            return;
        };
        info!(
            "Listening on {}{}",
            self.address(),
            if self.tls.is_some() { " (tls)" } else { "" }
        );
        if !self.invoke("did_listen", |h, ctx| h.did_listen(ctx)) {
            return;
        }
        if new & ACCEPT_REQUEST != 0 || self.status.load() & ACCEPT_REQUEST != 0 {
            self.transport().request_accept();
        }
    }

    fn acceptor_accept(&self) {
        let Some((old, _)) = self.status.transition(|s| {
            (s & ACCEPT_READY != 0).then(|| s & !(ACCEPT_READY | ACCEPT_REQUEST))
        }) else {
            return;
        };
        if old & ACCEPT_REQUEST != 0 {
            trace!(local = %self.address(), "Accept ready");
            self.invoke("do_accept", |h, ctx| h.do_accept(ctx));
        }
    }

    fn acceptor_close(&self) {
        self.status.transition(|s| Some(with_state(s, CLOSING_STATE)));
        debug!(local = %self.address(), "Closing listener");
        self.invoke("will_close", |h, ctx| h.will_close(ctx));
        self.transport().close();
        let channel = self.channel.write().take();
        drop(channel);
        self.status
            .transition(|s| Some(with_state(s & CLOSE_REQUEST, CLOSED_STATE)));
        info!("Listener on {} closed", self.address());
        self.invoke("did_close", |h, ctx| h.did_close(ctx));
    }

    fn take_connection(&self) -> io::Result<(mio::net::TcpStream, SocketAddr)> {
        match self.channel.read().as_ref() {
            Some(listener) => listener.accept(),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}

impl Transport for TcpListener {
    fn with_source(
        &self,
        f: &mut dyn FnMut(&mut dyn mio::event::Source) -> io::Result<()>,
    ) -> io::Result<()> {
        match self.channel.write().as_mut() {
            Some(listener) => f(listener),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn idle_timeout(&self) -> i64 {
        0
    }

    fn dispatch_accept(&self) {
        let accepted = self
            .status
            .transition(|s| (s & CLOSE_REQUEST == 0).then(|| s | ACCEPT_READY))
            .is_some();
        if accepted {
            self.acceptor.cue();
        }
    }

    fn dispatch_close(&self) {
        ListenerContext::close(self);
    }
}

impl ListenerContext for TcpListener {
    fn request_accept(&self) {
        let Some((_, new)) = self.status.transition(|s| {
            (s & (ACCEPT_REQUEST | CLOSE_REQUEST) == 0).then(|| s | ACCEPT_REQUEST)
        }) else {
            return;
        };
        if new & STATE_MASK == OPENED_STATE {
            self.transport().request_accept();
        }
    }

    fn cancel_accept(&self) {
        if let Some((_, new)) = self
            .status
            .transition(|s| (s & ACCEPT_REQUEST != 0).then(|| s & !ACCEPT_REQUEST))
        {
            if new & STATE_MASK == OPENED_STATE {
                self.transport().cancel_accept();
            }
        }
    }

    fn accept(&self, handler: Box<dyn SocketHandler>) -> Result<Option<SocketRef>> {
        let (stream, remote) = match self.take_connection() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if is_transient(&e) => {
                debug!(local = %self.address(), "Transient accept error: {}", e);
                return Ok(None);
            }
            Err(e) => {
                warn!(local = %self.address(), "Accept failed: {}", e);
                ListenerContext::close(self);
                return Err(e.into());
            }
        };
        if let Err(e) = self.settings.apply_to_stream(&stream) {
            warn!(remote = %display_address(Some(remote)), "Failed to apply TCP settings: {}", e);
        }
        let selector = self.selector.upgrade().ok_or(NetError::Unbound)?;
        let tls = self.tls.as_ref().map(|config| TlsEngine::server(Arc::clone(config)));
        let socket = TcpSocket::new(
            handler,
            Some((stream, remote)),
            self.settings.clone(),
            tls,
            Arc::clone(&self.executor),
        );
        socket.bind(&selector)?;
        socket.open();
        debug!(remote = %display_address(Some(remote)), local = %self.address(), "Accepted connection");
        Ok(Some(SocketRef::new(socket)))
    }

    fn close(&self) {
        let accepted = self
            .status
            .transition(|s| {
                let state = s & STATE_MASK;
                let closable = s & CLOSE_REQUEST == 0 && state != CLOSING_STATE && state != CLOSED_STATE;
                closable.then(|| (s | CLOSE_REQUEST) & !OPEN_REQUEST)
            })
            .is_some();
        if accepted {
            self.acceptor.cue();
        }
    }

    fn state(&self) -> ListenerState {
        state_of(self.status.load())
    }

    fn local_address(&self) -> Option<SocketAddr> {
        *self.local.lock()
    }

    fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}
