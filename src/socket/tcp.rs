//! TCP socket state machine
//!
//! A socket is driven by two lanes sharing one [`StatusWord`]. The reader
//! owns every lifecycle transition (connect, open, become, close) and the
//! inbound side; the writer only performs outbound I/O and defers to the
//! reader by requesting close.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use mio::net::TcpStream;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::consts;
use crate::flow::{FlowContext, FlowControl};
use crate::selector::{Selector, TransportRef};
use crate::task::{Executor, TaskCell};
use crate::transport::{TcpSettings, Transport, TransportContext};
use crate::util::{display_address, StatusWord};
use crate::{NetError, Result};
use super::status::*;
use super::tls::TlsEngine;
use super::{HandlerResult, SocketContext, SocketHandler, SocketState};

static UNBOUND: Lazy<TransportRef> = Lazy::new(TransportRef::unbound);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderStep {
    Close,
    Connect,
    ConnectReady,
    Open,
    OpeningRead,
    Become,
    CloseInbound,
    ClosingRead,
    Read,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterStep {
    OpeningWrite,
    CloseOutbound,
    ClosingWrite,
    Write,
}

/// Next unit of reader work, in priority order
fn next_reader_step(s: u32, secure: bool) -> Option<ReaderStep> {
    if s & CLOSE_REQUEST != 0 {
        return (!is_closed(s)).then_some(ReaderStep::Close);
    }
    if is_closed(s) {
        return None;
    }
    if s & CONNECT_REQUEST != 0 {
        Some(ReaderStep::Connect)
    } else if s & CONNECT_READY != 0 {
        Some(ReaderStep::ConnectReady)
    } else if s & OPEN_REQUEST != 0 {
        Some(ReaderStep::Open)
    } else if secure && is_opening(s) && s & READ_READY != 0 {
        Some(ReaderStep::OpeningRead)
    } else if s & BECOME_REQUEST != 0 {
        Some(ReaderStep::Become)
    } else if s & CLOSE_INBOUND_REQUEST != 0 {
        Some(ReaderStep::CloseInbound)
    } else if s & DONE_READING != 0 && s & CONNECTED != 0 && s & READ_READY != 0 {
        Some(ReaderStep::ClosingRead)
    } else if is_opened(s) && s & DONE_READING == 0 && s & READ_READY != 0 {
        Some(ReaderStep::Read)
    } else if s & TIMEOUT_REQUEST != 0 {
        Some(ReaderStep::Timeout)
    } else {
        None
    }
}

/// Next unit of writer work; nothing once a close is requested
fn next_writer_step(s: u32, secure: bool) -> Option<WriterStep> {
    if s & CLOSE_REQUEST != 0 || s & CONNECTED == 0 {
        return None;
    }
    if secure && is_opening(s) && s & WRITE_READY != 0 {
        Some(WriterStep::OpeningWrite)
    } else if s & CLOSE_OUTBOUND_REQUEST != 0 {
        Some(WriterStep::CloseOutbound)
    } else if s & DONE_WRITING != 0 && s & WRITE_READY != 0 {
        Some(WriterStep::ClosingWrite)
    } else if is_opened(s) && s & WRITE_READY != 0 {
        Some(WriterStep::Write)
    } else {
        None
    }
}

pub(super) fn would_block(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

pub(crate) struct TcpSocket {
    status: StatusWord,
    reader: Arc<TaskCell<TcpSocket>>,
    writer: Arc<TaskCell<TcpSocket>>,
    transport: OnceCell<TransportRef>,
    channel: RwLock<Option<TcpStream>>,
    handler: Mutex<Option<Box<dyn SocketHandler>>>,
    pending: Mutex<Option<Box<dyn SocketHandler>>>,
    idle_timeout: AtomicI64,
    local: Mutex<Option<SocketAddr>>,
    remote: Mutex<Option<SocketAddr>>,
    settings: TcpSettings,
    tls: Option<TlsEngine>,
}

impl TcpSocket {
    /// Create an unbound socket; `channel` is present for accepted connections
    pub(crate) fn new(
        handler: Box<dyn SocketHandler>,
        channel: Option<(TcpStream, SocketAddr)>,
        settings: TcpSettings,
        tls: Option<TlsEngine>,
        executor: Arc<dyn Executor>,
    ) -> Arc<Self> {
        let idle_timeout = handler.idle_timeout();
        let (channel, remote) = match channel {
            Some((stream, addr)) => (Some(stream), Some(addr)),
            None => (None, None),
        };
        Arc::new_cyclic(|me: &Weak<TcpSocket>| Self {
            status: StatusWord::new(INITIAL_STATE),
            reader: TaskCell::new(me.clone(), TcpSocket::run_reader, Arc::clone(&executor)),
            writer: TaskCell::new(me.clone(), TcpSocket::run_writer, executor),
            transport: OnceCell::new(),
            channel: RwLock::new(channel),
            handler: Mutex::new(Some(handler)),
            pending: Mutex::new(None),
            idle_timeout: AtomicI64::new(idle_timeout),
            local: Mutex::new(None),
            remote: Mutex::new(remote),
            settings,
            tls,
        })
    }

    /// Register with `selector`
    pub(crate) fn bind(self: &Arc<Self>, selector: &Selector) -> Result<()> {
        let transport = selector.bind_transport(Arc::clone(self) as Arc<dyn Transport>)?;
        if self.transport.set(transport).is_err() {
            trace!("Socket bound twice, keeping first registration");
        }
        Ok(())
    }

    pub(super) fn transport(&self) -> &TransportRef {
        self.transport.get().unwrap_or(&UNBOUND)
    }

    pub(super) fn status(&self) -> u32 {
        self.status.load()
    }

    /// Run `f` on the channel under the shared lock.
    ///
    /// Never call into the transport context from `f`: re-arming takes the
    /// channel lock exclusively.
    pub(super) fn with_channel<R>(&self, f: impl FnOnce(&TcpStream) -> io::Result<R>) -> io::Result<R> {
        match self.channel.read().as_ref() {
            Some(stream) => f(stream),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn peer(&self) -> String {
        display_address(*self.remote.lock())
    }

    /// Clear `bits`, returning the old status if any of them were set
    fn take(&self, bits: u32) -> Option<u32> {
        self.status
            .transition(|s| (s & bits != 0).then(|| s & !bits))
            .map(|(old, _)| old)
    }

    fn signal(&self, bit: u32, lane: &Arc<TaskCell<TcpSocket>>) {
        let accepted = self
            .status
            .transition(|s| (!is_closed(s) && s & CLOSE_REQUEST == 0).then(|| s | bit))
            .is_some();
        if accepted {
            lane.cue();
        }
    }

    /// Run a handler callback; an error is logged and closes the socket
    fn invoke<F>(&self, callback: &'static str, f: F) -> bool
    where
        F: FnOnce(&mut dyn SocketHandler, &dyn SocketContext) -> HandlerResult,
    {
        let result = {
            let mut handler = self.handler.lock();
            match handler.as_mut() {
                Some(handler) => f(handler.as_mut(), self),
                None => Ok(()),
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(remote = %self.peer(), "Socket {} failed: {:#}", callback, e);
                SocketContext::close(self);
                false
            }
        }
    }

    pub(crate) fn connect(&self, addr: SocketAddr) -> Result<bool> {
        if !self.transport().is_bound() {
            return Err(NetError::Unbound);
        }
        let mut remote = self.remote.lock();
        let accepted = self
            .status
            .transition(|s| {
                let idle = s & STATE_MASK == INITIAL_STATE
                    && s & (CONNECT_REQUEST | CLOSE_REQUEST | ACCEPTED) == 0;
                idle.then(|| s | CONNECT_REQUEST)
            })
            .is_some();
        if accepted {
            *remote = Some(addr);
        }
        drop(remote);
        if accepted {
            self.reader.cue();
        }
        Ok(accepted)
    }

    /// Open an accepted connection
    pub(crate) fn open(&self) -> bool {
        let accepted = self
            .status
            .transition(|s| {
                let idle = s & STATE_MASK == INITIAL_STATE
                    && s & (CONNECT_REQUEST | CLOSE_REQUEST | ACCEPTED) == 0;
                idle.then(|| s | ACCEPTED | CONNECTING_STATE | CONNECT_READY)
            })
            .is_some();
        if accepted {
            self.reader.cue();
        }
        accepted
    }

    /// Ask the reader to finish opening
    pub(super) fn request_open(&self) {
        let accepted = self
            .status
            .transition(|s| {
                (is_opening(s) && s & (OPEN_REQUEST | CLOSE_REQUEST) == 0).then(|| s | OPEN_REQUEST)
            })
            .is_some();
        if accepted {
            self.reader.cue();
        }
    }

    /// Mark the inbound side done without asking the reader to shut it
    pub(super) fn mark_done_reading(&self) -> bool {
        self.status
            .transition(|s| {
                (s & CONNECTED != 0 && s & DONE_READING == 0)
                    .then(|| (s | DONE_READING) & !(READ_REQUEST | READ_READY))
            })
            .is_some()
    }

    pub(super) fn shutdown(&self, how: Shutdown) {
        if let Err(e) = self.with_channel(|stream| stream.shutdown(how)) {
            trace!(remote = %self.peer(), "Shutdown {:?} failed: {}", how, e);
        }
    }

    /// Record a completed half-close; the second one closes the socket
    pub(super) fn shut(&self, bit: u32) {
        if let Some((_, new)) = self.status.transition(|s| (s & bit == 0).then(|| s | bit)) {
            if new & BOTH_SHUT == BOTH_SHUT {
                debug!(remote = %self.peer(), "Both directions shut");
                SocketContext::close(self);
            }
        }
    }

    /// Deliver read readiness, locally when the TLS engine already holds input
    pub(super) fn forward_read(&self) {
        match &self.tls {
            Some(engine) if engine.has_buffered() => self.signal(READ_READY, &self.reader),
            _ => self.transport().request_read(),
        }
    }

    fn run_reader(&self) {
        let secure = self.tls.is_some();
        while let Some(step) = next_reader_step(self.status.load(), secure) {
            trace!(?step, "reader");
            match step {
                ReaderStep::Close => self.reader_close(),
                ReaderStep::Connect => self.reader_connect(),
                ReaderStep::ConnectReady => self.reader_connect_ready(),
                ReaderStep::Open => self.reader_open(),
                ReaderStep::OpeningRead => self.reader_opening_read(),
                ReaderStep::Become => self.reader_become(),
                ReaderStep::CloseInbound => self.reader_close_inbound(),
                ReaderStep::ClosingRead => self.reader_closing_read(),
                ReaderStep::Read => self.reader_read(),
                ReaderStep::Timeout => self.reader_timeout(),
            }
        }
    }

    fn reader_connect(&self) {
        let started = self
            .status
            .transition(|s| {
                (s & CONNECT_REQUEST != 0 && s & STATE_MASK == INITIAL_STATE)
                    .then(|| (s & !CONNECT_REQUEST) | CONNECTING_STATE)
            })
            .is_some();
        if !started {
            self.take(CONNECT_REQUEST);
            return;
        }
        if !self.invoke("will_connect", |h, ctx| h.will_connect(ctx)) {
            return;
        }
        let Some(addr) = *self.remote.lock() else {
            SocketContext::close(self);
            return;
        };
        match TcpStream::connect(addr) {
            Ok(stream) => {
                if let Err(e) = self.settings.apply_to_stream(&stream) {
                    warn!(remote = %self.peer(), "Failed to apply TCP settings: {}", e);
                }
                *self.channel.write() = Some(stream);
                debug!(remote = %self.peer(), "Connecting");
                self.transport().request_connect();
            }
            Err(e) => {
                warn!(remote = %self.peer(), "Connect failed: {}", e);
                SocketContext::close(self);
            }
        }
    }

    fn finish_connect(&self) -> io::Result<bool> {
        self.with_channel(|stream| {
            if let Some(e) = stream.take_error()? {
                return Err(e);
            }
            match stream.peer_addr() {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn reader_connect_ready(&self) {
        let Some(old) = self.take(CONNECT_READY) else {
            return;
        };
        if old & STATE_MASK != CONNECTING_STATE {
            return;
        }
        if old & ACCEPTED == 0 {
            match self.finish_connect() {
                Ok(true) => {}
                Ok(false) => {
                    self.transport().request_connect();
                    return;
                }
                Err(e) => {
                    warn!(remote = %self.peer(), "Connect failed: {}", e);
                    SocketContext::close(self);
                    return;
                }
            }
        }
        let opening = self
            .status
            .transition(|s| {
                (s & STATE_MASK == CONNECTING_STATE && s & CLOSE_REQUEST == 0).then(|| s | CONNECTED)
            })
            .is_some();
        if !opening {
            return;
        }
        debug!(remote = %self.peer(), local = %display_address(self.local_address()), "Opening");
        self.will_open();
    }

    fn will_open(&self) {
        if !self.invoke("will_open", |h, ctx| h.will_open(ctx)) {
            return;
        }
        match &self.tls {
            Some(engine) => engine.begin(self),
            None => self.request_open(),
        }
    }

    fn reader_open(&self) {
        let Some((old, new)) = self.status.transition(|s| {
            if s & OPEN_REQUEST == 0 {
                None
            } else if is_opening(s) {
                Some(s & !(OPEN_REQUEST | CONNECTING))
            } else {
                Some(s & !OPEN_REQUEST)
            }
        }) else {
            return;
        };
        if !is_opening(old) {
            return;
        }
        debug!(remote = %self.peer(), "Opened");
        if new & READ_REQUEST != 0 {
            self.forward_read();
        }
        if new & WRITE_REQUEST != 0 {
            self.transport().request_write();
        }
        if !self.invoke("did_open", |h, ctx| h.did_open(ctx)) {
            return;
        }
        if self.status.load() & (WRITE_READY | CLOSE_OUTBOUND_REQUEST) != 0 {
            self.writer.cue();
        }
    }

    fn reader_opening_read(&self) {
        if self.take(READ_READY).is_some() {
            if let Some(engine) = &self.tls {
                engine.drive_handshake(self);
            }
        }
    }

    fn reader_become(&self) {
        if self.take(BECOME_REQUEST).is_none() {
            return;
        }
        let Some(next) = self.pending.lock().take() else {
            return;
        };
        if !self.invoke("will_become", |h, ctx| h.will_become(ctx)) {
            return;
        }
        self.idle_timeout.store(next.idle_timeout(), Ordering::Release);
        let previous = self.handler.lock().replace(next);
        drop(previous);
        debug!(remote = %self.peer(), "Handler replaced");
        if !self.invoke("did_become", |h, ctx| h.did_become(ctx)) {
            return;
        }
        if is_opened(self.status.load()) {
            self.invoke("did_open", |h, ctx| h.did_open(ctx));
        }
    }

    fn reader_close_inbound(&self) {
        if self.take(CLOSE_INBOUND_REQUEST).is_none() {
            return;
        }
        match &self.tls {
            Some(engine) => engine.close_inbound(self),
            None => {
                self.shutdown(Shutdown::Read);
                self.shut(INBOUND_SHUT);
            }
        }
    }

    fn reader_closing_read(&self) {
        if self.take(READ_READY).is_none() {
            return;
        }
        match &self.tls {
            Some(engine) => engine.closing_read(self),
            None => self.drain_input(),
        }
    }

    fn drain_input(&self) {
        let mut scratch = [0u8; consts::DISCARD_BUFFER_SIZE];
        while let Ok(n) = self.with_channel(|mut stream| stream.read(&mut scratch)) {
            if n == 0 {
                break;
            }
        }
    }

    fn reader_read(&self) {
        let Some((old, _)) = self
            .status
            .transition(|s| (s & READ_READY != 0).then(|| s & !(READ_READY | READ_REQUEST)))
        else {
            return;
        };
        if old & READ_REQUEST != 0 {
            self.invoke("do_read", |h, ctx| h.do_read(ctx));
        }
    }

    fn reader_timeout(&self) {
        if self.take(TIMEOUT_REQUEST).is_some() {
            debug!(remote = %self.peer(), "Idle timeout");
            self.invoke("do_timeout", |h, ctx| h.do_timeout(ctx));
        }
    }

    fn reader_close(&self) {
        debug!(remote = %self.peer(), "Closing");
        self.invoke("will_close", |h, ctx| h.will_close(ctx));
        self.transport().close();
        if let Some(engine) = &self.tls {
            engine.release(self);
        }
        let channel = self.channel.write().take();
        drop(channel);
        self.status
            .transition(|s| Some((s & (CLOSE_REQUEST | ACCEPTED | BOTH_SHUT)) | CLOSED_STATE));
        debug!(remote = %self.peer(), "Closed");
        self.invoke("did_close", |h, ctx| h.did_close(ctx));
        self.pending.lock().take();
    }

    fn run_writer(&self) {
        let secure = self.tls.is_some();
        while let Some(step) = next_writer_step(self.status.load(), secure) {
            trace!(?step, "writer");
            match step {
                WriterStep::OpeningWrite => self.writer_opening_write(),
                WriterStep::CloseOutbound => self.writer_close_outbound(),
                WriterStep::ClosingWrite => self.writer_closing_write(),
                WriterStep::Write => self.writer_write(),
            }
        }
    }

    fn writer_opening_write(&self) {
        if self.take(WRITE_READY).is_some() {
            if let Some(engine) = &self.tls {
                engine.drive_handshake(self);
            }
        }
    }

    fn writer_close_outbound(&self) {
        if self.take(CLOSE_OUTBOUND_REQUEST).is_none() {
            return;
        }
        match &self.tls {
            Some(engine) => engine.close_outbound(self),
            None => {
                self.shutdown(Shutdown::Write);
                self.shut(OUTBOUND_SHUT);
            }
        }
    }

    fn writer_closing_write(&self) {
        if self.take(WRITE_READY).is_some() {
            if let Some(engine) = &self.tls {
                engine.closing_write(self);
            }
        }
    }

    fn writer_write(&self) {
        let Some((old, _)) = self
            .status
            .transition(|s| (s & WRITE_READY != 0).then(|| s & !(WRITE_READY | WRITE_REQUEST)))
        else {
            return;
        };
        if let Some(engine) = &self.tls {
            if !engine.flush(self) {
                if old & WRITE_REQUEST != 0 {
                    self.status.set(WRITE_REQUEST);
                }
                return;
            }
        }
        if old & WRITE_REQUEST != 0 {
            self.invoke("do_write", |h, ctx| h.do_write(ctx));
        }
    }
}

impl Transport for TcpSocket {
    fn with_source(
        &self,
        f: &mut dyn FnMut(&mut dyn mio::event::Source) -> io::Result<()>,
    ) -> io::Result<()> {
        match self.channel.write().as_mut() {
            Some(stream) => f(stream),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn idle_timeout(&self) -> i64 {
        self.idle_timeout.load(Ordering::Acquire)
    }

    fn dispatch_connect(&self) {
        self.signal(CONNECT_READY, &self.reader);
    }

    fn dispatch_read(&self) {
        self.signal(READ_READY, &self.reader);
    }

    fn dispatch_write(&self) {
        self.signal(WRITE_READY, &self.writer);
    }

    fn dispatch_timeout(&self) {
        self.signal(TIMEOUT_REQUEST, &self.reader);
    }

    fn dispatch_close(&self) {
        SocketContext::close(self);
    }
}

impl FlowContext for TcpSocket {
    fn flow_control(&self) -> FlowControl {
        let s = self.status.load();
        FlowControl::from_flags(s & READ_REQUEST != 0, s & WRITE_REQUEST != 0)
    }

    fn request_read(&self) {
        let Some((_, new)) = self.status.transition(|s| {
            let refused = s & (READ_REQUEST | DONE_READING | CLOSE_REQUEST) != 0 || is_closed(s);
            (!refused).then(|| s | READ_REQUEST)
        }) else {
            return;
        };
        if is_opened(new) {
            self.forward_read();
        }
    }

    fn cancel_read(&self) {
        if let Some((_, new)) = self
            .status
            .transition(|s| (s & READ_REQUEST != 0).then(|| s & !READ_REQUEST))
        {
            if is_opened(new) {
                self.transport().cancel_read();
            }
        }
    }

    fn trigger_read(&self) {
        let accepted = self
            .status
            .transition(|s| {
                let refused = s & (DONE_READING | CLOSE_REQUEST) != 0 || is_closed(s);
                (!refused).then(|| s | READ_REQUEST | READ_READY)
            })
            .is_some();
        if accepted {
            self.reader.cue();
        }
    }

    fn request_write(&self) {
        let Some((_, new)) = self.status.transition(|s| {
            let refused = s & (WRITE_REQUEST | DONE_WRITING | CLOSE_REQUEST) != 0 || is_closed(s);
            (!refused).then(|| s | WRITE_REQUEST)
        }) else {
            return;
        };
        if is_opened(new) {
            self.transport().request_write();
        }
    }

    fn cancel_write(&self) {
        if let Some((_, new)) = self
            .status
            .transition(|s| (s & WRITE_REQUEST != 0).then(|| s & !WRITE_REQUEST))
        {
            let flushing = self.tls.as_ref().map_or(false, |engine| engine.has_pending_output());
            if is_opened(new) && !flushing {
                self.transport().cancel_write();
            }
        }
    }

    fn trigger_write(&self) {
        let accepted = self
            .status
            .transition(|s| {
                let refused = s & (DONE_WRITING | CLOSE_REQUEST) != 0 || is_closed(s);
                (!refused).then(|| s | WRITE_REQUEST | WRITE_READY)
            })
            .is_some();
        if accepted {
            self.writer.cue();
        }
    }

    fn done_reading(&self) -> bool {
        let done = self
            .status
            .transition(|s| {
                let open = s & CONNECTED != 0 && s & (DONE_READING | CLOSE_REQUEST) == 0;
                open.then(|| (s | DONE_READING | CLOSE_INBOUND_REQUEST) & !(READ_REQUEST | READ_READY))
            })
            .is_some();
        if done {
            debug!(remote = %self.peer(), "Done reading");
            self.transport().cancel_read();
            self.reader.cue();
        }
        done
    }

    fn done_writing(&self) -> bool {
        let done = self
            .status
            .transition(|s| {
                let open = s & CONNECTED != 0 && s & (DONE_WRITING | CLOSE_REQUEST) == 0;
                open.then(|| (s | DONE_WRITING | CLOSE_OUTBOUND_REQUEST) & !(WRITE_REQUEST | WRITE_READY))
            })
            .is_some();
        if done {
            debug!(remote = %self.peer(), "Done writing");
            self.writer.cue();
        }
        done
    }
}

impl SocketContext for TcpSocket {
    fn read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        if self.status.load() & DONE_READING != 0 {
            return Ok(None);
        }
        if let Some(engine) = &self.tls {
            return engine.read(self, buf);
        }
        if buf.is_empty() {
            return Ok(Some(0));
        }
        match self.with_channel(|mut stream| stream.read(buf)) {
            Ok(0) => {
                trace!(remote = %self.peer(), "End of stream");
                self.done_reading();
                Ok(None)
            }
            Ok(n) => Ok(Some(n)),
            Err(e) if would_block(&e) => Ok(Some(0)),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.status.load() & (DONE_WRITING | CLOSE_REQUEST) != 0 {
            return Err(NetError::ConnectionClosed);
        }
        if let Some(engine) = &self.tls {
            return engine.write(self, buf);
        }
        match self.with_channel(|mut stream| stream.write(buf)) {
            Ok(n) => Ok(n),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn become_handler(&self, handler: Box<dyn SocketHandler>) {
        *self.pending.lock() = Some(handler);
        let accepted = self
            .status
            .transition(|s| (!is_closed(s) && s & CLOSE_REQUEST == 0).then(|| s | BECOME_REQUEST))
            .is_some();
        if accepted {
            self.reader.cue();
        } else {
            self.pending.lock().take();
        }
    }

    fn close(&self) {
        let accepted = self
            .status
            .transition(|s| {
                (s & CLOSE_REQUEST == 0 && !is_closed(s)).then(|| (s | CLOSE_REQUEST) & !OPEN_REQUEST)
            })
            .is_some();
        if accepted {
            self.reader.cue();
        }
    }

    fn state(&self) -> SocketState {
        state_of(self.status.load())
    }

    fn local_address(&self) -> Option<SocketAddr> {
        let mut local = self.local.lock();
        if local.is_none() {
            *local = self.with_channel(|stream| stream.local_addr()).ok();
        }
        *local
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        let mut remote = self.remote.lock();
        if remote.is_none() {
            *remote = self.with_channel(|stream| stream.peer_addr()).ok();
        }
        *remote
    }

    fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    fn tls_protocol(&self) -> Result<Option<String>> {
        match &self.tls {
            Some(engine) => Ok(engine.protocol()),
            None => Err(NetError::NotSecure),
        }
    }

    fn tls_cipher_suite(&self) -> Result<Option<String>> {
        match &self.tls {
            Some(engine) => Ok(engine.cipher_suite()),
            None => Err(NetError::NotSecure),
        }
    }
}
