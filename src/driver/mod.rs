//! # Driver Module
//!
//! Owns the selector thread and the task executor, holds the TCP and TLS
//! settings handed to new transports, and binds sockets and listeners.
//!
//! ```rust,ignore
//! let driver = Driver::with_config(DriverConfig::from_file("netdrive.toml")?);
//! driver.start()?;
//! let listener = driver.listen_tcp("0.0.0.0:7000".parse()?, Box::new(Server))?;
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info};

use crate::consts;
use crate::listener::{ListenerHandler, ListenerRef, TcpListener};
use crate::selector::{Selector, SelectorSettings};
use crate::socket::{SocketHandler, SocketRef, TcpSocket, TlsEngine};
use crate::task::Executor;
use crate::transport::{TcpSettings, TlsSettings};
use crate::util::DriverConfig;
use crate::{NetError, Result};

const STOPPED: u8 = 0;
const STARTING: u8 = 1;
const STARTED: u8 = 2;
const STOPPING: u8 = 3;

/// Resources alive between `start` and `stop`
struct Running {
    selector: Arc<Selector>,
    executor: Arc<dyn Executor>,
    runtime: Option<Runtime>,
}

/// Entry point binding transports to a selector thread and an executor
pub struct Driver {
    config: DriverConfig,
    state: AtomicU8,
    lifecycle: Mutex<()>,
    changed: Condvar,
    running: RwLock<Option<Running>>,
    executor: Option<Arc<dyn Executor>>,
    tcp_settings: RwLock<Option<TcpSettings>>,
    tls_settings: RwLock<Option<TlsSettings>>,
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver {
    /// Create a driver with default configuration
    pub fn new() -> Self {
        Self::with_config(DriverConfig::default())
    }

    pub fn with_config(config: DriverConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(STOPPED),
            lifecycle: Mutex::new(()),
            changed: Condvar::new(),
            running: RwLock::new(None),
            executor: None,
            tcp_settings: RwLock::new(None),
            tls_settings: RwLock::new(None),
        }
    }

    /// Run lanes on `executor` instead of a runtime owned by the driver
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::Acquire) == STARTED
    }

    /// Start the selector and executor; returns once started.
    ///
    /// Calling `start` on a started driver does nothing.
    pub fn start(&self) -> Result<()> {
        loop {
            match self
                .state
                .compare_exchange(STOPPED, STARTING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let result = self.launch();
                    let next = if result.is_ok() { STARTED } else { STOPPED };
                    self.settle(next);
                    return result;
                }
                Err(STARTED) => return Ok(()),
                Err(_) => self.await_change(),
            }
        }
    }

    /// Stop the selector, closing every transport; returns once stopped.
    ///
    /// Calling `stop` on a stopped driver does nothing.
    pub fn stop(&self) {
        loop {
            match self
                .state
                .compare_exchange(STARTED, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.shutdown();
                    self.settle(STOPPED);
                    return;
                }
                Err(STOPPED) => return,
                Err(_) => self.await_change(),
            }
        }
    }

    fn launch(&self) -> Result<()> {
        let tcp = self.tcp_settings();
        let tls = self.tls_settings()?;
        debug!(?tcp, ?tls, "Starting driver");

        let (executor, runtime) = match &self.executor {
            Some(executor) => (Arc::clone(executor), None),
            None => {
                let runtime = self.build_runtime()?;
                let handle: Arc<dyn Executor> = Arc::new(runtime.handle().clone());
                (handle, Some(runtime))
            }
        };
        let selector = Selector::start(SelectorSettings::from(&self.config.selector))?;

        *self.running.write() = Some(Running {
            selector: Arc::new(selector),
            executor,
            runtime,
        });
        info!("Driver started");
        Ok(())
    }

    fn build_runtime(&self) -> Result<Runtime> {
        let mut builder = Builder::new_multi_thread();
        builder.thread_name("netdrive-worker").enable_all();
        if self.config.executor.worker_threads > 0 {
            builder.worker_threads(self.config.executor.worker_threads);
        }
        Ok(builder.build()?)
    }

    fn shutdown(&self) {
        let Some(running) = self.running.write().take() else {
            return;
        };
        running.selector.stop();
        if let Some(runtime) = running.runtime {
            // blocking on the runtime is not allowed from one of its workers
            if tokio::runtime::Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(Duration::from_millis(consts::LIFECYCLE_POLL_INTERVAL));
            }
        }
        info!("Driver stopped");
    }

    fn settle(&self, state: u8) {
        let _guard = self.lifecycle.lock();
        self.state.store(state, Ordering::Release);
        self.changed.notify_all();
    }

    /// Wait for an in-flight start or stop, rechecking at a bounded interval
    fn await_change(&self) {
        let mut guard = self.lifecycle.lock();
        let state = self.state.load(Ordering::Acquire);
        if state == STARTING || state == STOPPING {
            self.changed
                .wait_for(&mut guard, Duration::from_millis(consts::LIFECYCLE_POLL_INTERVAL));
        }
    }

    /// TCP options given to new transports, defaulted from the configuration
    pub fn tcp_settings(&self) -> TcpSettings {
        if let Some(settings) = self.tcp_settings.read().as_ref() {
            return settings.clone();
        }
        self.tcp_settings
            .write()
            .get_or_insert_with(|| self.config.tcp.clone())
            .clone()
    }

    /// TLS parameters given to new secure transports, defaulted from the configuration
    pub fn tls_settings(&self) -> Result<TlsSettings> {
        if let Some(settings) = self.tls_settings.read().as_ref() {
            return Ok(settings.clone());
        }
        let mut slot = self.tls_settings.write();
        if let Some(settings) = slot.as_ref() {
            return Ok(settings.clone());
        }
        let settings = self.config.tls.to_settings()?;
        *slot = Some(settings.clone());
        Ok(settings)
    }

    pub fn set_tcp_settings(&self, settings: TcpSettings) -> Result<()> {
        let mut slot = self.tcp_settings.write();
        if self.state.load(Ordering::Acquire) != STOPPED {
            return Err(NetError::AlreadyStarted);
        }
        *slot = Some(settings);
        Ok(())
    }

    pub fn set_tls_settings(&self, settings: TlsSettings) -> Result<()> {
        let mut slot = self.tls_settings.write();
        if self.state.load(Ordering::Acquire) != STOPPED {
            return Err(NetError::AlreadyStarted);
        }
        *slot = Some(settings);
        Ok(())
    }

    fn resources(&self) -> Result<(Arc<Selector>, Arc<dyn Executor>)> {
        self.running
            .read()
            .as_ref()
            .map(|running| (Arc::clone(&running.selector), Arc::clone(&running.executor)))
            .ok_or(NetError::NotStarted)
    }

    fn bind_socket(&self, handler: Box<dyn SocketHandler>, tls: Option<TlsEngine>) -> Result<SocketRef> {
        let (selector, executor) = self.resources()?;
        let socket = TcpSocket::new(handler, None, self.tcp_settings(), tls, executor);
        socket.bind(&selector)?;
        Ok(SocketRef::new(socket))
    }

    fn bind_listener(
        &self,
        handler: Box<dyn ListenerHandler>,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<ListenerRef> {
        let (selector, executor) = self.resources()?;
        let listener = TcpListener::new(handler, self.tcp_settings(), tls, &selector, executor);
        listener.bind()?;
        Ok(ListenerRef::new(listener))
    }

    /// Bind an unconnected plain socket
    pub fn bind_tcp_socket(&self, handler: Box<dyn SocketHandler>) -> Result<SocketRef> {
        self.bind_socket(handler, None)
    }

    /// Bind an unconnected client-side TLS socket
    pub fn bind_tls_socket(&self, handler: Box<dyn SocketHandler>) -> Result<SocketRef> {
        self.resources()?;
        let engine = TlsEngine::client(&self.tls_settings()?)?;
        self.bind_socket(handler, Some(engine))
    }

    pub fn bind_tcp_listener(&self, handler: Box<dyn ListenerHandler>) -> Result<ListenerRef> {
        self.bind_listener(handler, None)
    }

    /// Bind a listener whose accepted sockets run the server side of TLS
    pub fn bind_tls_listener(&self, handler: Box<dyn ListenerHandler>) -> Result<ListenerRef> {
        self.resources()?;
        let config = self.tls_settings()?.server_config()?;
        self.bind_listener(handler, Some(config))
    }

    pub fn connect_tcp(&self, addr: SocketAddr, handler: Box<dyn SocketHandler>) -> Result<SocketRef> {
        let socket = self.bind_tcp_socket(handler)?;
        socket.connect(addr)?;
        Ok(socket)
    }

    pub fn connect_tls(&self, addr: SocketAddr, handler: Box<dyn SocketHandler>) -> Result<SocketRef> {
        let socket = self.bind_tls_socket(handler)?;
        socket.connect(addr)?;
        Ok(socket)
    }

    pub fn listen_tcp(&self, addr: SocketAddr, handler: Box<dyn ListenerHandler>) -> Result<ListenerRef> {
        let listener = self.bind_tcp_listener(handler)?;
        listener.listen(addr)?;
        Ok(listener)
    }

    pub fn listen_tls(&self, addr: SocketAddr, handler: Box<dyn ListenerHandler>) -> Result<ListenerRef> {
        let listener = self.bind_tls_listener(handler)?;
        listener.listen(addr)?;
        Ok(listener)
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowContext;
    use crate::listener::ListenerContext;
    use crate::socket::{HandlerResult, SocketContext, SocketState};
    use crate::transport::tls::tests::{self_signed, trusting};
    use crate::transport::ClientAuth;
    use crossbeam::channel::{unbounded, Receiver, Sender};
    use rand::Rng;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        WillConnect,
        WillOpen,
        DidOpen,
        Data(Vec<u8>),
        Writable,
        Eof,
        Timeout,
        WillBecome,
        DidBecome,
        WillClose,
        DidClose,
    }

    /// Client side: records callbacks, sends a greeting once open
    struct Recorder {
        events: Sender<Event>,
        greeting: Vec<u8>,
        half_close: bool,
        idle: i64,
    }

    impl Recorder {
        fn new(events: &Sender<Event>, greeting: &[u8]) -> Self {
            Self {
                events: events.clone(),
                greeting: greeting.to_vec(),
                half_close: false,
                idle: -1,
            }
        }
    }

    impl SocketHandler for Recorder {
        fn idle_timeout(&self) -> i64 {
            self.idle
        }

        fn will_connect(&mut self, _ctx: &dyn SocketContext) -> HandlerResult {
            self.events.send(Event::WillConnect)?;
            Ok(())
        }

        fn will_open(&mut self, _ctx: &dyn SocketContext) -> HandlerResult {
            self.events.send(Event::WillOpen)?;
            Ok(())
        }

        fn did_open(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            self.events.send(Event::DidOpen)?;
            if !self.greeting.is_empty() {
                ctx.write(&self.greeting)?;
            }
            if self.half_close {
                ctx.done_writing();
            }
            ctx.request_read();
            Ok(())
        }

        fn do_read(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            let mut buf = [0u8; 1024];
            loop {
                match ctx.read(&mut buf)? {
                    Some(0) => {
                        ctx.request_read();
                        return Ok(());
                    }
                    Some(n) => self.events.send(Event::Data(buf[..n].to_vec()))?,
                    None => {
                        self.events.send(Event::Eof)?;
                        return Ok(());
                    }
                }
            }
        }

        fn will_become(&mut self, _ctx: &dyn SocketContext) -> HandlerResult {
            self.events.send(Event::WillBecome)?;
            Ok(())
        }

        fn did_become(&mut self, _ctx: &dyn SocketContext) -> HandlerResult {
            self.events.send(Event::DidBecome)?;
            Ok(())
        }

        fn do_timeout(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            self.events.send(Event::Timeout)?;
            ctx.close();
            Ok(())
        }

        fn will_close(&mut self, _ctx: &dyn SocketContext) -> HandlerResult {
            self.events.send(Event::WillClose)?;
            Ok(())
        }

        fn did_close(&mut self, _ctx: &dyn SocketContext) -> HandlerResult {
            self.events.send(Event::DidClose)?;
            Ok(())
        }
    }

    /// Server side: echoes everything, half-closes after the peer does
    #[derive(Default)]
    struct Echo {
        backlog: Vec<u8>,
        eof: bool,
        events: Option<Sender<Event>>,
    }

    impl Echo {
        fn flush(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            while !self.backlog.is_empty() {
                let n = ctx.write(&self.backlog)?;
                if n == 0 {
                    break;
                }
                self.backlog.drain(..n);
            }
            if !self.backlog.is_empty() {
                ctx.request_write();
            } else if self.eof {
                ctx.done_writing();
            } else {
                ctx.request_read();
            }
            Ok(())
        }
    }

    impl SocketHandler for Echo {
        fn idle_timeout(&self) -> i64 {
            0
        }

        fn did_open(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            ctx.request_read();
            Ok(())
        }

        fn do_read(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            let mut buf = [0u8; 4096];
            loop {
                match ctx.read(&mut buf)? {
                    Some(0) => break,
                    Some(n) => self.backlog.extend_from_slice(&buf[..n]),
                    None => {
                        self.eof = true;
                        break;
                    }
                }
            }
            self.flush(ctx)
        }

        fn do_write(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            self.flush(ctx)
        }

        fn will_close(&mut self, _ctx: &dyn SocketContext) -> HandlerResult {
            if let Some(events) = &self.events {
                events.send(Event::WillClose)?;
            }
            Ok(())
        }

        fn did_close(&mut self, _ctx: &dyn SocketContext) -> HandlerResult {
            if let Some(events) = &self.events {
                events.send(Event::DidClose)?;
            }
            Ok(())
        }
    }

    type Factory = Box<dyn FnMut() -> Box<dyn SocketHandler> + Send>;

    /// Accepts every pending connection with a handler built by `make`
    struct Server {
        make: Factory,
    }

    impl Server {
        fn new(make: Factory) -> Self {
            Self { make }
        }

        fn echo() -> Self {
            Self::new(Box::new(|| -> Box<dyn SocketHandler> { Box::new(Echo::default()) }))
        }

        /// Echo server reporting its close callbacks on `events`
        fn recording(events: &Sender<Event>) -> Self {
            let events = events.clone();
            Self::new(Box::new(move || -> Box<dyn SocketHandler> {
                Box::new(Echo {
                    events: Some(events.clone()),
                    ..Echo::default()
                })
            }))
        }
    }

    impl ListenerHandler for Server {
        fn did_listen(&mut self, ctx: &dyn ListenerContext) -> HandlerResult {
            ctx.request_accept();
            Ok(())
        }

        fn do_accept(&mut self, ctx: &dyn ListenerContext) -> HandlerResult {
            while ctx.accept((self.make)())?.is_some() {}
            ctx.request_accept();
            Ok(())
        }
    }

    fn wait_until(what: &str, f: impl Fn() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn expect(rx: &Receiver<Event>, event: Event) {
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), event);
    }

    /// Gather `len` bytes of data events
    fn collect(rx: &Receiver<Event>, len: usize) -> Vec<u8> {
        let mut data = Vec::new();
        while data.len() < len {
            match rx.recv_timeout(WAIT).unwrap() {
                Event::Data(chunk) => data.extend_from_slice(&chunk),
                other => panic!("unexpected event {:?}", other),
            }
        }
        data
    }

    fn started(config: DriverConfig) -> Driver {
        let driver = Driver::with_config(config);
        driver.start().unwrap();
        driver
    }

    fn echo_server(driver: &Driver, secure: bool) -> (ListenerRef, SocketAddr) {
        serve(driver, secure, Server::echo())
    }

    fn serve(driver: &Driver, secure: bool, server: Server) -> (ListenerRef, SocketAddr) {
        let handler = Box::new(server);
        let addr = "127.0.0.1:0".parse().unwrap();
        let listener = if secure {
            driver.listen_tls(addr, handler).unwrap()
        } else {
            driver.listen_tcp(addr, handler).unwrap()
        };
        wait_until("listener", || listener.local_address().is_some());
        let local = listener.local_address().unwrap();
        (listener, local)
    }

    fn tls_settings(cert: &rustls::pki_types::CertificateDer<'static>) -> TlsSettings {
        TlsSettings::new()
            .with_trust(trusting(cert))
            .with_server_name("localhost")
    }

    #[test]
    fn test_start_stop_idempotent() {
        let driver = Driver::new();
        assert!(matches!(
            driver.bind_tcp_socket(Box::new(Echo::default())),
            Err(NetError::NotStarted)
        ));

        driver.start().unwrap();
        driver.start().unwrap();
        assert!(driver.is_started());
        assert!(driver.bind_tcp_socket(Box::new(Echo::default())).is_ok());

        driver.stop();
        driver.stop();
        assert!(!driver.is_started());
        assert!(matches!(
            driver.bind_tcp_socket(Box::new(Echo::default())),
            Err(NetError::NotStarted)
        ));
    }

    #[test]
    fn test_concurrent_start() {
        let driver = Arc::new(Driver::new());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let driver = Arc::clone(&driver);
                std::thread::spawn(move || driver.start())
            })
            .collect();
        for thread in threads {
            thread.join().unwrap().unwrap();
        }
        assert!(driver.is_started());
        driver.stop();
    }

    #[test]
    fn test_settings_frozen_once_started() {
        let driver = Driver::new();
        assert_eq!(driver.tcp_settings().backlog, consts::DEFAULT_BACKLOG);
        driver
            .set_tcp_settings(TcpSettings::default().with_no_delay(true))
            .unwrap();
        assert!(driver.tcp_settings().no_delay);

        driver.start().unwrap();
        assert!(matches!(
            driver.set_tcp_settings(TcpSettings::default()),
            Err(NetError::AlreadyStarted)
        ));
        assert!(matches!(
            driver.set_tls_settings(TlsSettings::new()),
            Err(NetError::AlreadyStarted)
        ));
        assert!(driver.tcp_settings().no_delay);
    }

    #[test]
    fn test_invalid_tls_config_fails_start() {
        let config = DriverConfig::from_toml_str("[tls]\nclient_auth = \"maybe\"").unwrap();
        let driver = Driver::with_config(config);
        assert!(matches!(driver.start(), Err(NetError::InvalidClientAuth(_))));
        assert!(!driver.is_started());
    }

    #[test]
    fn test_tls_listener_requires_identity() {
        let driver = started(DriverConfig::default());
        let handler = Box::new(Server::echo());
        assert!(matches!(driver.bind_tls_listener(handler), Err(NetError::Config(_))));
    }

    #[test]
    fn test_echo_round_trip() {
        let driver = started(DriverConfig::default());
        let (server_tx, server_rx) = unbounded();
        let (_listener, addr) = serve(&driver, false, Server::recording(&server_tx));
        let (tx, rx) = unbounded();

        let socket = driver.connect_tcp(addr, Box::new(Recorder::new(&tx, b"ping"))).unwrap();
        assert!(!socket.connect(addr).unwrap());

        expect(&rx, Event::WillConnect);
        expect(&rx, Event::WillOpen);
        expect(&rx, Event::DidOpen);
        assert_eq!(collect(&rx, 4), b"ping");
        assert_eq!(socket.state(), SocketState::Opened);
        assert_eq!(socket.remote_address(), Some(addr));
        assert!(socket.local_address().is_some());

        socket.close();
        socket.close();
        expect(&rx, Event::WillClose);
        expect(&rx, Event::DidClose);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(socket.state(), SocketState::Closed);
        assert!(!matches!(socket.connect(addr), Ok(true)));

        // the server sees end of stream, half-closes back and closes
        expect(&server_rx, Event::WillClose);
        expect(&server_rx, Event::DidClose);
        assert!(server_rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_half_close_both_directions_closes() {
        let driver = started(DriverConfig::default());
        let (_listener, addr) = echo_server(&driver, false);
        let (tx, rx) = unbounded();

        let mut recorder = Recorder::new(&tx, b"bye");
        recorder.half_close = true;
        let socket = driver.connect_tcp(addr, Box::new(recorder)).unwrap();

        expect(&rx, Event::WillConnect);
        expect(&rx, Event::WillOpen);
        expect(&rx, Event::DidOpen);
        assert_eq!(collect(&rx, 3), b"bye");
        expect(&rx, Event::Eof);
        expect(&rx, Event::WillClose);
        expect(&rx, Event::DidClose);
        assert_eq!(socket.state(), SocketState::Closed);
    }

    #[test]
    fn test_connect_refused_closes_without_open() {
        let driver = started(DriverConfig::default());
        let addr = {
            let vacant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            vacant.local_addr().unwrap()
        };
        let (tx, rx) = unbounded();
        let socket = driver.connect_tcp(addr, Box::new(Recorder::new(&tx, b""))).unwrap();

        expect(&rx, Event::WillConnect);
        expect(&rx, Event::WillClose);
        expect(&rx, Event::DidClose);
        assert_eq!(socket.state(), SocketState::Closed);
    }

    #[test]
    fn test_idle_timeout_fires_once() {
        let config = DriverConfig::from_toml_str("[selector]\nidle_interval_ms = 20").unwrap();
        let driver = started(config);
        let (_listener, addr) = echo_server(&driver, false);
        let (tx, rx) = unbounded();

        let mut recorder = Recorder::new(&tx, b"");
        recorder.idle = 100;
        let opened = Instant::now();
        let _socket = driver.connect_tcp(addr, Box::new(recorder)).unwrap();

        expect(&rx, Event::WillConnect);
        expect(&rx, Event::WillOpen);
        expect(&rx, Event::DidOpen);
        expect(&rx, Event::Timeout);
        assert!(opened.elapsed() >= Duration::from_millis(100));
        expect(&rx, Event::WillClose);
        expect(&rx, Event::DidClose);
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    struct Switcher {
        events: Sender<Event>,
    }

    impl SocketHandler for Switcher {
        fn did_open(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            self.events.send(Event::DidOpen)?;
            ctx.become_handler(Box::new(Recorder::new(&self.events, b"swap")));
            Ok(())
        }

        fn will_become(&mut self, _ctx: &dyn SocketContext) -> HandlerResult {
            self.events.send(Event::WillBecome)?;
            Ok(())
        }
    }

    #[test]
    fn test_become_replays_did_open() {
        let driver = started(DriverConfig::default());
        let (_listener, addr) = echo_server(&driver, false);
        let (tx, rx) = unbounded();

        let socket = driver
            .connect_tcp(addr, Box::new(Switcher { events: tx.clone() }))
            .unwrap();

        expect(&rx, Event::DidOpen);
        expect(&rx, Event::WillBecome);
        expect(&rx, Event::DidBecome);
        expect(&rx, Event::DidOpen);
        assert_eq!(collect(&rx, 4), b"swap");

        socket.close();
        expect(&rx, Event::WillClose);
        expect(&rx, Event::DidClose);
    }

    #[test]
    fn test_plain_socket_is_not_secure() {
        let driver = started(DriverConfig::default());
        let (_listener, addr) = echo_server(&driver, false);
        let (tx, rx) = unbounded();
        let socket = driver.connect_tcp(addr, Box::new(Recorder::new(&tx, b""))).unwrap();
        expect(&rx, Event::WillConnect);
        expect(&rx, Event::WillOpen);
        expect(&rx, Event::DidOpen);

        assert!(!socket.is_secure());
        assert!(matches!(socket.context().tls_protocol(), Err(NetError::NotSecure)));
        assert!(matches!(socket.context().tls_cipher_suite(), Err(NetError::NotSecure)));
        socket.close();
    }

    /// Client writing a payload in randomly sized chunks
    struct Fragmenter {
        events: Sender<Event>,
        payload: Vec<u8>,
        offset: usize,
    }

    impl SocketHandler for Fragmenter {
        fn did_open(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            self.events.send(Event::DidOpen)?;
            ctx.request_read();
            ctx.trigger_write();
            Ok(())
        }

        fn do_write(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            let mut rng = rand::thread_rng();
            while self.offset < self.payload.len() {
                let remaining = self.payload.len() - self.offset;
                let size = rng.gen_range(1..=4096).min(remaining);
                let n = ctx.write(&self.payload[self.offset..self.offset + size])?;
                self.offset += n;
                if n < size {
                    ctx.request_write();
                    return Ok(());
                }
            }
            Ok(())
        }

        fn do_read(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            let size = rand::thread_rng().gen_range(1..=2048);
            let mut buf = vec![0u8; size];
            loop {
                match ctx.read(&mut buf)? {
                    Some(0) => {
                        ctx.request_read();
                        return Ok(());
                    }
                    Some(n) => self.events.send(Event::Data(buf[..n].to_vec()))?,
                    None => return Ok(()),
                }
            }
        }

        fn did_close(&mut self, _ctx: &dyn SocketContext) -> HandlerResult {
            self.events.send(Event::DidClose)?;
            Ok(())
        }
    }

    #[test]
    fn test_tls_round_trip_fragmented() {
        let (cert, key) = self_signed();
        let driver = Driver::new();
        driver
            .set_tls_settings(tls_settings(&cert).with_identity(vec![cert.clone()], key))
            .unwrap();
        driver.start().unwrap();
        let (listener, addr) = echo_server(&driver, true);
        assert!(listener.is_secure());

        let mut rng = rand::thread_rng();
        let payload: Vec<u8> = (0..100_000).map(|_| rng.gen()).collect();
        let (tx, rx) = unbounded();
        let socket = driver
            .connect_tls(
                addr,
                Box::new(Fragmenter {
                    events: tx,
                    payload: payload.clone(),
                    offset: 0,
                }),
            )
            .unwrap();

        expect(&rx, Event::DidOpen);
        assert!(socket.is_secure());
        assert_eq!(collect(&rx, payload.len()), payload);
        assert!(socket.context().tls_protocol().unwrap().is_some());
        assert!(socket.context().tls_cipher_suite().unwrap().is_some());

        socket.close();
        expect(&rx, Event::DidClose);
        assert_eq!(socket.state(), SocketState::Closed);
    }

    #[test]
    fn test_tls_client_auth_required() {
        let (cert, key) = self_signed();
        let server = Driver::new();
        server
            .set_tls_settings(
                tls_settings(&cert)
                    .with_identity(vec![cert.clone()], key)
                    .with_client_auth(ClientAuth::Need)
                    .with_protocols(vec!["TLSv1.2".to_string()]),
            )
            .unwrap();
        server.start().unwrap();
        let (_listener, addr) = echo_server(&server, true);

        let client = Driver::new();
        client
            .set_tls_settings(tls_settings(&cert).with_protocols(vec!["TLSv1.2".to_string()]))
            .unwrap();
        client.start().unwrap();

        let (tx, rx) = unbounded();
        let socket = client.connect_tls(addr, Box::new(Recorder::new(&tx, b"ping"))).unwrap();

        expect(&rx, Event::WillConnect);
        expect(&rx, Event::WillOpen);
        expect(&rx, Event::WillClose);
        expect(&rx, Event::DidClose);
        assert_eq!(socket.state(), SocketState::Closed);
    }

    #[test]
    fn test_stop_closes_transports() {
        let driver = started(DriverConfig::default());
        let (listener, addr) = echo_server(&driver, false);
        let (tx, rx) = unbounded();
        let socket = driver.connect_tcp(addr, Box::new(Recorder::new(&tx, b""))).unwrap();
        expect(&rx, Event::WillConnect);
        expect(&rx, Event::WillOpen);
        expect(&rx, Event::DidOpen);

        driver.stop();
        assert!(!driver.is_started());
        assert!(matches!(socket.connect(addr), Err(NetError::Unbound)));
        assert!(matches!(
            listener.listen("127.0.0.1:0".parse().unwrap()),
            Err(NetError::Unbound)
        ));
    }

    #[test]
    fn test_external_executor() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .build()
            .unwrap();
        let driver = Driver::new().with_executor(Arc::new(runtime.handle().clone()));
        driver.start().unwrap();
        let (_listener, addr) = echo_server(&driver, false);
        let (tx, rx) = unbounded();

        let socket = driver.connect_tcp(addr, Box::new(Recorder::new(&tx, b"ext"))).unwrap();
        expect(&rx, Event::WillConnect);
        expect(&rx, Event::WillOpen);
        expect(&rx, Event::DidOpen);
        assert_eq!(collect(&rx, 3), b"ext");

        driver.stop();
        expect(&rx, Event::WillClose);
        expect(&rx, Event::DidClose);
        assert_eq!(socket.state(), SocketState::Closed);
    }

    /// Server side: sends a greeting, then nothing
    struct Greeter;

    impl SocketHandler for Greeter {
        fn idle_timeout(&self) -> i64 {
            0
        }

        fn did_open(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            ctx.write(b"hello")?;
            Ok(())
        }
    }

    /// Client reporting each readiness callback once, without re-arming
    struct Tally {
        events: Sender<Event>,
    }

    impl SocketHandler for Tally {
        fn did_open(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            self.events.send(Event::DidOpen)?;
            ctx.request_read();
            ctx.cancel_read();
            ctx.request_write();
            ctx.request_write();
            Ok(())
        }

        fn do_read(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            let mut buf = [0u8; 64];
            let n = ctx.read(&mut buf)?.unwrap_or(0);
            self.events.send(Event::Data(buf[..n].to_vec()))?;
            Ok(())
        }

        fn do_write(&mut self, _ctx: &dyn SocketContext) -> HandlerResult {
            self.events.send(Event::Writable)?;
            Ok(())
        }
    }

    #[test]
    fn test_requests_coalesce_and_cancel() {
        let driver = started(DriverConfig::default());
        let greeter = Server::new(Box::new(|| -> Box<dyn SocketHandler> { Box::new(Greeter) }));
        let (_listener, addr) = serve(&driver, false, greeter);
        let (tx, rx) = unbounded();
        let socket = driver.connect_tcp(addr, Box::new(Tally { events: tx })).unwrap();

        expect(&rx, Event::DidOpen);
        // cancelled read never fires although the greeting is pending
        expect(&rx, Event::Writable);
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        socket.context().request_read();
        socket.context().request_read();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Event::Data(b"hello".to_vec()));
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        socket.close();
    }

    #[test]
    fn test_traffic_defers_idle_timeout() {
        let config = DriverConfig::from_toml_str("[selector]\nidle_interval_ms = 20").unwrap();
        let driver = started(config);
        let (_listener, addr) = echo_server(&driver, false);
        let (tx, rx) = unbounded();

        let mut recorder = Recorder::new(&tx, b"");
        recorder.idle = 150;
        let socket = driver.connect_tcp(addr, Box::new(recorder)).unwrap();
        expect(&rx, Event::WillConnect);
        expect(&rx, Event::WillOpen);
        expect(&rx, Event::DidOpen);

        let opened = Instant::now();
        for _ in 0..8 {
            socket.context().write(b".").unwrap();
            std::thread::sleep(Duration::from_millis(50));
            assert!(rx.try_iter().all(|event| matches!(event, Event::Data(_))));
        }
        loop {
            match rx.recv_timeout(WAIT).unwrap() {
                Event::Data(_) => continue,
                Event::Timeout => break,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(opened.elapsed() >= Duration::from_millis(450));
        expect(&rx, Event::WillClose);
        expect(&rx, Event::DidClose);
    }

    /// Server side: sends `remaining` bytes as 20-byte writes once open
    struct Burst {
        remaining: usize,
    }

    impl Burst {
        fn pump(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            while self.remaining > 0 {
                let size = self.remaining.min(20);
                let n = ctx.write(&[b'r'; 20][..size])?;
                if n == 0 {
                    ctx.request_write();
                    return Ok(());
                }
                self.remaining -= n;
            }
            Ok(())
        }
    }

    impl SocketHandler for Burst {
        fn idle_timeout(&self) -> i64 {
            0
        }

        fn did_open(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            self.pump(ctx)
        }

        fn do_write(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            self.pump(ctx)
        }
    }

    /// Client that lets input pile up, then reads once per callback
    struct Sluggish {
        events: Sender<Event>,
    }

    impl SocketHandler for Sluggish {
        fn did_open(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            std::thread::sleep(Duration::from_millis(400));
            ctx.request_read();
            Ok(())
        }

        fn do_read(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
            let mut buf = vec![0u8; 65536];
            match ctx.read(&mut buf)? {
                Some(n) => {
                    if n > 0 {
                        self.events.send(Event::Data(buf[..n].to_vec()))?;
                    }
                    ctx.request_read();
                }
                None => self.events.send(Event::Eof)?,
            }
            Ok(())
        }
    }

    #[test]
    fn test_tls_single_read_per_callback_drains_backlog() {
        for protocol in ["TLSv1.2", "TLSv1.3"] {
            let (cert, key) = self_signed();
            let driver = Driver::new();
            driver
                .set_tls_settings(
                    tls_settings(&cert)
                        .with_identity(vec![cert.clone()], key)
                        .with_protocols(vec![protocol.to_string()]),
                )
                .unwrap();
            driver.start().unwrap();
            let burst = Server::new(Box::new(|| -> Box<dyn SocketHandler> {
                Box::new(Burst { remaining: 6000 })
            }));
            let (_listener, addr) = serve(&driver, true, burst);

            let (tx, rx) = unbounded();
            let socket = driver.connect_tls(addr, Box::new(Sluggish { events: tx })).unwrap();
            assert_eq!(collect(&rx, 6000), vec![b'r'; 6000], "{}", protocol);

            socket.close();
            driver.stop();
        }
    }

    #[test]
    fn test_tls_half_close_reaches_closed() {
        let (cert, key) = self_signed();
        let driver = Driver::new();
        driver
            .set_tls_settings(tls_settings(&cert).with_identity(vec![cert.clone()], key))
            .unwrap();
        driver.start().unwrap();
        let (server_tx, server_rx) = unbounded();
        let (_listener, addr) = serve(&driver, true, Server::recording(&server_tx));
        let (tx, rx) = unbounded();

        let mut recorder = Recorder::new(&tx, b"");
        recorder.half_close = true;
        let socket = driver.connect_tls(addr, Box::new(recorder)).unwrap();

        // close_notify goes out, the peer answers with its own, no close() involved
        let mut seen = Vec::new();
        loop {
            let event = rx.recv_timeout(WAIT).unwrap();
            if matches!(event, Event::Eof | Event::Data(_)) {
                continue;
            }
            seen.push(event.clone());
            if event == Event::DidClose {
                break;
            }
        }
        assert_eq!(
            seen,
            [
                Event::WillConnect,
                Event::WillOpen,
                Event::DidOpen,
                Event::WillClose,
                Event::DidClose
            ]
        );
        assert_eq!(socket.state(), SocketState::Closed);
        expect(&server_rx, Event::WillClose);
        expect(&server_rx, Event::DidClose);
    }

    /// Server side: completes the handshake and never reads
    struct Silent;

    impl SocketHandler for Silent {
        fn idle_timeout(&self) -> i64 {
            0
        }
    }

    #[test]
    fn test_close_while_closing_runs_callbacks_once() {
        let (cert, key) = self_signed();
        let driver = Driver::new();
        driver
            .set_tls_settings(tls_settings(&cert).with_identity(vec![cert.clone()], key))
            .unwrap();
        driver.start().unwrap();
        let silent = Server::new(Box::new(|| -> Box<dyn SocketHandler> { Box::new(Silent) }));
        let (_listener, addr) = serve(&driver, true, silent);
        let (tx, rx) = unbounded();

        let mut recorder = Recorder::new(&tx, b"");
        recorder.half_close = true;
        let socket = driver.connect_tls(addr, Box::new(recorder)).unwrap();
        expect(&rx, Event::WillConnect);
        expect(&rx, Event::WillOpen);
        expect(&rx, Event::DidOpen);

        // the peer's close_notify never comes, so the socket stays closing
        wait_until("closing", || socket.state() == SocketState::Closing);
        socket.close();
        socket.close();
        expect(&rx, Event::WillClose);
        expect(&rx, Event::DidClose);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(socket.state(), SocketState::Closed);
        socket.close();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
