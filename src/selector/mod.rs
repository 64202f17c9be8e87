//! # Selector Module
//!
//! A single thread multiplexing readiness events for every bound transport.
//!
//! Each pass blocks on [`mio::Poll`] until the next idle-sweep deadline,
//! clears the interest bits of every ready registration and invokes the
//! matching [`Transport`] callback. On shutdown every remaining transport
//! receives `dispatch_close`.

mod registration;

pub use registration::TransportRef;
pub(crate) use registration::Registration;

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::consts;
use crate::transport::Transport;
use crate::util::SelectorConfig;
use crate::{NetError, Result};

/// Selector tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorSettings {
    /// Interval between idle sweeps
    pub idle_interval: Duration,
    /// Idle timeout for transports asking for the default
    pub idle_timeout: Duration,
    /// Events handled per poll pass
    pub poll_capacity: usize,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(consts::DEFAULT_IDLE_INTERVAL),
            idle_timeout: Duration::from_millis(consts::DEFAULT_IDLE_TIMEOUT),
            poll_capacity: consts::DEFAULT_POLL_CAPACITY,
        }
    }
}

impl SelectorSettings {
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_poll_capacity(mut self, capacity: usize) -> Self {
        self.poll_capacity = capacity.max(1);
        self
    }
}

impl From<&SelectorConfig> for SelectorSettings {
    fn from(config: &SelectorConfig) -> Self {
        SelectorSettings::default()
            .with_idle_interval(config.idle_interval_duration())
            .with_idle_timeout(config.idle_timeout_duration())
            .with_poll_capacity(config.poll_capacity)
    }
}

/// State shared between the selector thread and registration handles
pub(crate) struct SelectorShared {
    pub(crate) registry: Registry,
    waker: Waker,
    pub(crate) registrations: DashMap<Token, Arc<Registration>>,
    next_token: AtomicUsize,
    running: AtomicBool,
    epoch: Instant,
    settings: SelectorSettings,
}

impl SelectorShared {
    pub(crate) fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn dispatch(&self, events: &Events) {
        for event in events.iter() {
            let token = event.token();
            if token.0 == consts::WAKE_TOKEN {
                continue;
            }
            let registration = match self.registrations.get(&token) {
                Some(entry) => Arc::clone(entry.value()),
                None => continue,
            };
            let now = self.now_millis();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| registration.dispatch(event, now)));
            if outcome.is_err() {
                error!(token = token.0, "Transport panicked during dispatch, closing");
                self.isolate(&registration);
            }
        }
    }

    fn sweep_idle(&self) {
        let now = self.now_millis();
        let default_timeout = self.settings.idle_timeout.as_millis() as u64;
        let expired: Vec<Arc<Registration>> = self
            .registrations
            .iter()
            .filter(|entry| entry.value().expire_idle(now, default_timeout))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for registration in expired {
            debug!(token = registration.token().0, "Transport idle, dispatching timeout");
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| registration.transport.dispatch_timeout()));
            if outcome.is_err() {
                error!(token = registration.token().0, "Transport panicked during timeout, closing");
                self.isolate(&registration);
            }
        }
    }

    fn isolate(&self, registration: &Arc<Registration>) {
        let _ = panic::catch_unwind(AssertUnwindSafe(|| registration.transport.dispatch_close()));
    }

    fn teardown(&self) {
        let tokens: Vec<Token> = self.registrations.iter().map(|entry| *entry.key()).collect();
        for token in tokens {
            if let Some((_, registration)) = self.registrations.remove(&token) {
                self.isolate(&registration);
            }
        }
    }
}

fn run_loop(shared: Arc<SelectorShared>, mut poll: Poll) {
    let interval = shared.settings.idle_interval;
    let mut events = Events::with_capacity(shared.settings.poll_capacity);
    let mut next_sweep = Instant::now() + interval;

    while shared.running.load(Ordering::Acquire) {
        let timeout = next_sweep.saturating_duration_since(Instant::now());
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("Selector poll failed: {}", e);
            break;
        }

        shared.dispatch(&events);

        if Instant::now() >= next_sweep {
            shared.sweep_idle();
            next_sweep = Instant::now() + interval;
        }
    }

    shared.running.store(false, Ordering::Release);
    shared.teardown();
    info!("Selector stopped");
}

/// Readiness multiplexer owning one selector thread
pub struct Selector {
    shared: Arc<SelectorShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Selector {
    /// Spawn the selector thread
    pub fn start(settings: SelectorSettings) -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), Token(consts::WAKE_TOKEN))?;

        let shared = Arc::new(SelectorShared {
            registry,
            waker,
            registrations: DashMap::new(),
            next_token: AtomicUsize::new(consts::TRANSPORT_TOKEN_START),
            running: AtomicBool::new(true),
            epoch: Instant::now(),
            settings,
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("netdrive-selector".to_string())
            .spawn(move || run_loop(thread_shared, poll))?;
        let thread_id = handle.thread().id();

        info!(
            "Selector started (idle interval {:?}, idle timeout {:?})",
            shared.settings.idle_interval, shared.settings.idle_timeout
        );
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    pub fn settings(&self) -> &SelectorSettings {
        &self.shared.settings
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of live registrations
    pub fn transport_count(&self) -> usize {
        self.shared.registrations.len()
    }

    /// Bind a transport, returning the handle it uses to request interest
    pub fn bind_transport(&self, transport: Arc<dyn Transport>) -> Result<TransportRef> {
        if !self.is_running() {
            return Err(NetError::Unbound);
        }
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        let registration = Arc::new(Registration::new(
            token,
            transport,
            Arc::downgrade(&self.shared),
            self.shared.now_millis(),
        ));
        let transport_ref = TransportRef::new(&registration);
        self.shared.registrations.insert(token, registration);
        debug!(token = token.0, "Transport bound");
        Ok(transport_ref)
    }

    /// Stop the selector thread; every remaining transport is closed
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.shared.waker.wake() {
                warn!("Failed to wake selector: {}", e);
            }
        }
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("Selector thread panicked");
            }
        }
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportContext;
    use crossbeam::channel::{unbounded, Sender};
    use std::net::TcpStream;

    struct Stub {
        listener: Mutex<mio::net::TcpListener>,
        idle_timeout: i64,
        events: Sender<&'static str>,
    }

    impl Stub {
        fn new(idle_timeout: i64, events: Sender<&'static str>) -> Arc<Self> {
            let listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            Arc::new(Self {
                listener: Mutex::new(listener),
                idle_timeout,
                events,
            })
        }
    }

    impl Transport for Stub {
        fn with_source(
            &self,
            f: &mut dyn FnMut(&mut dyn mio::event::Source) -> io::Result<()>,
        ) -> io::Result<()> {
            f(&mut *self.listener.lock())
        }

        fn idle_timeout(&self) -> i64 {
            self.idle_timeout
        }

        fn dispatch_accept(&self) {
            let _ = self.events.send("accept");
        }

        fn dispatch_timeout(&self) {
            let _ = self.events.send("timeout");
        }

        fn dispatch_close(&self) {
            let _ = self.events.send("close");
        }
    }

    fn fast() -> SelectorSettings {
        SelectorSettings::default().with_idle_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_accept_is_edge_triggered() {
        let selector = Selector::start(fast()).unwrap();
        let (tx, rx) = unbounded();
        let stub = Stub::new(0, tx);
        let addr = stub.listener.lock().local_addr().unwrap();
        let transport = selector.bind_transport(stub.clone()).unwrap();

        transport.request_accept();
        let _client = TcpStream::connect(addr).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "accept");

        // Not re-requested: no further callback even though still acceptable
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        transport.request_accept();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "accept");
    }

    #[test]
    fn test_cancel_suppresses_dispatch() {
        let selector = Selector::start(fast()).unwrap();
        let (tx, rx) = unbounded();
        let stub = Stub::new(0, tx);
        let addr = stub.listener.lock().local_addr().unwrap();
        let transport = selector.bind_transport(stub.clone()).unwrap();

        transport.request_accept();
        transport.cancel_accept();
        let _client = TcpStream::connect(addr).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    }

    #[test]
    fn test_idle_timeout_fires() {
        let selector = Selector::start(fast()).unwrap();
        let (tx, rx) = unbounded();
        let stub = Stub::new(50, tx);
        let transport = selector.bind_transport(stub.clone()).unwrap();

        transport.request_accept();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "timeout");
    }

    #[test]
    fn test_unregistered_transport_not_swept() {
        let selector = Selector::start(fast()).unwrap();
        let (tx, rx) = unbounded();
        let stub = Stub::new(1, tx);
        let _transport = selector.bind_transport(stub.clone()).unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_stop_closes_transports() {
        let selector = Selector::start(fast()).unwrap();
        let (tx, rx) = unbounded();
        let transport = selector.bind_transport(Stub::new(0, tx)).unwrap();
        assert!(transport.is_bound());
        assert_eq!(selector.transport_count(), 1);

        selector.stop();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "close");
        assert!(!selector.is_running());
        assert!(!transport.is_bound());
        assert!(matches!(
            selector.bind_transport(Stub::new(0, unbounded().0)),
            Err(NetError::Unbound)
        ));
    }

    #[test]
    fn test_close_removes_registration() {
        let selector = Selector::start(fast()).unwrap();
        let (tx, _rx) = unbounded();
        let transport = selector.bind_transport(Stub::new(0, tx)).unwrap();
        transport.request_accept();
        transport.close();
        assert_eq!(selector.transport_count(), 0);
        assert!(!transport.is_bound());
    }

    #[test]
    fn test_settings_from_config() {
        let config = SelectorConfig::default();
        let settings = SelectorSettings::from(&config);
        assert_eq!(settings.poll_capacity, config.poll_capacity);
        assert_eq!(settings.idle_timeout, config.idle_timeout_duration());
    }
}
