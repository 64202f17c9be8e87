//! Registration handles binding a transport to the selector

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use mio::event::Event;
use mio::{Interest, Token};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::transport::{Transport, TransportContext, OP_ACCEPT, OP_CONNECT, OP_READ, OP_WRITE};
use super::SelectorShared;

/// Interest-set entry of one transport
pub(crate) struct Registration {
    token: Token,
    pub(crate) transport: Arc<dyn Transport>,
    selector: Weak<SelectorShared>,
    ops: AtomicU8,
    armed: AtomicBool,
    arm_lock: Mutex<()>,
    last_activity: AtomicU64,
}

fn interest_of(ops: u8) -> Option<Interest> {
    let readable = ops & (OP_ACCEPT | OP_READ) != 0;
    let writable = ops & (OP_CONNECT | OP_WRITE) != 0;
    match (readable, writable) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

impl Registration {
    pub(crate) fn new(
        token: Token,
        transport: Arc<dyn Transport>,
        selector: Weak<SelectorShared>,
        now: u64,
    ) -> Self {
        Self {
            token,
            transport,
            selector,
            ops: AtomicU8::new(0),
            armed: AtomicBool::new(false),
            arm_lock: Mutex::new(()),
            last_activity: AtomicU64::new(now),
        }
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn ops(&self) -> u8 {
        self.ops.load(Ordering::Acquire)
    }

    fn request(&self, op: u8) {
        self.ops.fetch_or(op, Ordering::AcqRel);
        self.arm();
    }

    fn cancel(&self, op: u8) {
        self.ops.fetch_and(!op, Ordering::AcqRel);
    }

    /// Register or re-register the channel with the current interest set.
    ///
    /// Re-registering makes the poller re-check readiness, so every request
    /// yields a fresh event when the channel is already ready.
    fn arm(&self) {
        let Some(selector) = self.selector.upgrade() else {
            return;
        };
        let _guard = self.arm_lock.lock();
        let Some(interest) = interest_of(self.ops()) else {
            return;
        };
        let first = !self.armed.load(Ordering::Acquire);
        let result = self.transport.with_source(&mut |source| {
            if first {
                selector.registry.register(source, self.token, interest)
            } else {
                selector.registry.reregister(source, self.token, interest)
            }
        });
        match result {
            Ok(()) => {
                if first {
                    self.armed.store(true, Ordering::Release);
                    self.touch(selector.now_millis());
                }
            }
            Err(e) => warn!(token = self.token.0, "Failed to arm registration: {}", e),
        }
    }

    fn take(&self, op: u8) -> bool {
        self.ops.fetch_and(!op, Ordering::AcqRel) & op != 0
    }

    fn touch(&self, now: u64) {
        self.last_activity.store(now, Ordering::Release);
    }

    /// Translate one readiness event into transport callbacks
    pub(crate) fn dispatch(&self, event: &Event, now: u64) {
        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
        let writable = event.is_writable() || event.is_write_closed() || event.is_error();

        if readable {
            if self.take(OP_ACCEPT) {
                trace!(token = self.token.0, "dispatch accept");
                self.touch(now);
                self.transport.dispatch_accept();
            }
            if self.take(OP_READ) {
                trace!(token = self.token.0, "dispatch read");
                self.touch(now);
                self.transport.dispatch_read();
            }
        }
        if writable {
            if self.take(OP_CONNECT) {
                trace!(token = self.token.0, "dispatch connect");
                self.touch(now);
                self.transport.dispatch_connect();
            }
            if self.take(OP_WRITE) {
                trace!(token = self.token.0, "dispatch write");
                self.touch(now);
                self.transport.dispatch_write();
            }
        }
    }

    /// Check the idle clock; on expiry the clock restarts
    pub(crate) fn expire_idle(&self, now: u64, default_timeout: u64) -> bool {
        if !self.armed.load(Ordering::Acquire) {
            return false;
        }
        let timeout = match self.transport.idle_timeout() {
            0 => return false,
            t if t < 0 => default_timeout,
            t => t as u64,
        };
        let last = self.last_activity.load(Ordering::Acquire);
        if now.saturating_sub(last) < timeout {
            return false;
        }
        self.last_activity
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drop all interest and release the channel from the poller
    fn release(&self) {
        self.ops.store(0, Ordering::Release);
        let _guard = self.arm_lock.lock();
        if !self.armed.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(selector) = self.selector.upgrade() {
            let result = self
                .transport
                .with_source(&mut |source| selector.registry.deregister(source));
            if let Err(e) = result {
                trace!(token = self.token.0, "Deregister failed: {}", e);
            }
        }
    }
}

/// Transport-side handle on a registration.
///
/// Every operation is a no-op once the registration was closed or the
/// selector stopped.
#[derive(Clone, Default)]
pub struct TransportRef {
    registration: Weak<Registration>,
}

impl TransportRef {
    pub(crate) fn new(registration: &Arc<Registration>) -> Self {
        Self {
            registration: Arc::downgrade(registration),
        }
    }

    /// Unbound handle
    pub fn unbound() -> Self {
        Self::default()
    }

    /// Selector token, if still bound
    pub fn token(&self) -> Option<usize> {
        self.registration.upgrade().map(|r| r.token.0)
    }

    fn with(&self, f: impl FnOnce(&Registration)) {
        if let Some(registration) = self.registration.upgrade() {
            f(&registration);
        }
    }
}

impl TransportContext for TransportRef {
    fn is_bound(&self) -> bool {
        self.registration
            .upgrade()
            .map_or(false, |r| r.selector.strong_count() > 0)
    }

    fn request_accept(&self) {
        self.with(|r| r.request(OP_ACCEPT));
    }

    fn cancel_accept(&self) {
        self.with(|r| r.cancel(OP_ACCEPT));
    }

    fn request_connect(&self) {
        self.with(|r| r.request(OP_CONNECT));
    }

    fn cancel_connect(&self) {
        self.with(|r| r.cancel(OP_CONNECT));
    }

    fn request_read(&self) {
        self.with(|r| r.request(OP_READ));
    }

    fn cancel_read(&self) {
        self.with(|r| r.cancel(OP_READ));
    }

    fn request_write(&self) {
        self.with(|r| r.request(OP_WRITE));
    }

    fn cancel_write(&self) {
        self.with(|r| r.cancel(OP_WRITE));
    }

    fn close(&self) {
        self.with(|r| {
            if let Some(selector) = r.selector.upgrade() {
                selector.registrations.remove(&r.token);
            }
            r.release();
        });
    }
}
