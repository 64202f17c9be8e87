//! # Flow Module
//!
//! Flow control requested by the application layer. Requests are
//! edge-triggered: each accepted request yields at most one readiness
//! callback, after which it must be re-issued.

/// Combined read/write interest of a flow-controlled transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// Neither reading nor writing
    #[default]
    Wait,
    /// Reading only
    AcceptRead,
    /// Writing only
    AcceptWrite,
    /// Both reading and writing
    AcceptReadWrite,
}

impl FlowControl {
    pub fn from_flags(read: bool, write: bool) -> Self {
        match (read, write) {
            (false, false) => FlowControl::Wait,
            (true, false) => FlowControl::AcceptRead,
            (false, true) => FlowControl::AcceptWrite,
            (true, true) => FlowControl::AcceptReadWrite,
        }
    }

    pub fn is_read_enabled(self) -> bool {
        matches!(self, FlowControl::AcceptRead | FlowControl::AcceptReadWrite)
    }

    pub fn is_write_enabled(self) -> bool {
        matches!(self, FlowControl::AcceptWrite | FlowControl::AcceptReadWrite)
    }

    /// Union of both interests
    pub fn or(self, other: FlowControl) -> Self {
        Self::from_flags(
            self.is_read_enabled() || other.is_read_enabled(),
            self.is_write_enabled() || other.is_write_enabled(),
        )
    }

    /// Remove the interests present in `other`
    pub fn without(self, other: FlowControl) -> Self {
        Self::from_flags(
            self.is_read_enabled() && !other.is_read_enabled(),
            self.is_write_enabled() && !other.is_write_enabled(),
        )
    }
}

impl std::fmt::Display for FlowControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlowControl::Wait => "wait",
            FlowControl::AcceptRead => "read",
            FlowControl::AcceptWrite => "write",
            FlowControl::AcceptReadWrite => "read-write",
        };
        f.write_str(s)
    }
}

/// Request/cancel/trigger contract for read and write readiness, plus
/// half-close.
pub trait FlowContext: Send + Sync {
    /// Current read/write requests
    fn flow_control(&self) -> FlowControl;

    /// Replace the read/write requests, requesting and cancelling as needed
    fn set_flow_control(&self, flow: FlowControl) {
        let current = self.flow_control();
        if flow.is_read_enabled() && !current.is_read_enabled() {
            self.request_read();
        } else if !flow.is_read_enabled() && current.is_read_enabled() {
            self.cancel_read();
        }
        if flow.is_write_enabled() && !current.is_write_enabled() {
            self.request_write();
        } else if !flow.is_write_enabled() && current.is_write_enabled() {
            self.cancel_write();
        }
    }

    /// Ask for one read-readiness callback
    fn request_read(&self);
    /// Withdraw a pending read request
    fn cancel_read(&self);
    /// Schedule a read callback now, without waiting for readiness
    fn trigger_read(&self);

    /// Ask for one write-readiness callback
    fn request_write(&self);
    /// Withdraw a pending write request
    fn cancel_write(&self);
    /// Schedule a write callback now, without waiting for readiness
    fn trigger_write(&self);

    /// Permanently stop reading; returns false if already done or not connected
    fn done_reading(&self) -> bool;
    /// Permanently stop writing; returns false if already done or not connected
    fn done_writing(&self) -> bool;
}
