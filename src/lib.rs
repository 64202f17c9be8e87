//! # netdrive
//!
//! Non-blocking, event-driven TCP and TLS transports multiplexed over a
//! single selector thread.
//!
//! ## Architecture
//!
//! The crate is organized into the following layers:
//!
//! - **Driver**: lifecycle of the selector thread and task executor, settings, bind surface
//! - **Selector**: readiness multiplexing, interest sets, idle-timeout sweeps
//! - **Socket / Listener**: lock-free lifecycle state machines driven by reader/writer/acceptor lanes
//! - **TLS**: handshake, wrap and unwrap layered over the plain byte stream
//! - **Flow**: request/cancel/trigger flow control exposed to handlers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use netdrive::{Driver, SocketContext, SocketHandler, HandlerResult};
//!
//! struct Echo;
//!
//! impl SocketHandler for Echo {
//!     fn did_open(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
//!         ctx.request_read();
//!         Ok(())
//!     }
//!
//!     fn do_read(&mut self, ctx: &dyn SocketContext) -> HandlerResult {
//!         let mut buf = [0u8; 1024];
//!         if let Some(n) = ctx.read(&mut buf)? {
//!             ctx.write(&buf[..n])?;
//!             ctx.request_read();
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let driver = Driver::new();
//! driver.start()?;
//! let socket = driver.connect_tcp("127.0.0.1:7000".parse()?, Box::new(Echo))?;
//! ```

pub mod util;
pub mod flow;
pub mod task;
pub mod transport;
pub mod selector;
pub mod socket;
pub mod listener;
pub mod driver;
pub mod logger;

// Re-export commonly used types
pub use util::{DriverConfig, StatusWord};
pub use flow::{FlowContext, FlowControl};
pub use task::{Executor, TaskCell};
pub use transport::{ClientAuth, TcpSettings, TlsSettings, Transport, TransportContext};
pub use selector::{Selector, SelectorSettings};
pub use socket::{HandlerResult, SocketContext, SocketHandler, SocketRef, SocketState};
pub use listener::{ListenerContext, ListenerHandler, ListenerRef, ListenerState};
pub use driver::Driver;
pub use logger::init_logging;

/// Error types for the transport engine
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum NetError {
        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        #[error("TLS error: {0}")]
        Tls(#[from] rustls::Error),

        #[error("Transport is not bound to a running selector")]
        Unbound,

        #[error("Driver is not started")]
        NotStarted,

        #[error("Driver is already started")]
        AlreadyStarted,

        #[error("Transport is not secure")]
        NotSecure,

        #[error("Invalid client auth: {0}")]
        InvalidClientAuth(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("TLS network buffer overflow")]
        BufferOverflow,

        #[error("Connection closed")]
        ConnectionClosed,
    }

    pub type Result<T> = std::result::Result<T, NetError>;
}

pub use error::{NetError, Result};

/// Constants used throughout the engine
pub mod consts {
    /// Default idle timeout for sockets (milliseconds)
    pub const DEFAULT_IDLE_TIMEOUT: u64 = 90_000;
    /// Default interval between idle sweeps (milliseconds)
    pub const DEFAULT_IDLE_INTERVAL: u64 = 1_000;
    /// Default event capacity of one selector pass
    pub const DEFAULT_POLL_CAPACITY: usize = 1024;

    /// Default listen backlog
    pub const DEFAULT_BACKLOG: i32 = 1024;

    /// Largest TLS record on the wire: 2^14 plaintext + 2048 expansion + 5 header
    pub const TLS_PACKET_BUFFER_SIZE: usize = 16 * 1024 + 2048 + 5;

    /// Scratch buffer used to drain and discard input after a read half-close
    pub const DISCARD_BUFFER_SIZE: usize = 4096;

    /// Bounded wait used by lifecycle barriers (milliseconds)
    pub const LIFECYCLE_POLL_INTERVAL: u64 = 100;

    /// Selector token reserved for the shutdown waker
    pub const WAKE_TOKEN: usize = 0;
    /// First token handed out to transports
    pub const TRANSPORT_TOKEN_START: usize = 1;
}
