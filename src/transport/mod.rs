//! # Transport Module
//!
//! Low-level contract between the selector and a transport.
//!
//! ## Components
//!
//! - **Transport**: callbacks invoked by the selector when a requested readiness fires
//! - **TransportContext**: interest-set changes requested by a transport
//! - **TcpSettings / TlsSettings**: immutable option values consumed at construction
//! - **TLS**: certificate loading and rustls configuration building

mod config;
pub mod tls;

pub use config::{ClientAuth, TcpSettings, TlsSettings};
pub use tls::{load_certs, load_private_key, webpki_roots};

use std::io;

/// Interest operation: accept an inbound connection
pub const OP_ACCEPT: u8 = 1 << 0;
/// Interest operation: finish an outbound connect
pub const OP_CONNECT: u8 = 1 << 1;
/// Interest operation: read
pub const OP_READ: u8 = 1 << 2;
/// Interest operation: write
pub const OP_WRITE: u8 = 1 << 3;

/// Callbacks invoked by the selector on a bound transport
pub trait Transport: Send + Sync + 'static {
    /// Give the selector access to the registered channel
    fn with_source(
        &self,
        f: &mut dyn FnMut(&mut dyn mio::event::Source) -> io::Result<()>,
    ) -> io::Result<()>;

    /// Idle timeout in milliseconds: negative uses the selector default, 0 never expires
    fn idle_timeout(&self) -> i64 {
        -1
    }

    fn dispatch_accept(&self) {}
    fn dispatch_connect(&self) {}
    fn dispatch_read(&self) {}
    fn dispatch_write(&self) {}
    fn dispatch_timeout(&self) {}
    fn dispatch_close(&self);
}

/// Interest-set changes a transport asks of its selector
pub trait TransportContext: Send + Sync {
    /// Check if the registration is still live
    fn is_bound(&self) -> bool;

    fn request_accept(&self);
    fn cancel_accept(&self);
    fn request_connect(&self);
    fn cancel_connect(&self);
    fn request_read(&self);
    fn cancel_read(&self);
    fn request_write(&self);
    fn cancel_write(&self);

    /// Cancel all interest and release the registration
    fn close(&self);
}
