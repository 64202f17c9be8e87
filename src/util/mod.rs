//! # Utility Module
//!
//! Common utilities used across the engine.

mod status;
mod config;

pub use status::StatusWord;
pub use config::*;

use std::net::SocketAddr;

/// Format a `host:port` authority, bracketing IPv6 literals
pub fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Format an optional socket address for logging
pub fn display_address(addr: Option<SocketAddr>) -> String {
    match addr {
        Some(addr) => authority(&addr.ip().to_string(), addr.port()),
        None => "-".to_string(),
    }
}
