//! Tunnelgate - HTTP edge services for a tunnelled media converter
//!
//! One binary runs one of three services:
//! - `proxy`: a streaming reverse proxy in front of a single upstream
//! - `media`: the converter API that searches, downloads and transcodes
//!   audio with external tools and serves the results from a media root
//! - `gateway`: a thin public gateway that forwards a fixed set of routes to
//!   the converter over a tunnel URL

pub mod body;
pub mod config;
pub mod cors;
pub mod error;
pub mod gateway;
pub mod media;
pub mod pool;
pub mod proxy;
pub mod server;
pub mod tools;
pub mod upstream;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
