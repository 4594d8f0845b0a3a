//! # hkv-server
//!
//! TCP/RESP front door for `hkv-engine`: connection handling, the request
//! parser, metrics, and environment-driven configuration. Split into a
//! library target (this crate) and a thin `main.rs` binary so integration
//! tests can drive `handle_connection` over a real loopback socket.

pub mod config;
pub mod metrics;
pub mod protocol;
pub mod server;
