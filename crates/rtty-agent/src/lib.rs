//! rtty-agent: Remote terminal device agent
//!
//! The agent dials outward to a central broker, registers under a stable
//! device identity, and multiplexes terminal sessions, file transfers,
//! proxied HTTP connections and one-shot command executions over the
//! single framed connection.

pub mod client;
pub mod cmd;
pub mod file;
pub mod http;
pub mod pty;
pub mod terminal;
pub mod tls;
pub mod transfer;

pub use client::Client;
pub use pty::{PtyBackend, PtyHandle};
