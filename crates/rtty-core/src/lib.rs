//! rtty-core: Shared building blocks for the rtty agent
//!
//! This crate provides the immutable runtime configuration record, the
//! host-probe capability used by the file-transfer engine and heartbeat,
//! and a couple of small utilities shared between the agent and its
//! helper mode.

pub mod config;
pub mod error;
pub mod probe;
pub mod util;

pub use config::Config;
pub use error::{ConfigError, ProbeError};
pub use probe::{HostProbe, ProcProbe};
