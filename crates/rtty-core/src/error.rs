//! Core error types

use std::path::PathBuf;

use thiserror::Error;

/// Configuration validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No device id was supplied
    #[error("you must specify an id for your device")]
    MissingId,

    /// Device id is too long or contains whitespace
    #[error("invalid device id: must be 1-32 characters and cannot contain spaces")]
    InvalidId,

    /// Group is too long or contains whitespace
    #[error("invalid group: must be 1-16 characters and cannot contain spaces")]
    InvalidGroup,

    /// Description exceeds the wire limit
    #[error("description too long: must be 1-126 bytes")]
    DescriptionTooLong,

    /// TLS options are inconsistent
    #[error("invalid TLS options: {0}")]
    InvalidTls(String),
}

/// Host probe errors
///
/// `Unsupported` is returned on platforms lacking the underlying facility;
/// callers surface it as a transfer error rather than treating it as fatal.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// Underlying I/O failure (missing /proc entry, unreadable file, ...)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A /proc field could not be located or parsed
    #[error("failed to parse {what} for pid {pid}")]
    Parse { pid: u32, what: &'static str },

    /// The filesystem holding the path could not be resolved
    #[error("not found mount point of '{0}'")]
    MountPointNotFound(PathBuf),

    /// Not enough free space on the target filesystem
    #[error("no enough space: need {need} bytes, available {avail} bytes")]
    NoSpace { need: u64, avail: u64 },

    /// The platform has no way to answer this probe
    #[error("not supported on this platform")]
    Unsupported,
}
