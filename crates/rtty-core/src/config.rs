//! Agent configuration
//!
//! The configuration record is built once at startup (from the CLI) and
//! is immutable afterwards. Validation mirrors what the broker enforces
//! on its side of the register handshake.

use std::path::PathBuf;

use crate::error::ConfigError;

/// Default broker port
pub const DEFAULT_PORT: u16 = 5912;

/// Default heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT: u8 = 30;

/// Minimum heartbeat interval in seconds
pub const MIN_HEARTBEAT: u8 = 5;

/// Runtime configuration for the agent
#[derive(Debug, Clone)]
pub struct Config {
    /// Device id (1-32 chars, no whitespace), required
    pub id: String,
    /// Optional device group (max 16 chars, no whitespace)
    pub group: Option<String>,
    /// Optional device description (max 126 bytes)
    pub description: Option<String>,
    /// Broker host or address
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Heartbeat interval in seconds, clamped to [`MIN_HEARTBEAT`]
    pub heartbeat: u8,
    /// Optional authorization token
    pub token: Option<String>,
    /// Local user to log in as (`login -f <username>`)
    pub username: Option<String>,
    /// Reconnect automatically after a connection loss
    pub reconnect: bool,

    /// Connect with TLS
    pub ssl: bool,
    /// CA certificate to verify the broker against
    pub cacert: Option<PathBuf>,
    /// Client certificate file
    pub cert: Option<PathBuf>,
    /// Client private key file
    pub key: Option<PathBuf>,
    /// Skip broker certificate verification
    pub insecure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: String::new(),
            group: None,
            description: None,
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            heartbeat: DEFAULT_HEARTBEAT,
            token: None,
            username: None,
            reconnect: false,
            ssl: false,
            cacert: None,
            cert: None,
            key: None,
            insecure: false,
        }
    }
}

impl Config {
    /// Validate the record and normalise out-of-range values.
    ///
    /// A heartbeat below the minimum is clamped rather than rejected.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::MissingId);
        }

        if self.id.len() > 32 || self.id.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidId);
        }

        if let Some(group) = &self.group {
            if group.len() > 16 || group.contains(char::is_whitespace) {
                return Err(ConfigError::InvalidGroup);
            }
        }

        if let Some(description) = &self.description {
            if description.len() > 126 {
                return Err(ConfigError::DescriptionTooLong);
            }
        }

        if self.heartbeat < MIN_HEARTBEAT {
            tracing::warn!(
                "heartbeat interval too low, setting to minimum {} seconds",
                MIN_HEARTBEAT
            );
            self.heartbeat = MIN_HEARTBEAT;
        }

        if self.cert.is_some() != self.key.is_some() {
            return Err(ConfigError::InvalidTls(
                "--cert and --key must be given together".to_string(),
            ));
        }

        Ok(())
    }
}
