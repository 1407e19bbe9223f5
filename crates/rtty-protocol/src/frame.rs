//! Frame envelope definitions
//!
//! Every message on the wire is `type(1) | length(2 BE) | payload`, with
//! the payload capped at 65535 bytes. A per-type minimum payload length is
//! enforced on the receive path so handlers can slice fixed fields without
//! re-checking.

use std::fmt;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 3;

/// Maximum payload size (limited by the 16-bit length field)
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Length of a session id in bytes
pub const SID_LEN: usize = 32;

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Registration (agent → broker), registration result (broker → agent)
    Register = 0,
    /// Terminal session open request / reply
    Login = 1,
    /// Terminal session close
    Logout = 2,
    /// Terminal byte stream, either direction
    TermData = 3,
    /// Terminal resize
    Winsize = 4,
    /// One-shot command execution request / reply
    Cmd = 5,
    /// Keep-alive, either direction
    Heartbeat = 6,
    /// File transfer subprotocol
    File = 7,
    /// Proxied HTTP(S) connection data
    Http = 8,
    /// Terminal flow-control acknowledgement
    Ack = 9,
}

impl MessageType {
    /// Convert to the wire byte
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Convert from the wire byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Register),
            1 => Some(Self::Login),
            2 => Some(Self::Logout),
            3 => Some(Self::TermData),
            4 => Some(Self::Winsize),
            5 => Some(Self::Cmd),
            6 => Some(Self::Heartbeat),
            7 => Some(Self::File),
            8 => Some(Self::Http),
            9 => Some(Self::Ack),
            _ => None,
        }
    }

    /// Lower-case name used in log lines
    pub fn name(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Login => "login",
            Self::Logout => "logout",
            Self::TermData => "termdata",
            Self::Winsize => "winsize",
            Self::Cmd => "cmd",
            Self::Heartbeat => "heartbeat",
            Self::File => "file",
            Self::Http => "http",
            Self::Ack => "ack",
        }
    }

    /// Minimum payload length accepted for this type in the client role.
    ///
    /// TermData requires at least one data byte past the sid: an empty
    /// data frame has no observable effect and is rejected.
    pub fn min_payload_len(self) -> usize {
        match self {
            Self::Register => 1,
            Self::Login => SID_LEN,
            Self::Logout => SID_LEN,
            Self::TermData => SID_LEN + 1,
            Self::Winsize => SID_LEN + 4,
            Self::File => SID_LEN + 1,
            Self::Ack => SID_LEN + 2,
            Self::Http => 26,
            Self::Cmd | Self::Heartbeat => 0,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Session identifier assigned by the broker, 32 opaque bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sid([u8; SID_LEN]);

impl Sid {
    /// Wrap raw bytes
    pub fn new(bytes: [u8; SID_LEN]) -> Self {
        Self(bytes)
    }

    /// Read a sid from the head of `data`; `None` when too short.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; SID_LEN] = data.get(..SID_LEN)?.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; SID_LEN] {
        &self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Brokers hand out printable sids; fall back to lossy for logs.
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
