//! Typed payload builders and parsers
//!
//! The frame payloads are hand-packed binary: the register/heartbeat
//! messages carry TLV attribute lists, the terminal messages lead with a
//! 32-byte sid, and the command/HTTP messages have their own layouts.
//! Everything byte-order sensitive on the wire is big-endian.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::frame::{Sid, SID_LEN};

/// Protocol version sent in the register payload
pub const PROTOCOL_VERSION: u8 = 5;

/// Register attribute types
pub mod reg_attr {
    pub const HEARTBEAT: u8 = 0;
    pub const DEVID: u8 = 1;
    pub const DESCRIPTION: u8 = 2;
    pub const TOKEN: u8 = 3;
    pub const GROUP: u8 = 4;
}

/// Heartbeat attribute types
pub mod heartbeat_attr {
    pub const UPTIME: u8 = 0;
}

/// Append one TLV attribute: `attr(1) | length(2 BE) | value`.
pub fn put_attr(buf: &mut BytesMut, attr: u8, value: &[u8]) {
    buf.put_u8(attr);
    buf.put_u16(value.len() as u16);
    buf.extend_from_slice(value);
}

/// Build the register payload: `version(1)` followed by the attribute
/// list. Optional attributes are omitted entirely when unset.
pub fn register_payload(
    heartbeat: u8,
    id: &str,
    group: Option<&str>,
    description: Option<&str>,
    token: Option<&str>,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);

    buf.put_u8(PROTOCOL_VERSION);

    put_attr(&mut buf, reg_attr::HEARTBEAT, &[heartbeat]);
    put_attr(&mut buf, reg_attr::DEVID, id.as_bytes());

    if let Some(group) = group {
        put_attr(&mut buf, reg_attr::GROUP, group.as_bytes());
    }

    if let Some(description) = description {
        put_attr(&mut buf, reg_attr::DESCRIPTION, description.as_bytes());
    }

    if let Some(token) = token {
        put_attr(&mut buf, reg_attr::TOKEN, token.as_bytes());
    }

    buf
}

/// Build the heartbeat payload: a single uptime attribute (u32 BE).
pub fn heartbeat_payload(uptime: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(7);
    put_attr(&mut buf, heartbeat_attr::UPTIME, &uptime.to_be_bytes());
    buf
}

/// Slice a sid off the front of a payload; the codec's minimum-length
/// table guarantees it is present for every sid-bearing type.
pub fn parse_sid(payload: &[u8]) -> (Sid, &[u8]) {
    let sid = Sid::from_slice(payload).expect("payload shorter than codec minimum");
    (sid, &payload[SID_LEN..])
}

/// Parse a winsize payload: `sid(32) | cols(2 BE) | rows(2 BE)`.
pub fn parse_winsize(payload: &[u8]) -> (Sid, u16, u16) {
    let (sid, rest) = parse_sid(payload);
    let cols = u16::from_be_bytes([rest[0], rest[1]]);
    let rows = u16::from_be_bytes([rest[2], rest[3]]);
    (sid, cols, rows)
}

/// Parse an ack payload: `sid(32) | count(2 BE)`.
pub fn parse_ack(payload: &[u8]) -> (Sid, u16) {
    let (sid, rest) = parse_sid(payload);
    (sid, u16::from_be_bytes([rest[0], rest[1]]))
}

/// File subprotocol message types (byte 32 of a File frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileMessageType {
    /// Agent → broker: a local file is offered, payload is the basename
    Send = 0,
    /// Agent → broker: the user asked to receive a file
    Recv = 1,
    /// Broker → agent: total size (4 BE) and filename
    Info = 2,
    /// File content chunk; empty means end of stream
    Data = 3,
    /// Chunk acknowledgement
    Ack = 4,
    /// Transfer aborted
    Abort = 5,
}

impl FileMessageType {
    /// Convert to the wire byte
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Convert from the wire byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Send),
            1 => Some(Self::Recv),
            2 => Some(Self::Info),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Abort),
            _ => None,
        }
    }
}

/// A parsed command execution request.
///
/// Wire layout: `username \0 name \0 token \0 nparams(1) params`, the
/// params zero-separated with a trailing terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdRequest {
    pub username: String,
    pub name: String,
    pub token: String,
    pub params: Vec<String>,
}

impl CmdRequest {
    /// Parse a command request payload.
    pub fn parse(mut data: &[u8]) -> Result<Self, ProtocolError> {
        let mut head = Vec::with_capacity(3);

        while head.len() < 3 {
            let i = data
                .iter()
                .position(|&b| b == 0)
                .ok_or(ProtocolError::Malformed("cmd"))?;

            head.push(String::from_utf8_lossy(&data[..i]).into_owned());
            data = &data[i + 1..];

            if data.is_empty() {
                return Err(ProtocolError::Malformed("cmd"));
            }
        }

        let nparams = data[0] as usize;
        data = &data[1..];

        let mut params = Vec::with_capacity(nparams);

        if nparams > 0 {
            let data = data.strip_suffix(&[0]).unwrap_or(data);
            for part in data.split(|&b| b == 0) {
                params.push(String::from_utf8_lossy(part).into_owned());
            }

            if params.len() != nparams {
                return Err(ProtocolError::Malformed("cmd"));
            }
        }

        let mut head = head.into_iter();
        Ok(Self {
            username: head.next().unwrap(),
            name: head.next().unwrap(),
            token: head.next().unwrap(),
            params,
        })
    }
}

/// Command execution error codes reported in the JSON reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmdError {
    /// Target user does not exist
    Permit = 1,
    /// Executable not found in PATH
    NotFound = 2,
    /// Concurrency limit reached
    NoMem = 3,
    /// Spawn/wait failure or timeout
    SysErr = 4,
    /// Captured output exceeds the cap
    RespTooBig = 5,
}

impl CmdError {
    /// Human-readable message placed next to the code
    pub fn message(self) -> &'static str {
        match self {
            Self::Permit => "operation not permitted",
            Self::NotFound => "not found",
            Self::NoMem => "no mem",
            Self::SysErr => "sys error",
            Self::RespTooBig => "stdout+stderr is too big",
        }
    }
}

/// Build the JSON error reply for a command request.
pub fn cmd_err_reply(token: &str, err: CmdError) -> String {
    serde_json::json!({
        "token": token,
        "attrs": { "err": err as u8, "msg": err.message() },
    })
    .to_string()
}

/// Build the JSON success reply: exit code plus base64 stdout/stderr.
pub fn cmd_reply(token: &str, code: i32, stdout: &[u8], stderr: &[u8]) -> String {
    serde_json::json!({
        "token": token,
        "attrs": {
            "code": code,
            "stdout": BASE64.encode(stdout),
            "stderr": BASE64.encode(stderr),
        },
    })
    .to_string()
}

/// A parsed HTTP tunnel frame from the broker.
///
/// Wire layout: `tls(1) | src_key(18) | ipv4(4) | port(2 BE) | payload`.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Dial the target with TLS
    pub tls: bool,
    /// Opaque per-source key chosen by the broker
    pub key: [u8; 18],
    /// Target address on the LAN
    pub addr: std::net::SocketAddrV4,
    /// Bytes for the target connection
    pub data: Bytes,
}

impl HttpRequest {
    /// Parse an HTTP frame payload; the codec guarantees the fixed head.
    pub fn parse(payload: &Bytes) -> Self {
        let tls = payload[0] == 1;
        let key: [u8; 18] = payload[1..19].try_into().expect("http key");
        let ip = std::net::Ipv4Addr::new(payload[19], payload[20], payload[21], payload[22]);
        let port = u16::from_be_bytes([payload[23], payload[24]]);

        Self {
            tls,
            key,
            addr: std::net::SocketAddrV4::new(ip, port),
            data: payload.slice(25..),
        }
    }
}
