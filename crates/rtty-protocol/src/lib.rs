//! rtty-protocol: Wire protocol for the rtty device agent
//!
//! Defines the length-prefixed frame envelope spoken with the broker, the
//! typed payload builders/parsers for every message, and the fixed-size
//! control frames exchanged with the local transfer helper over a named
//! pipe.

pub mod codec;
pub mod error;
pub mod filectl;
pub mod frame;
pub mod message;

pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{MessageType, Sid, HEADER_SIZE, MAX_PAYLOAD_SIZE, SID_LEN};
pub use message::{CmdError, CmdRequest, FileMessageType, HttpRequest, PROTOCOL_VERSION};
