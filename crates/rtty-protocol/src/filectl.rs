//! Local transfer rendezvous framing
//!
//! The transfer helper runs inside the terminal and signals the agent by
//! writing a 12-byte magic sequence to its own stdout, which the agent
//! spots in the PTY byte stream. From then on the two talk over a named
//! pipe using fixed 129-byte control frames.
//!
//! PID and fd in the magic, and the sizes inside control values, are
//! native-endian: both ends run on the same machine.

use std::path::PathBuf;

/// First three bytes of the transfer magic
pub const FILE_MAGIC: [u8; 3] = [0xb6, 0xbc, 0xbd];

/// Total length of the magic sequence
pub const FILE_MAGIC_LEN: usize = 12;

/// Control frame length on the named pipe: type byte + value area
pub const CTL_FRAME_LEN: usize = 129;

/// Value area of a control frame
pub const CTL_VALUE_LEN: usize = CTL_FRAME_LEN - 1;

/// Largest file the helper will offer for sending (2 GiB)
pub const FILE_SIZE_LIMIT: u64 = 2 * 1024 * 1024 * 1024;

/// Conventional named-pipe path for a helper pid.
pub fn fifo_path(pid: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/rtty-fifo-{pid}.fifo"))
}

/// Direction of a requested transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDir {
    /// Broker → device, helper invoked with `-R`
    Recv,
    /// Device → broker, helper invoked with `-S`; carries the helper's
    /// open descriptor for the source file
    Send { fd: u32 },
}

/// A transfer initiation decoded from the PTY stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    /// Pid of the helper process
    pub pid: u32,
    /// Requested direction
    pub dir: TransferDir,
}

impl TransferRequest {
    /// Detect the magic in a PTY output buffer.
    ///
    /// Matches only a buffer of exactly [`FILE_MAGIC_LEN`] bytes starting
    /// with [`FILE_MAGIC`]; any such buffer is consumed by the caller
    /// whatever the direction byte says, so a corrupted direction cannot
    /// leak the magic to the broker.
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.len() != FILE_MAGIC_LEN || data[..3] != FILE_MAGIC {
            return None;
        }

        let pid = u32::from_ne_bytes(data[4..8].try_into().unwrap());

        let dir = if data[3] == b'R' {
            TransferDir::Recv
        } else {
            TransferDir::Send {
                fd: u32::from_ne_bytes(data[8..12].try_into().unwrap()),
            }
        };

        Some(Self { pid, dir })
    }

    /// Encode the magic sequence the helper writes to stdout.
    pub fn encode(&self) -> [u8; FILE_MAGIC_LEN] {
        let mut buf = [0u8; FILE_MAGIC_LEN];
        buf[..3].copy_from_slice(&FILE_MAGIC);

        match self.dir {
            TransferDir::Recv => buf[3] = b'R',
            TransferDir::Send { fd } => {
                buf[3] = b'S';
                buf[8..12].copy_from_slice(&fd.to_ne_bytes());
            }
        }

        buf[4..8].copy_from_slice(&self.pid.to_ne_bytes());
        buf
    }
}

/// Control frame types on the named pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtlType {
    /// The agent accepted the request
    RequestAccept = 0,
    /// Remaining byte count update
    Progress = 1,
    /// Total size and filename of an incoming file
    Info = 2,
    /// Another transfer is already running on this terminal
    Busy = 3,
    /// The broker side aborted
    Abort = 4,
    /// Not enough space on the target filesystem
    NoSpace = 5,
    /// The target file already exists
    ErrExist = 6,
    /// Generic failure
    Err = 7,
}

impl CtlType {
    /// Convert from the frame byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::RequestAccept),
            1 => Some(Self::Progress),
            2 => Some(Self::Info),
            3 => Some(Self::Busy),
            4 => Some(Self::Abort),
            5 => Some(Self::NoSpace),
            6 => Some(Self::ErrExist),
            7 => Some(Self::Err),
            _ => None,
        }
    }
}

/// Encode a control frame: type byte, then the value zero-padded to the
/// fixed width. Oversized values are truncated.
pub fn encode_ctl(typ: CtlType, value: &[u8]) -> [u8; CTL_FRAME_LEN] {
    let mut frame = [0u8; CTL_FRAME_LEN];
    frame[0] = typ as u8;

    let n = value.len().min(CTL_VALUE_LEN);
    frame[1..1 + n].copy_from_slice(&value[..n]);
    frame
}

/// A decoded control frame
#[derive(Debug, Clone, Copy)]
pub struct CtlFrame {
    pub typ: CtlType,
    pub value: [u8; CTL_VALUE_LEN],
}

impl CtlFrame {
    /// Decode a full control frame; `None` on an unknown type byte.
    pub fn decode(frame: &[u8; CTL_FRAME_LEN]) -> Option<Self> {
        Some(Self {
            typ: CtlType::from_u8(frame[0])?,
            value: frame[1..].try_into().unwrap(),
        })
    }

    /// First four value bytes as a native-endian u32 (sizes, remainders).
    pub fn value_u32(&self) -> u32 {
        u32::from_ne_bytes(self.value[..4].try_into().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_requires_exact_length() {
        let mut data = vec![0xb6, 0xbc, 0xbd, b'R'];
        data.extend_from_slice(&1234u32.to_ne_bytes());
        data.extend_from_slice(&[0; 4]);
        assert!(TransferRequest::detect(&data).is_some());

        data.push(0);
        assert!(TransferRequest::detect(&data).is_none());
        assert!(TransferRequest::detect(&data[..11]).is_none());
    }

    #[test]
    fn test_detect_requires_magic_bytes() {
        let mut data = [0u8; FILE_MAGIC_LEN];
        data[0] = 0xb6;
        data[1] = 0xbc;
        data[2] = 0xbe;
        assert!(TransferRequest::detect(&data).is_none());
    }

    #[test]
    fn test_detect_unknown_direction_still_matches() {
        let mut data = [0u8; FILE_MAGIC_LEN];
        data[..3].copy_from_slice(&FILE_MAGIC);
        data[3] = b'X';
        // Consumed as a send; the agent fails it later via the probe.
        assert!(TransferRequest::detect(&data).is_some());
    }

    #[test]
    fn test_magic_roundtrip() {
        let req = TransferRequest {
            pid: 4242,
            dir: TransferDir::Send { fd: 7 },
        };
        let decoded = TransferRequest::detect(&req.encode()).unwrap();
        assert_eq!(decoded, req);

        let req = TransferRequest {
            pid: 99,
            dir: TransferDir::Recv,
        };
        assert_eq!(TransferRequest::detect(&req.encode()).unwrap(), req);
    }

    #[test]
    fn test_ctl_frame_roundtrip() {
        let frame = encode_ctl(CtlType::Progress, &512u32.to_ne_bytes());
        assert_eq!(frame.len(), CTL_FRAME_LEN);

        let decoded = CtlFrame::decode(&frame).unwrap();
        assert_eq!(decoded.typ, CtlType::Progress);
        assert_eq!(decoded.value_u32(), 512);
        assert!(decoded.value[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_ctl_value_truncated() {
        let frame = encode_ctl(CtlType::Info, &[0xff; 200]);
        assert_eq!(frame[1..], [0xff; CTL_VALUE_LEN]);
    }

    #[test]
    fn test_fifo_path() {
        assert_eq!(
            fifo_path(1500),
            PathBuf::from("/tmp/rtty-fifo-1500.fifo")
        );
    }
}
