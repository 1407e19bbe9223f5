//! File-transfer engine
//!
//! Transfers are initiated out-of-band: the helper process, run by the
//! interactive user inside the terminal, emits a magic sequence into the
//! PTY stream and listens on a named pipe. The engine rendezvouses with
//! it there, then drives the in-band download/upload state machine over
//! File frames. Errors are reported on the pipe and reset the context;
//! they never take the terminal session down.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use rtty_core::util::file_exists;
use rtty_protocol::filectl::{encode_ctl, fifo_path, CtlType, TransferDir, TransferRequest};
use rtty_protocol::message::parse_sid;
use rtty_protocol::{FileMessageType, Sid};

use crate::client::Shared;

/// Upload chunk size; one chunk per FileData frame
const FILE_CHUNK: usize = 63 * 1024;

/// Per-session transfer state. Idle until the magic is detected, busy
/// while exactly one transfer runs, reset on completion or any error.
pub(crate) struct FileContext {
    busy: bool,
    file: Option<File>,
    fifo: Option<File>,
    uid: u32,
    gid: u32,
    total_size: u32,
    remain_size: u32,
    savepath: PathBuf,
    chunk: Vec<u8>,
}

impl FileContext {
    pub(crate) fn new() -> Self {
        Self {
            busy: false,
            file: None,
            fifo: None,
            uid: 0,
            gid: 0,
            total_size: 0,
            remain_size: 0,
            savepath: PathBuf::new(),
            chunk: Vec::new(),
        }
    }

    /// Inspect a PTY output buffer for the transfer magic.
    ///
    /// Returns true when the buffer was consumed as a transfer
    /// initiation; the caller must not forward it to the broker. A
    /// matching buffer is always consumed, even when the rendezvous with
    /// the helper fails.
    pub(crate) async fn detect(&mut self, shared: &Shared, sid: Sid, data: &[u8]) -> bool {
        let Some(req) = TransferRequest::detect(data) else {
            return false;
        };

        let pid = req.pid;

        let uid = match shared.probe.uid_of_pid(pid) {
            Ok(uid) => uid,
            Err(e) => {
                tracing::error!("failed to get uid for pid {pid}: {e}");
                terminate_helper(pid);
                return true;
            }
        };

        let gid = match shared.probe.gid_of_pid(pid) {
            Ok(gid) => gid,
            Err(e) => {
                tracing::error!("failed to get gid for pid {pid}: {e}");
                terminate_helper(pid);
                return true;
            }
        };

        let path = fifo_path(pid);
        let mut fifo = match tokio::fs::OpenOptions::new().write(true).open(&path).await {
            Ok(fifo) => fifo,
            Err(e) => {
                tracing::error!("could not open fifo {}: {e}", path.display());
                terminate_helper(pid);
                return true;
            }
        };

        if self.busy {
            // Tell the new helper off on its own pipe; the running
            // transfer keeps its handles.
            let _ = write_ctl(&mut fifo, CtlType::Busy, &[]).await;
            return true;
        }

        tracing::debug!("detected file operation: sid={sid} pid={pid}, uid={uid}, gid={gid}");

        match req.dir {
            TransferDir::Recv => {
                let savepath = match shared.probe.cwd_of_pid(pid) {
                    Ok(cwd) => cwd,
                    Err(e) => {
                        tracing::error!("failed to get cwd for pid {pid}: {e}");
                        let _ = write_ctl(&mut fifo, CtlType::Err, &[]).await;
                        return true;
                    }
                };

                self.savepath = savepath;
                self.uid = uid;
                self.gid = gid;
                self.fifo = Some(fifo);

                let _ = shared.send_file_msg(&sid, FileMessageType::Recv, &[]).await;
                let _ = self.send_ctl(CtlType::RequestAccept, &[]).await;
            }
            TransferDir::Send { fd } => {
                let path = match shared.probe.path_of_pid_fd(pid, fd) {
                    Ok(path) => path,
                    Err(e) => {
                        tracing::error!("failed to resolve fd {fd} of pid {pid}: {e}");
                        let _ = write_ctl(&mut fifo, CtlType::Err, &[]).await;
                        return true;
                    }
                };

                self.fifo = Some(fifo);
                let _ = self.send_ctl(CtlType::RequestAccept, &[]).await;

                if let Err(e) = self.start_upload(shared, sid, &path).await {
                    tracing::error!("failed to start upload for {}: {e:#}", path.display());
                    let _ = self.send_ctl(CtlType::Err, &[]).await;
                    self.reset();
                    return true;
                }
            }
        }

        self.busy = true;
        true
    }

    /// Broker announced an incoming file: check space, refuse overwrite,
    /// create the target owned by the helper's uid/gid, echo Info.
    pub(crate) async fn start_download(&mut self, shared: &Shared, data: &[u8]) {
        if data.len() < 4 {
            self.reset();
            return;
        }

        self.total_size = u32::from_be_bytes(data[..4].try_into().unwrap());
        self.remain_size = self.total_size;

        if let Err(e) = shared
            .probe
            .free_space_for(&self.savepath, self.total_size as u64)
        {
            tracing::error!("download file fail for {}: {e}", self.savepath.display());
            let _ = self.send_ctl(CtlType::NoSpace, &[]).await;
            self.reset();
            return;
        }

        let name = String::from_utf8_lossy(&data[4..]).into_owned();
        self.savepath = self.savepath.join(&name);

        if file_exists(&self.savepath) {
            tracing::error!("file {} already exists", self.savepath.display());
            let _ = self.send_ctl(CtlType::ErrExist, &[]).await;
            self.reset();
            return;
        }

        let file = match self.create_target() {
            Ok(file) => file,
            Err(e) => {
                tracing::error!("failed to open file {} for writing: {e}", self.savepath.display());
                let _ = self.send_ctl(CtlType::Err, &[]).await;
                self.reset();
                return;
            }
        };

        tracing::debug!(
            "download file: {}, size: {} bytes",
            self.savepath.display(),
            self.total_size
        );

        if self.total_size > 0 {
            self.file = Some(File::from_std(file));
        }

        let mut value = Vec::with_capacity(4 + name.len());
        value.extend_from_slice(&self.total_size.to_ne_bytes());
        value.extend_from_slice(name.as_bytes());
        let _ = self.send_ctl(CtlType::Info, &value).await;
    }

    /// Create the download target, mode 0644, chowned to the helper's
    /// credentials. The chown is best-effort.
    fn create_target(&self) -> std::io::Result<std::fs::File> {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }

        let file = options.open(&self.savepath)?;

        #[cfg(unix)]
        if let Err(e) = std::os::unix::fs::fchown(&file, Some(self.uid), Some(self.gid)) {
            tracing::warn!(
                "failed to change owner of file {} to uid={} gid={}: {e}",
                self.savepath.display(),
                self.uid,
                self.gid
            );
        }

        Ok(file)
    }

    /// A download chunk arrived.
    pub(crate) async fn handle_data(&mut self, shared: &Shared, sid: Sid, data: &[u8]) {
        if data.is_empty() {
            self.reset();
            return;
        }

        let Some(file) = self.file.as_mut() else {
            return;
        };

        if let Err(e) = file.write_all(data).await {
            tracing::error!("failed to write file {}: {e}", self.savepath.display());
            let _ = self.send_ctl(CtlType::Err, &[]).await;
            self.reset();
            return;
        }

        self.remain_size = self.remain_size.saturating_sub(data.len() as u32);

        if self.notify_progress().await.is_err() {
            // Helper is gone; nobody left to report to.
            self.reset();
        } else if self.remain_size == 0 {
            if let Some(file) = self.file.as_mut() {
                let _ = file.flush().await;
            }
            self.reset();
        } else {
            let _ = shared.send_file_msg(&sid, FileMessageType::Ack, &[]).await;
        }
    }

    /// Open the upload source and offer it to the broker.
    async fn start_upload(&mut self, shared: &Shared, sid: Sid, path: &Path) -> Result<()> {
        let file = File::open(path)
            .await
            .with_context(|| format!("failed to open file {}", path.display()))?;

        let size = file.metadata().await?.len() as u32;

        self.file = Some(file);
        self.total_size = size;
        self.remain_size = size;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        shared
            .send_file_msg(&sid, FileMessageType::Send, name.as_bytes())
            .await?;

        tracing::debug!("upload file: {}, size: {size} bytes", path.display());
        Ok(())
    }

    /// Broker acked the previous chunk: push the next one. A zero-length
    /// read closes the stream with a final empty FileData.
    pub(crate) async fn send_data(&mut self, shared: &Shared, sid: Sid) {
        let Some(file) = self.file.as_mut() else {
            return;
        };

        if self.chunk.is_empty() {
            self.chunk.resize(FILE_CHUNK, 0);
        }

        let n = match file.read(&mut self.chunk).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("failed to read file {}: {e}", self.savepath.display());
                let _ = shared.send_file_msg(&sid, FileMessageType::Abort, &[]).await;
                let _ = self.send_ctl(CtlType::Err, &[]).await;
                self.reset();
                return;
            }
        };

        self.remain_size = self.remain_size.saturating_sub(n as u32);

        let _ = shared
            .send_file_msg(&sid, FileMessageType::Data, &self.chunk[..n])
            .await;

        if n == 0 {
            self.reset();
            return;
        }

        if self.notify_progress().await.is_err() {
            let _ = shared.send_file_msg(&sid, FileMessageType::Abort, &[]).await;
            self.reset();
        }
    }

    async fn notify_progress(&mut self) -> std::io::Result<()> {
        let remain = self.remain_size;
        self.send_ctl(CtlType::Progress, &remain.to_ne_bytes()).await
    }

    pub(crate) async fn send_ctl(&mut self, typ: CtlType, value: &[u8]) -> std::io::Result<()> {
        let Some(fifo) = self.fifo.as_mut() else {
            return Err(std::io::ErrorKind::NotConnected.into());
        };
        write_ctl(fifo, typ, value).await
    }

    /// Drop both handles and go idle. Safe from every error path.
    pub(crate) fn reset(&mut self) {
        self.file = None;
        self.fifo = None;
        self.busy = false;
    }
}

async fn write_ctl(fifo: &mut File, typ: CtlType, value: &[u8]) -> std::io::Result<()> {
    let frame = encode_ctl(typ, value);
    fifo.write_all(&frame).await?;
    // tokio files buffer internally; the helper must see the frame now.
    fifo.flush().await
}

#[cfg(unix)]
fn terminate_helper(pid: u32) {
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGTERM,
    );
}

#[cfg(not(unix))]
fn terminate_helper(_pid: u32) {}

/// Route a File frame to the owning session's transfer context.
pub(crate) async fn handle_file_msg(
    shared: &std::sync::Arc<Shared>,
    payload: &[u8],
) -> Result<()> {
    let (sid, rest) = parse_sid(payload);
    let typ = rest[0];
    let data = &rest[1..];

    let Some(session) = shared.sessions.get(&sid).map(|e| e.value().clone()) else {
        tracing::error!("terminal session {sid} not found");
        return Ok(());
    };

    let mut fc = session.fc.lock().await;

    match FileMessageType::from_u8(typ) {
        Some(FileMessageType::Info) => fc.start_download(shared, data).await,
        Some(FileMessageType::Data) => fc.handle_data(shared, sid, data).await,
        Some(FileMessageType::Ack) => fc.send_data(shared, sid).await,
        Some(FileMessageType::Abort) => {
            let _ = fc.send_ctl(CtlType::Abort, &[]).await;
            fc.reset();
        }
        _ => tracing::debug!("ignoring unexpected file message type {typ}"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rtty_core::{Config, HostProbe, ProbeError, ProcProbe};
    use rtty_protocol::filectl::{CtlFrame, CTL_FRAME_LEN, FILE_MAGIC};

    use crate::client::tests::{connect_duplex, NullPty};
    use crate::client::Client;

    fn test_shared() -> Client {
        let cfg = Config {
            id: "dev-01".to_string(),
            ..Config::default()
        };
        Client::with_backends(cfg, Arc::new(NullPty), Arc::new(ProcProbe))
    }

    fn sid() -> Sid {
        Sid::new([b's'; 32])
    }

    /// Read back control frames written to a regular file standing in
    /// for the fifo.
    fn read_ctl_frames(path: &Path) -> Vec<CtlFrame> {
        let data = std::fs::read(path).unwrap();
        data.chunks(CTL_FRAME_LEN)
            .map(|c| CtlFrame::decode(c.try_into().unwrap()).unwrap())
            .collect()
    }

    async fn context_with_pipe(dir: &tempfile::TempDir) -> (FileContext, PathBuf) {
        let pipe = dir.path().join("ctl.pipe");
        let mut fc = FileContext::new();
        fc.fifo = Some(File::from_std(std::fs::File::create(&pipe).unwrap()));
        (fc, pipe)
    }

    #[tokio::test]
    async fn test_detect_ignores_non_magic() {
        let client = test_shared();
        let _broker = connect_duplex(client.shared()).await;
        let mut fc = FileContext::new();

        // Right length, wrong leading bytes: forwarded verbatim.
        let buf = [0x01u8; 12];
        assert!(!fc.detect(client.shared(), sid(), &buf).await);

        // Matching prefix but wrong length: forwarded verbatim.
        let mut long = vec![0xb6, 0xbc, 0xbd, b'R'];
        long.extend_from_slice(&[0u8; 9]);
        assert!(!fc.detect(client.shared(), sid(), &long).await);
    }

    #[tokio::test]
    async fn test_detect_consumes_magic_even_on_failure() {
        let client = test_shared();
        let _broker = connect_duplex(client.shared()).await;
        let mut fc = FileContext::new();

        // A pid far beyond the kernel maximum: the probe fails, the
        // SIGTERM goes nowhere, and the bytes are still consumed.
        let req = TransferRequest {
            pid: 0x7fff_fff0,
            dir: TransferDir::Recv,
        };
        assert!(fc.detect(client.shared(), sid(), &req.encode()).await);
        assert!(!fc.busy);
    }

    #[tokio::test]
    async fn test_download_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let client = test_shared();
        let _broker = connect_duplex(client.shared()).await;

        let existing = dir.path().join("hello");
        std::fs::write(&existing, b"old").unwrap();

        let (mut fc, pipe) = context_with_pipe(&dir).await;
        fc.busy = true;
        fc.savepath = dir.path().to_path_buf();

        let mut info = 5u32.to_be_bytes().to_vec();
        info.extend_from_slice(b"hello");
        fc.start_download(client.shared(), &info).await;

        // ErrExist on the pipe, context reset, file untouched.
        let frames = read_ctl_frames(&pipe);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].typ, CtlType::ErrExist);
        assert!(!fc.busy);
        assert!(fc.file.is_none());
        assert_eq!(std::fs::read(&existing).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_download_writes_file_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let client = test_shared();
        let mut broker = connect_duplex(client.shared()).await;

        let (mut fc, pipe) = context_with_pipe(&dir).await;
        fc.busy = true;
        fc.savepath = dir.path().to_path_buf();
        fc.uid = nix::unistd::getuid().as_raw();
        fc.gid = nix::unistd::getgid().as_raw();

        let mut info = 5u32.to_be_bytes().to_vec();
        info.extend_from_slice(b"hello");
        fc.start_download(client.shared(), &info).await;

        assert!(fc.file.is_some());
        assert_eq!(fc.remain_size, 5);

        fc.handle_data(client.shared(), sid(), b"hello").await;

        assert!(!fc.busy);
        assert_eq!(
            std::fs::read(dir.path().join("hello")).unwrap(),
            b"hello"
        );

        let frames = read_ctl_frames(&pipe);
        assert_eq!(frames[0].typ, CtlType::Info);
        assert_eq!(frames[0].value_u32(), 5);
        assert_eq!(&frames[0].value[4..9], b"hello");
        assert_eq!(frames[1].typ, CtlType::Progress);
        assert_eq!(frames[1].value_u32(), 0);

        // No FileAck goes out once the transfer is complete.
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            broker.read(&mut buf),
        )
        .await;
        assert!(read.is_err());
    }

    #[tokio::test]
    async fn test_download_zero_size_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let client = test_shared();
        let _broker = connect_duplex(client.shared()).await;

        let (mut fc, pipe) = context_with_pipe(&dir).await;
        fc.busy = true;
        fc.savepath = dir.path().to_path_buf();

        let mut info = 0u32.to_be_bytes().to_vec();
        info.extend_from_slice(b"empty");
        fc.start_download(client.shared(), &info).await;

        assert!(fc.file.is_none());
        assert!(file_exists(&dir.path().join("empty")));

        let frames = read_ctl_frames(&pipe);
        assert_eq!(frames[0].typ, CtlType::Info);
        assert_eq!(frames[0].value_u32(), 0);
    }

    #[tokio::test]
    async fn test_upload_streams_chunks_to_eof() {
        let dir = tempfile::tempdir().unwrap();
        let client = test_shared();
        let _broker = connect_duplex(client.shared()).await;

        let source = dir.path().join("payload.bin");
        std::fs::write(&source, b"abcdef").unwrap();

        let (mut fc, pipe) = context_with_pipe(&dir).await;
        fc.busy = true;
        fc.file = Some(File::open(&source).await.unwrap());
        fc.total_size = 6;
        fc.remain_size = 6;

        fc.send_data(client.shared(), sid()).await;
        assert_eq!(fc.remain_size, 0);
        assert!(fc.busy);

        // EOF round: final empty FileData, then reset.
        fc.send_data(client.shared(), sid()).await;
        assert!(!fc.busy);
        assert!(fc.file.is_none());

        let frames = read_ctl_frames(&pipe);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].typ, CtlType::Progress);
        assert_eq!(frames[0].value_u32(), 0);
    }

    #[tokio::test]
    async fn test_abort_notifies_helper_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let client = test_shared();
        let _broker = connect_duplex(client.shared()).await;

        let (mut fc, pipe) = context_with_pipe(&dir).await;
        fc.busy = true;

        let _ = fc.send_ctl(CtlType::Abort, &[]).await;
        fc.reset();

        let frames = read_ctl_frames(&pipe);
        assert_eq!(frames[0].typ, CtlType::Abort);
        assert!(!fc.busy);
        assert!(fc.fifo.is_none());
    }

    /// Probe whose space check always fails.
    struct NoSpaceProbe;

    impl HostProbe for NoSpaceProbe {
        fn uid_of_pid(&self, _pid: u32) -> Result<u32, ProbeError> {
            Ok(0)
        }
        fn gid_of_pid(&self, _pid: u32) -> Result<u32, ProbeError> {
            Ok(0)
        }
        fn cwd_of_pid(&self, _pid: u32) -> Result<PathBuf, ProbeError> {
            Ok(PathBuf::from("/"))
        }
        fn path_of_pid_fd(&self, _pid: u32, _fd: u32) -> Result<PathBuf, ProbeError> {
            Err(ProbeError::Unsupported)
        }
        fn uptime_seconds(&self) -> u32 {
            0
        }
        fn free_space_for(&self, _path: &Path, need: u64) -> Result<(), ProbeError> {
            Err(ProbeError::NoSpace { need, avail: 0 })
        }
    }

    #[tokio::test]
    async fn test_download_no_space_reported_on_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            id: "dev-01".to_string(),
            ..Config::default()
        };
        let client = Client::with_backends(cfg, Arc::new(NullPty), Arc::new(NoSpaceProbe));
        let _broker = connect_duplex(client.shared()).await;

        let (mut fc, pipe) = context_with_pipe(&dir).await;
        fc.busy = true;
        fc.savepath = dir.path().to_path_buf();

        let mut info = 100u32.to_be_bytes().to_vec();
        info.extend_from_slice(b"big");
        fc.start_download(client.shared(), &info).await;

        let frames = read_ctl_frames(&pipe);
        assert_eq!(frames[0].typ, CtlType::NoSpace);
        assert!(!fc.busy);
    }

    #[test]
    fn test_magic_first_bytes() {
        assert_eq!(FILE_MAGIC, [0xb6, 0xbc, 0xbd]);
    }
}
