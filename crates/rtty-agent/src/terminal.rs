//! Terminal sessions
//!
//! Each broker login owns one PTY. A blocking reader thread feeds PTY
//! output through a small channel to the session task, which inspects it
//! for the file-transfer magic, relays it as TermData and then waits on
//! the unacked-bytes window. Input, resize and acks arrive from the
//! dispatch task keyed by sid.

use std::io::Read;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;

use rtty_protocol::message::{parse_ack, parse_sid, parse_winsize};
use rtty_protocol::{MessageType, Sid};

use crate::client::Shared;
use crate::file::FileContext;
use crate::pty::PtyHandle;

/// Maximum concurrent terminal sessions
pub(crate) const TERM_LIMIT: u32 = 10;

/// A session with no I/O for this long gets its PTY killed
const TERM_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Outbound terminal bytes allowed to sit unacknowledged
const ACK_BLOCK: i32 = 4096;

/// PTY read chunk size
const PTY_READ_BUF: usize = 32 * 1024;

/// Chunks buffered between the reader thread and the session task. Kept
/// small so the flow-control window also throttles the reader.
const PTY_CHANNEL_CAPACITY: usize = 4;

/// One terminal session keyed by the broker-assigned sid.
pub(crate) struct TermSession {
    sid: Sid,
    pty: StdMutex<Box<dyn PtyHandle>>,
    unacked: AtomicI32,
    ack_notify: Notify,
    idle_deadline: StdMutex<Instant>,
    pub(crate) fc: Mutex<FileContext>,
}

impl TermSession {
    fn new(sid: Sid, pty: Box<dyn PtyHandle>) -> Self {
        Self {
            sid,
            pty: StdMutex::new(pty),
            unacked: AtomicI32::new(0),
            ack_notify: Notify::new(),
            idle_deadline: StdMutex::new(Instant::now() + TERM_IDLE_TIMEOUT),
            fc: Mutex::new(FileContext::new()),
        }
    }

    /// Push the idle deadline out; called on every I/O in either direction.
    fn touch(&self) {
        *self.idle_deadline.lock().unwrap() = Instant::now() + TERM_IDLE_TIMEOUT;
    }

    /// Relay PTY output toward the broker, honouring magic detection and
    /// the flow-control window.
    async fn relay(&self, shared: &Arc<Shared>, data: Vec<u8>) -> Result<()> {
        self.touch();

        {
            let mut fc = self.fc.lock().await;
            if fc.detect(shared, self.sid, &data).await {
                return Ok(());
            }
        }

        shared
            .send_frame(MessageType::TermData, &[self.sid.as_bytes(), &data])
            .await?;

        self.wait_ack(data.len() as i32).await;
        Ok(())
    }

    /// Charge `n` bytes to the window; block while it is over the
    /// threshold until acks bring it back down.
    pub(crate) async fn wait_ack(&self, n: i32) {
        if self.unacked.fetch_add(n, Ordering::AcqRel) + n <= ACK_BLOCK {
            return;
        }

        loop {
            let notified = self.ack_notify.notified();
            if self.unacked.load(Ordering::Acquire) <= ACK_BLOCK {
                return;
            }
            notified.await;
        }
    }

    /// Credit `n` acknowledged bytes and wake one blocked relay.
    pub(crate) fn ack(&self, n: u16) {
        self.unacked.fetch_sub(n as i32, Ordering::AcqRel);
        self.ack_notify.notify_one();
    }

    pub(crate) fn write_pty(&self, data: &[u8]) -> Result<()> {
        self.pty.lock().unwrap().write_all(data)
    }

    pub(crate) fn resize_pty(&self, cols: u16, rows: u16) -> Result<()> {
        self.pty.lock().unwrap().resize(cols, rows)
    }

    fn close_pty(&self) {
        self.pty.lock().unwrap().close();
    }

    /// Close the PTY and drop any transfer state; used on logout and
    /// client teardown.
    pub(crate) async fn shutdown(&self) {
        self.close_pty();
        self.fc.lock().await.reset();
    }

    /// Session task: pump PTY output until the child exits or the idle
    /// timer fires, then clean up and notify the broker.
    pub(crate) async fn run(self: Arc<Self>, shared: Arc<Shared>) {
        let reader_result = self.pty.lock().unwrap().clone_reader();
        let reader = match reader_result {
            Ok(reader) => reader,
            Err(e) => {
                tracing::error!("tty {}: {e:#}", self.sid);
                self.finish(&shared).await;
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PTY_CHANNEL_CAPACITY);

        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = vec![0u8; PTY_READ_BUF];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.touch();

        loop {
            let deadline = *self.idle_deadline.lock().unwrap();

            tokio::select! {
                chunk = rx.recv() => {
                    match chunk {
                        Some(data) => {
                            if self.relay(&shared, data).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    // A later touch() may have moved the deadline on.
                    if *self.idle_deadline.lock().unwrap() <= Instant::now() {
                        tracing::info!(
                            "tty {} inactive over {:?}, now kill it",
                            self.sid,
                            TERM_IDLE_TIMEOUT
                        );
                        self.close_pty();
                        break;
                    }
                }
            }
        }

        self.finish(&shared).await;
    }

    /// Final cleanup, exactly once: whoever removes the session from the
    /// map reports the logout and releases the TTY slot.
    async fn finish(&self, shared: &Arc<Shared>) {
        if shared.sessions.remove(&self.sid).is_none() {
            return;
        }

        let _ = shared
            .send_frame(MessageType::Logout, &[self.sid.as_bytes()])
            .await;

        self.shutdown().await;
        shared.active_ttys.fetch_sub(1, Ordering::Relaxed);

        tracing::info!("delete tty {}", self.sid);
    }
}

fn lookup(shared: &Shared, sid: &Sid) -> Option<Arc<TermSession>> {
    let session = shared.sessions.get(sid).map(|e| e.value().clone());
    if session.is_none() {
        tracing::error!("terminal session {sid} not found");
    }
    session
}

/// Broker requests a new terminal. Reject with retCode 1 when the TTY cap
/// is reached or the PTY spawn fails; the slot is only taken on success.
pub(crate) async fn handle_login(shared: &Arc<Shared>, payload: &[u8]) -> Result<()> {
    let (sid, _) = parse_sid(payload);
    let mut ret_code: u8 = 0;

    let active = shared.active_ttys.load(Ordering::Relaxed);
    if active >= TERM_LIMIT {
        tracing::error!("maximum number of TTYs reached: {active}");
        ret_code = 1;
    } else {
        match shared.pty.spawn(shared.cfg.username.as_deref()) {
            Ok(pty) => {
                tracing::info!("new tty: {}/{} {}", active + 1, TERM_LIMIT, sid);

                let session = Arc::new(TermSession::new(sid, pty));
                shared.sessions.insert(sid, session.clone());
                shared.active_ttys.fetch_add(1, Ordering::Relaxed);

                tokio::spawn(session.run(shared.clone()));
            }
            Err(e) => {
                tracing::error!("failed to create terminal: {e:#}");
                ret_code = 1;
            }
        }
    }

    shared
        .send_frame(MessageType::Login, &[sid.as_bytes(), &[ret_code]])
        .await
}

/// Broker closes a terminal.
pub(crate) async fn handle_logout(shared: &Arc<Shared>, payload: &[u8]) -> Result<()> {
    let (sid, _) = parse_sid(payload);

    if let Some((_, session)) = shared.sessions.remove(&sid) {
        tracing::info!("delete tty {sid}");
        session.shutdown().await;
        shared.active_ttys.fetch_sub(1, Ordering::Relaxed);
    } else {
        tracing::error!("tty session {sid} not found");
    }

    Ok(())
}

/// Terminal input from the broker.
pub(crate) fn handle_term_data(shared: &Arc<Shared>, payload: &[u8]) -> Result<()> {
    let (sid, data) = parse_sid(payload);

    let Some(session) = lookup(shared, &sid) else {
        return Ok(());
    };

    session.touch();
    if let Err(e) = session.write_pty(data) {
        tracing::error!("failed to write to terminal {sid}: {e:#}");
    }

    Ok(())
}

/// Terminal resize from the broker.
pub(crate) fn handle_winsize(shared: &Arc<Shared>, payload: &[u8]) -> Result<()> {
    let (sid, cols, rows) = parse_winsize(payload);

    let Some(session) = lookup(shared, &sid) else {
        return Ok(());
    };

    session
        .resize_pty(cols, rows)
        .with_context(|| format!("failed to set terminal size for {sid}"))?;

    tracing::debug!("setting terminal {sid} size to {cols}x{rows}");
    Ok(())
}

/// Flow-control credit from the broker.
pub(crate) fn handle_ack(shared: &Arc<Shared>, payload: &[u8]) -> Result<()> {
    let (sid, count) = parse_ack(payload);

    if let Some(session) = lookup(shared, &sid) {
        session.ack(count);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;

    use rtty_core::{Config, ProcProbe};

    use crate::client::tests::connect_duplex;
    use crate::client::Client;
    use crate::pty::PtyBackend;
    use tokio::io::AsyncReadExt;

    /// Scripted PTY: output is fed in from the test, input and resizes
    /// are recorded.
    pub(crate) struct FakePty {
        output: Option<std_mpsc::Receiver<Vec<u8>>>,
        pub written: Arc<StdMutex<Vec<u8>>>,
        pub resizes: Arc<StdMutex<Vec<(u16, u16)>>>,
    }

    struct FakeReader(std_mpsc::Receiver<Vec<u8>>);

    impl Read for FakeReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.recv() {
                Ok(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Err(_) => Ok(0),
            }
        }
    }

    impl PtyHandle for FakePty {
        fn clone_reader(&mut self) -> Result<Box<dyn Read + Send>> {
            Ok(Box::new(FakeReader(self.output.take().unwrap())))
        }

        fn write_all(&mut self, data: &[u8]) -> Result<()> {
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
            self.resizes.lock().unwrap().push((cols, rows));
            Ok(())
        }

        fn close(&mut self) {}
    }

    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub spawned: AtomicUsize,
        pub resizes: Arc<StdMutex<Vec<(u16, u16)>>>,
        // Keeps the PTY readers blocked instead of reporting EOF, so
        // sessions stay alive for the duration of the test.
        outputs: StdMutex<Vec<std_mpsc::Sender<Vec<u8>>>>,
    }

    impl PtyBackend for FakeBackend {
        fn spawn(&self, _username: Option<&str>) -> Result<Box<dyn PtyHandle>> {
            self.spawned.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = std_mpsc::channel();
            self.outputs.lock().unwrap().push(tx);
            Ok(Box::new(FakePty {
                output: Some(rx),
                written: Arc::new(StdMutex::new(Vec::new())),
                resizes: self.resizes.clone(),
            }))
        }
    }

    fn fake_client() -> (Client, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::default());
        let cfg = Config {
            id: "dev-01".to_string(),
            ..Config::default()
        };
        let client = Client::with_backends(cfg, backend.clone(), Arc::new(ProcProbe));
        (client, backend)
    }

    fn login_payload(n: u8) -> Vec<u8> {
        vec![n; 32]
    }

    async fn read_login_reply(broker: &mut tokio::io::DuplexStream) -> (Vec<u8>, u8) {
        let mut head = [0u8; 3];
        broker.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], MessageType::Login.as_u8());
        assert_eq!(u16::from_be_bytes([head[1], head[2]]), 33);

        let mut payload = [0u8; 33];
        broker.read_exact(&mut payload).await.unwrap();
        (payload[..32].to_vec(), payload[32])
    }

    #[tokio::test]
    async fn test_login_cap_rejects_eleventh() {
        let (client, backend) = fake_client();
        let mut broker = connect_duplex(client.shared()).await;

        for n in 0..10u8 {
            handle_login(client.shared(), &login_payload(n)).await.unwrap();
            let (sid, ret) = read_login_reply(&mut broker).await;
            assert_eq!(sid, login_payload(n));
            assert_eq!(ret, 0);
        }

        handle_login(client.shared(), &login_payload(10)).await.unwrap();
        let (_, ret) = read_login_reply(&mut broker).await;
        assert_eq!(ret, 1);

        // The rejected login must not have spawned a PTY.
        assert_eq!(backend.spawned.load(Ordering::Relaxed), 10);
    }

    #[tokio::test]
    async fn test_logout_frees_a_slot() {
        let (client, backend) = fake_client();
        let mut broker = connect_duplex(client.shared()).await;

        for n in 0..10u8 {
            handle_login(client.shared(), &login_payload(n)).await.unwrap();
            read_login_reply(&mut broker).await;
        }

        handle_logout(client.shared(), &login_payload(3)).await.unwrap();

        handle_login(client.shared(), &login_payload(10)).await.unwrap();
        let (_, ret) = read_login_reply(&mut broker).await;
        assert_eq!(ret, 0);
        assert_eq!(backend.spawned.load(Ordering::Relaxed), 11);
    }

    #[tokio::test]
    async fn test_winsize_resizes_pty() {
        let (client, backend) = fake_client();
        let mut broker = connect_duplex(client.shared()).await;

        handle_login(client.shared(), &login_payload(7)).await.unwrap();
        read_login_reply(&mut broker).await;

        let mut payload = login_payload(7);
        payload.extend_from_slice(&[0x00, 0x50, 0x00, 0x18]);
        handle_winsize(client.shared(), &payload).unwrap();

        assert_eq!(backend.resizes.lock().unwrap().as_slice(), &[(80, 24)]);
    }

    #[tokio::test]
    async fn test_term_data_unknown_sid_dropped() {
        let (client, _) = fake_client();
        let _broker = connect_duplex(client.shared()).await;

        let mut payload = login_payload(9);
        payload.push(b'x');
        // No session exists: logged and dropped, never an error.
        handle_term_data(client.shared(), &payload).unwrap();
    }

    #[tokio::test]
    async fn test_wait_ack_blocks_over_threshold() {
        let (_tx, rx) = std_mpsc::channel();
        let pty = FakePty {
            output: Some(rx),
            written: Arc::new(StdMutex::new(Vec::new())),
            resizes: Arc::new(StdMutex::new(Vec::new())),
        };
        let session = Arc::new(TermSession::new(
            Sid::new([b'a'; 32]),
            Box::new(pty),
        ));

        // Below the threshold: never blocks.
        session.wait_ack(4096).await;

        // 5000 outstanding: must block until an ack brings it to 4000.
        let blocked = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_ack(904).await })
        };

        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        session.ack(1000);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("ack did not release the waiter")
            .unwrap();
    }

    #[tokio::test]
    async fn test_ack_handler_credits_window() {
        let (client, _) = fake_client();
        let mut broker = connect_duplex(client.shared()).await;

        handle_login(client.shared(), &login_payload(1)).await.unwrap();
        read_login_reply(&mut broker).await;

        let session = client
            .shared()
            .sessions
            .get(&Sid::new([1u8; 32]))
            .unwrap()
            .clone();

        session.wait_ack(3000).await;

        let mut payload = login_payload(1);
        payload.extend_from_slice(&3000u16.to_be_bytes());
        handle_ack(client.shared(), &payload).unwrap();

        assert_eq!(session.unacked.load(Ordering::Relaxed), 0);
    }
}
