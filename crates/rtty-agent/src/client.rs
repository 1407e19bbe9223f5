//! Client core: connect, register, dispatch, heartbeat, reconnect
//!
//! One connection to the broker carries every subprotocol. Inbound frames
//! are handled sequentially on the dispatch task; outbound frames from
//! every producer (terminal relays, file engine, tunnels, command
//! replies, heartbeat) funnel through a single mutex-guarded writer with
//! one reused scratch buffer, so frames never interleave on the wire.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::BytesMut;
use dashmap::DashMap;
use futures_util::StreamExt;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsConnector;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use rtty_core::{Config, HostProbe, ProcProbe};
use rtty_protocol::codec::encode_frame_parts;
use rtty_protocol::message::{heartbeat_payload, register_payload};
use rtty_protocol::{Frame, FrameCodec, MessageType, Sid};

use crate::cmd::{self, CMD_RUNNING_LIMIT};
use crate::file;
use crate::http::{self, HttpTunnel};
use crate::pty::{LoginPtyBackend, PtyBackend};
use crate::terminal::{self, TermSession};
use crate::tls;

/// Broker connect timeout, covering the TLS handshake when enabled
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the broker's register reply
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for a heartbeat reply
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);

/// Byte stream to the broker, plain or TLS.
pub(crate) trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

struct WriteState {
    io: WriteHalf<Box<dyn Conn>>,
    scratch: BytesMut,
}

/// State shared between the dispatch task and every subsystem task.
pub(crate) struct Shared {
    pub(crate) cfg: Config,
    pub(crate) pty: Arc<dyn PtyBackend>,
    pub(crate) probe: Arc<dyn HostProbe>,
    pub(crate) sessions: DashMap<Sid, Arc<TermSession>>,
    pub(crate) http_tunnels: DashMap<[u8; 18], Arc<HttpTunnel>>,
    pub(crate) active_ttys: AtomicU32,
    pub(crate) cmd_slots: Arc<Semaphore>,
    awaiting_heartbeat: AtomicBool,
    last_heartbeat: StdMutex<Option<Instant>>,
    writer: Mutex<Option<WriteState>>,
    conn_cancel: StdMutex<CancellationToken>,
}

impl Shared {
    fn new(cfg: Config, pty: Arc<dyn PtyBackend>, probe: Arc<dyn HostProbe>) -> Self {
        Self {
            cfg,
            pty,
            probe,
            sessions: DashMap::new(),
            http_tunnels: DashMap::new(),
            active_ttys: AtomicU32::new(0),
            cmd_slots: Arc::new(Semaphore::new(CMD_RUNNING_LIMIT)),
            awaiting_heartbeat: AtomicBool::new(false),
            last_heartbeat: StdMutex::new(None),
            writer: Mutex::new(None),
            conn_cancel: StdMutex::new(CancellationToken::new()),
        }
    }

    /// Encode and write one frame assembled from payload `parts`.
    pub(crate) async fn send_frame(&self, msg_type: MessageType, parts: &[&[u8]]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let state = guard.as_mut().ok_or_else(|| anyhow!("not connected"))?;

        state.scratch.clear();
        encode_frame_parts(&mut state.scratch, msg_type, parts)?;
        state.io.write_all(&state.scratch).await?;

        Ok(())
    }

    /// Send a file subprotocol frame for `sid`.
    pub(crate) async fn send_file_msg(
        &self,
        sid: &Sid,
        typ: rtty_protocol::FileMessageType,
        data: &[u8],
    ) -> Result<()> {
        self.send_frame(MessageType::File, &[sid.as_bytes(), &[typ.as_u8()], data])
            .await
    }

    /// Send an HTTP tunnel frame for `key`; empty `data` signals a failed
    /// dial or a closed target connection.
    pub(crate) async fn send_http_msg(&self, key: &[u8; 18], data: &[u8]) -> Result<()> {
        self.send_frame(MessageType::Http, &[key, data]).await
    }

    /// Cancellation token of the current connection.
    pub(crate) fn conn_token(&self) -> CancellationToken {
        self.conn_cancel.lock().unwrap().clone()
    }

    async fn install_conn(&self, io: WriteHalf<Box<dyn Conn>>, token: CancellationToken) {
        *self.writer.lock().await = Some(WriteState {
            io,
            scratch: BytesMut::with_capacity(4096),
        });
        *self.conn_cancel.lock().unwrap() = token;
        self.awaiting_heartbeat.store(false, Ordering::Relaxed);
        *self.last_heartbeat.lock().unwrap() = None;
    }

    fn heartbeat_reply_seen(&self) {
        self.awaiting_heartbeat.store(false, Ordering::Relaxed);
    }

    /// Tear down everything tied to the current connection.
    pub(crate) async fn close(&self) {
        self.conn_cancel.lock().unwrap().cancel();

        let sids: Vec<Sid> = self.sessions.iter().map(|e| *e.key()).collect();
        for sid in sids {
            if let Some((_, session)) = self.sessions.remove(&sid) {
                session.shutdown().await;
            }
        }
        self.active_ttys.store(0, Ordering::Relaxed);

        for entry in self.http_tunnels.iter() {
            entry.value().cancel();
        }

        *self.writer.lock().await = None;
    }
}

/// The rtty client: owns the connect/register/dispatch/reconnect cycle.
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Create a client with the production PTY backend and host probe.
    pub fn new(cfg: Config) -> Self {
        Self::with_backends(cfg, Arc::new(LoginPtyBackend), Arc::new(ProcProbe))
    }

    /// Create a client with explicit platform capabilities.
    pub fn with_backends(
        cfg: Config,
        pty: Arc<dyn PtyBackend>,
        probe: Arc<dyn HostProbe>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(cfg, pty, probe)),
        }
    }

    /// Run until the connection ends; reconnect forever when configured.
    pub async fn run(&self) -> Result<()> {
        loop {
            let result = self.serve_once().await;

            if let Err(e) = &result {
                tracing::error!("{e:#}");
            }

            self.shared.close().await;

            if !self.shared.cfg.reconnect {
                return result;
            }

            let delay = reconnect_delay();
            tracing::error!("Reconnecting in {delay} seconds...");
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
    }

    /// One full connection: dial, register, then dispatch until the
    /// stream or the heartbeat gives out.
    async fn serve_once(&self) -> Result<()> {
        let cfg = &self.shared.cfg;

        let stream = connect(cfg).await?;
        tracing::info!("Connected to {}:{}", cfg.host, cfg.port);

        let (rd, wr) = tokio::io::split(stream);
        let token = CancellationToken::new();
        self.shared.install_conn(wr, token.clone()).await;

        let mut framed = FramedRead::new(rd, FrameCodec::new());

        let payload = register_payload(
            cfg.heartbeat,
            &cfg.id,
            cfg.group.as_deref(),
            cfg.description.as_deref(),
            cfg.token.as_deref(),
        );
        self.shared
            .send_frame(MessageType::Register, &[&payload])
            .await
            .context("failed to register with server")?;

        let reply = timeout(REGISTER_TIMEOUT, framed.next())
            .await
            .map_err(|_| anyhow!("timed out waiting for register reply"))?
            .ok_or_else(|| anyhow!("connection closed before register reply"))?
            .context("failed to read register msg")?;

        if reply.msg_type != MessageType::Register {
            bail!("register msg expected first, got {}", reply.msg_type);
        }

        if reply.payload[0] != 0 {
            bail!(
                "register failed: {}",
                String::from_utf8_lossy(&reply.payload[1..])
            );
        }

        tracing::info!("registered successfully");

        let heartbeat = tokio::spawn(heartbeat_loop(self.shared.clone(), token.clone()));
        let result = self.dispatch(&mut framed, &token).await;
        heartbeat.abort();

        result
    }

    async fn dispatch(
        &self,
        framed: &mut FramedRead<ReadHalf<Box<dyn Conn>>, FrameCodec>,
        token: &CancellationToken,
    ) -> Result<()> {
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => bail!("connection closed"),
                frame = framed.next() => frame,
            };

            let frame = frame
                .ok_or_else(|| anyhow!("connection closed by server"))?
                .context("failed to read message")?;

            tracing::debug!("recv msg: {}", frame.msg_type);

            self.shared.heartbeat_reply_seen();

            self.handle(frame)
                .await
                .context("failed to handle message")?;
        }
    }

    async fn handle(&self, frame: Frame) -> Result<()> {
        let shared = &self.shared;

        match frame.msg_type {
            MessageType::Heartbeat => Ok(()),
            MessageType::Login => terminal::handle_login(shared, &frame.payload).await,
            MessageType::Logout => terminal::handle_logout(shared, &frame.payload).await,
            MessageType::TermData => terminal::handle_term_data(shared, &frame.payload),
            MessageType::Winsize => terminal::handle_winsize(shared, &frame.payload),
            MessageType::Ack => terminal::handle_ack(shared, &frame.payload),
            MessageType::File => file::handle_file_msg(shared, &frame.payload).await,
            MessageType::Cmd => cmd::handle_cmd_msg(shared, &frame.payload).await,
            MessageType::Http => http::handle_http_msg(shared, frame.payload).await,
            MessageType::Register => bail!("unexpected message 'register'"),
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

/// Dial the broker, optionally completing a TLS handshake, within one
/// connect timeout.
async fn connect(cfg: &Config) -> Result<Box<dyn Conn>> {
    let addr = format!("{}:{}", cfg.host, cfg.port);

    let dial = async {
        let tcp = TcpStream::connect(&addr).await?;

        if !cfg.ssl {
            return Ok::<Box<dyn Conn>, anyhow::Error>(Box::new(tcp));
        }

        let connector = TlsConnector::from(Arc::new(tls::client_config(cfg)?));
        let name = tls::server_name(&cfg.host)?;
        let stream = connector.connect(name, tcp).await?;
        Ok(Box::new(stream))
    };

    timeout(CONNECT_TIMEOUT, dial)
        .await
        .map_err(|_| anyhow!("connection timed out"))?
        .with_context(|| format!("failed to connect to {addr}"))
}

/// Heartbeat driver.
///
/// Fires at the configured interval; a tick that still sees the previous
/// heartbeat unanswered declares the connection dead. After a send the
/// timer is shortened to the reply deadline, and a tick arriving early
/// (because a reply reset the pending flag) re-arms for the remainder of
/// the interval instead of re-sending.
async fn heartbeat_loop(shared: Arc<Shared>, token: CancellationToken) {
    let interval = Duration::from_secs(shared.cfg.heartbeat as u64);
    let mut next = interval;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(next) => {}
        }

        if shared.awaiting_heartbeat.load(Ordering::Relaxed) {
            tracing::error!("heartbeat timeout");
            token.cancel();
            return;
        }

        if let Some(last) = *shared.last_heartbeat.lock().unwrap() {
            let elapsed = last.elapsed();
            if elapsed < interval {
                next = interval - elapsed;
                continue;
            }
        }

        let payload = heartbeat_payload(shared.probe.uptime_seconds());
        if shared
            .send_frame(MessageType::Heartbeat, &[&payload])
            .await
            .is_err()
        {
            token.cancel();
            return;
        }

        *shared.last_heartbeat.lock().unwrap() = Some(Instant::now());
        shared.awaiting_heartbeat.store(true, Ordering::Relaxed);
        tracing::debug!("send msg: heartbeat");

        next = HEARTBEAT_TIMEOUT;
    }
}

/// Random reconnect delay in whole seconds.
fn reconnect_delay() -> u64 {
    rand::thread_rng().gen_range(5..=14)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    pub(crate) struct NullPty;

    impl PtyBackend for NullPty {
        fn spawn(&self, _username: Option<&str>) -> Result<Box<dyn crate::pty::PtyHandle>> {
            bail!("no pty in this test")
        }
    }

    /// Wire a duplex stream in as the broker connection; returns the
    /// broker-side half.
    pub(crate) async fn connect_duplex(shared: &Arc<Shared>) -> tokio::io::DuplexStream {
        let (agent_side, broker_side) = tokio::io::duplex(256 * 1024);
        let (_rd, wr) = tokio::io::split(Box::new(agent_side) as Box<dyn Conn>);
        shared.install_conn(wr, CancellationToken::new()).await;
        broker_side
    }

    fn test_client() -> Client {
        let cfg = Config {
            id: "dev-01".to_string(),
            ..Config::default()
        };
        Client::with_backends(cfg, Arc::new(NullPty), Arc::new(ProcProbe))
    }

    #[test]
    fn test_reconnect_delay_range() {
        for _ in 0..200 {
            let delay = reconnect_delay();
            assert!((5..=14).contains(&delay), "delay {delay} out of range");
        }
    }

    #[tokio::test]
    async fn test_register_frame_bytes() {
        let client = test_client();
        let mut broker = connect_duplex(client.shared()).await;

        let payload = register_payload(5, "dev-01", None, None, None);
        client
            .shared()
            .send_frame(MessageType::Register, &[&payload])
            .await
            .unwrap();

        let mut buf = [0u8; 17];
        broker.read_exact(&mut buf).await.unwrap();

        let mut expect = vec![0x00, 0x00, 0x0e, 0x05];
        expect.extend_from_slice(&[0x00, 0x00, 0x01, 0x05]);
        expect.extend_from_slice(&[0x01, 0x00, 0x06]);
        expect.extend_from_slice(b"dev-01");
        assert_eq!(&buf[..], &expect[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_closes_connection() {
        let client = test_client();
        let _broker = connect_duplex(client.shared()).await;

        let shared = client.shared().clone();
        let token = shared.conn_token();
        let heartbeat = tokio::spawn(heartbeat_loop(shared.clone(), token.clone()));

        // First tick sends a heartbeat; no reply ever arrives, so the
        // reply-deadline tick must kill the connection.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(token.is_cancelled());
        heartbeat.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_going_when_replies_arrive() {
        let client = test_client();
        let mut broker = connect_duplex(client.shared()).await;

        let shared = client.shared().clone();
        let token = shared.conn_token();
        let heartbeat = tokio::spawn(heartbeat_loop(shared.clone(), token.clone()));

        let mut frame = [0u8; 10];
        for _ in 0..3 {
            // Heartbeat frame: type 6, then a single 7-byte uptime TLV.
            broker.read_exact(&mut frame).await.unwrap();
            assert_eq!(frame[0], MessageType::Heartbeat.as_u8());
            assert_eq!(u16::from_be_bytes([frame[1], frame[2]]), 7);

            // Simulate the dispatch loop observing the broker's reply.
            shared.heartbeat_reply_seen();
        }

        assert!(!token.is_cancelled());
        heartbeat.abort();
    }
}
