//! HTTP tunnel manager
//!
//! The broker's control plane proxies HTTP(S) requests to services on the
//! device's LAN. Each distinct source key gets one outbound connection:
//! a writer task drains the bounded inbound queue, a reader task copies
//! target output back as Http frames. Tunnels die on EOF, on a 30-second
//! activity lapse, or when the client shuts down.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use rtty_protocol::message::HttpRequest;

use crate::client::{Conn, Shared};
use crate::tls;

/// No traffic for this long closes the tunnel
const HTTP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle sweep period
const HTTP_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Target dial timeout
const HTTP_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Broker payloads buffered per tunnel
const HTTP_QUEUE_DEPTH: usize = 100;

/// Target read chunk size
const HTTP_READ_BUF: usize = 63 * 1024;

/// One proxied connection, keyed by the broker's 18-byte source key.
pub(crate) struct HttpTunnel {
    inbound: mpsc::Sender<Bytes>,
    active_deadline: AtomicI64,
    cancel: CancellationToken,
}

impl HttpTunnel {
    fn new(inbound: mpsc::Sender<Bytes>) -> Self {
        let tunnel = Self {
            inbound,
            active_deadline: AtomicI64::new(0),
            cancel: CancellationToken::new(),
        };
        tunnel.touch();
        tunnel
    }

    /// Ask the tunnel to shut down.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    fn touch(&self) {
        self.active_deadline.store(
            unix_now() + HTTP_IDLE_TIMEOUT.as_secs() as i64,
            Ordering::Relaxed,
        );
    }

    fn expired(&self) -> bool {
        unix_now() > self.active_deadline.load(Ordering::Relaxed)
    }

    /// Tunnel body: dial, then pump both directions until something ends
    /// it. Teardown always deletes the map entry, so a later frame for
    /// the same key starts fresh.
    async fn run(
        self: Arc<Self>,
        shared: Arc<Shared>,
        use_tls: bool,
        key: [u8; 18],
        addr: SocketAddrV4,
        mut inbound: mpsc::Receiver<Bytes>,
    ) {
        let stream = match dial(use_tls, addr).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("failed to connect to target address {addr}: {e:#}");
                let _ = shared.send_http_msg(&key, &[]).await;
                shared.http_tunnels.remove(&key);
                return;
            }
        };

        self.touch();
        let (mut rd, mut wr) = tokio::io::split(stream);

        let writer = {
            let tunnel = self.clone();
            tokio::spawn(async move {
                let mut sweep = tokio::time::interval(HTTP_SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        buf = inbound.recv() => {
                            let Some(buf) = buf else { break };
                            if wr.write_all(&buf).await.is_err() {
                                break;
                            }
                            tunnel.touch();
                        }
                        _ = sweep.tick() => {
                            if tunnel.expired() {
                                break;
                            }
                        }
                        _ = tunnel.cancel.cancelled() => break,
                    }
                }
                // Idle lapse or a write failure must stop the reader too.
                tunnel.cancel.cancel();
            })
        };

        let mut buf = vec![0u8; HTTP_READ_BUF];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = shared.send_http_msg(&key, &[]).await;
                    break;
                }
                read = rd.read(&mut buf) => {
                    let n = read.unwrap_or(0);
                    let _ = shared.send_http_msg(&key, &buf[..n]).await;
                    if n == 0 {
                        break;
                    }
                    self.touch();
                }
            }
        }

        shared.http_tunnels.remove(&key);
        self.cancel.cancel();
        let _ = writer.await;
    }
}

/// Route an Http frame: enqueue onto the existing tunnel for the key, or
/// insert a fresh one and start its task.
pub(crate) async fn handle_http_msg(shared: &Arc<Shared>, payload: Bytes) -> Result<()> {
    let req = HttpRequest::parse(&payload);

    if req.data.is_empty() {
        tracing::debug!("received empty HTTP message");
        return Ok(());
    }

    // load-or-store without holding the map shard across an await
    let (sender, started) = match shared.http_tunnels.entry(req.key) {
        dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().inbound.clone(), None),
        dashmap::mapref::entry::Entry::Vacant(entry) => {
            let (tx, rx) = mpsc::channel(HTTP_QUEUE_DEPTH);
            let tunnel = Arc::new(HttpTunnel::new(tx.clone()));
            entry.insert(tunnel.clone());
            (tx, Some((tunnel, rx)))
        }
    };

    if let Some((tunnel, rx)) = started {
        tokio::spawn(tunnel.run(shared.clone(), req.tls, req.key, req.addr, rx));
    }

    let _ = sender.send(req.data).await;
    Ok(())
}

/// Dial the LAN target; HTTPS targets are routinely self-signed, so the
/// TLS handshake skips verification.
async fn dial(use_tls: bool, addr: SocketAddrV4) -> Result<Box<dyn Conn>> {
    let stream = timeout(HTTP_DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow!("connection timed out"))??;

    if !use_tls {
        return Ok(Box::new(stream));
    }

    let connector = TlsConnector::from(Arc::new(tls::insecure_config()));
    let name = tls::server_name(&addr.ip().to_string())?;
    let stream = connector.connect(name, stream).await?;
    Ok(Box::new(stream))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
