//! One stratum connection.
//!
//! A connection is a newline-delimited JSON-RPC stream over TCP, optionally
//! wrapped in TLS and optionally prefixed by a proxy-protocol v1 header.
//! [`StratumConnection`] is a cheap-to-clone handle shared between the
//! accept task, the pool logic, and broadcast paths; the I/O itself runs in
//! [`StratumConnection::run`], which races the read loop, the send queue
//! drain, and the cancellation token.
//!
//! Outbound messages pass through a bounded queue. A peer that stops
//! reading first blocks the socket write, then fills the queue; once
//! either the in-flight write or an enqueue blocks past [`SEND_TIMEOUT`]
//! the connection is torn down rather than letting backpressure
//! propagate into the broadcast path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::config::ProxyProtocolConfig;
use crate::pool::context::WorkerContext;
use crate::stratum::rpc::{Request, Response, RpcError};
use crate::tracing::prelude::*;

/// Longest accepted line, including the terminator.
pub const MAX_LINE_LENGTH: usize = 32 * 1024;

/// Outbound queue depth before senders start blocking.
pub const SEND_QUEUE_CAPACITY: usize = 32;

/// How long a sender may block on a full queue, or the drain loop on one
/// socket write, before the connection is declared stalled and torn down.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Any bidirectional byte stream a connection can run over.
pub type DynStream = Box<dyn AsyncStream>;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Receives protocol events for a connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A complete JSON-RPC request arrived.
    async fn on_request(&self, conn: &StratumConnection, request: Request) -> Result<()>;

    /// The connection ended, cleanly or not.
    async fn on_disconnect(&self, conn: &StratumConnection);
}

struct ConnectionInner {
    id: String,
    endpoint: usize,
    local_addr: SocketAddr,
    remote_addr: RwLock<SocketAddr>,
    tls: bool,
    connected_at: Instant,
    last_seen: Mutex<Instant>,
    send_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    context: Mutex<WorkerContext>,
}

/// Handle to a live stratum connection.
#[derive(Clone)]
pub struct StratumConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for StratumConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StratumConnection")
            .field("id", &self.inner.id)
            .field("remote", &*self.inner.remote_addr.read())
            .finish()
    }
}

impl StratumConnection {
    /// Create a handle plus the receiver its run loop will drain.
    pub fn new(
        id: String,
        endpoint: usize,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        tls: bool,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<String>) {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let now = Instant::now();
        let inner = Arc::new(ConnectionInner {
            id,
            endpoint,
            local_addr,
            remote_addr: RwLock::new(remote_addr),
            tls,
            connected_at: now,
            last_seen: Mutex::new(now),
            send_tx,
            cancel,
            context: Mutex::new(WorkerContext::default()),
        });
        (Self { inner }, send_rx)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Index of the listen endpoint this connection arrived on.
    pub fn endpoint(&self) -> usize {
        self.inner.endpoint
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Peer address, after any proxy-protocol rewrite.
    pub fn remote_addr(&self) -> SocketAddr {
        *self.inner.remote_addr.read()
    }

    pub fn is_tls(&self) -> bool {
        self.inner.tls
    }

    pub fn connected_at(&self) -> Instant {
        self.inner.connected_at
    }

    /// Instant of the last inbound line.
    pub fn last_seen(&self) -> Instant {
        *self.inner.last_seen.lock()
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Tear the connection down. The run loop exits on the next poll.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// Lock the per-worker protocol state.
    pub fn context(&self) -> MutexGuard<'_, WorkerContext> {
        self.inner.context.lock()
    }

    /// Queue a message for the peer.
    ///
    /// Blocks up to [`SEND_TIMEOUT`] when the queue is full; a stall closes
    /// the connection and surfaces [`Error::SendQueueStalled`].
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        if line.len() >= MAX_LINE_LENGTH {
            return Err(Error::Protocol("oversized outbound message".into()));
        }
        line.push('\n');
        match self.inner.send_tx.send_timeout(line, SEND_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(id = %self.inner.id, "send queue stalled, closing connection");
                self.close();
                Err(Error::SendQueueStalled)
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.close();
                Err(Error::Io(std::io::ErrorKind::BrokenPipe.into()))
            }
        }
    }

    pub async fn respond(&self, id: Value, result: Value) -> Result<()> {
        self.send(&Response::ok(id, result)).await
    }

    pub async fn respond_error(&self, id: Value, error: RpcError) -> Result<()> {
        self.send(&Response::err(id, error)).await
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.send(&Request::notification(method, params)).await
    }

    fn touch(&self) {
        *self.inner.last_seen.lock() = Instant::now();
    }

    /// Drive the connection until EOF, error, or cancellation.
    ///
    /// Reads frames off `stream`, drains the outbound queue into it, and
    /// hands parsed requests to `handler`. The first line is intercepted
    /// for a proxy-protocol header when `proxy` is configured. Returns the
    /// error that ended the session so the server can classify it.
    pub async fn run<H: ConnectionHandler>(
        &self,
        stream: DynStream,
        mut send_rx: mpsc::Receiver<String>,
        proxy: Option<ProxyProtocolConfig>,
        handler: Arc<H>,
    ) -> Result<()> {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut frames = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        );
        let mut awaiting_proxy_header = proxy.is_some();

        let result = loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    break Ok(());
                }

                outbound = send_rx.recv() => {
                    match outbound {
                        Some(line) => {
                            let write = async {
                                write_half.write_all(line.as_bytes()).await?;
                                write_half.flush().await
                            };
                            // The write itself must stay cancellable and
                            // bounded: a peer that stopped reading would
                            // otherwise park this loop inside write_all
                            // with the cancellation token never polled.
                            tokio::select! {
                                _ = self.inner.cancel.cancelled() => break Ok(()),
                                written = tokio::time::timeout(SEND_TIMEOUT, write) => {
                                    match written {
                                        Ok(Ok(())) => {}
                                        Ok(Err(e)) => break Err(Error::Io(e)),
                                        Err(_) => {
                                            warn!(id = %self.inner.id, "peer stopped reading, closing connection");
                                            break Err(Error::SendQueueStalled);
                                        }
                                    }
                                }
                            }
                        }
                        // All senders gone, nothing left to write.
                        None => break Ok(()),
                    }
                }

                frame = frames.next() => {
                    let line = match frame {
                        Some(Ok(line)) => line,
                        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                            break Err(Error::Protocol("oversized frame".into()));
                        }
                        Some(Err(LinesCodecError::Io(e))) => break Err(Error::Io(e)),
                        None => break Ok(()),
                    };

                    if line.trim().is_empty() {
                        continue;
                    }
                    self.touch();

                    if awaiting_proxy_header {
                        awaiting_proxy_header = false;
                        let config = proxy.as_ref().unwrap();
                        match self.apply_proxy_header(&line, config) {
                            Ok(true) => continue,
                            Ok(false) => {} // ordinary line, fall through
                            Err(e) => break Err(e),
                        }
                    }

                    let request: Request = match serde_json::from_str(&line) {
                        Ok(request) => request,
                        Err(e) => break Err(Error::Json(e)),
                    };

                    trace!(id = %self.inner.id, method = %request.method, "request");
                    if let Err(e) = handler.on_request(self, request).await {
                        break Err(e);
                    }
                }
            }
        };

        self.inner.cancel.cancel();
        handler.on_disconnect(self).await;
        result
    }

    /// Handle a possible proxy-protocol v1 line.
    ///
    /// Returns `Ok(true)` if the line was a header and got consumed,
    /// `Ok(false)` if it was not a header and the endpoint tolerates that.
    fn apply_proxy_header(&self, line: &str, config: &ProxyProtocolConfig) -> Result<bool> {
        if !line.starts_with("PROXY ") {
            if config.mandatory {
                return Err(Error::Protocol(
                    "expected proxy-protocol header".into(),
                ));
            }
            return Ok(false);
        }

        let peer = self.remote_addr().ip();
        if !config.is_trusted(peer) {
            return Err(Error::SpoofedProxyHeader(peer));
        }

        let source = parse_proxy_v1(line)?;
        debug!(id = %self.inner.id, %source, "proxy-protocol rewrite");
        *self.inner.remote_addr.write() = source;
        Ok(true)
    }
}

/// Parse a proxy-protocol v1 line and return the advertised source address.
///
/// Format: `PROXY TCP4|TCP6 <src> <dst> <sport> <dport>`. The UNKNOWN
/// variant carries no address and is rejected.
fn parse_proxy_v1(line: &str) -> Result<SocketAddr> {
    let mut parts = line.split_ascii_whitespace();
    let bad = || Error::Protocol(format!("malformed proxy-protocol header: {line}"));

    let _proxy = parts.next().ok_or_else(bad)?;
    let proto = parts.next().ok_or_else(bad)?;
    if proto != "TCP4" && proto != "TCP6" {
        return Err(Error::Protocol(format!(
            "unsupported proxy-protocol transport: {proto}"
        )));
    }

    let src_ip = parts.next().ok_or_else(bad)?;
    let _dst_ip = parts.next().ok_or_else(bad)?;
    let src_port = parts.next().ok_or_else(bad)?;
    let _dst_port = parts.next().ok_or_else(bad)?;

    let ip = src_ip.parse().map_err(|_| bad())?;
    let port: u16 = src_port.parse().map_err(|_| bad())?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    struct Recorder {
        requests: Mutex<Vec<Request>>,
        disconnected: Mutex<bool>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                disconnected: Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl ConnectionHandler for Recorder {
        async fn on_request(&self, conn: &StratumConnection, request: Request) -> Result<()> {
            if request.expects_response() {
                conn.respond(request.id.clone().unwrap(), json!(true)).await?;
            }
            self.requests.lock().push(request);
            Ok(())
        }

        async fn on_disconnect(&self, _conn: &StratumConnection) {
            *self.disconnected.lock() = true;
        }
    }

    fn test_connection(proxy: bool) -> (StratumConnection, mpsc::Receiver<String>) {
        let _ = proxy;
        StratumConnection::new(
            "conn-1".into(),
            0,
            "127.0.0.1:3333".parse().unwrap(),
            "127.0.0.1:49152".parse().unwrap(),
            false,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn frames_survive_arbitrary_chunking() {
        let (conn, send_rx) = test_connection(false);
        let handler = Recorder::new();
        let (mut client, server) = tokio::io::duplex(1024);

        let task = {
            let conn = conn.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                conn.run(Box::new(server), send_rx, None, handler).await
            })
        };

        // One request split into byte-sized chunks plus a second request
        // arriving glued to the first one's terminator.
        let payload =
            b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n{\"id\":2,\"method\":\"mining.authorize\",\"params\":[\"w\",\"x\"]}\n";
        for chunk in payload.chunks(7) {
            client.write_all(chunk).await.unwrap();
        }

        // Both responses come back on the same stream.
        let mut buf = vec![0u8; 256];
        let mut got = String::new();
        while got.matches('\n').count() < 2 {
            let n = client.read(&mut buf).await.unwrap();
            got.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        assert_eq!(got.lines().count(), 2);

        conn.close();
        task.await.unwrap().unwrap();
        assert_eq!(handler.requests.lock().len(), 2);
        assert!(*handler.disconnected.lock());
    }

    #[tokio::test]
    async fn oversized_line_ends_the_session() {
        let (conn, send_rx) = test_connection(false);
        let handler = Recorder::new();
        let (mut client, server) = tokio::io::duplex(64 * 1024);

        let task = {
            let conn = conn.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                conn.run(Box::new(server), send_rx, None, handler).await
            })
        };

        let junk = vec![b'a'; MAX_LINE_LENGTH + 1];
        client.write_all(&junk).await.unwrap();
        client.write_all(b"\n").await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err:?}");
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn invalid_json_is_classified_as_junk() {
        let (conn, send_rx) = test_connection(false);
        let handler = Recorder::new();
        let (mut client, server) = tokio::io::duplex(1024);

        let task = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.run(Box::new(server), send_rx, None, handler).await
            })
        };

        client.write_all(b"GET / HTTP/1.1\n").await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_junk(), "{err:?}");
    }

    #[tokio::test]
    async fn proxy_header_rewrites_remote_endpoint() {
        let (conn, send_rx) = test_connection(true);
        let handler = Recorder::new();
        let (mut client, server) = tokio::io::duplex(1024);

        let proxy = ProxyProtocolConfig {
            mandatory: true,
            trusted: vec![],
        };
        let task = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.run(Box::new(server), send_rx, Some(proxy), handler).await
            })
        };

        client
            .write_all(b"PROXY TCP4 203.0.113.7 10.0.0.1 51000 3333\n")
            .await
            .unwrap();
        client
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        assert!(n > 0);

        assert_eq!(conn.remote_addr(), "203.0.113.7:51000".parse().unwrap());
        conn.close();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn spoofed_proxy_header_fails_closed() {
        let (conn, send_rx) = StratumConnection::new(
            "conn-2".into(),
            0,
            "0.0.0.0:3333".parse().unwrap(),
            "198.51.100.9:40000".parse().unwrap(),
            false,
            CancellationToken::new(),
        );
        let handler = Recorder::new();
        let (mut client, server) = tokio::io::duplex(1024);

        // Trusted set defaults to loopback; 198.51.100.9 is not in it.
        let proxy = ProxyProtocolConfig {
            mandatory: false,
            trusted: vec![],
        };
        let task = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.run(Box::new(server), send_rx, Some(proxy), handler).await
            })
        };

        client
            .write_all(b"PROXY TCP4 203.0.113.7 10.0.0.1 51000 3333\n")
            .await
            .unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::SpoofedProxyHeader(_)), "{err:?}");
        // The advertised address must not take effect.
        assert_eq!(conn.remote_addr(), "198.51.100.9:40000".parse().unwrap());
    }

    #[tokio::test]
    async fn mandatory_proxy_rejects_plain_clients() {
        let (conn, send_rx) = test_connection(true);
        let handler = Recorder::new();
        let (mut client, server) = tokio::io::duplex(1024);

        let proxy = ProxyProtocolConfig {
            mandatory: true,
            trusted: vec![],
        };
        let task = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.run(Box::new(server), send_rx, Some(proxy), handler).await
            })
        };

        client
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err:?}");
    }

    #[tokio::test]
    async fn stalled_send_queue_tears_the_connection_down() {
        tokio::time::pause();

        let (conn, _send_rx) = test_connection(false);

        // Nobody drains the queue. Fill it to capacity, then one more send
        // must stall and fail once the timeout elapses.
        for _ in 0..SEND_QUEUE_CAPACITY {
            conn.send(&json!({"k": 1})).await.unwrap();
        }
        let err = conn.send(&json!({"k": 2})).await.unwrap_err();
        assert!(matches!(err, Error::SendQueueStalled), "{err:?}");
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn blocked_write_tears_the_connection_down() {
        tokio::time::pause();

        let (conn, send_rx) = test_connection(false);
        let handler = Recorder::new();
        // A transport buffer too small for even one message, and a peer
        // that never reads: the first dequeued write blocks for good.
        let (_client, server) = tokio::io::duplex(16);

        let task = {
            let conn = conn.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                conn.run(Box::new(server), send_rx, None, handler).await
            })
        };

        // One queued message is enough: the run loop dequeues it, the
        // write parks, and the write timeout must end the session.
        conn.send(&json!({"filler": "a".repeat(64)})).await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::SendQueueStalled)), "{result:?}");
        assert!(!conn.is_alive());
        assert!(*handler.disconnected.lock());
    }

    #[tokio::test]
    async fn close_interrupts_a_blocked_write() {
        let (conn, send_rx) = test_connection(false);
        let handler = Recorder::new();
        let (_client, server) = tokio::io::duplex(16);

        let task = {
            let conn = conn.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                conn.run(Box::new(server), send_rx, None, handler).await
            })
        };

        conn.send(&json!({"filler": "a".repeat(64)})).await.unwrap();
        tokio::task::yield_now().await;

        // The run loop is parked inside the write; close() must still end
        // the session without waiting out the send timeout.
        conn.close();
        task.await.unwrap().unwrap();
        assert!(*handler.disconnected.lock());
    }

    #[test]
    fn parses_proxy_v1_header() {
        let addr = parse_proxy_v1("PROXY TCP4 192.0.2.1 10.0.0.1 56324 3333").unwrap();
        assert_eq!(addr, "192.0.2.1:56324".parse().unwrap());

        let addr = parse_proxy_v1("PROXY TCP6 2001:db8::1 ::1 4000 3333").unwrap();
        assert_eq!(addr, "[2001:db8::1]:4000".parse().unwrap());

        assert!(parse_proxy_v1("PROXY UNKNOWN").is_err());
        assert!(parse_proxy_v1("PROXY TCP4 not-an-ip 10.0.0.1 1 2").is_err());
    }
}
