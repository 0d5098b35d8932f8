//! Stratum listener and connection registry.
//!
//! [`StratumServer`] binds one TCP listener per configured endpoint and
//! races them all in a single accept loop. Accepted sockets get their TCP
//! options set, pass a ban check, optionally complete a TLS handshake, and
//! then run as a [`StratumConnection`] session on the task tracker.
//!
//! TLS acceptors are built once at construction, keyed by certificate
//! path, so endpoints sharing a certificate share an acceptor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::select_all;
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::banning::BanManager;
use crate::config::{EndpointConfig, PoolConfig, TlsConfig};
use crate::error::{Error, Result};
use crate::stratum::connection::{ConnectionHandler, DynStream, StratumConnection};
use crate::tracing::prelude::*;

/// Ban handed to peers that send junk before completing a handshake.
const JUNK_BAN: Duration = Duration::from_secs(180);

const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

pub struct StratumServer {
    config: Arc<PoolConfig>,
    bans: Arc<BanManager>,
    registry: Mutex<HashMap<String, StratumConnection>>,
    tls_acceptors: HashMap<PathBuf, TlsAcceptor>,
    conn_seq: AtomicU64,
    cancel: CancellationToken,
}

impl StratumServer {
    /// Build the server, loading TLS material for every TLS endpoint.
    ///
    /// Certificate problems surface here rather than at first connection.
    pub fn new(
        config: Arc<PoolConfig>,
        bans: Arc<BanManager>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut tls_acceptors = HashMap::new();
        for endpoint in &config.ports {
            if let Some(tls) = &endpoint.tls {
                if !tls_acceptors.contains_key(&tls.cert_file) {
                    let acceptor = build_tls_acceptor(tls)?;
                    tls_acceptors.insert(tls.cert_file.clone(), acceptor);
                }
            }
        }

        Ok(Self {
            config,
            bans,
            registry: Mutex::new(HashMap::new()),
            tls_acceptors,
            conn_seq: AtomicU64::new(1),
            cancel,
        })
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Snapshot of all live connections.
    ///
    /// The registry lock is dropped before the caller iterates, so slow
    /// peers cannot hold up other registry users.
    pub fn connections(&self) -> Vec<StratumConnection> {
        self.registry.lock().values().cloned().collect()
    }

    pub fn get_connection(&self, id: &str) -> Option<StratumConnection> {
        self.registry.lock().get(id).cloned()
    }

    pub fn ban_manager(&self) -> &Arc<BanManager> {
        &self.bans
    }

    /// Bind all endpoints and accept until cancelled.
    pub async fn run<H: ConnectionHandler>(
        self: Arc<Self>,
        handler: Arc<H>,
        tracker: TaskTracker,
    ) -> Result<()> {
        let mut accept_streams = Vec::new();
        for (index, endpoint) in self.config.ports.iter().enumerate() {
            let listener = bind_endpoint(endpoint).await?;
            info!(
                address = %endpoint.address,
                port = endpoint.port,
                tls = endpoint.tls.is_some(),
                "stratum endpoint listening"
            );
            accept_streams
                .push(TcpListenerStream::new(listener).map(move |result| (index, result)).boxed());
        }
        let mut accepts = select_all(accept_streams);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("stratum server shutting down");
                    break;
                }

                Some((endpoint_index, accepted)) = accepts.next() => {
                    let stream = match accepted {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    self.clone().admit(stream, endpoint_index, handler.clone(), &tracker);
                }
            }
        }
        Ok(())
    }

    /// Vet a freshly accepted socket and spawn its session.
    pub(crate) fn admit<H: ConnectionHandler>(
        self: Arc<Self>,
        stream: TcpStream,
        endpoint_index: usize,
        handler: Arc<H>,
        tracker: &TaskTracker,
    ) {
        let remote_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            // Peer already gone.
            Err(_) => return,
        };

        if self.bans.is_banned(remote_addr.ip()) {
            debug!(%remote_addr, "dropping connection from banned peer");
            return;
        }

        let max = self.config.max_connections;
        if max > 0 && self.connection_count() >= max {
            warn!(%remote_addr, limit = max, "connection limit reached, rejecting");
            return;
        }

        if let Err(e) = configure_socket(&stream) {
            debug!(%remote_addr, error = %e, "failed to set socket options");
        }

        let server = self;
        tracker.spawn(async move {
            server.session(stream, remote_addr, endpoint_index, handler).await;
        });
    }

    /// Run a full session: TLS handshake, registry bookkeeping, the
    /// connection loop, and terminal error classification.
    async fn session<H: ConnectionHandler>(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: std::net::SocketAddr,
        endpoint_index: usize,
        handler: Arc<H>,
    ) {
        let endpoint = &self.config.ports[endpoint_index];
        let local_addr = stream.local_addr().unwrap_or_else(|_| {
            std::net::SocketAddr::new(endpoint.address, endpoint.port)
        });
        let is_tls = endpoint.tls.is_some();

        let stream: DynStream = if let Some(tls) = &endpoint.tls {
            let acceptor = &self.tls_acceptors[&tls.cert_file];
            match acceptor.accept(stream).await {
                Ok(tls_stream) => Box::new(tls_stream),
                Err(e) => {
                    self.classify_terminal(remote_addr, &Error::Tls(e.to_string()));
                    return;
                }
            }
        } else {
            Box::new(stream)
        };

        let id = format!("{:x}", self.conn_seq.fetch_add(1, Ordering::Relaxed));
        let (conn, send_rx) = StratumConnection::new(
            id.clone(),
            endpoint_index,
            local_addr,
            remote_addr,
            is_tls,
            self.cancel.child_token(),
        );
        self.registry.lock().insert(id.clone(), conn.clone());
        debug!(%id, %remote_addr, tls = is_tls, "connection established");

        let result = conn
            .run(stream, send_rx, endpoint.proxy_protocol.clone(), handler)
            .await;

        self.registry.lock().remove(&id);
        match result {
            Ok(()) => debug!(%id, "connection closed"),
            Err(e) => self.classify_terminal(conn.remote_addr(), &e),
        }
    }

    /// Log a terminal error at appropriate severity and ban junk senders.
    fn classify_terminal(&self, remote_addr: std::net::SocketAddr, error: &Error) {
        if error.is_expected_churn() {
            debug!(%remote_addr, %error, "connection lost");
        } else if error.is_junk() {
            warn!(%remote_addr, %error, "junk from peer");
            if self.config.banning.enabled && self.config.banning.ban_on_junk {
                self.bans.ban(remote_addr.ip(), JUNK_BAN);
            }
        } else {
            warn!(%remote_addr, %error, "connection failed");
        }
    }
}

async fn bind_endpoint(endpoint: &EndpointConfig) -> Result<TcpListener> {
    let addr = std::net::SocketAddr::new(endpoint.address, endpoint.port);
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into())?)
}

fn configure_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_TIME))
}

fn build_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_pem = std::fs::read(&tls.cert_file).map_err(|e| {
        Error::Tls(format!("reading {}: {e}", tls.cert_file.display()))
    })?;
    let key_pem = std::fs::read(&tls.key_file).map_err(|e| {
        Error::Tls(format!("reading {}: {e}", tls.key_file.display()))
    })?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Tls(format!("parsing {}: {e}", tls.cert_file.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates in {}",
            tls.cert_file.display()
        )));
    }
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| Error::Tls(format!("parsing {}: {e}", tls.key_file.display())))?
        .ok_or_else(|| {
            Error::Tls(format!("no private key in {}", tls.key_file.display()))
        })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config(ports: Vec<EndpointConfig>) -> Arc<PoolConfig> {
        Arc::new(PoolConfig {
            id: "test".into(),
            ports,
            daemon: DaemonConfig {
                url: "http://127.0.0.1:18443".into(),
                user: None,
                password: None,
            },
            address: "addr".into(),
            banning: Default::default(),
            max_connections: 0,
            poll_interval: 1,
        })
    }

    fn plain_endpoint() -> EndpointConfig {
        EndpointConfig {
            address: "127.0.0.1".parse().unwrap(),
            port: 0,
            difficulty: 1.0,
            tls: None,
            proxy_protocol: None,
            vardiff: None,
        }
    }

    struct Echo;

    #[async_trait]
    impl ConnectionHandler for Echo {
        async fn on_request(
            &self,
            conn: &StratumConnection,
            request: crate::stratum::rpc::Request,
        ) -> Result<()> {
            if request.expects_response() {
                conn.respond(request.id.unwrap(), json!(request.method)).await?;
            }
            Ok(())
        }

        async fn on_disconnect(&self, _conn: &StratumConnection) {}
    }

    async fn start_server(
        config: Arc<PoolConfig>,
        bans: Arc<BanManager>,
    ) -> (Arc<StratumServer>, std::net::SocketAddr, CancellationToken) {
        let cancel = CancellationToken::new();
        // Bind by hand so the test learns the ephemeral port.
        let listener = bind_endpoint(&config.ports[0]).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Arc::new(StratumServer::new(config, bans, cancel.clone()).unwrap());
        let tracker = TaskTracker::new();
        {
            let server = server.clone();
            let handler = Arc::new(Echo);
            let accept_cancel = cancel.clone();
            tokio::spawn(async move {
                let mut accepts = TcpListenerStream::new(listener);
                loop {
                    tokio::select! {
                        _ = accept_cancel.cancelled() => break,
                        Some(accepted) = accepts.next() => {
                            if let Ok(stream) = accepted {
                                server.clone().admit(stream, 0, handler.clone(), &tracker);
                            }
                        }
                    }
                }
            });
        }
        (server, addr, cancel)
    }

    #[tokio::test]
    async fn accepts_and_registers_connections() {
        let config = test_config(vec![plain_endpoint()]);
        let bans = Arc::new(BanManager::new());
        let (server, addr, cancel) = start_server(config, bans).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        let line = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(line.contains("mining.subscribe"), "{line}");
        assert_eq!(server.connection_count(), 1);

        drop(client);
        cancel.cancel();
    }

    #[tokio::test]
    async fn banned_peer_is_dropped_before_handshake() {
        let config = test_config(vec![plain_endpoint()]);
        let bans = Arc::new(BanManager::new());
        bans.ban("127.0.0.1".parse().unwrap(), Duration::from_secs(60));
        let (server, addr, cancel) = start_server(config, bans).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        // The socket is accepted then immediately dropped; the read must
        // see EOF without any registry entry appearing.
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(server.connection_count(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn junk_sender_gets_banned() {
        let config = test_config(vec![plain_endpoint()]);
        let bans = Arc::new(BanManager::new());
        let (server, addr, cancel) = start_server(config, bans.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        // Session ends with a junk classification and a ban.
        let mut buf = [0u8; 16];
        let _ = client.read(&mut buf).await;
        for _ in 0..50 {
            if bans.is_banned("127.0.0.1".parse().unwrap()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(bans.is_banned("127.0.0.1".parse().unwrap()));
        assert_eq!(server.connection_count(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn connection_limit_is_enforced() {
        let mut config = (*test_config(vec![plain_endpoint()])).clone();
        config.max_connections = 1;
        let config = Arc::new(config);
        let bans = Arc::new(BanManager::new());
        let (server, addr, cancel) = start_server(config, bans).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();
        let mut buf = [0u8; 256];
        let _ = first.read(&mut buf).await.unwrap();
        assert_eq!(server.connection_count(), 1);

        let mut second = TcpStream::connect(addr).await.unwrap();
        let n = second.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "second connection should be rejected");
        cancel.cancel();
    }
}
