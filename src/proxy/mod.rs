//! Multi-protocol proxy server
//!
//! One accept loop per listening port. Dedicated ports go straight to
//! their typed handler; multi-protocol ports peek at the first bytes,
//! classify the connection as SSH, TLS or HTTP, and replay the peeked
//! bytes into the chosen handler so it observes the original stream.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{detect, timeout};
use crate::identity::SshIdentity;
use crate::router::RouteState;
use crate::stream::ReplayStream;

pub mod http;
pub mod ssh;
pub mod tls;

/// What a connection's first bytes say it speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ssh,
    Tls,
    Http,
}

/// Classify peeked bytes. `None` means the connection should be
/// closed immediately; matching is exact, never loose.
#[must_use]
pub fn detect_protocol(buf: &[u8]) -> Option<Protocol> {
    if buf.len() >= 4 && &buf[..4] == detect::SSH_PREFIX {
        return Some(Protocol::Ssh);
    }
    if !buf.is_empty() && buf[0] == detect::TLS_HANDSHAKE {
        return Some(Protocol::Tls);
    }
    if buf.len() >= 4 && detect::HTTP_METHODS.iter().any(|m| buf[..4] == m[..]) {
        return Some(Protocol::Http);
    }
    None
}

/// The handler a listener feeds accepted connections into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Ssh,
    Http,
    Tls,
    /// Auto-detect between the three
    Multi,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssh => write!(f, "ssh"),
            Self::Http => write!(f, "http"),
            Self::Tls => write!(f, "tls"),
            Self::Multi => write!(f, "multi"),
        }
    }
}

/// Accepts connections and routes them to tenant containers, static
/// upstreams or the fallback.
pub struct GatewayServer {
    state: Arc<RouteState>,
    identity: Arc<SshIdentity>,
    fallback: Option<String>,
    tls_acceptor: Option<TlsAcceptor>,
    ssh_config: Arc<russh::server::Config>,
    shutdown: CancellationToken,
}

impl GatewayServer {
    #[must_use]
    pub fn new(
        state: Arc<RouteState>,
        identity: Arc<SshIdentity>,
        fallback: Option<String>,
    ) -> Self {
        let ssh_config = Arc::new(ssh::server_config(&identity));
        Self {
            state,
            identity,
            fallback: fallback.filter(|f| !f.is_empty()),
            tls_acceptor: None,
            ssh_config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Load a certificate and key for TLS termination. Without this
    /// the gateway only ever passes TLS through.
    pub fn load_tls_cert(&mut self, cert_path: &str, key_path: &str) -> Result<()> {
        let config = tls::load_server_config(cert_path, key_path)?;
        self.tls_acceptor = Some(TlsAcceptor::from(Arc::new(config)));
        info!("loaded TLS certificate cert={}", cert_path);
        Ok(())
    }

    /// Bind `port` on all interfaces and serve until `close` is called.
    pub async fn listen(self: Arc<Self>, port: u16, kind: ListenerKind) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("bind port {}", port))?;
        self.listen_on(listener, kind).await
    }

    /// Serve an already-bound listener until `close` is called.
    pub async fn listen_on(self: Arc<Self>, listener: TcpListener, kind: ListenerKind) -> Result<()> {
        let local_port = listener.local_addr()?.port();
        info!("listening port={} protocol={}", local_port, kind);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("listener closed port={}", local_port);
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.dispatch(stream, local_port, peer, kind).await;
                            });
                        }
                        Err(e) => error!("accept failed port={}: {}", local_port, e),
                    }
                }
            }
        }
    }

    /// Stop all accept loops. In-flight connections drain naturally.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn dispatch(&self, stream: TcpStream, local_port: u16, peer: SocketAddr, kind: ListenerKind) {
        match kind {
            ListenerKind::Ssh => self.handle_ssh(stream, peer).await,
            ListenerKind::Http => self.handle_http(stream, local_port, peer).await,
            ListenerKind::Tls => self.handle_tls(stream, local_port, peer).await,
            ListenerKind::Multi => self.handle_multi(stream, local_port, peer).await,
        }
    }

    /// Peek up to 8 bytes, classify, and hand the connection (with the
    /// peeked bytes replayed) to the protocol handler.
    async fn handle_multi(&self, mut stream: TcpStream, local_port: u16, peer: SocketAddr) {
        let mut buf = [0u8; detect::PEEK_SIZE];
        let n = match stream.read(&mut buf).await {
            Ok(0) => {
                debug!("connection closed before protocol detection client={}", peer);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("failed to read protocol detection bytes client={}: {}", peer, e);
                return;
            }
        };
        let peeked = buf[..n].to_vec();

        let Some(protocol) = detect_protocol(&peeked) else {
            warn!("unknown protocol bytes={:02x?} client={}", peeked, peer);
            return;
        };

        debug!("detected {:?} protocol client={}", protocol, peer);
        let replay = ReplayStream::new(stream, peeked);
        match protocol {
            Protocol::Ssh => self.handle_ssh(replay, peer).await,
            Protocol::Tls => self.handle_tls(replay, local_port, peer).await,
            Protocol::Http => self.handle_http(replay, local_port, peer).await,
        }
    }

    /// Dial an upstream with the standard connect timeout.
    pub(crate) async fn dial_backend(&self, addr: &str) -> Result<TcpStream> {
        let stream = tokio::time::timeout(timeout::BACKEND_DIAL, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("connect timed out after {:?}", timeout::BACKEND_DIAL))?
            .with_context(|| format!("connect to {}", addr))?;
        Ok(stream)
    }

    pub(crate) fn state(&self) -> &RouteState {
        &self.state
    }

    pub(crate) fn state_arc(&self) -> Arc<RouteState> {
        self.state.clone()
    }

    pub(crate) fn fallback(&self) -> Option<&str> {
        self.fallback.as_deref()
    }

    pub(crate) fn identity(&self) -> &SshIdentity {
        &self.identity
    }

    pub(crate) fn ssh_config(&self) -> Arc<russh::server::Config> {
        self.ssh_config.clone()
    }

    pub(crate) fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        self.tls_acceptor.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_ssh() {
        assert_eq!(detect_protocol(b"SSH-2.0-"), Some(Protocol::Ssh));
        assert_eq!(detect_protocol(&b"SSH-2.0-OpenSSH"[..8]), Some(Protocol::Ssh));
    }

    #[test]
    fn test_detect_tls() {
        assert_eq!(detect_protocol(&[0x16, 0x03, 0x01, 0x00, 0x5f]), Some(Protocol::Tls));
        // A single 0x16 byte is already conclusive
        assert_eq!(detect_protocol(&[0x16]), Some(Protocol::Tls));
    }

    #[test]
    fn test_detect_http_methods() {
        for request in [
            "GET / HT", "POST /ab", "PUT /abc", "HEAD / H", "DELETE /", "OPTIONS ", "PATCH /a",
            "CONNECT ", "TRACE / ",
        ] {
            assert_eq!(
                detect_protocol(request.as_bytes()),
                Some(Protocol::Http),
                "{:?} should classify as HTTP",
                request
            );
        }
    }

    #[test]
    fn test_detect_rejects_unknown() {
        assert_eq!(detect_protocol(b"\x00\x01\x02\x03"), None);
        assert_eq!(detect_protocol(b"FOO bar "), None);
        assert_eq!(detect_protocol(b""), None);
        // Exact matching only: lowercase is not a method
        assert_eq!(detect_protocol(b"get / ht"), None);
    }

    #[test]
    fn test_detect_short_buffers() {
        // Too short for SSH/HTTP, not a TLS byte
        assert_eq!(detect_protocol(b"GE"), None);
        assert_eq!(detect_protocol(b"SSH"), None);
    }
}
