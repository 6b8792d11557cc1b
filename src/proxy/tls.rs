//! TLS inspection: record parsing, SNI extraction, passthrough and
//! optional in-place termination
//!
//! The gateway reads exactly one TLS record (the ClientHello), pulls the
//! SNI hostname out of it and decides where the connection goes. In
//! passthrough mode the recorded bytes are forwarded to the backend
//! verbatim, so the gateway never holds keys for tenant hostnames. In
//! termination mode the recorded bytes are replayed into a rustls
//! server handshake and the decrypted stream joins the HTTP pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::constants::tls;
use crate::proxy::http::normalize_ingress_port;
use crate::proxy::GatewayServer;
use crate::splice::splice;
use crate::stream::ReplayStream;

/// Load a certificate chain and private key into a rustls server
/// configuration using the ring provider.
pub(crate) fn load_server_config(cert_path: &str, key_path: &str) -> Result<rustls::ServerConfig> {
    let cert_data = std::fs::read(cert_path)
        .with_context(|| format!("read TLS certificate from {}", cert_path))?;
    let certs = rustls_pemfile::certs(&mut cert_data.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("parse TLS certificate")?;
    if certs.is_empty() {
        bail!("no certificates found in {}", cert_path);
    }

    let key_data =
        std::fs::read(key_path).with_context(|| format!("read TLS key from {}", key_path))?;
    let key = rustls_pemfile::private_key(&mut key_data.as_slice())
        .context("parse TLS key")?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path))?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("create TLS config with ring provider")?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("build TLS server config")?;

    Ok(config)
}

/// Parse a TLS handshake payload (the bytes after the 5-byte record
/// header) and extract the SNI hostname from the ClientHello.
pub fn extract_sni(payload: &[u8]) -> Result<String> {
    // Handshake header: 1 byte type + 3 bytes length
    if payload.len() < 4 {
        bail!("payload too short");
    }
    if payload[0] != tls::CLIENT_HELLO {
        bail!("not a ClientHello");
    }
    let mut rest = &payload[4..];

    // Fixed part: 2 bytes version + 32 bytes random
    if rest.len() < 34 {
        bail!("ClientHello too short");
    }
    rest = &rest[34..];

    // Session id (1-byte length)
    let Some((&session_len, after)) = rest.split_first() else {
        bail!("missing session ID length");
    };
    rest = after;
    if rest.len() < session_len as usize {
        bail!("truncated session ID");
    }
    rest = &rest[session_len as usize..];

    // Cipher suites (2-byte length)
    if rest.len() < 2 {
        bail!("missing cipher suites length");
    }
    let cipher_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    rest = &rest[2..];
    if rest.len() < cipher_len {
        bail!("truncated cipher suites");
    }
    rest = &rest[cipher_len..];

    // Compression methods (1-byte length)
    let Some((&comp_len, after)) = rest.split_first() else {
        bail!("missing compression methods length");
    };
    rest = after;
    if rest.len() < comp_len as usize {
        bail!("truncated compression methods");
    }
    rest = &rest[comp_len as usize..];

    // Extensions
    if rest.len() < 2 {
        bail!("no extensions");
    }
    let ext_total = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    rest = &rest[2..];
    if rest.len() < ext_total {
        bail!("truncated extensions");
    }

    while rest.len() >= 4 {
        let ext_type = u16::from_be_bytes([rest[0], rest[1]]);
        let ext_len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if rest.len() < ext_len {
            bail!("truncated extension data");
        }
        if ext_type == tls::SNI_EXTENSION {
            return parse_sni_extension(&rest[..ext_len]);
        }
        rest = &rest[ext_len..];
    }

    bail!("no SNI extension found")
}

/// Extract the hostname from an SNI extension body: a 2-byte list
/// length followed by `{name_type(1), name_len(2), name}` entries.
fn parse_sni_extension(data: &[u8]) -> Result<String> {
    if data.len() < 2 {
        bail!("SNI extension too short");
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let mut rest = &data[2..];
    if rest.len() < list_len {
        bail!("truncated SNI list");
    }

    while rest.len() >= 3 {
        let name_type = rest[0];
        let name_len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
        rest = &rest[3..];
        if rest.len() < name_len {
            bail!("truncated SNI name");
        }
        if name_type == 0 {
            let hostname = std::str::from_utf8(&rest[..name_len])
                .ok()
                .filter(|h| is_valid_hostname(h))
                .ok_or_else(|| anyhow::anyhow!("invalid hostname"))?;
            return Ok(hostname.to_string());
        }
        rest = &rest[name_len..];
    }

    bail!("no hostname in SNI")
}

/// Pick the passthrough upstream for an SNI hostname. Hostnames
/// containing ".compute." are treated as container traffic (a policy
/// match, not an identity check); everything else goes to the
/// fallback. `None` means the connection is closed silently.
pub(crate) fn passthrough_backend(
    state: &crate::router::RouteState,
    fallback: Option<&str>,
    sni: &str,
    ingress_port: u16,
) -> Option<String> {
    if sni.contains(".compute.") {
        match state.resolve_http(sni, ingress_port) {
            Ok((container, target_port)) => {
                info!(
                    "TLS passthrough to container sni={} port={} target={}",
                    sni, ingress_port, target_port
                );
                Some(container.backend_addr(target_port))
            }
            Err(e) => {
                warn!(
                    "no ingress rule for port sni={} port={}: {}",
                    sni, ingress_port, e
                );
                None
            }
        }
    } else {
        match fallback {
            Some(fallback) => {
                debug!("TLS passthrough to fallback sni={} fallback={}", sni, fallback);
                Some(format!("{}:{}", fallback, ingress_port))
            }
            None => {
                warn!("no fallback configured sni={}", sni);
                None
            }
        }
    }
}

/// Hostname sanity: printable ASCII, 1-255 bytes, at least one dot.
fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 255 {
        return false;
    }
    if !hostname.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        return false;
    }
    hostname.contains('.')
}

impl GatewayServer {
    /// Handle a TLS connection accepted on `local_port`: read the
    /// ClientHello record, extract SNI and route.
    pub(crate) async fn handle_tls<S>(&self, mut stream: S, local_port: u16, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut header = [0u8; tls::RECORD_HEADER_SIZE];
        if let Err(e) = stream.read_exact(&mut header).await {
            debug!("failed to read TLS header client={}: {}", peer, e);
            return;
        }

        if header[0] != crate::constants::detect::TLS_HANDSHAKE {
            warn!("not a TLS handshake type={} client={}", header[0], peer);
            return;
        }

        let length = u16::from_be_bytes([header[3], header[4]]) as usize;
        if length > tls::MAX_RECORD_SIZE {
            warn!("TLS record too large length={} client={}", length, peer);
            return;
        }

        let mut payload = vec![0u8; length];
        if let Err(e) = stream.read_exact(&mut payload).await {
            debug!("failed to read TLS payload client={}: {}", peer, e);
            return;
        }

        let sni = match extract_sni(&payload) {
            Ok(sni) => sni,
            Err(e) => {
                debug!("failed to extract SNI client={}: {}", peer, e);
                return;
            }
        };

        let ingress_port = normalize_ingress_port(local_port);
        info!("TLS connection sni={} port={} client={}", sni, ingress_port, peer);

        // Termination applies to operator hostnames with a static route;
        // the ".compute." test is policy for tenant container hostnames,
        // which always stay passthrough.
        if let Some(acceptor) = self.tls_acceptor() {
            if !sni.contains(".compute.")
                && self.state().resolve_static_route(&sni, "/").is_ok()
            {
                self.terminate_tls(stream, acceptor, header, payload, &sni, peer)
                    .await;
                return;
            }
        }

        let Some(backend_addr) =
            passthrough_backend(self.state(), self.fallback(), &sni, ingress_port)
        else {
            return;
        };

        let backend = match self.dial_backend(&backend_addr).await {
            Ok(backend) => backend,
            Err(e) => {
                error!(
                    "failed to connect to backend sni={} addr={}: {:#}",
                    sni, backend_addr, e
                );
                return;
            }
        };

        // The backend must observe the handshake byte-for-byte
        let mut initial = header.to_vec();
        initial.extend_from_slice(&payload);

        match splice(stream, backend, &initial).await {
            Ok((up, down)) => debug!(
                "TLS connection closed sni={} up={} down={}",
                sni, up, down
            ),
            Err(e) => debug!("TLS splice error sni={}: {}", sni, e),
        }
    }

    /// Terminate TLS in place: replay the consumed ClientHello into a
    /// rustls server handshake and hand the cleartext to the HTTP
    /// pipeline.
    async fn terminate_tls<S>(
        &self,
        stream: S,
        acceptor: TlsAcceptor,
        header: [u8; tls::RECORD_HEADER_SIZE],
        payload: Vec<u8>,
        sni: &str,
        peer: SocketAddr,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut replay = header.to_vec();
        replay.extend_from_slice(&payload);
        let replay_stream = ReplayStream::new(stream, replay);

        let tls_stream = match acceptor.accept(replay_stream).await {
            Ok(tls_stream) => tls_stream,
            Err(e) => {
                warn!("TLS handshake failed sni={} client={}: {}", sni, peer, e);
                return;
            }
        };

        info!("TLS terminated sni={} client={}", sni, peer);
        self.handle_terminated_http(tls_stream, sni, peer).await;
    }
}
