//! HTTP handling: header-boundary parsing, request-line rewriting and
//! the routing pipeline
//!
//! The gateway never parses a full HTTP message. It reads up to the
//! header terminator, extracts the Host header and request path, picks
//! a backend, optionally rewrites the request line, and from then on
//! shuffles bytes.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use crate::constants::{http, https, ports};
use crate::proxy::GatewayServer;
use crate::router::{RouteState, StaticRoute};
use crate::splice::splice;
use std::sync::Arc;

/// Outcome of reading a request's header section
pub(crate) enum HeaderRead {
    /// Complete header block, terminator line included
    Complete(String),
    /// The 16 KiB cap was exceeded
    TooLarge,
    /// EOF or read error before the terminator
    Closed,
}

/// Read header lines until the first empty line, accumulating into a
/// single buffer capped at [`http::MAX_HEADER_SIZE`].
pub(crate) async fn read_headers<R>(reader: &mut R) -> HeaderRead
where
    R: AsyncBufReadExt + Unpin,
{
    let mut header_buf = String::new();
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => return HeaderRead::Closed,
            Ok(_) => {
                if !line.ends_with('\n') {
                    // EOF in the middle of a line
                    return HeaderRead::Closed;
                }
                header_buf.push_str(&line);
                if line == "\r\n" || line == "\n" {
                    return HeaderRead::Complete(header_buf);
                }
                if header_buf.len() > http::MAX_HEADER_SIZE {
                    return HeaderRead::TooLarge;
                }
            }
            Err(e) => {
                debug!("failed to read HTTP header: {}", e);
                return HeaderRead::Closed;
            }
        }
    }
}

/// Find the Host header value (case-insensitive lookup).
pub(crate) fn extract_host_header(headers: &str) -> Option<String> {
    for line in headers.split('\n') {
        let line = line.trim();
        if line.len() >= 5 && line[..5].eq_ignore_ascii_case("host:") {
            return Some(line[5..].trim().to_string());
        }
    }
    None
}

/// Strip an optional `:port` suffix from a Host value.
pub(crate) fn strip_host_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

/// Extract the path from the request line: the second space-separated
/// token, query string dropped, empty normalized to "/".
pub(crate) fn extract_request_path(headers: &str) -> String {
    let Some(idx) = headers.find('\n') else {
        return "/".to_string();
    };
    let request_line = headers[..idx].trim();

    let mut parts = request_line.splitn(3, ' ');
    let _method = parts.next();
    let Some(raw_path) = parts.next() else {
        return "/".to_string();
    };

    let path = match raw_path.find('?') {
        Some(q) => &raw_path[..q],
        None => raw_path,
    };

    if path.is_empty() {
        return "/".to_string();
    }
    path.to_string()
}

/// First line of the header block, for logging.
pub(crate) fn extract_request_line(headers: &str) -> &str {
    match headers.find('\n') {
        Some(idx) => headers[..idx].trim_end(),
        None => headers.trim_end(),
    }
}

/// Rewrite the request-line path, replacing `" old "` and `" old?"`
/// with the new path exactly once each. Only the first line changes.
pub(crate) fn rewrite_request_path(headers: &str, old_path: &str, new_path: &str) -> String {
    let Some(idx) = headers.find('\n') else {
        return headers.to_string();
    };
    let (request_line, rest) = headers.split_at(idx);

    let rewritten = request_line
        .replacen(&format!(" {} ", old_path), &format!(" {} ", new_path), 1)
        .replacen(&format!(" {}?", old_path), &format!(" {}?", new_path), 1);

    format!("{}{}", rewritten, rest)
}

/// Insert a header line just before the terminating blank line.
pub(crate) fn insert_header(headers: &str, name: &str, value: &str) -> String {
    let line = format!("{}: {}\r\n", name, value);
    if let Some(base) = headers.strip_suffix("\r\n") {
        format!("{}{}\r\n", base, line)
    } else if let Some(base) = headers.strip_suffix('\n') {
        format!("{}{}\n", base, line)
    } else {
        format!("{}{}", headers, line)
    }
}

/// Map alternate listener ports onto their canonical external ports.
pub(crate) fn normalize_ingress_port(port: u16) -> u16 {
    match port {
        ports::ALT_HTTP => 80,
        ports::ALT_HTTPS => 443,
        other => other,
    }
}

/// A routing decision for an HTTP request
pub(crate) enum HttpTarget {
    /// Static route match; `target_path` is the path the backend sees
    Static {
        route: Arc<StaticRoute>,
        target_path: String,
    },
    /// Tenant container service address
    Container(String),
    /// Catch-all upstream address
    Fallback(String),
}

/// Apply the routing precedence: static routes, then containers, then
/// the fallback upstream. `None` means nothing can serve the request.
pub(crate) fn route_http(
    state: &RouteState,
    fallback: Option<&str>,
    hostname: &str,
    path: &str,
    ingress_port: u16,
) -> Option<HttpTarget> {
    if let Ok((route, target_path)) = state.resolve_static_route(hostname, path) {
        return Some(HttpTarget::Static { route, target_path });
    }

    if let Ok((container, target_port)) = state.resolve_http(hostname, ingress_port) {
        return Some(HttpTarget::Container(container.backend_addr(target_port)));
    }

    fallback.map(|addr| HttpTarget::Fallback(format!("{}:{}", addr, ingress_port)))
}

impl GatewayServer {
    /// Handle a plaintext HTTP connection accepted on `local_port`.
    pub(crate) async fn handle_http<S>(&self, stream: S, local_port: u16, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(stream);

        let header_buf = match read_headers(&mut reader).await {
            HeaderRead::Complete(h) => h,
            HeaderRead::TooLarge => {
                warn!("HTTP headers too large, client={}", peer);
                let _ = reader.write_all(http::HEADER_TOO_LARGE).await;
                return;
            }
            HeaderRead::Closed => return,
        };

        let Some(host) = extract_host_header(&header_buf) else {
            warn!("no Host header in HTTP request, client={}", peer);
            let _ = reader.write_all(http::BAD_REQUEST).await;
            return;
        };
        let hostname = strip_host_port(&host).to_string();
        let ingress_port = normalize_ingress_port(local_port);
        let path = extract_request_path(&header_buf);

        info!(
            "HTTP connection host={} path={} port={} client={}",
            hostname, path, ingress_port, peer
        );

        let target = route_http(
            self.state(),
            self.fallback(),
            &hostname,
            &path,
            ingress_port,
        );

        let (backend_addr, rewritten) = match target {
            Some(HttpTarget::Static { route, target_path }) => {
                info!(
                    "routing HTTP via static route host={} path={} target={} target_path={}",
                    hostname, path, route.target, target_path
                );
                let rewritten = (route.strip_prefix && path != target_path)
                    .then(|| rewrite_request_path(&header_buf, &path, &target_path));
                (route.target.clone(), rewritten)
            }
            Some(HttpTarget::Container(addr)) => {
                info!(
                    "routing HTTP to container host={} port={} backend={}",
                    hostname, ingress_port, addr
                );
                (addr, None)
            }
            Some(HttpTarget::Fallback(addr)) => {
                debug!("routing HTTP to fallback upstream host={} backend={}", hostname, addr);
                (addr, None)
            }
            None => {
                warn!(
                    "no route found host={} path={} port={}",
                    hostname, path, ingress_port
                );
                let _ = reader.write_all(http::BAD_GATEWAY_NO_BACKEND).await;
                return;
            }
        };

        let backend = match self.dial_backend(&backend_addr).await {
            Ok(backend) => backend,
            Err(e) => {
                error!(
                    "failed to connect to backend host={} addr={}: {:#}",
                    hostname, backend_addr, e
                );
                let _ = reader.write_all(http::BAD_GATEWAY_DIAL_FAILED).await;
                return;
            }
        };

        let headers = rewritten.unwrap_or(header_buf);
        let buffered = reader.buffer().to_vec();
        let stream = reader.into_inner();

        let mut initial = headers.into_bytes();
        initial.extend_from_slice(&buffered);

        match splice(stream, backend, &initial).await {
            Ok((up, down)) => debug!(
                "HTTP connection closed client={} up={} down={}",
                peer, up, down
            ),
            Err(e) => debug!("HTTP splice error client={}: {}", peer, e),
        }
    }

    /// Handle the decrypted side of a terminated TLS connection. Only
    /// static routes apply here, and every error response carries
    /// no-cache headers.
    pub(crate) async fn handle_terminated_http<S>(&self, stream: S, sni: &str, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(stream);

        let header_buf = match read_headers(&mut reader).await {
            HeaderRead::Complete(h) => h,
            HeaderRead::TooLarge => {
                warn!("HTTP headers too large after TLS termination, client={}", peer);
                let _ = reader.write_all(https::HEADER_TOO_LARGE).await;
                return;
            }
            HeaderRead::Closed => return,
        };

        let path = extract_request_path(&header_buf);
        info!(
            "HTTP after TLS termination host={} path={} request_line={:?} client={}",
            sni,
            path,
            extract_request_line(&header_buf),
            peer
        );

        let (route, target_path) = match self.state().resolve_static_route(sni, &path) {
            Ok(found) => found,
            Err(e) => {
                warn!("no static route found host={} path={}: {}", sni, path, e);
                let _ = reader.write_all(https::BAD_GATEWAY_NO_BACKEND).await;
                return;
            }
        };

        info!(
            "routing via static route host={} path={} target={} target_path={} strip_prefix={}",
            sni, path, route.target, target_path, route.strip_prefix
        );

        let backend = match self.dial_backend(&route.target).await {
            Ok(backend) => backend,
            Err(e) => {
                error!(
                    "failed to connect to backend host={} target={}: {:#}",
                    sni, route.target, e
                );
                let _ = reader.write_all(https::BAD_GATEWAY_DIAL_FAILED).await;
                return;
            }
        };

        let mut headers = header_buf;
        if route.strip_prefix && path != target_path {
            headers = rewrite_request_path(&headers, &path, &target_path);
        }
        headers = insert_header(&headers, "X-Forwarded-Proto", "https");

        let buffered = reader.buffer().to_vec();
        let stream = reader.into_inner();

        let mut initial = headers.into_bytes();
        initial.extend_from_slice(&buffered);

        match splice(stream, backend, &initial).await {
            Ok((up, down)) => debug!(
                "terminated HTTPS connection closed client={} up={} down={}",
                peer, up, down
            ),
            Err(e) => debug!("terminated HTTPS splice error client={}: {}", peer, e),
        }
    }
}
