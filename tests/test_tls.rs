//! TLS inspection tests: SNI-based passthrough, silent closes and
//! in-place termination with a real rustls handshake.

use std::io::Write as _;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use edge_gateway::{extract_sni, GatewayServer, ListenerKind, RouteState, SshIdentity, StaticRoute};

/// Build a minimal but well-formed TLS record carrying a ClientHello
/// with the given SNI hostname.
fn client_hello_record(sni: &str) -> Vec<u8> {
    let name = sni.as_bytes();

    let mut sni_list = vec![0u8]; // name_type: hostname
    sni_list.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni_list.extend_from_slice(name);

    let mut sni_ext = Vec::new();
    sni_ext.extend_from_slice(&(sni_list.len() as u16).to_be_bytes());
    sni_ext.extend_from_slice(&sni_list);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&0u16.to_be_bytes()); // extension type: SNI
    extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni_ext);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0u8; 32]);
    body.push(0); // session id
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&[0x00, 0x2f]); // one cipher suite
    body.push(1);
    body.push(0); // null compression
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut payload = vec![0x01, 0x00];
    payload.extend_from_slice(&(body.len() as u16).to_be_bytes());
    payload.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    record.extend_from_slice(&payload);
    record
}

async fn spawn_gateway(
    state: Arc<RouteState>,
    fallback: Option<String>,
    tls_cert: Option<(&str, &str)>,
) -> (Arc<GatewayServer>, std::net::SocketAddr) {
    let identity = Arc::new(SshIdentity::ephemeral().unwrap());
    let mut server = GatewayServer::new(state, identity, fallback);
    if let Some((cert, key)) = tls_cert {
        server.load_tls_cert(cert, key).unwrap();
    }
    let server = Arc::new(server);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_clone = server.clone();
    tokio::spawn(async move {
        let _ = server_clone.listen_on(listener, ListenerKind::Tls).await;
    });

    (server, addr)
}

#[test]
fn test_sni_parser_roundtrip() {
    let record = client_hello_record("abc.compute.example.com");
    // Strip the 5-byte record header; the payload is what the parser sees
    assert_eq!(
        extract_sni(&record[5..]).unwrap(),
        "abc.compute.example.com"
    );
}

#[tokio::test]
async fn test_passthrough_forwards_bytes_exactly() {
    // The fallback backend listens on the same port as the gateway but
    // on a second loopback address
    let state = Arc::new(RouteState::new());
    let (_server, addr) = spawn_gateway(state, Some("127.0.0.2".to_string()), None).await;

    let backend_listener = TcpListener::bind(("127.0.0.2", addr.port())).await.unwrap();
    let backend = tokio::spawn(async move {
        let (mut stream, _) = backend_listener.accept().await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        received
    });

    let record = client_hello_record("www.example.com");
    let mut expected = record.clone();
    expected.extend_from_slice(b"encrypted-looking follow-up bytes");

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&record).await.unwrap();
    client
        .write_all(b"encrypted-looking follow-up bytes")
        .await
        .unwrap();
    client.shutdown().await.unwrap();

    // The backend must observe the record header + payload byte-exact,
    // followed by everything after it
    assert_eq!(backend.await.unwrap(), expected);
}

#[tokio::test]
async fn test_no_fallback_closes_silently() {
    let state = Arc::new(RouteState::new());
    let (_server, addr) = spawn_gateway(state, None, None).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&client_hello_record("www.example.com"))
        .await
        .unwrap();

    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_non_handshake_record_closes() {
    let state = Arc::new(RouteState::new());
    let (_server, addr) = spawn_gateway(state, Some("127.0.0.2".to_string()), None).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x17, 0x03, 0x03, 0x00, 0x05]).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_oversize_record_closes() {
    let state = Arc::new(RouteState::new());
    let (_server, addr) = spawn_gateway(state, Some("127.0.0.2".to_string()), None).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    // Declared record length 0x7fff > 16384
    client.write_all(&[0x16, 0x03, 0x01, 0x7f, 0xff]).await.unwrap();

    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_truncated_client_hello_closes() {
    let state = Arc::new(RouteState::new());
    let (_server, addr) = spawn_gateway(state, Some("127.0.0.2".to_string()), None).await;

    let record = client_hello_record("www.example.com");
    let mut client = TcpStream::connect(addr).await.unwrap();
    // Send the header plus half the payload, then EOF
    client.write_all(&record[..record.len() / 2]).await.unwrap();
    client.shutdown().await.unwrap();

    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_termination_handshake_and_forwarded_proto() {
    // Self-signed certificate for the operator hostname
    let cert = rcgen::generate_simple_self_signed(vec!["ops.example.com".to_string()]).unwrap();
    let mut cert_file = tempfile::NamedTempFile::new().unwrap();
    cert_file.write_all(cert.cert.pem().as_bytes()).unwrap();
    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file
        .write_all(cert.key_pair.serialize_pem().as_bytes())
        .unwrap();

    // Backend the static route points at
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    let backend = tokio::spawn(async move {
        let (mut stream, _) = backend_listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            if received.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        received
    });

    let state = Arc::new(RouteState::new());
    state.replace_routes(vec![StaticRoute {
        id: 1,
        host: "ops.example.com".to_string(),
        path_prefix: "/".to_string(),
        target: backend_addr.to_string(),
        strip_prefix: false,
        priority: 0,
    }]);

    let (_server, addr) = spawn_gateway(
        state,
        None,
        Some((
            cert_file.path().to_str().unwrap(),
            key_file.path().to_str().unwrap(),
        )),
    )
    .await;

    // rustls client trusting the self-signed certificate
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.cert.der().clone()).unwrap();
    let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();

    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = rustls::pki_types::ServerName::try_from("ops.example.com").unwrap();
    let mut tls = connector.connect(server_name, tcp).await.unwrap();

    tls.write_all(b"GET /status HTTP/1.1\r\nHost: ops.example.com\r\n\r\n")
        .await
        .unwrap();

    let mut response = vec![0u8; 1024];
    let n = tls.read(&mut response).await.unwrap();
    assert!(response[..n].starts_with(b"HTTP/1.1 200 OK"));

    let received = String::from_utf8(backend.await.unwrap()).unwrap();
    assert!(received.starts_with("GET /status HTTP/1.1\r\n"));
    assert!(
        received.contains("X-Forwarded-Proto: https\r\n"),
        "terminated requests must carry X-Forwarded-Proto, got: {}",
        received
    );
}
