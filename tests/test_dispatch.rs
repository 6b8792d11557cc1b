//! Multi-protocol listener tests: protocol detection and peek-and-replay
//! transparency over real sockets.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use edge_gateway::{GatewayServer, ListenerKind, RouteState, SshIdentity, StaticRoute};

async fn spawn_multi_gateway(
    state: Arc<RouteState>,
    fallback: Option<String>,
) -> (Arc<GatewayServer>, std::net::SocketAddr) {
    let identity = Arc::new(SshIdentity::ephemeral().unwrap());
    let server = Arc::new(GatewayServer::new(state, identity, fallback));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_clone = server.clone();
    tokio::spawn(async move {
        let _ = server_clone.listen_on(listener, ListenerKind::Multi).await;
    });

    (server, addr)
}

#[tokio::test]
async fn test_http_on_multi_port_is_replayed_byte_identical() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    let backend = tokio::spawn(async move {
        let (mut stream, _) = backend_listener.accept().await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        received
    });

    let state = Arc::new(RouteState::new());
    state.replace_routes(vec![StaticRoute {
        id: 1,
        host: "api.example.com".to_string(),
        path_prefix: "/".to_string(),
        target: backend_addr.to_string(),
        strip_prefix: false,
        priority: 0,
    }]);
    let (_server, addr) = spawn_multi_gateway(state, None).await;

    // More than 8 bytes, so the peeked prefix and the remainder must be
    // stitched back together seamlessly
    let request = b"GET /long/enough/path HTTP/1.1\r\nHost: api.example.com\r\n\r\ntrailing body";
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(request).await.unwrap();
    client.shutdown().await.unwrap();

    assert_eq!(backend.await.unwrap(), request);
}

#[tokio::test]
async fn test_tls_on_multi_port_is_replayed_byte_identical() {
    let state = Arc::new(RouteState::new());
    let (_server, addr) = spawn_multi_gateway(state, Some("127.0.0.2".to_string())).await;

    let backend_listener = TcpListener::bind(("127.0.0.2", addr.port())).await.unwrap();
    let backend = tokio::spawn(async move {
        let (mut stream, _) = backend_listener.accept().await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        received
    });

    // A fake-but-parseable ClientHello for a non-container hostname:
    // build it the same way the TLS tests do
    let record = {
        let name = b"site.example.com";
        let mut sni_list = vec![0u8];
        sni_list.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni_list.extend_from_slice(name);
        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&(sni_list.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(&sni_list);
        let mut extensions = Vec::new();
        extensions.extend_from_slice(&0u16.to_be_bytes());
        extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext);
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0x00, 0x2f]);
        body.push(1);
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);
        let mut payload = vec![0x01, 0x00];
        payload.extend_from_slice(&(body.len() as u16).to_be_bytes());
        payload.extend_from_slice(&body);
        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        record.extend_from_slice(&payload);
        record
    };

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&record).await.unwrap();
    client.shutdown().await.unwrap();

    assert_eq!(backend.await.unwrap(), record);
}

#[tokio::test]
async fn test_ssh_on_multi_port_reaches_ssh_handler() {
    let state = Arc::new(RouteState::new());
    let (_server, addr) = spawn_multi_gateway(state, None).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();

    // The SSH handler replies with the gateway's identification string
    let mut banner = [0u8; 64];
    let n = client.read(&mut banner).await.unwrap();
    assert!(n >= 4, "expected an SSH identification banner");
    assert_eq!(&banner[..4], b"SSH-");
}

#[tokio::test]
async fn test_unknown_protocol_closes_immediately() {
    let state = Arc::new(RouteState::new());
    let (_server, addr) = spawn_multi_gateway(state, Some("127.0.0.2".to_string())).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"\x00\x01\x02\x03 garbage").await.unwrap();

    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
}
